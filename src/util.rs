//! Small identifier helpers shared by the supervisor and worker sides.
//!
//! Device and component ids are slugs: lowercase alphanumeric runs joined by
//! single dashes. Anything without a usable name gets a generated id from a
//! process-wide counter (`device-1`, `led-3`, ...).

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Convert an arbitrary human name into a slug id.
///
/// Non-alphanumeric runs collapse into a single `-`; leading/trailing dashes
/// are trimmed; the result is lowercase. Returns `None` when nothing usable
/// remains (empty input, pure punctuation).
pub fn slugify(name: &str) -> Option<String> {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        None
    } else {
        Some(slug)
    }
}

/// Generate a unique id with the given prefix, e.g. `unique_id("led")` ->
/// `"led-7"`. The counter is global so generated ids never collide within a
/// process.
pub fn unique_id(prefix: &str) -> String {
    let n = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{n}")
}

/// Normalize a component class name the way the wire protocol expects it:
/// camel-cased across separator boundaries, then capitalized with the rest
/// lowercased (`"rgb-led"` -> `"Rgbled"`, `"led"` -> `"Led"`).
pub fn normalize_class(class: &str) -> String {
    let mut camel = String::with_capacity(class.len());
    let mut upper_next = false;
    for ch in class.chars() {
        if ch.is_ascii_alphanumeric() {
            if upper_next {
                camel.push(ch.to_ascii_uppercase());
            } else {
                camel.push(ch);
            }
            upper_next = false;
        } else {
            upper_next = !camel.is_empty();
        }
    }
    let mut out = String::with_capacity(camel.len());
    for (i, ch) in camel.chars().enumerate() {
        if i == 0 {
            out.push(ch.to_ascii_uppercase());
        } else {
            out.push(ch.to_ascii_lowercase());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_basic() {
        assert_eq!(slugify("My Device"), Some("my-device".to_string()));
        assert_eq!(slugify("  led #1 "), Some("led-1".to_string()));
        assert_eq!(slugify("already-slug"), Some("already-slug".to_string()));
    }

    #[test]
    fn slugify_rejects_empty() {
        assert_eq!(slugify(""), None);
        assert_eq!(slugify("--- "), None);
    }

    #[test]
    fn unique_ids_do_not_collide() {
        let a = unique_id("device");
        let b = unique_id("device");
        assert_ne!(a, b);
        assert!(a.starts_with("device-"));
    }

    #[test]
    fn class_normalization() {
        assert_eq!(normalize_class("led"), "Led");
        assert_eq!(normalize_class("Led"), "Led");
        assert_eq!(normalize_class("rgb-led"), "Rgbled");
        assert_eq!(normalize_class("servo"), "Servo");
    }
}
