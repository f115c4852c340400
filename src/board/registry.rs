//! Component class registry.
//!
//! Maps each supported component class name to a constructor and a declared
//! list of method names, populated when the worker is built. The declared
//! lists are what `dir` reports; there is no runtime reflection, and a class the
//! registry does not know is a recoverable protocol error, never a crash.

use super::{BoardComponent, BoardDriver};
use anyhow::{bail, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Constructor for one component class: board binding plus opaque options in,
/// live component out.
pub type ComponentCtor = fn(Arc<dyn BoardDriver>, &Value) -> Result<Box<dyn BoardComponent>>;

struct RegistryEntry {
    methods: &'static [&'static str],
    ctor: ComponentCtor,
}

/// Registry of component classes a worker can instantiate.
#[derive(Default)]
pub struct ComponentRegistry {
    entries: HashMap<String, RegistryEntry>,
}

impl ComponentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a class under its normalized name.
    pub fn register(
        &mut self,
        class: &str,
        methods: &'static [&'static str],
        ctor: ComponentCtor,
    ) {
        self.entries
            .insert(class.to_string(), RegistryEntry { methods, ctor });
    }

    /// Whether a class is known.
    pub fn contains(&self, class: &str) -> bool {
        self.entries.contains_key(class)
    }

    /// Declared method names for a class, private markers included.
    pub fn methods(&self, class: &str) -> Option<&'static [&'static str]> {
        self.entries.get(class).map(|e| e.methods)
    }

    /// Construct a component of the given class against a board.
    pub fn construct(
        &self,
        class: &str,
        board: Arc<dyn BoardDriver>,
        opts: &Value,
    ) -> Result<Box<dyn BoardComponent>> {
        let Some(entry) = self.entries.get(class) else {
            bail!("unknown component class \"{class}\"");
        };
        (entry.ctor)(board, opts)
    }

    /// Registered class names.
    pub fn classes(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::sim;
    use serde_json::json;

    #[tokio::test]
    async fn construct_known_class() {
        let registry = sim::sim_registry();
        let board = crate::board::open(&json!({})).await.unwrap();
        let led = registry
            .construct("Led", board, &json!({"pin": 13}))
            .unwrap();
        assert_eq!(led.component_class(), "Led");
        assert!(led.methods().contains(&"on"));
    }

    #[tokio::test]
    async fn unknown_class_is_an_error_not_a_panic() {
        let registry = sim::sim_registry();
        let board = crate::board::open(&json!({})).await.unwrap();
        let err = registry
            .construct("Teleporter", board, &json!({}))
            .err()
            .unwrap();
        assert!(err.to_string().contains("Teleporter"));
    }

    #[test]
    fn declared_methods_are_stable() {
        let registry = sim::sim_registry();
        let first = registry.methods("Led").unwrap();
        let second = registry.methods("Led").unwrap();
        assert_eq!(first, second);
    }
}
