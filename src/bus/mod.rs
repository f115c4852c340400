//! Message bus adapter.
//!
//! Every supervisor/worker exchange travels over a topic-based
//! publish/subscribe transport behind the [`MessageBus`] trait. Topics are
//! `/`-joined segments; subscription patterns may use `+` as a single-level
//! wildcard (`porch/+` matches `porch/ready` but not `porch/a/b`).
//!
//! Delivery is at-least-once. Ordering across distinct topics is not
//! guaranteed, and the core never relies on per-topic ordering beyond
//! request/response pairing. Publish failures surface as `Err` to the caller,
//! never silently dropped.
//!
//! Two transports ship with the crate:
//!
//! - [`MemoryBus`]: an in-process broker for tests and simulation workers;
//! - [`FsqBus`]: a filesystem-spool transport for real cross-process fleets.

mod fsq;
mod memory;

pub use fsq::FsqBus;
pub use memory::MemoryBus;

use crate::error::FleetResult;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

/// A single message delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// Concrete topic the message was published on.
    pub topic: String,
    /// JSON payload.
    pub payload: Value,
}

/// Topic-based publish/subscribe transport.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a payload on a concrete topic.
    async fn publish(&self, topic: &str, payload: Value) -> FleetResult<()>;

    /// Subscribe to a topic pattern. Messages matching the pattern arrive on
    /// the returned channel until the receiver is dropped.
    async fn subscribe(&self, pattern: &str) -> FleetResult<mpsc::Receiver<BusMessage>>;
}

/// Match a concrete topic against a pattern with `+` single-level wildcards.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pat = pattern.split('/');
    let mut top = topic.split('/');
    loop {
        match (pat.next(), top.next()) {
            (None, None) => return true,
            (Some("+"), Some(_)) => {}
            (Some(p), Some(t)) if p == t => {}
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_topics_match() {
        assert!(topic_matches("porch/ready", "porch/ready"));
        assert!(!topic_matches("porch/ready", "porch/error"));
    }

    #[test]
    fn wildcard_matches_one_segment_only() {
        assert!(topic_matches("porch/+", "porch/ready"));
        assert!(topic_matches("+/ready", "porch/ready"));
        assert!(!topic_matches("porch/+", "porch/a/b"));
        assert!(!topic_matches("porch/+", "porch"));
    }

    #[test]
    fn segment_counts_must_agree() {
        assert!(!topic_matches("porch", "porch/ready"));
        assert!(!topic_matches("porch/ready/extra", "porch/ready"));
    }
}
