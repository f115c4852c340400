//! In-process message bus.
//!
//! `MemoryBus` fans every published message out to all matching
//! subscriptions over mpsc channels. It backs the integration tests and the
//! in-process (simulation) worker mode, where supervisor and worker share one
//! address space.

use super::{topic_matches, BusMessage, MessageBus};
use crate::error::FleetResult;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

const CHANNEL_CAPACITY: usize = 64;

struct Subscription {
    pattern: String,
    sender: mpsc::Sender<BusMessage>,
}

/// Shared in-process broker. Cheap to clone; clones share the subscription
/// table.
#[derive(Clone, Default)]
pub struct MemoryBus {
    subscriptions: Arc<Mutex<Vec<Subscription>>>,
}

impl MemoryBus {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, topic: &str, payload: Value) -> FleetResult<()> {
        let targets: Vec<mpsc::Sender<BusMessage>> = {
            let mut subs = self.subscriptions.lock().await;
            // Closed receivers are pruned on the way through.
            subs.retain(|s| !s.sender.is_closed());
            subs.iter()
                .filter(|s| topic_matches(&s.pattern, topic))
                .map(|s| s.sender.clone())
                .collect()
        };
        for sender in targets {
            let message = BusMessage {
                topic: topic.to_string(),
                payload: payload.clone(),
            };
            // A receiver dropped mid-publish is a lapsed subscription, not a
            // publish failure.
            let _ = sender.send(message).await;
        }
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> FleetResult<mpsc::Receiver<BusMessage>> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.subscriptions.lock().await.push(Subscription {
            pattern: pattern.to_string(),
            sender: tx,
        });
        Ok(rx)
    }
}
