//! Filesystem-spool message bus.
//!
//! `FsqBus` is the cross-process transport: each published message becomes a
//! JSON file in a shared spool directory, named so that lexicographic order
//! is publication order (`<millis>-<seq>-<node>.json`). Subscribers poll the
//! directory and track which files they have consumed, so every subscriber
//! sees every message published after it subscribed: at-least-once, fan-out
//! by topic pattern.
//!
//! The spool is append-only for the lifetime of a fleet run; `serve` creates
//! a fresh spool per run and tests use temp dirs. Writes go through a
//! temporary file and a rename so a polling reader never observes a partial
//! message.

use super::{topic_matches, BusMessage, MessageBus};
use crate::error::{FleetError, FleetResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 64;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(20);
// Publishers on other nodes may stamp the same millisecond slightly out of
// order; files younger than this window stay in the dedupe set.
const SAFETY_WINDOW_MS: u128 = 2_000;

fn file_millis(name: &str) -> Option<u128> {
    name.get(..13).and_then(|prefix| prefix.parse().ok())
}

#[derive(Debug, Serialize, Deserialize)]
struct SpoolRecord {
    topic: String,
    payload: Value,
}

/// Filesystem-backed bus rooted at a spool directory shared between the
/// supervisor process and its workers.
#[derive(Clone)]
pub struct FsqBus {
    dir: Arc<PathBuf>,
    node: Arc<String>,
    seq: Arc<AtomicU64>,
    poll_interval: Duration,
}

impl FsqBus {
    /// Open (creating if necessary) the spool directory.
    pub fn open(dir: impl Into<PathBuf>) -> FleetResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir: Arc::new(dir),
            node: Arc::new(Uuid::new_v4().simple().to_string()),
            seq: Arc::new(AtomicU64::new(0)),
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// Override the poll interval (tests shrink it).
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// The spool directory this bus reads and writes.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn next_file_name(&self) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{millis:013}-{seq:06}-{}.json", self.node)
    }

    async fn list_after(&self, cursor: &str) -> FleetResult<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&*self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".json") && name.as_str() > cursor {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

#[async_trait]
impl MessageBus for FsqBus {
    async fn publish(&self, topic: &str, payload: Value) -> FleetResult<()> {
        let record = SpoolRecord {
            topic: topic.to_string(),
            payload,
        };
        let body = serde_json::to_vec(&record)?;
        let name = self.next_file_name();
        let tmp = self.dir.join(format!(".{name}.tmp"));
        let fin = self.dir.join(&name);
        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, &fin).await?;
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> FleetResult<mpsc::Receiver<BusMessage>> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        // Everything already in the spool counts as seen: a subscription
        // delivers only messages published after it was created. The seen
        // set (rather than a bare cursor) keeps same-millisecond files from
        // other publishers from being skipped, and is pruned against a
        // sliding watermark so it stays bounded.
        let mut seen: std::collections::HashSet<String> =
            self.list_after("").await?.into_iter().collect();
        let mut watermark = seen.iter().filter_map(|n| file_millis(n)).max().unwrap_or(0);
        let bus = self.clone();
        let pattern = pattern.to_string();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(bus.poll_interval);
            loop {
                tick.tick().await;
                let floor = format!("{:013}", watermark.saturating_sub(SAFETY_WINDOW_MS));
                let names = match bus.list_after(&floor).await {
                    Ok(names) => names,
                    Err(err) => {
                        warn!(error = %err, "fsq poll failed");
                        continue;
                    }
                };
                for name in names {
                    if !seen.insert(name.clone()) {
                        continue;
                    }
                    if let Some(millis) = file_millis(&name) {
                        watermark = watermark.max(millis);
                    }
                    let path = bus.dir.join(&name);
                    let record: SpoolRecord = match tokio::fs::read(&path).await {
                        Ok(body) => match serde_json::from_slice(&body) {
                            Ok(record) => record,
                            Err(err) => {
                                warn!(file = %name, error = %err, "malformed spool record");
                                continue;
                            }
                        },
                        Err(err) => {
                            warn!(file = %name, error = %err, "unreadable spool record");
                            continue;
                        }
                    };
                    if !topic_matches(&pattern, &record.topic) {
                        continue;
                    }
                    let message = BusMessage {
                        topic: record.topic,
                        payload: record.payload,
                    };
                    if tx.send(message).await.is_err() {
                        // Receiver dropped; the subscription is over.
                        return;
                    }
                }
                seen.retain(|name| name.as_str() >= floor.as_str());
            }
        });
        Ok(rx)
    }
}
