//! Worker handles and request/response plumbing.
//!
//! [`WorkerHandle`] is the supervisor's grip on one spawned worker: an
//! idempotent kill switch and an exit signal, decoupled from how the worker
//! actually runs (child process or in-process task).
//!
//! [`RequestRouter`] pairs worker events with in-flight requests. The wire
//! protocol carries no correlation ids, so pairing is per device, FIFO per
//! expected event kind; an `error` event rejects the oldest pending request,
//! and worker death rejects everything with `ConnectionLost` immediately,
//! so pending calls never hang on a dead worker.

use crate::bus::MessageBus;
use crate::error::{FleetError, FleetResult};
use crate::protocol::{command_topic, CommandKind, EventKind, WorkerEvent};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Supervisor-side grip on a running worker.
#[derive(Clone)]
pub struct WorkerHandle {
    kill_token: CancellationToken,
    exit_token: CancellationToken,
}

impl WorkerHandle {
    /// Build a handle from its two signals. The launcher keeps the other
    /// ends: cancelling `kill_token` asks the worker to die, `exit_token`
    /// fires once it actually has.
    pub fn new(kill_token: CancellationToken, exit_token: CancellationToken) -> Self {
        Self {
            kill_token,
            exit_token,
        }
    }

    /// Request termination. Killing an already-dead or never-started worker
    /// is a no-op, not an error.
    pub fn kill(&self) {
        self.kill_token.cancel();
    }

    /// Whether the worker process is still alive.
    pub fn is_connected(&self) -> bool {
        !self.exit_token.is_cancelled()
    }

    /// Resolve once the worker has exited.
    pub async fn wait_exit(&self) {
        self.exit_token.cancelled().await;
    }
}

struct Pending {
    id: u64,
    expect: EventKind,
    tx: oneshot::Sender<FleetResult<WorkerEvent>>,
}

struct RouterInner {
    next_id: u64,
    connected: bool,
    pending: VecDeque<Pending>,
}

/// Pairs worker events with waiting requests for one device.
#[derive(Clone)]
pub(crate) struct RequestRouter {
    device_id: Arc<String>,
    inner: Arc<Mutex<RouterInner>>,
}

impl RequestRouter {
    pub(crate) fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: Arc::new(device_id.into()),
            inner: Arc::new(Mutex::new(RouterInner {
                next_id: 1,
                connected: false,
                pending: VecDeque::new(),
            })),
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.lock().connected = connected;
    }

    /// Register a waiter for the next event of the given kind.
    pub(crate) fn register(
        &self,
        expect: EventKind,
    ) -> (u64, oneshot::Receiver<FleetResult<WorkerEvent>>) {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.pending.push_back(Pending { id, expect, tx });
        (id, rx)
    }

    /// Drop a waiter that timed out or whose publish failed.
    pub(crate) fn cancel(&self, id: u64) {
        self.lock().pending.retain(|p| p.id != id);
    }

    /// Route one worker event to its waiter.
    ///
    /// An `error` event rejects the oldest pending request of any kind; a
    /// success event resolves the oldest waiter expecting that kind. Events
    /// with no waiter are dropped (the worker may re-publish under
    /// at-least-once delivery).
    pub(crate) fn resolve(&self, event: WorkerEvent) {
        let waiter = {
            let mut inner = self.lock();
            match &event {
                WorkerEvent::Error { .. } => inner.pending.pop_front(),
                other => {
                    let kind = other.kind();
                    let idx = inner.pending.iter().position(|p| p.expect == kind);
                    idx.and_then(|idx| inner.pending.remove(idx))
                }
            }
        };
        match (waiter, event) {
            (Some(p), WorkerEvent::Error { message }) => {
                let _ = p.tx.send(Err(FleetError::Protocol(message)));
            }
            (Some(p), event) => {
                let _ = p.tx.send(Ok(event));
            }
            (None, event) => {
                debug!(device = %self.device_id, kind = event.kind().as_str(), "unmatched worker event dropped");
            }
        }
    }

    /// Reject every pending request with `ConnectionLost` and mark the
    /// device disconnected. New requests fail fast until the next fork.
    pub(crate) fn fail_all(&self) {
        let drained: Vec<Pending> = {
            let mut inner = self.lock();
            inner.connected = false;
            inner.pending.drain(..).collect()
        };
        for p in drained {
            let _ = p.tx.send(Err(FleetError::ConnectionLost {
                device: self.device_id.to_string(),
            }));
        }
    }

    #[allow(clippy::unwrap_used)]
    fn lock(&self) -> std::sync::MutexGuard<'_, RouterInner> {
        // The router never panics while holding the lock.
        self.inner.lock().unwrap()
    }
}

/// Shared device-side endpoint for issuing requests to a worker.
pub(crate) struct DeviceLink {
    pub(crate) device_id: String,
    pub(crate) bus: Arc<dyn MessageBus>,
    pub(crate) router: RequestRouter,
    pub(crate) request_timeout: Duration,
}

impl DeviceLink {
    /// Publish a command and await the matching response event.
    ///
    /// Fails fast with `ConnectionLost` when no worker is connected, and
    /// with `RequestTimeout` when no response arrives in time; "no
    /// response" is always a distinguishable error, never a hang.
    pub(crate) async fn request(
        &self,
        command: CommandKind,
        payload: Value,
        expect: EventKind,
    ) -> FleetResult<WorkerEvent> {
        if !self.router.is_connected() {
            return Err(FleetError::ConnectionLost {
                device: self.device_id.clone(),
            });
        }
        let (id, rx) = self.router.register(expect);
        if let Err(err) = self
            .bus
            .publish(&command_topic(&self.device_id, command), payload)
            .await
        {
            self.router.cancel(id);
            return Err(err);
        }
        match tokio::time::timeout(self.request_timeout, rx).await {
            Err(_) => {
                self.router.cancel(id);
                Err(FleetError::RequestTimeout {
                    device: self.device_id.clone(),
                    command: command.as_str().to_string(),
                })
            }
            Ok(Err(_)) => Err(FleetError::ConnectionLost {
                device: self.device_id.clone(),
            }),
            Ok(Ok(result)) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_event_rejects_oldest_pending() {
        let router = RequestRouter::new("porch");
        let (_a, rx_a) = router.register(EventKind::Instantiated);
        let (_b, rx_b) = router.register(EventKind::Instantiated);

        router.resolve(WorkerEvent::Error {
            message: "boom".into(),
        });
        router.resolve(WorkerEvent::Instantiated {
            id: "led-1".into(),
            component_class: "Led".into(),
            methods: vec![],
        });

        let a = rx_a.blocking_recv().unwrap();
        assert!(matches!(a, Err(FleetError::Protocol(m)) if m == "boom"));
        let b = rx_b.blocking_recv().unwrap();
        assert!(b.is_ok());
    }

    #[test]
    fn events_pair_by_expected_kind() {
        let router = RequestRouter::new("porch");
        let (_e, rx_exec) = router.register(EventKind::Executed);
        let (_m, rx_methods) = router.register(EventKind::Methods);

        // Out-of-order arrival still reaches the right waiter.
        router.resolve(WorkerEvent::Methods {
            methods: vec!["on".into()],
        });
        router.resolve(WorkerEvent::Executed {
            retval: serde_json::json!(true),
        });

        assert!(rx_methods.blocking_recv().unwrap().is_ok());
        assert!(rx_exec.blocking_recv().unwrap().is_ok());
    }

    #[test]
    fn fail_all_rejects_everything_with_connection_lost() {
        let router = RequestRouter::new("porch");
        router.set_connected(true);
        let (_a, rx_a) = router.register(EventKind::Executed);
        let (_b, rx_b) = router.register(EventKind::Ready);

        router.fail_all();

        for rx in [rx_a, rx_b] {
            let result = rx.blocking_recv().unwrap();
            assert!(matches!(result, Err(FleetError::ConnectionLost { .. })));
        }
        assert!(!router.is_connected());
    }

    #[test]
    fn cancelled_waiters_never_resolve() {
        let router = RequestRouter::new("porch");
        let (id, rx) = router.register(EventKind::Executed);
        router.cancel(id);
        router.resolve(WorkerEvent::Executed {
            retval: serde_json::json!(1),
        });
        // Sender side was dropped by cancel.
        assert!(rx.blocking_recv().is_err());
    }
}
