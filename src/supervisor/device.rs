//! Device supervisor.
//!
//! One `Device` owns one worker process and its set of component proxies,
//! and drives the explicit state machine `stopped -> starting -> started`.
//! Transitions are checked against a table at every call; an event missing
//! from the table is a rejected `InvalidTransition`, not undefined behavior.
//!
//! Supervision shape: each fork gets its own cancellation scope covering the
//! event pump and the exit watcher, so a fault in one device's worker can
//! never corrupt another device's state. The worker's death, expected or
//! not, rejects every pending request with `ConnectionLost` and drops the
//! device back to `stopped`.

use super::component::ComponentProxy;
use super::handle::{DeviceLink, RequestRouter, WorkerHandle};
use super::launcher::WorkerLauncher;
use crate::bus::{BusMessage, MessageBus};
use crate::config::ComponentSettings;
use crate::error::{FleetError, FleetResult};
use crate::events::FleetEvent;
use crate::protocol::{event_subscription, DirRequest, EventKind, WorkerEvent};
use crate::util::normalize_class;
use crate::worker::WorkerEnv;
use futures::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Tagged device state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// No worker process; the initial and terminal state.
    Stopped,
    /// A start is in flight: forking, handshaking, instantiating components.
    Starting,
    /// Worker connected and the start handshake resolved.
    Started,
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceState::Stopped => write!(f, "stopped"),
            DeviceState::Starting => write!(f, "starting"),
            DeviceState::Started => write!(f, "started"),
        }
    }
}

/// The transition table. Events absent from it are rejected; they never
/// fall through to undefined behavior.
fn transition(from: DeviceState, event: &'static str) -> Option<DeviceState> {
    match (event, from) {
        ("start", DeviceState::Stopped) => Some(DeviceState::Starting),
        ("stop", _) => Some(DeviceState::Stopped),
        _ => None,
    }
}

/// Everything a device supervisor needs to know about its device.
#[derive(Debug, Clone)]
pub struct DeviceSpec {
    /// Stable slug id, unique within the fleet.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Opaque board configuration passed through to the worker.
    pub board: Value,
    /// Components instantiated eagerly at start.
    pub components: Vec<ComponentSettings>,
    /// How long to wait for the worker's ready handshake.
    pub ready_timeout: Duration,
    /// Minimum spacing between fork attempts.
    pub retry_interval: Duration,
    /// Fork attempts before the start fails with a fork error.
    pub retry_max_tries: u32,
    /// Escalate component instantiation failures into device-start failures.
    pub fail_on_error: bool,
    /// Namespace handed to the worker environment.
    pub namespace: String,
    /// Project handed to the worker environment.
    pub project: String,
    /// Bus spool directory handed to the worker environment.
    pub bus_dir: PathBuf,
}

/// Optional hook invoked before each fork during `start`.
pub type PreStartHook =
    Box<dyn Fn() -> futures::future::BoxFuture<'static, FleetResult<()>> + Send + Sync>;

struct DeviceInner {
    spec: DeviceSpec,
    bus: Arc<dyn MessageBus>,
    launcher: Arc<dyn WorkerLauncher>,
    link: Arc<DeviceLink>,
    state: Mutex<DeviceState>,
    worker: AsyncMutex<Option<WorkerHandle>>,
    components: Mutex<HashMap<String, Arc<ComponentProxy>>>,
    scope: Mutex<Option<CancellationToken>>,
    events: broadcast::Sender<FleetEvent>,
    pre_start: Mutex<Option<PreStartHook>>,
}

/// Supervisor for one device and its worker process.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    /// Build a supervisor from a spec. Nothing runs until `start`.
    pub fn new(
        spec: DeviceSpec,
        bus: Arc<dyn MessageBus>,
        launcher: Arc<dyn WorkerLauncher>,
        events: broadcast::Sender<FleetEvent>,
    ) -> Self {
        let router = RequestRouter::new(spec.id.clone());
        let link = Arc::new(DeviceLink {
            device_id: spec.id.clone(),
            bus: bus.clone(),
            router,
            // Discovery and execute requests share the ready-handshake bound.
            request_timeout: spec.ready_timeout,
        });
        Self {
            inner: Arc::new(DeviceInner {
                spec,
                bus,
                launcher,
                link,
                state: Mutex::new(DeviceState::Stopped),
                worker: AsyncMutex::new(None),
                components: Mutex::new(HashMap::new()),
                scope: Mutex::new(None),
                events,
                pre_start: Mutex::new(None),
            }),
        }
    }

    /// Install a hook to run before each fork.
    pub fn set_pre_start(&self, hook: PreStartHook) {
        if let Ok(mut slot) = self.inner.pre_start.lock() {
            *slot = Some(hook);
        }
    }

    /// Device id.
    pub fn id(&self) -> &str {
        &self.inner.spec.id
    }

    /// Human-readable name.
    pub fn name(&self) -> &str {
        &self.inner.spec.name
    }

    /// Human-readable description.
    pub fn description(&self) -> &str {
        &self.inner.spec.description
    }

    /// Current state.
    pub fn state(&self) -> DeviceState {
        self.inner
            .state
            .lock()
            .map(|s| *s)
            .unwrap_or(DeviceState::Stopped)
    }

    /// Whether a worker process is currently connected.
    pub fn connected(&self) -> bool {
        self.inner.link.router.is_connected()
    }

    /// Proxies of all successfully instantiated components.
    pub fn components(&self) -> Vec<Arc<ComponentProxy>> {
        self.inner
            .components
            .lock()
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Look up a component proxy by id.
    pub fn component_by_id(&self, id: &str) -> Option<Arc<ComponentProxy>> {
        self.inner
            .components
            .lock()
            .ok()
            .and_then(|c| c.get(id).cloned())
    }

    fn set_state(&self, to: DeviceState) {
        let from = {
            let Ok(mut state) = self.inner.state.lock() else {
                return;
            };
            let from = *state;
            *state = to;
            from
        };
        if from != to {
            debug!(device = %self.id(), %from, %to, "state transition");
            let _ = self.inner.events.send(FleetEvent::DeviceStateChanged {
                device: self.id().to_string(),
                from,
                to,
            });
        }
    }

    /// Start the device: pre-start hook, fork with retry, ready handshake,
    /// parallel component instantiation, then `started`.
    ///
    /// Starting an already-started device is a no-op; starting while a start
    /// is in flight is a rejected transition.
    pub async fn start(&self) -> FleetResult<()> {
        {
            let Ok(mut state) = self.inner.state.lock() else {
                return Err(FleetError::Protocol("device state poisoned".to_string()));
            };
            match *state {
                DeviceState::Started => {
                    debug!(device = %self.id(), "already started");
                    return Ok(());
                }
                from => match transition(from, "start") {
                    Some(next) => *state = next,
                    None => {
                        return Err(FleetError::InvalidTransition {
                            from,
                            event: "start",
                        });
                    }
                },
            }
        }
        let _ = self.inner.events.send(FleetEvent::DeviceStateChanged {
            device: self.id().to_string(),
            from: DeviceState::Stopped,
            to: DeviceState::Starting,
        });
        info!(device = %self.id(), "starting");

        match self.run_start().await {
            Ok(()) => {
                self.set_state(DeviceState::Started);
                info!(device = %self.id(), "started");
                Ok(())
            }
            Err(err) => {
                // Failed starts leave no half-alive worker behind.
                self.kill_worker().await;
                self.set_state(DeviceState::Stopped);
                Err(err)
            }
        }
    }

    async fn run_start(&self) -> FleetResult<()> {
        let hook = {
            let Ok(slot) = self.inner.pre_start.lock() else {
                return Err(FleetError::Protocol("device state poisoned".to_string()));
            };
            slot.as_ref().map(|hook| hook())
        };
        if let Some(fut) = hook {
            fut.await?;
        }
        self.fork_with_retry().await?;
        self.instantiate_components().await
    }

    /// Stop the device, killing its worker. Legal from every state,
    /// idempotent.
    pub async fn stop(&self) -> FleetResult<()> {
        let Some(next) = transition(self.state(), "stop") else {
            return Err(FleetError::InvalidTransition {
                from: self.state(),
                event: "stop",
            });
        };
        self.kill_worker().await;
        self.set_state(next);
        Ok(())
    }

    /// Stop, then start again.
    pub async fn restart(&self) -> FleetResult<()> {
        self.stop().await?;
        self.start().await
    }

    /// Instantiate one component on demand against the running worker.
    pub async fn component(
        &self,
        component_class: &str,
        opts: Value,
    ) -> FleetResult<Arc<ComponentProxy>> {
        if !self.connected() {
            return Err(FleetError::ConnectionLost {
                device: self.id().to_string(),
            });
        }
        let proxy = Arc::new(ComponentProxy::new(
            self.inner.link.clone(),
            component_class,
            None,
            opts,
        ));
        proxy.instantiate().await?;
        if let Ok(mut components) = self.inner.components.lock() {
            components.insert(proxy.id(), proxy.clone());
        }
        Ok(proxy)
    }

    /// List a component's methods by id (`dir` round trip).
    pub async fn dir(&self, id: &str) -> FleetResult<Vec<String>> {
        let request = DirRequest {
            id: Some(id.to_string()),
            component_class: None,
        };
        self.dir_request(request).await
    }

    /// List the declared methods of a component class.
    pub async fn dir_class(&self, component_class: &str) -> FleetResult<Vec<String>> {
        let request = DirRequest {
            id: None,
            component_class: Some(normalize_class(component_class)),
        };
        self.dir_request(request).await
    }

    async fn dir_request(&self, request: DirRequest) -> FleetResult<Vec<String>> {
        let event = self
            .inner
            .link
            .request(
                crate::protocol::CommandKind::Dir,
                serde_json::to_value(&request)?,
                EventKind::Methods,
            )
            .await?;
        match event {
            WorkerEvent::Methods { methods } => Ok(methods),
            _ => Err(FleetError::Protocol(
                "dir resolved with an unexpected event".to_string(),
            )),
        }
    }

    // =========================================================================
    // Fork machinery
    // =========================================================================

    async fn fork_with_retry(&self) -> FleetResult<()> {
        let tries = self.inner.spec.retry_max_tries.max(1);
        let mut last_reason = String::new();
        for attempt in 1..=tries {
            match self.fork_once().await {
                Ok(()) => return Ok(()),
                // A concurrent fork is a programming error, not retryable.
                Err(err @ FleetError::ForkInProgress { .. }) => return Err(err),
                Err(err) => {
                    warn!(
                        device = %self.id(),
                        attempt,
                        tries,
                        error = %err,
                        "fork attempt failed"
                    );
                    last_reason = err.to_string();
                    if attempt < tries {
                        tokio::time::sleep(self.inner.spec.retry_interval).await;
                    }
                }
            }
        }
        Err(FleetError::Fork {
            device: self.id().to_string(),
            attempts: tries,
            reason: last_reason,
        })
    }

    async fn fork_once(&self) -> FleetResult<()> {
        let mut worker_slot = self.inner.worker.lock().await;
        if worker_slot.as_ref().is_some_and(WorkerHandle::is_connected) {
            return Err(FleetError::ForkInProgress {
                device: self.id().to_string(),
            });
        }

        // Fresh supervision scope per fork; the previous pump dies with it.
        let scope = CancellationToken::new();
        {
            let Ok(mut slot) = self.inner.scope.lock() else {
                return Err(FleetError::Protocol("device state poisoned".to_string()));
            };
            if let Some(old) = slot.replace(scope.clone()) {
                old.cancel();
            }
        }
        let subscription = self
            .inner
            .bus
            .subscribe(&event_subscription(self.id()))
            .await?;
        self.spawn_event_pump(subscription, scope.clone());

        // The ready waiter registers before the launch so a fast worker
        // cannot win the race.
        let (waiter, ready_rx) = self.inner.link.router.register(EventKind::Ready);

        let env = WorkerEnv {
            device_id: self.inner.spec.id.clone(),
            namespace: self.inner.spec.namespace.clone(),
            project: self.inner.spec.project.clone(),
            bus_dir: self.inner.spec.bus_dir.clone(),
            board_config: self.inner.spec.board.clone(),
        };
        let handle = match self.inner.launcher.launch(&env).await {
            Ok(handle) => handle,
            Err(err) => {
                self.inner.link.router.cancel(waiter);
                scope.cancel();
                return Err(err);
            }
        };
        self.spawn_exit_watcher(handle.clone(), scope.clone());

        match tokio::time::timeout(self.inner.spec.ready_timeout, ready_rx).await {
            Err(_) => {
                self.inner.link.router.cancel(waiter);
                handle.kill();
                scope.cancel();
                Err(FleetError::Protocol(
                    "ready handshake timed out".to_string(),
                ))
            }
            Ok(Err(_)) => {
                handle.kill();
                scope.cancel();
                Err(FleetError::Protocol(
                    "worker exited before ready".to_string(),
                ))
            }
            Ok(Ok(Err(err))) => {
                handle.kill();
                scope.cancel();
                Err(err)
            }
            Ok(Ok(Ok(event))) => {
                if let WorkerEvent::Ready { id } = event {
                    debug!(device = %self.id(), board = %id, "ready handshake complete");
                }
                self.inner.link.router.set_connected(true);
                *worker_slot = Some(handle);
                Ok(())
            }
        }
    }

    fn spawn_event_pump(&self, mut rx: mpsc::Receiver<BusMessage>, scope: CancellationToken) {
        let router = self.inner.link.router.clone();
        let device_id = self.id().to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = scope.cancelled() => break,
                    msg = rx.recv() => {
                        let Some(msg) = msg else { break };
                        let segment = msg.topic.rsplit('/').next().unwrap_or_default();
                        match WorkerEvent::parse(segment, msg.payload) {
                            Ok(event) => router.resolve(event),
                            Err(err) => {
                                debug!(device = %device_id, error = %err, "unparseable worker event dropped");
                            }
                        }
                    }
                }
            }
        });
    }

    fn spawn_exit_watcher(&self, handle: WorkerHandle, scope: CancellationToken) {
        let device = self.clone();
        tokio::spawn(async move {
            handle.wait_exit().await;
            if scope.is_cancelled() {
                // This fork's scope was already torn down (stop or re-fork);
                // nothing left to clean up.
                return;
            }
            scope.cancel();
            device.inner.link.router.fail_all();
            if let Ok(mut components) = device.inner.components.lock() {
                components.clear();
            }
            let was_started = device.state() == DeviceState::Started;
            if was_started {
                warn!(device = %device.id(), "worker exited unexpectedly");
                device.set_state(DeviceState::Stopped);
            }
            let _ = device.inner.events.send(FleetEvent::WorkerExited {
                device: device.id().to_string(),
            });
        });
    }

    async fn kill_worker(&self) {
        {
            let Ok(mut slot) = self.inner.scope.lock() else {
                return;
            };
            if let Some(scope) = slot.take() {
                scope.cancel();
            }
        }
        // Reject pending requests within this tick; the exit watcher would
        // also get there, but later.
        self.inner.link.router.fail_all();
        if let Ok(mut components) = self.inner.components.lock() {
            components.clear();
        }
        let handle = self.inner.worker.lock().await.take();
        if let Some(handle) = handle {
            handle.kill();
            handle.wait_exit().await;
            debug!(device = %self.id(), "worker killed");
        }
    }

    // =========================================================================
    // Component instantiation
    // =========================================================================

    async fn instantiate_components(&self) -> FleetResult<()> {
        let specs = self.inner.spec.components.clone();
        if specs.is_empty() {
            warn!(device = %self.id(), "no components configured, not much to do");
            return Ok(());
        }
        debug!(device = %self.id(), count = specs.len(), "instantiating components");

        let attempts = specs.into_iter().map(|spec| {
            let proxy = Arc::new(ComponentProxy::new(
                self.inner.link.clone(),
                &spec.class,
                spec.name.clone(),
                spec.opts.clone(),
            ));
            async move {
                let outcome = proxy.instantiate().await;
                (proxy, outcome)
            }
        });

        let mut failures = Vec::new();
        for (proxy, outcome) in join_all(attempts).await {
            match outcome {
                Ok(()) => {
                    if let Ok(mut components) = self.inner.components.lock() {
                        components.insert(proxy.id(), proxy);
                    }
                }
                Err(err) => {
                    error!(
                        device = %self.id(),
                        class = %proxy.component_class(),
                        error = %err,
                        "component failed to instantiate"
                    );
                    let _ = self.inner.events.send(FleetEvent::ComponentFailed {
                        device: self.id().to_string(),
                        component_class: proxy.component_class().to_string(),
                        message: err.to_string(),
                    });
                    failures.push(err);
                }
            }
        }

        if !failures.is_empty() && self.inner.spec.fail_on_error {
            return Err(FleetError::Protocol(format!(
                "{} component(s) failed to instantiate",
                failures.len()
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("connected", &self.connected())
            .finish()
    }
}
