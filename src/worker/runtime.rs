//! Worker RPC loop.
//!
//! `WorkerRuntime` owns the live component map for one board and processes
//! commands sequentially off its bus subscription, in the same
//! single-owner/event-loop shape the supervisor side uses. Sequential
//! processing means no locks around the component map and no interleaving
//! surprises between an `instantiate` and the `execute` that follows it.

use crate::board::{self, BoardComponent, BoardDriver, ComponentRegistry};
use crate::bus::{BusMessage, MessageBus};
use crate::error::{FleetError, FleetResult};
use crate::protocol::{
    command_subscription, event_topic, CommandKind, DirRequest, ExecuteRequest,
    InstantiateRequest, WorkerEvent,
};
use crate::util::unique_id;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_BOARD_TIMEOUT: Duration = Duration::from_secs(10);

/// Names starting with this marker never cross the wire in a `dir` listing.
const PRIVATE_MARKER: char = '_';

/// The worker-side half of one device.
pub struct WorkerRuntime {
    device_id: String,
    bus: Arc<dyn MessageBus>,
    registry: ComponentRegistry,
    board_timeout: Duration,
    board: Option<Arc<dyn BoardDriver>>,
    components: HashMap<String, Box<dyn BoardComponent>>,
}

impl WorkerRuntime {
    /// Build a runtime for a device over the given bus and registry.
    pub fn new(
        device_id: impl Into<String>,
        bus: Arc<dyn MessageBus>,
        registry: ComponentRegistry,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            bus,
            registry,
            board_timeout: DEFAULT_BOARD_TIMEOUT,
            board: None,
            components: HashMap::new(),
        }
    }

    /// Bound how long board initialization may take before the worker gives
    /// up and reports an error to its supervisor.
    pub fn with_board_timeout(mut self, board_timeout: Duration) -> Self {
        self.board_timeout = board_timeout;
        self
    }

    /// Initialize the board, perform the ready handshake, then serve
    /// commands until `shutdown` fires or the bus subscription closes.
    ///
    /// Per-command failures are published as `error` events and do not end
    /// the loop. An `Err` return is a fatal runtime fault; the binary
    /// terminates the process on it.
    pub async fn run(mut self, board_config: Value, shutdown: CancellationToken) -> FleetResult<()> {
        // Subscribe before the ready handshake so no command can slip past
        // between "supervisor saw ready" and "worker is listening".
        let mut commands = self
            .bus
            .subscribe(&command_subscription(&self.device_id))
            .await?;

        // Shutdown must be able to preempt a board that hangs during init.
        let opened = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            opened = timeout(self.board_timeout, board::open(&board_config)) => opened,
        };
        let board = match opened {
            Ok(Ok(board)) => board,
            Ok(Err(err)) => {
                let message = format!("board failed to initialize: {err}");
                self.publish_event(&WorkerEvent::Error {
                    message: message.clone(),
                })
                .await?;
                return Err(FleetError::Protocol(message));
            }
            Err(_) => {
                let message = "board timed out".to_string();
                self.publish_event(&WorkerEvent::Error {
                    message: message.clone(),
                })
                .await?;
                return Err(FleetError::Protocol(message));
            }
        };
        info!(device = %self.device_id, board = %board.id(), "board ready");
        self.publish_event(&WorkerEvent::Ready {
            id: board.id().to_string(),
        })
        .await?;
        self.board = Some(board);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(device = %self.device_id, "worker shutdown requested");
                    return Ok(());
                }
                msg = commands.recv() => {
                    match msg {
                        Some(msg) => {
                            // Shutdown preempts even an in-flight command,
                            // mirroring how a kill signal lands mid-call.
                            tokio::select! {
                                _ = shutdown.cancelled() => {
                                    debug!(device = %self.device_id, "worker shutdown requested");
                                    return Ok(());
                                }
                                outcome = self.dispatch(msg) => outcome?,
                            }
                        }
                        None => {
                            debug!(device = %self.device_id, "command subscription closed");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn dispatch(&mut self, msg: BusMessage) -> FleetResult<()> {
        let segment = msg.topic.rsplit('/').next().unwrap_or_default();
        let Some(kind) = CommandKind::parse(segment) else {
            return self
                .reply_error(format!("unknown command \"{segment}\""))
                .await;
        };
        debug!(device = %self.device_id, command = segment, "dispatching");
        match kind {
            CommandKind::Instantiate => self.handle_instantiate(msg.payload).await,
            CommandKind::Execute => self.handle_execute(msg.payload).await,
            CommandKind::Dir => self.handle_dir(msg.payload).await,
        }
    }

    async fn handle_instantiate(&mut self, payload: Value) -> FleetResult<()> {
        let request: InstantiateRequest = match serde_json::from_value(payload) {
            Ok(request) => request,
            Err(err) => {
                return self
                    .reply_error(format!("malformed instantiate request: {err}"))
                    .await
            }
        };
        let class = crate::util::normalize_class(&request.component_class);
        if !self.registry.contains(&class) {
            return self
                .reply_error(format!("unknown component class \"{class}\""))
                .await;
        }
        let id = request
            .opts
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| unique_id(&class.to_lowercase()));

        // The board is set before the command loop starts.
        let Some(board) = self.board.clone() else {
            return self.reply_error("board not initialized".to_string()).await;
        };
        let component = match self.registry.construct(&class, board, &request.opts) {
            Ok(component) => component,
            Err(err) => {
                return self
                    .reply_error(format!(
                        "failed to instantiate component class \"{class}\": {err}"
                    ))
                    .await
            }
        };
        let methods = public_methods(component.methods());
        self.components.insert(id.clone(), component);
        info!(device = %self.device_id, component = %id, class = %class, "component instantiated");
        self.publish_event(&WorkerEvent::Instantiated {
            id,
            component_class: class,
            methods,
        })
        .await
    }

    async fn handle_execute(&mut self, payload: Value) -> FleetResult<()> {
        let request: ExecuteRequest = match serde_json::from_value(payload) {
            Ok(request) => request,
            Err(err) => {
                return self
                    .reply_error(format!("malformed execute request: {err}"))
                    .await
            }
        };
        let Some(component) = self.components.get(&request.id) else {
            return self
                .reply_error(format!("unknown component \"{}\"", request.id))
                .await;
        };
        match component.call(&request.method, &request.args).await {
            // A method with nothing serializable to report yields `true`.
            Ok(retval) => {
                self.publish_event(&WorkerEvent::Executed {
                    retval: retval.unwrap_or(json!(true)),
                })
                .await
            }
            Err(err) => self.reply_error(err.to_string()).await,
        }
    }

    async fn handle_dir(&mut self, payload: Value) -> FleetResult<()> {
        let request: DirRequest = match serde_json::from_value(payload) {
            Ok(request) => request,
            Err(err) => {
                return self
                    .reply_error(format!("malformed dir request: {err}"))
                    .await
            }
        };
        let methods = match (&request.id, &request.component_class) {
            (Some(id), None) => match self.components.get(id) {
                Some(component) => public_methods(component.methods()),
                None => {
                    return self.reply_error(format!("unknown component \"{id}\"")).await;
                }
            },
            (None, Some(class)) => {
                let class = crate::util::normalize_class(class);
                match self.registry.methods(&class) {
                    Some(methods) => public_methods(methods),
                    None => {
                        return self
                            .reply_error(format!("unknown component class \"{class}\""))
                            .await;
                    }
                }
            }
            _ => {
                return self
                    .reply_error("dir requires exactly one of id or componentClass".to_string())
                    .await;
            }
        };
        self.publish_event(&WorkerEvent::Methods { methods }).await
    }

    async fn reply_error(&self, message: String) -> FleetResult<()> {
        warn!(device = %self.device_id, %message, "command failed");
        self.publish_event(&WorkerEvent::Error { message }).await
    }

    async fn publish_event(&self, event: &WorkerEvent) -> FleetResult<()> {
        let (name, payload) = event.to_wire()?;
        self.bus
            .publish(&event_topic(&self.device_id, name), payload)
            .await
    }
}

fn public_methods(methods: &[&str]) -> Vec<String> {
    methods
        .iter()
        .filter(|m| !m.starts_with(PRIVATE_MARKER))
        .map(|m| (*m).to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::sim::sim_registry;
    use crate::bus::MemoryBus;
    use crate::protocol::{command_topic, event_subscription};

    /// Spawn a worker with an event subscription created before it can
    /// publish anything, so tests never miss the ready handshake.
    async fn started_worker(
        device_id: &str,
    ) -> (
        MemoryBus,
        tokio::sync::mpsc::Receiver<BusMessage>,
        CancellationToken,
    ) {
        let bus = MemoryBus::new();
        let events = bus.subscribe(&event_subscription(device_id)).await.unwrap();
        let token = CancellationToken::new();
        let runtime = WorkerRuntime::new(
            device_id,
            Arc::new(bus.clone()) as Arc<dyn MessageBus>,
            sim_registry(),
        );
        let child = token.clone();
        tokio::spawn(async move { runtime.run(json!({}), child).await });
        (bus, events, token)
    }

    async fn next_event(
        rx: &mut tokio::sync::mpsc::Receiver<BusMessage>,
    ) -> (String, Value) {
        let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let event = msg.topic.rsplit('/').next().unwrap().to_string();
        (event, msg.payload)
    }

    #[tokio::test]
    async fn publishes_ready_after_board_init() {
        let (_bus, mut events, token) = started_worker("porch").await;
        let (event, payload) = next_event(&mut events).await;
        assert_eq!(event, "ready");
        assert!(payload["id"].is_string());
        token.cancel();
    }

    #[tokio::test]
    async fn unknown_class_replies_error_and_registers_nothing() {
        let (bus, mut events, token) = started_worker("porch").await;
        let (event, _) = next_event(&mut events).await;
        assert_eq!(event, "ready");

        bus.publish(
            &command_topic("porch", CommandKind::Instantiate),
            json!({"componentClass": "Teleporter", "opts": {}}),
        )
        .await
        .unwrap();
        let (event, payload) = next_event(&mut events).await;
        assert_eq!(event, "error");
        assert!(payload["message"].as_str().unwrap().contains("Teleporter"));

        // A dir against the never-registered id keeps failing.
        bus.publish(
            &command_topic("porch", CommandKind::Dir),
            json!({"id": "teleporter-1"}),
        )
        .await
        .unwrap();
        let (event, _) = next_event(&mut events).await;
        assert_eq!(event, "error");
        token.cancel();
    }

    #[tokio::test]
    async fn instantiate_then_dir_agree_on_methods() {
        let (bus, mut events, token) = started_worker("porch").await;
        let (event, _) = next_event(&mut events).await;
        assert_eq!(event, "ready");

        bus.publish(
            &command_topic("porch", CommandKind::Instantiate),
            json!({"componentClass": "Sensor", "opts": {"id": "photo", "value": 10.0}}),
        )
        .await
        .unwrap();
        let (event, payload) = next_event(&mut events).await;
        assert_eq!(event, "instantiated");
        assert_eq!(payload["id"], "photo");
        let discovered = payload["methods"].clone();
        // The private _tare never shows up.
        assert!(!discovered
            .as_array()
            .unwrap()
            .iter()
            .any(|m| m.as_str().unwrap().starts_with('_')));

        bus.publish(
            &command_topic("porch", CommandKind::Dir),
            json!({"id": "photo"}),
        )
        .await
        .unwrap();
        let (event, payload) = next_event(&mut events).await;
        assert_eq!(event, "methods");
        assert_eq!(payload["methods"], discovered);
        token.cancel();
    }

    #[tokio::test]
    async fn execute_substitutes_true_for_void_returns() {
        let (bus, mut events, token) = started_worker("porch").await;
        let (event, _) = next_event(&mut events).await;
        assert_eq!(event, "ready");

        bus.publish(
            &command_topic("porch", CommandKind::Instantiate),
            json!({"componentClass": "Led", "opts": {"id": "led-1"}}),
        )
        .await
        .unwrap();
        let (event, _) = next_event(&mut events).await;
        assert_eq!(event, "instantiated");

        bus.publish(
            &command_topic("porch", CommandKind::Execute),
            json!({"id": "led-1", "method": "on", "args": []}),
        )
        .await
        .unwrap();
        let (event, payload) = next_event(&mut events).await;
        assert_eq!(event, "executed");
        assert_eq!(payload["retval"], json!(true));
        token.cancel();
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn dir_rejects_ambiguous_requests() {
        let (bus, mut events, token) = started_worker("porch").await;
        let (event, _) = next_event(&mut events).await;
        assert_eq!(event, "ready");

        bus.publish(
            &command_topic("porch", CommandKind::Dir),
            json!({"id": "x", "componentClass": "Led"}),
        )
        .await
        .unwrap();
        let (event, payload) = next_event(&mut events).await;
        assert_eq!(event, "error");
        assert!(payload["message"]
            .as_str()
            .unwrap()
            .contains("exactly one"));
        assert!(logs_contain("command failed"));
        token.cancel();
    }

    #[tokio::test]
    async fn failing_board_publishes_error() {
        let bus = MemoryBus::new();
        let mut events = bus.subscribe(&event_subscription("porch")).await.unwrap();
        let runtime = WorkerRuntime::new(
            "porch",
            Arc::new(bus.clone()) as Arc<dyn MessageBus>,
            sim_registry(),
        );
        let result = runtime
            .run(json!({"behavior": "fail"}), CancellationToken::new())
            .await;
        assert!(result.is_err());
        let (event, payload) = next_event(&mut events).await;
        assert_eq!(event, "error");
        assert!(payload["message"]
            .as_str()
            .unwrap()
            .contains("failed to initialize"));
    }
}
