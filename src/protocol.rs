//! Wire protocol between the supervisor and its workers.
//!
//! All supervisor/worker traffic travels over the message bus as JSON
//! payloads on hierarchical topics:
//!
//! - supervisor -> worker: `<deviceId>/<command>` with commands
//!   `instantiate`, `execute` and `dir`;
//! - worker -> supervisor: `<deviceId>-local/<event>` with events `ready`,
//!   `instantiated`, `executed`, `methods` and `error`.
//!
//! The request/response shapes are deliberately small and carry no
//! correlation ids; responses pair with requests per device in FIFO order by
//! expected event kind (see [`crate::supervisor`]). Field names on the wire
//! are camelCase.

use crate::error::FleetError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Suffix appended to a device id to form its worker-side client id.
pub const LOCAL_SUFFIX: &str = "-local";

/// Client id a worker identifies itself with (`<deviceId>-local`).
pub fn worker_client_id(device_id: &str) -> String {
    format!("{device_id}{LOCAL_SUFFIX}")
}

/// Topic a single command is published on (`<deviceId>/<command>`).
pub fn command_topic(device_id: &str, command: CommandKind) -> String {
    format!("{device_id}/{}", command.as_str())
}

/// Topic a single worker event is published on (`<deviceId>-local/<event>`).
pub fn event_topic(device_id: &str, event: &str) -> String {
    format!("{device_id}{LOCAL_SUFFIX}/{event}")
}

/// Wildcard pattern covering every command addressed to a device.
pub fn command_subscription(device_id: &str) -> String {
    format!("{device_id}/+")
}

/// Wildcard pattern covering every event a device's worker publishes.
pub fn event_subscription(device_id: &str) -> String {
    format!("{device_id}{LOCAL_SUFFIX}/+")
}

/// Commands a supervisor can send to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Construct a component inside the worker.
    Instantiate,
    /// Invoke a discovered method on an instantiated component.
    Execute,
    /// List method names for a class or an instantiated component.
    Dir,
}

impl CommandKind {
    /// Wire name of the command (the last topic segment).
    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::Instantiate => "instantiate",
            CommandKind::Execute => "execute",
            CommandKind::Dir => "dir",
        }
    }

    /// Parse the last topic segment of a command topic.
    pub fn parse(segment: &str) -> Option<Self> {
        match segment {
            "instantiate" => Some(CommandKind::Instantiate),
            "execute" => Some(CommandKind::Execute),
            "dir" => Some(CommandKind::Dir),
            _ => None,
        }
    }
}

/// Payload of an `instantiate` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstantiateRequest {
    /// Capability kind recognized by the worker's component registry.
    pub component_class: String,
    /// Opaque constructor options, passed through to the component.
    #[serde(default)]
    pub opts: Value,
}

/// Payload of an `execute` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    /// Component id assigned at instantiate time.
    pub id: String,
    /// Discovered method name.
    pub method: String,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,
}

/// Payload of a `dir` command. Exactly one of `id`/`component_class` must be
/// present; the worker replies with an error otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirRequest {
    /// Instantiated component id to introspect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Component class to introspect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_class: Option<String>,
}

/// The kind of a worker event, used for response pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Worker process is up and its hardware binding initialized.
    Ready,
    /// An `instantiate` command succeeded.
    Instantiated,
    /// An `execute` command succeeded.
    Executed,
    /// A `dir` command succeeded.
    Methods,
    /// A command failed; rejects the oldest pending request.
    Error,
}

impl EventKind {
    /// Wire name of the event (the last topic segment).
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Ready => "ready",
            EventKind::Instantiated => "instantiated",
            EventKind::Executed => "executed",
            EventKind::Methods => "methods",
            EventKind::Error => "error",
        }
    }
}

/// A fully parsed worker event.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// The ready handshake; carries the board id reported by the driver.
    Ready {
        /// Board identity reported by the hardware binding.
        id: String,
    },
    /// Successful component construction.
    Instantiated {
        /// Component id (worker-assigned when the request carried none).
        id: String,
        /// Normalized component class.
        component_class: String,
        /// Discovered public method names.
        methods: Vec<String>,
    },
    /// Successful method invocation.
    Executed {
        /// Return value, or boolean `true` when the real return value is not
        /// serializable.
        retval: Value,
    },
    /// `dir` response.
    Methods {
        /// Public method names, private-marker names filtered out.
        methods: Vec<String>,
    },
    /// Command failure.
    Error {
        /// Human-readable description.
        message: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadyPayload {
    id: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstantiatedPayload {
    id: String,
    component_class: String,
    methods: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecutedPayload {
    retval: Value,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MethodsPayload {
    methods: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorPayload {
    message: String,
}

impl WorkerEvent {
    /// Kind of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            WorkerEvent::Ready { .. } => EventKind::Ready,
            WorkerEvent::Instantiated { .. } => EventKind::Instantiated,
            WorkerEvent::Executed { .. } => EventKind::Executed,
            WorkerEvent::Methods { .. } => EventKind::Methods,
            WorkerEvent::Error { .. } => EventKind::Error,
        }
    }

    /// Parse an event from its topic segment and JSON payload.
    ///
    /// Unknown event names and malformed payloads are protocol errors; the
    /// supervisor logs and drops them rather than crashing the router.
    pub fn parse(event: &str, payload: Value) -> Result<Self, FleetError> {
        match event {
            "ready" => {
                let p: ReadyPayload = serde_json::from_value(payload)?;
                Ok(WorkerEvent::Ready { id: p.id })
            }
            "instantiated" => {
                let p: InstantiatedPayload = serde_json::from_value(payload)?;
                Ok(WorkerEvent::Instantiated {
                    id: p.id,
                    component_class: p.component_class,
                    methods: p.methods,
                })
            }
            "executed" => {
                let p: ExecutedPayload = serde_json::from_value(payload)?;
                Ok(WorkerEvent::Executed { retval: p.retval })
            }
            "methods" => {
                let p: MethodsPayload = serde_json::from_value(payload)?;
                Ok(WorkerEvent::Methods { methods: p.methods })
            }
            "error" => {
                let p: ErrorPayload = serde_json::from_value(payload)?;
                Ok(WorkerEvent::Error { message: p.message })
            }
            other => Err(FleetError::Protocol(format!(
                "unknown worker event \"{other}\""
            ))),
        }
    }

    /// Render this event into its topic segment and JSON payload.
    pub fn to_wire(&self) -> Result<(&'static str, Value), FleetError> {
        let payload = match self {
            WorkerEvent::Ready { id } => serde_json::to_value(ReadyPayload { id: id.clone() })?,
            WorkerEvent::Instantiated {
                id,
                component_class,
                methods,
            } => serde_json::to_value(InstantiatedPayload {
                id: id.clone(),
                component_class: component_class.clone(),
                methods: methods.clone(),
            })?,
            WorkerEvent::Executed { retval } => serde_json::to_value(ExecutedPayload {
                retval: retval.clone(),
            })?,
            WorkerEvent::Methods { methods } => serde_json::to_value(MethodsPayload {
                methods: methods.clone(),
            })?,
            WorkerEvent::Error { message } => serde_json::to_value(ErrorPayload {
                message: message.clone(),
            })?,
        };
        Ok((self.kind().as_str(), payload))
    }
}
