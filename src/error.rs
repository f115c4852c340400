//! Custom error types for the fleet supervisor.
//!
//! This module defines the primary error type, `FleetError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different kinds of failure the control plane
//! can see, from configuration problems to worker processes dying mid-call.
//!
//! ## Error Taxonomy
//!
//! The variants that drive supervision decisions:
//!
//! - **`Fork`**: a worker process failed to spawn, or never completed its
//!   ready handshake within the configured timeout. Retryable up to
//!   `retry_max_tries`, then terminal for that start attempt.
//! - **`Protocol`** / **`UnknownMethod`** / **`NotInstantiated`** /
//!   **`RequestTimeout`**: a specific request went wrong (malformed or missing
//!   response, call against an undiscovered method). Surfaced to the caller of
//!   that operation only; sibling operations are unaffected.
//! - **`ConnectionLost`**: the worker process exited while requests were
//!   outstanding; every pending request for that device rejects with this.
//! - **`AggregateStart`**: raised by the fleet manager only when
//!   `fail_on_error` is set and at least one device failed to start; carries
//!   the identities of the failed devices.
//! - **`InvalidTransition`**: a state-machine event not present in the
//!   transition table (e.g. `start` while already `starting`).
//!
//! Everything else (`Config`, `Io`, `Serialization`, `Bus`, `WorkerEnv`, ...)
//! is ambient plumbing. `#[from]` conversions keep `?` ergonomic throughout.

use crate::supervisor::DeviceState;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type FleetResult<T> = std::result::Result<T, FleetError>;

/// All the ways fleet supervision can fail.
#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Bus error: {0}")]
    Bus(String),

    #[error("Worker environment error: missing or empty variable {0}")]
    WorkerEnv(String),

    #[error("Device \"{device}\" failed to fork after {attempts} attempt(s): {reason}")]
    Fork {
        device: String,
        attempts: u32,
        reason: String,
    },

    #[error("Device \"{device}\" already has a fork in progress")]
    ForkInProgress { device: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Component \"{component}\" has no discovered method \"{method}\"")]
    UnknownMethod { component: String, method: String },

    #[error("Component \"{component}\" has not completed its instantiate handshake")]
    NotInstantiated { component: String },

    #[error("Request \"{command}\" to device \"{device}\" timed out")]
    RequestTimeout { device: String, command: String },

    #[error("Connection to device \"{device}\" lost with requests outstanding")]
    ConnectionLost { device: String },

    #[error("Invalid transition: event \"{event}\" is not legal from state {from}")]
    InvalidTransition {
        from: DeviceState,
        event: &'static str,
    },

    #[error("{} device(s) failed to start: {}", failed.len(), failed.join(", "))]
    AggregateStart { failed: Vec<String> },

    #[error("Unknown device \"{0}\"")]
    UnknownDevice(String),

    #[error("Unknown component \"{0}\"")]
    UnknownComponent(String),
}
