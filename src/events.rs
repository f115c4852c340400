//! Fleet lifecycle events.
//!
//! The fleet owns a broadcast channel of [`FleetEvent`]; devices and the
//! fleet manager publish every state transition on it so observers (CLI
//! output, dashboards, tests) can watch supervision happen without polling.
//! Dropped receivers are fine; publishing to a channel with no subscribers
//! is not an error.

use crate::supervisor::DeviceState;

/// Composite state of the whole fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FleetState {
    /// No start has completed yet, or the fleet was stopped.
    Stopped,
    /// At least one device start has completed since the last stop.
    Started,
}

impl std::fmt::Display for FleetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FleetState::Stopped => write!(f, "stopped"),
            FleetState::Started => write!(f, "started"),
        }
    }
}

/// Everything that can happen to a fleet while it runs.
#[derive(Debug, Clone)]
pub enum FleetEvent {
    /// A device moved through its state machine.
    DeviceStateChanged {
        /// Device id.
        device: String,
        /// State before the transition.
        from: DeviceState,
        /// State after the transition.
        to: DeviceState,
    },
    /// A worker process exited (expected or not).
    WorkerExited {
        /// Device id the worker belonged to.
        device: String,
    },
    /// A component failed to instantiate during device start.
    ComponentFailed {
        /// Owning device id.
        device: String,
        /// Component class that failed.
        component_class: String,
        /// Failure description from the worker.
        message: String,
    },
    /// The fleet's own composite state changed.
    FleetStateChanged {
        /// State before the transition.
        from: FleetState,
        /// State after the transition.
        to: FleetState,
    },
    /// A fleet start settled; carries the partition of outcomes.
    FleetStarted {
        /// Ids of devices that reached `started`.
        started: Vec<String>,
        /// Ids of devices whose start failed.
        failed: Vec<String>,
    },
}
