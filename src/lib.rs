//! # fleet_io Core Library
//!
//! This crate is the supervisory control plane for a fleet of hardware I/O
//! boards. Each board is served by an out-of-process worker; the supervisor
//! launches and monitors those workers, talks to them over a topic-based
//! publish/subscribe bus, discovers each board's capabilities at runtime
//! through an `instantiate`/`dir` handshake, and exposes the discovered
//! methods as remote calls. Process isolation is the point: a hardware
//! driver fault inside a worker can never take the supervisor down.
//!
//! ## Crate Structure
//!
//! - **`board`**: the hardware driver seam (traits, component registry) and
//!   the simulated board used by tests and demos.
//! - **`bus`**: the message bus adapter: trait, topic matching, an
//!   in-process broker and a filesystem-spool transport.
//! - **`config`**: fleet configuration loaded from TOML, with map-or-list
//!   device input normalized into a mapping keyed by device id.
//! - **`error`**: the centralized `FleetError` enum.
//! - **`events`**: lifecycle event types broadcast by the fleet.
//! - **`fleet`**: the fleet manager with settle-all concurrent start/stop and
//!   aggregate failure policy.
//! - **`protocol`**: typed wire messages and topic builders.
//! - **`supervisor`**: per-device supervision: launchers, worker handles,
//!   request routing, component proxies and the device state machine.
//! - **`telemetry`**: tracing subscriber setup.
//! - **`util`**: slug and id helpers.
//! - **`worker`**: the worker-side runtime that executes commands against a
//!   board inside the spawned process.
//!
//! ## Example
//!
//! ```no_run
//! use fleet_io::{
//!     bus::MemoryBus, config::FleetSettings, fleet::Fleet,
//!     supervisor::InProcessLauncher,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), fleet_io::error::FleetError> {
//! let settings = FleetSettings::load("config/default")?;
//! let bus = Arc::new(MemoryBus::new());
//! let launcher = Arc::new(InProcessLauncher::new(bus.clone()));
//! let fleet = Fleet::new(&settings, bus, launcher)?;
//!
//! let report = fleet.start(None).await?;
//! println!("started: {:?}", report.started);
//! # Ok(())
//! # }
//! ```

pub mod board;
pub mod bus;
pub mod config;
pub mod error;
pub mod events;
pub mod fleet;
pub mod protocol;
pub mod supervisor;
pub mod telemetry;
pub mod util;
pub mod worker;

pub use crate::bus::{FsqBus, MemoryBus, MessageBus};
pub use crate::config::FleetSettings;
pub use crate::error::{FleetError, FleetResult};
pub use crate::events::{FleetEvent, FleetState};
pub use crate::fleet::{Fleet, FleetStartReport};
pub use crate::supervisor::{
    ComponentProxy, Device, DeviceState, InProcessLauncher, ProcessLauncher, WorkerLauncher,
};
pub use crate::worker::{WorkerEnv, WorkerRuntime};
