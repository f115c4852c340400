//! Per-device supervision: worker launchers, process handles, the
//! request/response router, component proxies, and the device state machine.
//!
//! One [`Device`] owns one worker and its components exclusively; no two
//! devices share mutable state. The only resource devices share is the
//! message bus.

mod component;
mod device;
mod handle;
mod launcher;

pub use component::ComponentProxy;
pub use device::{Device, DeviceSpec, DeviceState, PreStartHook};
pub use handle::WorkerHandle;
pub use launcher::{InProcessLauncher, ProcessLauncher, WorkerLauncher};
