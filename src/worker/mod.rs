//! Worker-side runtime.
//!
//! A worker is the out-of-process half of a device: it binds to one physical
//! board and executes `instantiate`/`execute`/`dir` commands received over
//! the bus, publishing results and errors back to its supervisor. The worker
//! never crashes on a bad command (every handler failure becomes an `error`
//! event), with one deliberate exception: an unrecoverable runtime fault
//! (e.g. the bus itself failing) publishes a final `error` and terminates the
//! process so the supervisor sees a dead worker instead of a hung one.

mod env;
mod runtime;

pub use env::{
    WorkerEnv, ENV_BOARD_CONFIG, ENV_BUS_DIR, ENV_DEVICE_ID, ENV_NAMESPACE, ENV_PROJECT,
};
pub use runtime::WorkerRuntime;
