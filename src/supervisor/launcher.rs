//! Worker launchers.
//!
//! [`WorkerLauncher`] is the seam between the device supervisor and the
//! mechanics of getting a worker running. [`ProcessLauncher`] forks the real
//! worker binary with the environment contract; [`InProcessLauncher`] runs
//! the same worker runtime as a task inside the supervisor process over a
//! shared in-memory bus, the simulation mode the integration tests drive.
//!
//! Launchers report readiness only indirectly: the device supervisor awaits
//! the worker's `ready` event over the bus, because a process can exist
//! without ever initializing its hardware binding.

use super::handle::WorkerHandle;
use crate::board::sim::sim_registry;
use crate::bus::MessageBus;
use crate::error::FleetResult;
use crate::worker::{WorkerEnv, WorkerRuntime};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Starts workers for device supervisors.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Launch a worker for the given environment contract. The returned
    /// handle is live but not yet ready; readiness arrives over the bus.
    async fn launch(&self, env: &WorkerEnv) -> FleetResult<WorkerHandle>;
}

// =============================================================================
// ProcessLauncher
// =============================================================================

/// Forks the worker binary as a child process.
#[derive(Default)]
pub struct ProcessLauncher {
    program: Option<PathBuf>,
}

impl ProcessLauncher {
    /// Launcher that re-executes the current binary with the `worker`
    /// subcommand.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an explicit worker program instead of `current_exe()`.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = Some(program.into());
        self
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, env: &WorkerEnv) -> FleetResult<WorkerHandle> {
        let program = match &self.program {
            Some(program) => program.clone(),
            None => std::env::current_exe()?,
        };
        let mut command = tokio::process::Command::new(&program);
        command.arg("worker");
        for (key, value) in env.to_vars()? {
            command.env(key, value);
        }
        // kill_on_drop guarantees supervisor death cannot leak orphan
        // workers even when no explicit stop ever ran.
        command.kill_on_drop(true);
        let mut child = command.spawn()?;
        info!(device = %env.device_id, program = %program.display(), pid = ?child.id(), "worker forked");

        let kill_token = CancellationToken::new();
        let exit_token = CancellationToken::new();
        let device_id = env.device_id.clone();
        let kill = kill_token.clone();
        let exited = exit_token.clone();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    debug!(device = %device_id, ?status, "worker exited");
                }
                _ = kill.cancelled() => {
                    if let Err(err) = child.start_kill() {
                        debug!(device = %device_id, error = %err, "kill on dead worker ignored");
                    }
                    let status = child.wait().await;
                    debug!(device = %device_id, ?status, "worker killed");
                }
            }
            exited.cancel();
        });
        Ok(WorkerHandle::new(kill_token, exit_token))
    }
}

// =============================================================================
// InProcessLauncher
// =============================================================================

/// Runs the worker runtime as an in-process task over a shared bus.
///
/// The same RPC handler, component registry and handshake as the forked
/// worker, minus the process boundary. Used by the integration tests and
/// available as a simulation mode when no real hardware exists.
pub struct InProcessLauncher {
    bus: Arc<dyn MessageBus>,
    board_timeout: Option<Duration>,
}

impl InProcessLauncher {
    /// Launcher whose workers share the given bus.
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self {
            bus,
            board_timeout: None,
        }
    }

    /// Override the worker-side board initialization timeout.
    pub fn with_board_timeout(mut self, board_timeout: Duration) -> Self {
        self.board_timeout = Some(board_timeout);
        self
    }
}

#[async_trait]
impl WorkerLauncher for InProcessLauncher {
    async fn launch(&self, env: &WorkerEnv) -> FleetResult<WorkerHandle> {
        let mut runtime = WorkerRuntime::new(&env.device_id, self.bus.clone(), sim_registry());
        if let Some(board_timeout) = self.board_timeout {
            runtime = runtime.with_board_timeout(board_timeout);
        }
        let kill_token = CancellationToken::new();
        let exit_token = CancellationToken::new();
        let board_config = env.board_config.clone();
        let device_id = env.device_id.clone();
        let shutdown = kill_token.clone();
        let exited = exit_token.clone();
        tokio::spawn(async move {
            if let Err(err) = runtime.run(board_config, shutdown).await {
                warn!(device = %device_id, error = %err, "in-process worker failed");
            }
            exited.cancel();
        });
        Ok(WorkerHandle::new(kill_token, exit_token))
    }
}
