//! Fleet manager.
//!
//! A `Fleet` owns the named collection of device supervisors and
//! orchestrates concurrent start/stop across all of them. Starts use
//! settle-all semantics: every device's attempt runs to completion before
//! the aggregate result is produced, and no single failure cancels the
//! others. With `fail_on_error` set, any failed device escalates the whole
//! start into an [`FleetError::AggregateStart`]; the partition of outcomes
//! is still observable through the lifecycle event stream.

use crate::bus::MessageBus;
use crate::config::FleetSettings;
use crate::error::{FleetError, FleetResult};
use crate::events::{FleetEvent, FleetState};
use crate::supervisor::{Device, DeviceSpec, WorkerLauncher};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

const EVENT_CAPACITY: usize = 64;

/// Outcome partition of one fleet start.
#[derive(Debug)]
pub struct FleetStartReport {
    /// Ids of devices that reached `started`.
    pub started: Vec<String>,
    /// Devices whose start failed, with the error that stopped them.
    pub failed: Vec<(String, FleetError)>,
}

/// The full set of configured devices under one manager.
pub struct Fleet {
    devices: HashMap<String, Device>,
    fail_on_error: bool,
    state: Mutex<FleetState>,
    events: broadcast::Sender<FleetEvent>,
}

impl Fleet {
    /// Build a fleet from settings: one device supervisor per configured
    /// device spec, all sharing the given bus and launcher.
    pub fn new(
        settings: &FleetSettings,
        bus: Arc<dyn MessageBus>,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> FleetResult<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let mut devices = HashMap::new();
        for (id, device_settings) in &settings.devices {
            let name = device_settings.name.clone().unwrap_or_else(|| id.clone());
            let description = device_settings
                .description
                .clone()
                .unwrap_or_else(|| name.clone());
            let spec = DeviceSpec {
                id: id.clone(),
                name,
                description,
                board: device_settings.board.clone(),
                components: device_settings.components.clone(),
                ready_timeout: device_settings.ready_timeout,
                retry_interval: device_settings.retry_interval,
                retry_max_tries: device_settings.retry_max_tries,
                fail_on_error: settings.fail_on_error,
                namespace: settings.namespace.clone(),
                project: settings.project.clone(),
                bus_dir: settings.bus.dir.clone(),
            };
            let device = Device::new(spec, bus.clone(), launcher.clone(), events.clone());
            devices.insert(id.clone(), device);
        }
        info!(devices = devices.len(), "fleet configured");
        Ok(Self {
            devices,
            fail_on_error: settings.fail_on_error,
            state: Mutex::new(FleetState::Stopped),
            events,
        })
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.events.subscribe()
    }

    /// Look up a device supervisor by id.
    pub fn device(&self, id: &str) -> Option<&Device> {
        self.devices.get(id)
    }

    /// All device supervisors.
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    /// Number of configured devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether the fleet has no devices at all.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Current composite state.
    pub fn state(&self) -> FleetState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(FleetState::Stopped)
    }

    fn set_state(&self, to: FleetState) {
        let from = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            let from = *state;
            *state = to;
            from
        };
        if from != to {
            let _ = self.events.send(FleetEvent::FleetStateChanged { from, to });
        }
    }

    /// Start one named device, or every configured device concurrently when
    /// `target` is `None`.
    ///
    /// Every start attempt settles before the report is produced. With
    /// `fail_on_error` set and at least one failure, the call rejects with
    /// an aggregate error naming the failed devices; devices that did start
    /// stay started.
    pub async fn start(&self, target: Option<&str>) -> FleetResult<FleetStartReport> {
        let targets: Vec<&Device> = match target {
            Some(id) => vec![self
                .devices
                .get(id)
                .ok_or_else(|| FleetError::UnknownDevice(id.to_string()))?],
            None => self.devices.values().collect(),
        };

        let attempts = targets.into_iter().map(|device| async move {
            let id = device.id().to_string();
            let outcome = device.start().await;
            (id, outcome)
        });

        let mut report = FleetStartReport {
            started: Vec::new(),
            failed: Vec::new(),
        };
        for (id, outcome) in join_all(attempts).await {
            match outcome {
                Ok(()) => report.started.push(id),
                Err(err) => {
                    error!(device = %id, error = %err, "device failed to start");
                    report.failed.push((id, err));
                }
            }
        }

        if !report.started.is_empty() {
            self.set_state(FleetState::Started);
        }
        let _ = self.events.send(FleetEvent::FleetStarted {
            started: report.started.clone(),
            failed: report.failed.iter().map(|(id, _)| id.clone()).collect(),
        });
        info!(
            started = report.started.len(),
            failed = report.failed.len(),
            "fleet start settled"
        );

        if self.fail_on_error && !report.failed.is_empty() {
            return Err(FleetError::AggregateStart {
                failed: report.failed.into_iter().map(|(id, _)| id).collect(),
            });
        }
        Ok(report)
    }

    /// Stop every device, killing all live workers. Already-dead workers
    /// are tolerated; individual stop failures are logged, not propagated.
    pub async fn stop(&self) -> FleetResult<()> {
        let attempts = self.devices.values().map(|device| async move {
            let id = device.id().to_string();
            (id, device.stop().await)
        });
        for (id, outcome) in join_all(attempts).await {
            if let Err(err) = outcome {
                warn!(device = %id, error = %err, "device stop failed");
            }
        }
        self.set_state(FleetState::Stopped);
        info!("fleet stopped");
        Ok(())
    }
}

impl std::fmt::Debug for Fleet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fleet")
            .field("devices", &self.devices.keys().collect::<Vec<_>>())
            .field("state", &self.state())
            .finish()
    }
}
