//! Configuration management.
//!
//! Fleet configuration is TOML loaded through the `config` crate. The
//! canonical representation of the device collection is a mapping keyed by
//! device id; list input (with the id embedded in each entry) is accepted
//! and normalized into the mapping at deserialization time. The same
//! map-or-list tolerance applies to each device's component specs.
//!
//! Duration fields (`ready_timeout`, `retry_interval`) are humantime strings
//! (`"10s"`, `"500ms"`).

use crate::error::{FleetError, FleetResult};
use crate::util::slugify;
use config::Config;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_RETRY_MAX_TRIES: u32 = 3;

/// Top-level fleet settings.
#[derive(Debug, Deserialize, Clone)]
pub struct FleetSettings {
    /// Namespace identifier handed to every worker.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Project identifier handed to every worker.
    #[serde(default = "default_project")]
    pub project: String,
    /// Log level for the tracing subscriber (`trace` .. `error`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Bus transport settings.
    #[serde(default)]
    pub bus: BusSettings,
    /// Start every device as soon as the fleet is built.
    #[serde(default = "default_true")]
    pub auto_start: bool,
    /// Escalate any device/component start failure into an aggregate error.
    #[serde(default)]
    pub fail_on_error: bool,
    /// Worker program to fork; defaults to re-executing the current binary.
    #[serde(default)]
    pub worker_program: Option<PathBuf>,
    /// Device specs keyed by id (map input) or with embedded ids (list
    /// input, normalized into the map).
    #[serde(default, deserialize_with = "deserialize_devices")]
    pub devices: HashMap<String, DeviceSettings>,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            project: default_project(),
            log_level: default_log_level(),
            bus: BusSettings::default(),
            auto_start: true,
            fail_on_error: false,
            worker_program: None,
            devices: HashMap::new(),
        }
    }
}

/// Bus transport settings.
#[derive(Debug, Deserialize, Clone)]
pub struct BusSettings {
    /// Spool directory of the filesystem bus.
    #[serde(default = "default_bus_dir")]
    pub dir: PathBuf,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            dir: default_bus_dir(),
        }
    }
}

/// Per-device settings.
#[derive(Debug, Deserialize, Clone)]
pub struct DeviceSettings {
    /// Stable id; slug of the map key or of this field for list input.
    #[serde(default)]
    pub id: Option<String>,
    /// Human-readable name; defaults to the id.
    #[serde(default)]
    pub name: Option<String>,
    /// Human-readable description; defaults to the name.
    #[serde(default)]
    pub description: Option<String>,
    /// Opaque board configuration, passed through to the worker verbatim.
    #[serde(default)]
    pub board: Value,
    /// Components instantiated eagerly at device start.
    #[serde(default, deserialize_with = "deserialize_components")]
    pub components: Vec<ComponentSettings>,
    /// How long to wait for the worker's ready handshake.
    #[serde(default = "default_ready_timeout", with = "humantime_serde")]
    pub ready_timeout: Duration,
    /// Minimum spacing between fork attempts.
    #[serde(default = "default_retry_interval", with = "humantime_serde")]
    pub retry_interval: Duration,
    /// Fork attempts before a start fails with a fork error.
    #[serde(default = "default_retry_max_tries")]
    pub retry_max_tries: u32,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            id: None,
            name: None,
            description: None,
            board: Value::Null,
            components: Vec::new(),
            ready_timeout: DEFAULT_READY_TIMEOUT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            retry_max_tries: DEFAULT_RETRY_MAX_TRIES,
        }
    }
}

/// One component spec within a device.
#[derive(Debug, Deserialize, Clone)]
pub struct ComponentSettings {
    /// Component class recognized by the worker registry.
    pub class: String,
    /// Optional name; its slug becomes the component id.
    #[serde(default)]
    pub name: Option<String>,
    /// Opaque constructor options.
    #[serde(default)]
    pub opts: Value,
}

impl FleetSettings {
    /// Load settings from a config file (extension resolved by the `config`
    /// crate, e.g. `config/default` -> `config/default.toml`).
    pub fn load(path: &str) -> FleetResult<Self> {
        let source = Config::builder()
            .add_source(config::File::with_name(path))
            .build()?;
        source.try_deserialize().map_err(FleetError::Config)
    }
}

fn default_namespace() -> String {
    "fleet".to_string()
}

fn default_project() -> String {
    "default".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_bus_dir() -> PathBuf {
    PathBuf::from(".fsq")
}

fn default_true() -> bool {
    true
}

fn default_ready_timeout() -> Duration {
    DEFAULT_READY_TIMEOUT
}

fn default_retry_interval() -> Duration {
    DEFAULT_RETRY_INTERVAL
}

fn default_retry_max_tries() -> u32 {
    DEFAULT_RETRY_MAX_TRIES
}

/// Accept `devices` as either a map keyed by id or a list with embedded ids,
/// normalizing to the map. List entries without an id (or with duplicate
/// ids) are configuration errors.
fn deserialize_devices<'de, D>(deserializer: D) -> Result<HashMap<String, DeviceSettings>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DevicesInput {
        Map(HashMap<String, DeviceSettings>),
        List(Vec<DeviceSettings>),
    }

    let mut devices = HashMap::new();
    match DevicesInput::deserialize(deserializer)? {
        DevicesInput::Map(map) => {
            for (key, mut settings) in map {
                let id = slugify(settings.id.as_deref().unwrap_or(&key))
                    .ok_or_else(|| D::Error::custom(format!("unusable device id \"{key}\"")))?;
                settings.id = Some(id.clone());
                devices.insert(id, settings);
            }
        }
        DevicesInput::List(list) => {
            for mut settings in list {
                let raw = settings
                    .id
                    .as_deref()
                    .or(settings.name.as_deref())
                    .ok_or_else(|| D::Error::custom("device list entry is missing an id"))?;
                let id = slugify(raw)
                    .ok_or_else(|| D::Error::custom(format!("unusable device id \"{raw}\"")))?;
                settings.id = Some(id.clone());
                if devices.insert(id.clone(), settings).is_some() {
                    return Err(D::Error::custom(format!("duplicate device id \"{id}\"")));
                }
            }
        }
    }
    Ok(devices)
}

/// Accept `components` as either a map keyed by name or a list.
fn deserialize_components<'de, D>(deserializer: D) -> Result<Vec<ComponentSettings>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ComponentsInput {
        Map(HashMap<String, ComponentSettings>),
        List(Vec<ComponentSettings>),
    }

    Ok(match ComponentsInput::deserialize(deserializer)? {
        ComponentsInput::Map(map) => map
            .into_iter()
            .map(|(key, mut settings)| {
                if settings.name.is_none() {
                    settings.name = Some(key);
                }
                settings
            })
            .collect(),
        ComponentsInput::List(list) => list,
    })
}
