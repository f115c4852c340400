//! Integration tests for fleet-level start orchestration: settle-all
//! semantics, outcome partitioning and the fail-on-error escalation policy.

use fleet_io::config::{DeviceSettings, FleetSettings};
use fleet_io::error::FleetError;
use fleet_io::events::FleetEvent;
use fleet_io::fleet::Fleet;
use fleet_io::supervisor::{DeviceState, InProcessLauncher};
use fleet_io::MemoryBus;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn fast_device(board: Value) -> DeviceSettings {
    DeviceSettings {
        board,
        ready_timeout: Duration::from_millis(500),
        retry_interval: Duration::from_millis(10),
        retry_max_tries: 1,
        ..DeviceSettings::default()
    }
}

fn fleet_settings(devices: Vec<(&str, DeviceSettings)>, fail_on_error: bool) -> FleetSettings {
    let mut map = HashMap::new();
    for (id, mut settings) in devices {
        settings.id = Some(id.to_string());
        map.insert(id.to_string(), settings);
    }
    FleetSettings {
        fail_on_error,
        devices: map,
        ..FleetSettings::default()
    }
}

fn build_fleet(settings: &FleetSettings) -> Fleet {
    let bus = Arc::new(MemoryBus::new());
    let launcher = Arc::new(InProcessLauncher::new(bus.clone()));
    Fleet::new(settings, bus, launcher).unwrap()
}

#[tokio::test]
async fn one_supervisor_per_spec_with_matching_ids() {
    let settings = fleet_settings(
        vec![("a", fast_device(json!({}))), ("b", fast_device(json!({})))],
        false,
    );
    let fleet = build_fleet(&settings);

    assert_eq!(fleet.len(), 2);
    for id in ["a", "b"] {
        let device = fleet.device(id).unwrap();
        assert_eq!(device.id(), id);
        assert_eq!(device.state(), DeviceState::Stopped);
    }
}

#[tokio::test]
async fn start_all_devices_ready_immediately() {
    let settings = fleet_settings(
        vec![("a", fast_device(json!({}))), ("b", fast_device(json!({})))],
        false,
    );
    let fleet = build_fleet(&settings);

    let report = fleet.start(None).await.unwrap();
    assert_eq!(report.started.len(), 2);
    assert_eq!(report.failed.len(), 0);
    assert_eq!(fleet.device("a").unwrap().state(), DeviceState::Started);
    assert_eq!(fleet.device("b").unwrap().state(), DeviceState::Started);
}

#[tokio::test]
async fn fail_on_error_escalates_but_healthy_devices_stay_started() {
    // Device b's board rejects readiness while fail_on_error is set.
    let settings = fleet_settings(
        vec![
            ("a", fast_device(json!({}))),
            ("b", fast_device(json!({"behavior": "fail"}))),
        ],
        true,
    );
    let fleet = build_fleet(&settings);

    let err = fleet.start(None).await.unwrap_err();
    match err {
        FleetError::AggregateStart { failed } => {
            assert_eq!(failed, vec!["b".to_string()]);
        }
        other => panic!("expected AggregateStart, got {other:?}"),
    }
    // The aggregate rejection does not undo the devices that made it.
    assert_eq!(fleet.device("a").unwrap().state(), DeviceState::Started);
    assert_eq!(fleet.device("b").unwrap().state(), DeviceState::Stopped);

    fleet.stop().await.unwrap();
}

#[tokio::test]
async fn partition_without_fail_on_error_resolves() {
    let settings = fleet_settings(
        vec![
            ("a", fast_device(json!({}))),
            ("b", fast_device(json!({"behavior": "fail"}))),
        ],
        false,
    );
    let fleet = build_fleet(&settings);

    let report = fleet.start(None).await.unwrap();
    assert_eq!(report.started, vec!["a".to_string()]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "b");

    fleet.stop().await.unwrap();
}

#[tokio::test]
async fn start_by_name_touches_only_that_device() {
    let settings = fleet_settings(
        vec![("a", fast_device(json!({}))), ("b", fast_device(json!({})))],
        false,
    );
    let fleet = build_fleet(&settings);

    let report = fleet.start(Some("a")).await.unwrap();
    assert_eq!(report.started, vec!["a".to_string()]);
    assert_eq!(fleet.device("b").unwrap().state(), DeviceState::Stopped);

    fleet.stop().await.unwrap();
}

#[tokio::test]
async fn starting_an_unknown_device_is_an_error() {
    let settings = fleet_settings(vec![("a", fast_device(json!({})))], false);
    let fleet = build_fleet(&settings);

    let err = fleet.start(Some("nope")).await.unwrap_err();
    assert!(matches!(err, FleetError::UnknownDevice(id) if id == "nope"));
}

#[tokio::test]
async fn lifecycle_events_mirror_the_transitions() {
    let settings = fleet_settings(vec![("a", fast_device(json!({})))], false);
    let fleet = build_fleet(&settings);
    let mut events = fleet.subscribe();

    fleet.start(None).await.unwrap();

    let mut saw_starting = false;
    let mut saw_started = false;
    let mut saw_fleet_started = false;
    while let Ok(event) =
        tokio::time::timeout(Duration::from_millis(200), events.recv()).await
    {
        match event.unwrap() {
            FleetEvent::DeviceStateChanged { device, to, .. } if device == "a" => {
                match to {
                    DeviceState::Starting => saw_starting = true,
                    DeviceState::Started => saw_started = true,
                    DeviceState::Stopped => {}
                }
            }
            FleetEvent::FleetStarted { started, failed } => {
                assert_eq!(started, vec!["a".to_string()]);
                assert!(failed.is_empty());
                saw_fleet_started = true;
            }
            _ => {}
        }
        if saw_starting && saw_started && saw_fleet_started {
            break;
        }
    }
    assert!(saw_starting && saw_started && saw_fleet_started);

    fleet.stop().await.unwrap();
}
