//! Integration tests for component discovery and remote invocation: the
//! instantiate handshake, the method descriptor, execute payload shape, and
//! the dir round trip.

use fleet_io::bus::MessageBus;
use fleet_io::config::{ComponentSettings, DeviceSettings, FleetSettings};
use fleet_io::error::FleetError;
use fleet_io::fleet::Fleet;
use fleet_io::supervisor::InProcessLauncher;
use fleet_io::MemoryBus;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn led_fleet(bus: Arc<MemoryBus>) -> Fleet {
    let mut devices = HashMap::new();
    devices.insert(
        "porch".to_string(),
        DeviceSettings {
            components: vec![ComponentSettings {
                class: "led".to_string(),
                name: Some("led-1".to_string()),
                opts: json!({"pin": 13}),
            }],
            ready_timeout: Duration::from_millis(500),
            retry_interval: Duration::from_millis(10),
            retry_max_tries: 1,
            ..DeviceSettings::default()
        },
    );
    let settings = FleetSettings {
        devices,
        ..FleetSettings::default()
    };
    let launcher = Arc::new(InProcessLauncher::new(bus.clone()));
    Fleet::new(&settings, bus, launcher).unwrap()
}

#[tokio::test]
async fn discovered_methods_become_callable_and_publish_execute() {
    // A Led component spec produces a proxy whose discovered methods,
    // when invoked, publish an execute command carrying the component id,
    // method name and args.
    let bus = Arc::new(MemoryBus::new());
    let mut commands = bus.subscribe("porch/execute").await.unwrap();
    let fleet = led_fleet(bus);

    let report = fleet.start(None).await.unwrap();
    assert_eq!(report.started, vec!["porch".to_string()]);

    let device = fleet.device("porch").unwrap();
    let led = device.component_by_id("led-1").unwrap();
    assert!(led.has_method("on"));
    assert!(led.has_method("off"));

    let retval = led.call("on", vec![]).await.unwrap();
    assert_eq!(retval, json!(true));

    let msg = tokio::time::timeout(Duration::from_secs(1), commands.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.topic, "porch/execute");
    assert_eq!(msg.payload["id"], "led-1");
    assert_eq!(msg.payload["method"], "on");
    assert_eq!(msg.payload["args"], json!([]));

    fleet.stop().await.unwrap();
}

#[tokio::test]
async fn undiscovered_methods_are_rejected_before_the_wire() {
    let bus = Arc::new(MemoryBus::new());
    let mut commands = bus.subscribe("porch/execute").await.unwrap();
    let fleet = led_fleet(bus);
    fleet.start(None).await.unwrap();

    let led = fleet
        .device("porch")
        .unwrap()
        .component_by_id("led-1")
        .unwrap();
    let err = led.call("explode", vec![]).await.unwrap_err();
    assert!(matches!(
        err,
        FleetError::UnknownMethod { component, method }
            if component == "led-1" && method == "explode"
    ));
    // Nothing was published for the rejected call.
    assert!(commands.try_recv().is_err());

    fleet.stop().await.unwrap();
}

#[tokio::test]
async fn dir_round_trip_matches_the_instantiated_descriptor() {
    let bus = Arc::new(MemoryBus::new());
    let fleet = led_fleet(bus);
    fleet.start(None).await.unwrap();

    let device = fleet.device("porch").unwrap();
    let led = device.component_by_id("led-1").unwrap();
    let descriptor: Vec<String> = led.methods().unwrap().to_vec();

    // Same set through the device-level dir...
    let via_device = device.dir("led-1").await.unwrap();
    assert_eq!(via_device, descriptor);

    // ...and through the proxy's own dir, idempotently.
    let first = led.dir().await.unwrap();
    let second = led.dir().await.unwrap();
    assert_eq!(first, descriptor);
    assert_eq!(second, descriptor);

    fleet.stop().await.unwrap();
}

#[tokio::test]
async fn dir_by_class_reports_declared_methods() {
    let bus = Arc::new(MemoryBus::new());
    let fleet = led_fleet(bus);
    fleet.start(None).await.unwrap();

    let device = fleet.device("porch").unwrap();
    let methods = device.dir_class("led").await.unwrap();
    assert!(methods.contains(&"on".to_string()));
    assert!(methods.contains(&"off".to_string()));

    fleet.stop().await.unwrap();
}

#[tokio::test]
async fn on_demand_components_instantiate_against_the_running_worker() {
    let bus = Arc::new(MemoryBus::new());
    let fleet = led_fleet(bus);
    fleet.start(None).await.unwrap();

    let device = fleet.device("porch").unwrap();
    let sensor = device
        .component("sensor", json!({"name": "photocell", "value": 100.0, "noise": 0.0}))
        .await
        .unwrap();
    assert_eq!(sensor.id(), "photocell");

    let reading = sensor.call("read", vec![]).await.unwrap();
    assert_eq!(reading, json!(100.0));

    fleet.stop().await.unwrap();
}

#[tokio::test]
async fn unknown_component_class_surfaces_the_worker_error() {
    let bus = Arc::new(MemoryBus::new());
    let fleet = led_fleet(bus);
    fleet.start(None).await.unwrap();

    let device = fleet.device("porch").unwrap();
    let err = device
        .component("teleporter", Value::Null)
        .await
        .unwrap_err();
    match err {
        FleetError::Protocol(message) => assert!(message.contains("Teleporter")),
        other => panic!("expected Protocol, got {other:?}"),
    }

    fleet.stop().await.unwrap();
}

#[tokio::test]
async fn void_and_value_returns_round_trip() {
    let bus = Arc::new(MemoryBus::new());
    let fleet = led_fleet(bus);
    fleet.start(None).await.unwrap();

    let device = fleet.device("porch").unwrap();
    let sensor = device
        .component("sensor", json!({"name": "pot", "value": 7.0, "noise": 0.0}))
        .await
        .unwrap();

    // A value-bearing method returns its value...
    assert_eq!(sensor.call("read", vec![]).await.unwrap(), json!(7.0));
    // ...and a void method comes back as boolean true.
    let led = device.component_by_id("led-1").unwrap();
    assert_eq!(led.call("off", vec![]).await.unwrap(), json!(true));

    fleet.stop().await.unwrap();
}
