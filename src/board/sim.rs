//! Simulated board and components.
//!
//! Stands in for a real hardware binding so the fleet can run end-to-end
//! without physical boards. The simulated board honors two config knobs used
//! by tests: `behavior = "fail"` makes initialization error out and
//! `behavior = "never-ready"` makes it hang forever (exercising the ready
//! timeout upstream).
//!
//! Three component classes ship with the simulator: `Led`, `Servo` and
//! `Sensor`.

use super::{BoardComponent, BoardDriver, ComponentRegistry};
use crate::util::unique_id;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// A simulated board binding.
#[derive(Debug)]
pub struct SimBoard {
    id: String,
}

impl SimBoard {
    /// Initialize the simulated hardware from a board-config blob.
    pub async fn open(config: &Value) -> Result<Self> {
        match config.get("behavior").and_then(Value::as_str) {
            Some("fail") => bail!("simulated board failed to initialize"),
            // Hardware that exists but never finishes binding.
            Some("never-ready") => return std::future::pending().await,
            _ => {}
        }
        // Small settle delay so startup ordering bugs surface in tests.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let id = config
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| unique_id("sim-board"));
        Ok(Self { id })
    }
}

impl BoardDriver for SimBoard {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Registry with all simulated component classes.
pub fn sim_registry() -> ComponentRegistry {
    let mut registry = ComponentRegistry::new();
    registry.register("Led", Led::METHODS, Led::construct);
    registry.register("Servo", Servo::METHODS, Servo::construct);
    registry.register("Sensor", Sensor::METHODS, Sensor::construct);
    registry
}

fn arg_f64(args: &[Value], idx: usize) -> Option<f64> {
    args.get(idx).and_then(Value::as_f64)
}

// =============================================================================
// Led
// =============================================================================

#[derive(Default)]
struct LedState {
    on: bool,
    blink_ms: Option<u64>,
}

/// Simulated LED with on/off/blink state.
pub struct Led {
    state: Mutex<LedState>,
}

impl Led {
    const METHODS: &'static [&'static str] = &["on", "off", "toggle", "blink", "stop"];

    fn construct(_board: Arc<dyn BoardDriver>, _opts: &Value) -> Result<Box<dyn BoardComponent>> {
        Ok(Box::new(Led {
            state: Mutex::new(LedState::default()),
        }))
    }
}

#[async_trait]
impl BoardComponent for Led {
    fn component_class(&self) -> &'static str {
        "Led"
    }

    fn methods(&self) -> &'static [&'static str] {
        Self::METHODS
    }

    async fn call(&self, method: &str, args: &[Value]) -> Result<Option<Value>> {
        let mut state = self.state.lock().await;
        match method {
            "on" => state.on = true,
            "off" => {
                state.on = false;
                state.blink_ms = None;
            }
            "toggle" => state.on = !state.on,
            "blink" => {
                let interval = arg_f64(args, 0).unwrap_or(100.0);
                if interval <= 0.0 {
                    bail!("blink interval must be positive, got {interval}");
                }
                state.on = true;
                state.blink_ms = Some(interval as u64);
            }
            "stop" => state.blink_ms = None,
            other => return Err(anyhow!("Led has no method \"{other}\"")),
        }
        Ok(None)
    }
}

// =============================================================================
// Servo
// =============================================================================

/// Simulated servo constrained to a `[min, max]` degree range, with motion
/// time proportional to travel distance.
pub struct Servo {
    range: (f64, f64),
    degrees_per_sec: f64,
    position: Mutex<f64>,
}

impl Servo {
    const METHODS: &'static [&'static str] = &["to", "min", "max", "center", "sweep", "stop"];

    fn construct(_board: Arc<dyn BoardDriver>, opts: &Value) -> Result<Box<dyn BoardComponent>> {
        let min = opts.get("min").and_then(Value::as_f64).unwrap_or(0.0);
        let max = opts.get("max").and_then(Value::as_f64).unwrap_or(180.0);
        if min >= max {
            bail!("servo range is empty: min {min} >= max {max}");
        }
        let degrees_per_sec = opts
            .get("degreesPerSec")
            .and_then(Value::as_f64)
            .unwrap_or(3600.0);
        if degrees_per_sec <= 0.0 {
            bail!("servo speed must be positive, got {degrees_per_sec}");
        }
        Ok(Box::new(Servo {
            range: (min, max),
            degrees_per_sec,
            position: Mutex::new(min),
        }))
    }

    async fn travel(&self, from: f64, to: f64) {
        let millis = ((to - from).abs() / self.degrees_per_sec * 1000.0) as u64;
        if millis > 0 {
            tokio::time::sleep(Duration::from_millis(millis)).await;
        }
    }
}

#[async_trait]
impl BoardComponent for Servo {
    fn component_class(&self) -> &'static str {
        "Servo"
    }

    fn methods(&self) -> &'static [&'static str] {
        Self::METHODS
    }

    async fn call(&self, method: &str, args: &[Value]) -> Result<Option<Value>> {
        let (min, max) = self.range;
        let mut position = self.position.lock().await;
        match method {
            "to" => {
                let target =
                    arg_f64(args, 0).ok_or_else(|| anyhow!("\"to\" needs a numeric position"))?;
                if target < min || target > max {
                    bail!("position {target} outside range [{min}, {max}]");
                }
                self.travel(*position, target).await;
                *position = target;
            }
            "min" => *position = min,
            "max" => *position = max,
            "center" => *position = (min + max) / 2.0,
            // Sweep and stop only move the simulated horn to an endpoint.
            "sweep" => *position = max,
            "stop" => {}
            other => return Err(anyhow!("Servo has no method \"{other}\"")),
        }
        Ok(None)
    }
}

// =============================================================================
// Sensor
// =============================================================================

/// Simulated analog sensor producing a noisy reading around a base value.
pub struct Sensor {
    base: f64,
    noise: f64,
    offset: Mutex<f64>,
}

impl Sensor {
    // _tare is private: declared here, filtered out of every dir listing.
    const METHODS: &'static [&'static str] = &["read", "average", "_tare"];

    fn construct(_board: Arc<dyn BoardDriver>, opts: &Value) -> Result<Box<dyn BoardComponent>> {
        Ok(Box::new(Sensor {
            base: opts.get("value").and_then(Value::as_f64).unwrap_or(512.0),
            noise: opts.get("noise").and_then(Value::as_f64).unwrap_or(1.0),
            offset: Mutex::new(0.0),
        }))
    }

    fn sample(&self, offset: f64) -> f64 {
        let jitter = if self.noise > 0.0 {
            rand::thread_rng().gen_range(-self.noise..=self.noise)
        } else {
            0.0
        };
        self.base + jitter - offset
    }
}

#[async_trait]
impl BoardComponent for Sensor {
    fn component_class(&self) -> &'static str {
        "Sensor"
    }

    fn methods(&self) -> &'static [&'static str] {
        Self::METHODS
    }

    async fn call(&self, method: &str, args: &[Value]) -> Result<Option<Value>> {
        match method {
            "read" => {
                let offset = *self.offset.lock().await;
                Ok(Some(json!(self.sample(offset))))
            }
            "average" => {
                let count = arg_f64(args, 0).unwrap_or(8.0).max(1.0) as usize;
                let offset = *self.offset.lock().await;
                let sum: f64 = (0..count).map(|_| self.sample(offset)).sum();
                Ok(Some(json!(sum / count as f64)))
            }
            "_tare" => {
                *self.offset.lock().await = self.base;
                Ok(None)
            }
            other => Err(anyhow!("Sensor has no method \"{other}\"")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn board() -> Arc<dyn BoardDriver> {
        crate::board::open(&json!({})).await.unwrap()
    }

    #[tokio::test]
    async fn led_toggles() {
        let led = Led::construct(board().await, &json!({})).unwrap();
        led.call("on", &[]).await.unwrap();
        led.call("toggle", &[]).await.unwrap();
        let err = led.call("dim", &[]).await.unwrap_err();
        assert!(err.to_string().contains("dim"));
    }

    #[tokio::test]
    async fn servo_enforces_range() {
        let servo = Servo::construct(board().await, &json!({"min": 10.0, "max": 20.0})).unwrap();
        servo.call("to", &[json!(15.0)]).await.unwrap();
        let err = servo.call("to", &[json!(45.0)]).await.unwrap_err();
        assert!(err.to_string().contains("outside range"));
    }

    #[tokio::test]
    async fn sensor_reads_near_base_after_tare() {
        let sensor =
            Sensor::construct(board().await, &json!({"value": 100.0, "noise": 0.0})).unwrap();
        let reading = sensor.call("read", &[]).await.unwrap().unwrap();
        assert_eq!(reading, json!(100.0));
        sensor.call("_tare", &[]).await.unwrap();
        let reading = sensor.call("read", &[]).await.unwrap().unwrap();
        assert_eq!(reading, json!(0.0));
    }

    #[tokio::test]
    async fn board_failure_knob_works() {
        let err = SimBoard::open(&json!({"behavior": "fail"})).await.unwrap_err();
        assert!(err.to_string().contains("failed to initialize"));
    }
}
