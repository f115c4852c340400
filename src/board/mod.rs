//! Hardware board seam.
//!
//! The worker process talks to physical hardware through the [`BoardDriver`]
//! and [`BoardComponent`] traits. Real hardware bindings live outside this
//! crate; what ships here is the trait boundary, the component registry
//! (class name -> constructor + declared method list), and a simulated board
//! used by tests, demos and the default worker build.
//!
//! Driver-facing code uses `anyhow::Result`: hardware failure modes are
//! open-ended and get converted into protocol `error` replies at the worker
//! handler boundary.

pub mod registry;
pub mod sim;

pub use registry::{ComponentCtor, ComponentRegistry};

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// A live hardware binding for one physical board.
///
/// Opening a driver performs whatever initialization the hardware needs; a
/// driver that has been handed out is ready. Readiness timeouts are the
/// worker runtime's concern, not the driver's.
pub trait BoardDriver: Send + Sync {
    /// Board identity reported in the ready handshake.
    fn id(&self) -> &str;
}

/// One capability instantiated against a board.
#[async_trait]
pub trait BoardComponent: Send + Sync {
    /// Normalized class name this component was constructed as.
    fn component_class(&self) -> &'static str;

    /// Declared method names, private-marker names included; the worker's
    /// `dir` handler filters those out before anything crosses the wire.
    fn methods(&self) -> &'static [&'static str];

    /// Invoke a method with positional JSON arguments.
    ///
    /// `Ok(Some(value))` is a serializable return value; `Ok(None)` means the
    /// method succeeded but has nothing serializable to report (the worker
    /// substitutes boolean `true` on the wire).
    async fn call(&self, method: &str, args: &[Value]) -> Result<Option<Value>>;
}

/// Open a board driver from the opaque board-configuration blob.
///
/// Dispatches on the `driver` field; only the simulated driver ships with
/// this crate. The returned future resolves when the hardware binding is
/// initialized; a board configured to never become ready simply never
/// resolves, which is what the worker's ready timeout is for.
pub async fn open(config: &Value) -> Result<Arc<dyn BoardDriver>> {
    let driver = config
        .get("driver")
        .and_then(Value::as_str)
        .unwrap_or("sim");
    match driver {
        "sim" => {
            let board = sim::SimBoard::open(config).await?;
            Ok(Arc::new(board) as Arc<dyn BoardDriver>)
        }
        other => bail!("unknown board driver \"{other}\""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn open_defaults_to_the_simulated_driver() {
        let board = open(&json!({})).await.unwrap();
        assert!(!board.id().is_empty());
    }

    #[tokio::test]
    async fn open_rejects_unknown_drivers() {
        let err = open(&json!({"driver": "pcie"})).await.err().unwrap();
        assert!(err.to_string().contains("pcie"));
    }
}
