//! Supervisor-side component proxy.
//!
//! A `ComponentProxy` stands in for one capability living inside a worker.
//! It performs the `instantiate` handshake, captures the discovered method
//! names as an immutable descriptor, and turns method calls into `execute`
//! requests over the bus. Callers are checked against the descriptor before
//! anything crosses the wire; calling an undiscovered method is a signalled
//! programming error, never a silent no-op.

use super::handle::DeviceLink;
use crate::error::{FleetError, FleetResult};
use crate::protocol::{
    CommandKind, DirRequest, EventKind, ExecuteRequest, InstantiateRequest, WorkerEvent,
};
use crate::util::{normalize_class, slugify, unique_id};
use serde_json::Value;
use std::sync::{Arc, Mutex, OnceLock};

/// Remote proxy for one instantiated component.
pub struct ComponentProxy {
    link: Arc<DeviceLink>,
    component_class: String,
    name: String,
    description: String,
    opts: Value,
    id: Mutex<String>,
    methods: OnceLock<Vec<String>>,
}

impl ComponentProxy {
    /// Build a proxy for a component class with constructor options.
    ///
    /// `name`/`description`/`id` keys are lifted out of `opts`; the
    /// component id is the slug of the name, or a generated
    /// `<class-lower>-N`, and is written back into `opts` so the worker
    /// instantiates under the same id.
    pub(crate) fn new(
        link: Arc<DeviceLink>,
        component_class: &str,
        name: Option<String>,
        mut opts: Value,
    ) -> Self {
        let component_class = normalize_class(component_class);
        if !opts.is_object() {
            opts = Value::Object(serde_json::Map::new());
        }
        let taken = |opts: &mut Value, key: &str| -> Option<String> {
            opts.as_object_mut()
                .and_then(|o| o.remove(key))
                .and_then(|v| v.as_str().map(str::to_string))
        };
        let opts_name = taken(&mut opts, "name");
        let opts_id = taken(&mut opts, "id");
        let description = taken(&mut opts, "description");
        let name = name.or(opts_name).or(opts_id);
        let id = name
            .as_deref()
            .and_then(slugify)
            .unwrap_or_else(|| unique_id(&component_class.to_lowercase()));
        if let Some(obj) = opts.as_object_mut() {
            obj.insert("id".to_string(), Value::String(id.clone()));
        }
        let name = name.unwrap_or_else(|| id.clone());
        Self {
            link,
            component_class,
            description: description.unwrap_or_else(|| name.clone()),
            name,
            opts,
            id: Mutex::new(id),
            methods: OnceLock::new(),
        }
    }

    /// Component id (worker-assigned once instantiated).
    pub fn id(&self) -> String {
        self.id.lock().map(|id| id.clone()).unwrap_or_default()
    }

    /// Human-readable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human-readable description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Normalized component class.
    pub fn component_class(&self) -> &str {
        &self.component_class
    }

    /// Discovered method names; `None` until the instantiate handshake has
    /// resolved.
    pub fn methods(&self) -> Option<&[String]> {
        self.methods.get().map(Vec::as_slice)
    }

    /// Whether a method was discovered on this component.
    pub fn has_method(&self, method: &str) -> bool {
        self.methods()
            .is_some_and(|methods| methods.iter().any(|m| m == method))
    }

    /// Run the instantiate handshake: publish `instantiate`, await the
    /// `instantiated` (or `error`) response, adopt the worker-assigned id
    /// and bind the discovered method descriptor. The descriptor is written
    /// at most once.
    pub(crate) async fn instantiate(&self) -> FleetResult<()> {
        let request = InstantiateRequest {
            component_class: self.component_class.clone(),
            opts: self.opts.clone(),
        };
        let event = self
            .link
            .request(
                CommandKind::Instantiate,
                serde_json::to_value(&request)?,
                EventKind::Instantiated,
            )
            .await?;
        if let WorkerEvent::Instantiated { id, methods, .. } = event {
            if let Ok(mut current) = self.id.lock() {
                *current = id;
            }
            let _ = self.methods.set(methods);
            Ok(())
        } else {
            Err(FleetError::Protocol(
                "instantiate resolved with an unexpected event".to_string(),
            ))
        }
    }

    /// Invoke a discovered method remotely and return its value (`true`
    /// when the worker had nothing serializable to report).
    pub async fn call(&self, method: &str, args: Vec<Value>) -> FleetResult<Value> {
        if self.methods.get().is_none() {
            return Err(FleetError::NotInstantiated {
                component: self.id(),
            });
        }
        if !self.has_method(method) {
            return Err(FleetError::UnknownMethod {
                component: self.id(),
                method: method.to_string(),
            });
        }
        let request = ExecuteRequest {
            id: self.id(),
            method: method.to_string(),
            args,
        };
        let event = self
            .link
            .request(
                CommandKind::Execute,
                serde_json::to_value(&request)?,
                EventKind::Executed,
            )
            .await?;
        match event {
            WorkerEvent::Executed { retval } => Ok(retval),
            _ => Err(FleetError::Protocol(
                "execute resolved with an unexpected event".to_string(),
            )),
        }
    }

    /// Ask the worker for this component's current method list.
    pub async fn dir(&self) -> FleetResult<Vec<String>> {
        let request = DirRequest {
            id: Some(self.id()),
            component_class: None,
        };
        let event = self
            .link
            .request(
                CommandKind::Dir,
                serde_json::to_value(&request)?,
                EventKind::Methods,
            )
            .await?;
        match event {
            WorkerEvent::Methods { methods } => Ok(methods),
            _ => Err(FleetError::Protocol(
                "dir resolved with an unexpected event".to_string(),
            )),
        }
    }
}

impl std::fmt::Debug for ComponentProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentProxy")
            .field("id", &self.id())
            .field("component_class", &self.component_class)
            .field("methods", &self.methods.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::supervisor::handle::RequestRouter;
    use serde_json::json;
    use std::time::Duration;

    fn test_link() -> Arc<DeviceLink> {
        Arc::new(DeviceLink {
            device_id: "porch".to_string(),
            bus: Arc::new(MemoryBus::new()),
            router: RequestRouter::new("porch"),
            request_timeout: Duration::from_millis(100),
        })
    }

    #[test]
    fn ids_derive_from_names_or_generate() {
        let named = ComponentProxy::new(
            test_link(),
            "led",
            Some("Front Door".to_string()),
            json!({"pin": 13}),
        );
        assert_eq!(named.id(), "front-door");
        assert_eq!(named.component_class(), "Led");
        assert_eq!(named.name(), "Front Door");

        let anonymous = ComponentProxy::new(test_link(), "led", None, json!({}));
        assert!(anonymous.id().starts_with("led-"));
    }

    #[test]
    fn name_and_description_are_lifted_out_of_opts() {
        let proxy = ComponentProxy::new(
            test_link(),
            "sensor",
            None,
            json!({"name": "photocell", "description": "porch light sensor", "pin": 2}),
        );
        assert_eq!(proxy.id(), "photocell");
        assert_eq!(proxy.description(), "porch light sensor");
        // The id travels with the opts; name/description do not.
        assert_eq!(proxy.opts["id"], "photocell");
        assert!(proxy.opts.get("name").is_none());
        assert!(proxy.opts.get("description").is_none());
        assert_eq!(proxy.opts["pin"], 2);
    }

    #[tokio::test]
    async fn calling_before_instantiate_is_rejected() {
        let proxy = ComponentProxy::new(test_link(), "led", Some("led-1".to_string()), json!({}));
        assert!(proxy.methods().is_none());

        let err = proxy.call("on", vec![]).await.unwrap_err();
        assert!(matches!(
            err,
            FleetError::NotInstantiated { component } if component == "led-1"
        ));
    }
}
