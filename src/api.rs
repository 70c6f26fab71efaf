//! APIs: named collections of remotely-callable procedures and fire-able
//! events, plus the process-wide registry of APIs this process serves.
//!
//! The reference implementation derives an API's procedures and events via
//! Python reflection over a class's public members (`inspect.getmembers` in
//! `lightbus/schema/schema.py`'s `api_to_schema`). Rust has no equivalent
//! reflection, so an [`Api`] here is an explicit, builder-assembled
//! description: each procedure and event is registered by name together
//! with its JSON-schema shape and (for procedures) its handler. This is the
//! "keep HOW, replace WHAT" seam — dynamic member discovery becomes
//! explicit registration, but the name/underscore rules, the schema shape,
//! and the call dispatch semantics are unchanged.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::message::Kwargs;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A procedure handler: takes keyword arguments, returns a JSON value.
///
/// Handlers are boxed, cloneable (`Arc`), and may be invoked concurrently.
pub type ProcedureHandler = Arc<dyn Fn(Kwargs) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

#[derive(Clone)]
pub struct ProcedureDef {
    pub name: String,
    pub parameters_schema: Value,
    pub response_schema: Value,
    pub handler: ProcedureHandler,
}

impl std::fmt::Debug for ProcedureDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcedureDef").field("name", &self.name).finish_non_exhaustive()
    }
}

#[derive(Clone, Debug)]
pub struct EventDef {
    pub name: String,
    pub parameters: HashSet<String>,
    pub parameters_schema: Value,
}

/// Validate an API or member name: non-empty, not underscore-prefixed.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidName {
            name: name.to_string(),
            reason: "name must not be empty",
        });
    }
    if name.starts_with('_') {
        return Err(Error::InvalidName {
            name: name.to_string(),
            reason: "names beginning with '_' are private and not exposed",
        });
    }
    Ok(())
}

/// A named collection of procedures and events. Authoritative only on
/// processes that register it via [`ApiRegistry::add`].
pub struct Api {
    name: String,
    procedures: HashMap<String, ProcedureDef>,
    events: HashMap<String, EventDef>,
}

impl Api {
    pub fn builder(name: impl Into<String>) -> ApiBuilder {
        ApiBuilder {
            name: name.into(),
            procedures: HashMap::new(),
            events: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn procedure(&self, name: &str) -> Option<&ProcedureDef> {
        self.procedures.get(name)
    }

    pub fn event(&self, name: &str) -> Option<&EventDef> {
        self.events.get(name)
    }

    pub fn procedures(&self) -> impl Iterator<Item = &ProcedureDef> {
        self.procedures.values()
    }

    pub fn events(&self) -> impl Iterator<Item = &EventDef> {
        self.events.values()
    }

    /// Invoke the named procedure locally. Callers are responsible for
    /// validating the name and the incoming schema beforehand; this just
    /// dispatches to the registered handler.
    pub async fn call(&self, name: &str, kwargs: Kwargs) -> Result<Value> {
        let procedure = self
            .procedures
            .get(name)
            .ok_or_else(|| Error::InvalidParameters {
                canonical_name: format!("{}.{}", self.name, name),
                reason: "no such procedure".to_string(),
            })?;
        (procedure.handler)(kwargs).await
    }
}

pub struct ApiBuilder {
    name: String,
    procedures: HashMap<String, ProcedureDef>,
    events: HashMap<String, EventDef>,
}

impl ApiBuilder {
    /// Register an RPC procedure.
    ///
    /// `parameters_schema`/`response_schema` are JSON Schemas used by the
    /// [`crate::schema`] store; pass `serde_json::json!({})` to accept
    /// anything.
    pub fn procedure<F, Fut>(
        mut self,
        name: impl Into<String>,
        parameters_schema: Value,
        response_schema: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(Kwargs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let name = name.into();
        self.procedures.insert(
            name.clone(),
            ProcedureDef {
                name,
                parameters_schema,
                response_schema,
                handler: Arc::new(move |kwargs| Box::pin(handler(kwargs))),
            },
        );
        self
    }

    /// Register a declared event. `parameters` is the event's full declared
    /// parameter set; a fire must supply exactly this set of kwarg keys.
    pub fn event(
        mut self,
        name: impl Into<String>,
        parameters: &[&str],
        parameters_schema: Value,
    ) -> Self {
        let name = name.into();
        self.events.insert(
            name.clone(),
            EventDef {
                name,
                parameters: parameters.iter().map(|s| s.to_string()).collect(),
                parameters_schema,
            },
        );
        self
    }

    pub fn build(self) -> Result<Api> {
        validate_name(&self.name)?;
        for name in self.procedures.keys().chain(self.events.keys()) {
            validate_name(name)?;
        }
        Ok(Api {
            name: self.name,
            procedures: self.procedures,
            events: self.events,
        })
    }
}

/// Process-wide (or, in tests, per-client) mapping from API name to the
/// API instance this process serves. An API being present here implies
/// this process is authoritative for it: only registered APIs may fire
/// events or have their RPCs consumed (spec invariant 4).
#[derive(Default)]
pub struct ApiRegistry {
    apis: DashMap<String, Arc<Api>>,
}

impl ApiRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, api: Api) {
        self.apis.insert(api.name().to_string(), Arc::new(api));
    }

    pub fn get(&self, api_name: &str) -> Result<Arc<Api>> {
        self.apis
            .get(api_name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::UnknownApi {
                api_name: api_name.to_string(),
            })
    }

    pub fn contains(&self, api_name: &str) -> bool {
        self.apis.contains_key(api_name)
    }

    pub fn all(&self) -> Vec<Arc<Api>> {
        self.apis.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.apis.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.apis.is_empty()
    }

    pub fn len(&self) -> usize {
        self.apis.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rejects_empty_and_underscore_names() {
        assert!(validate_name("").is_err());
        assert!(validate_name("_private").is_err());
        assert!(validate_name("ok").is_ok());
    }

    #[tokio::test]
    async fn calls_registered_procedure() {
        let api = Api::builder("my.dummy")
            .procedure("my_proc", json!({}), json!({}), |kwargs: Kwargs| async move {
                let field = kwargs.get("field").and_then(|v| v.as_str()).unwrap_or_default();
                Ok(Value::String(format!("value: {field}")))
            })
            .build()
            .unwrap();

        let mut kwargs = Kwargs::new();
        kwargs.insert("field".into(), Value::String("Hello! 😎".into()));
        let result = api.call("my_proc", kwargs).await.unwrap();
        assert_eq!(result, Value::String("value: Hello! 😎".into()));
    }

    #[test]
    fn registry_round_trips() {
        let registry = ApiRegistry::new();
        let api = Api::builder("my.dummy").build().unwrap();
        registry.add(api);
        assert!(registry.contains("my.dummy"));
        assert!(registry.get("other").is_err());
        assert_eq!(registry.names(), vec!["my.dummy".to_string()]);
    }
}
