//! Resolves `(api_name, kind)` to a concrete transport, with a reserved
//! `"default"` key acting as fallback. Grounded on spec §4.1; the grouping
//! operation (`get_rpc_transports`/`get_event_transports`) is the piece the
//! RPC and event engines lean on to fan a single logical consume/listen
//! call out over however many distinct transports are actually configured.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::config::Config;
use crate::error::{Error, Result};

use super::{EventTransport, RpcTransport, SchemaTransport, ResultTransport};

pub const DEFAULT_KEY: &str = "default";

/// Builds concrete transports from the typed config sections named in
/// spec §6 (`apis.<name>.{rpc_transport,result_transport,event_transport}`,
/// `bus.schema.transport`). Constructing e.g. a Redis transport from a
/// `{redis: {url}}` blob is exactly the kind of protocol-specific work spec
/// §1 places out of scope for this crate — a real deployment supplies its
/// own `TransportResolver` and hands it to
/// [`TransportRegistry::load_config`].
pub trait TransportResolver: Send + Sync {
    fn resolve_rpc(&self, spec: &serde_json::Value) -> Result<Arc<dyn RpcTransport>>;
    fn resolve_result(&self, spec: &serde_json::Value) -> Result<Arc<dyn ResultTransport>>;
    fn resolve_event(&self, spec: &serde_json::Value) -> Result<Arc<dyn EventTransport>>;
    fn resolve_schema(&self, spec: &serde_json::Value) -> Result<Arc<dyn SchemaTransport>>;
}

#[derive(Default)]
struct Slots<T: ?Sized> {
    by_api: HashMap<String, Arc<T>>,
}

impl<T: ?Sized> Slots<T> {
    fn get(&self, api_name: &str, kind: &'static str) -> Result<Arc<T>> {
        self.by_api
            .get(api_name)
            .or_else(|| self.by_api.get(DEFAULT_KEY))
            .cloned()
            .ok_or_else(|| Error::NoTransport {
                api_name: api_name.to_string(),
                kind,
            })
    }
}

pub struct TransportRegistry {
    rpc: RwLock<Slots<dyn RpcTransport>>,
    result: RwLock<Slots<dyn ResultTransport>>,
    event: RwLock<Slots<dyn EventTransport>>,
    schema: RwLock<Option<Arc<dyn SchemaTransport>>>,
    loaded_config: RwLock<bool>,
}

impl Default for TransportRegistry {
    fn default() -> Self {
        TransportRegistry {
            rpc: RwLock::new(Slots::default()),
            result: RwLock::new(Slots::default()),
            event: RwLock::new(Slots::default()),
            schema: RwLock::new(None),
            loaded_config: RwLock::new(false),
        }
    }
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_rpc_transport(&self, api_name: impl Into<String>, transport: Arc<dyn RpcTransport>) {
        self.rpc.write().unwrap().by_api.insert(api_name.into(), transport);
    }

    pub fn set_result_transport(&self, api_name: impl Into<String>, transport: Arc<dyn ResultTransport>) {
        self.result.write().unwrap().by_api.insert(api_name.into(), transport);
    }

    pub fn set_event_transport(&self, api_name: impl Into<String>, transport: Arc<dyn EventTransport>) {
        self.event.write().unwrap().by_api.insert(api_name.into(), transport);
    }

    pub fn set_schema_transport(&self, transport: Arc<dyn SchemaTransport>) {
        *self.schema.write().unwrap() = Some(transport);
    }

    pub fn get_rpc_transport(&self, api_name: &str) -> Result<Arc<dyn RpcTransport>> {
        self.rpc.read().unwrap().get(api_name, "rpc")
    }

    pub fn get_result_transport(&self, api_name: &str) -> Result<Arc<dyn ResultTransport>> {
        self.result.read().unwrap().get(api_name, "result")
    }

    pub fn get_event_transport(&self, api_name: &str) -> Result<Arc<dyn EventTransport>> {
        self.event.read().unwrap().get(api_name, "event")
    }

    pub fn get_schema_transport(&self) -> Result<Arc<dyn SchemaTransport>> {
        self.schema
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::NoTransport {
                api_name: DEFAULT_KEY.to_string(),
                kind: "schema",
            })
    }

    /// Group `api_names` by the transport that will actually serve them.
    /// Preserves the invariant that no API appears under more than one
    /// transport in the result.
    pub fn get_rpc_transports(
        &self,
        api_names: &[String],
    ) -> Result<Vec<(Arc<dyn RpcTransport>, Vec<String>)>> {
        let mut groups: Vec<(Arc<dyn RpcTransport>, Vec<String>)> = Vec::new();
        for api_name in api_names {
            let transport = self.get_rpc_transport(api_name)?;
            if let Some(group) = groups.iter_mut().find(|(t, _)| Arc::ptr_eq(t, &transport)) {
                group.1.push(api_name.clone());
            } else {
                groups.push((transport, vec![api_name.clone()]));
            }
        }
        Ok(groups)
    }

    pub fn get_event_transports(
        &self,
        api_names: &[String],
    ) -> Result<Vec<(Arc<dyn EventTransport>, Vec<String>)>> {
        let mut groups: Vec<(Arc<dyn EventTransport>, Vec<String>)> = Vec::new();
        for api_name in api_names {
            let transport = self.get_event_transport(api_name)?;
            if let Some(group) = groups.iter_mut().find(|(t, _)| Arc::ptr_eq(t, &transport)) {
                group.1.push(api_name.clone());
            } else {
                groups.push((transport, vec![api_name.clone()]));
            }
        }
        Ok(groups)
    }

    pub fn all_rpc_transports(&self) -> Vec<Arc<dyn RpcTransport>> {
        dedup_transports(self.rpc.read().unwrap().by_api.values().cloned())
    }

    pub fn all_result_transports(&self) -> Vec<Arc<dyn ResultTransport>> {
        dedup_transports(self.result.read().unwrap().by_api.values().cloned())
    }

    pub fn all_event_transports(&self) -> Vec<Arc<dyn EventTransport>> {
        dedup_transports(self.event.read().unwrap().by_api.values().cloned())
    }

    /// Close every distinct transport instance exactly once, per spec §5's
    /// "each transport must be closed exactly once during shutdown".
    pub async fn close_all(&self) -> Result<()> {
        for t in self.all_rpc_transports() {
            t.close().await?;
        }
        for t in self.all_result_transports() {
            t.close().await?;
        }
        for t in self.all_event_transports() {
            t.close().await?;
        }
        if let Some(schema) = self.schema.read().unwrap().clone() {
            schema.close().await?;
        }
        Ok(())
    }

    /// Read `config` and install transports per API. Idempotent: a second
    /// call with the same config is a no-op.
    pub fn load_config(&self, config: &Config, resolver: &dyn TransportResolver) -> Result<()> {
        {
            let mut loaded = self.loaded_config.write().unwrap();
            if *loaded {
                return Ok(());
            }
            *loaded = true;
        }

        if let Some(spec) = &config.bus.schema.transport {
            self.set_schema_transport(resolver.resolve_schema(spec)?);
        }

        for (api_name, api_config) in &config.apis {
            if let Some(spec) = &api_config.rpc_transport {
                self.set_rpc_transport(api_name.clone(), resolver.resolve_rpc(spec)?);
            }
            if let Some(spec) = &api_config.result_transport {
                self.set_result_transport(api_name.clone(), resolver.resolve_result(spec)?);
            }
            if let Some(spec) = &api_config.event_transport {
                self.set_event_transport(api_name.clone(), resolver.resolve_event(spec)?);
            }
        }

        Ok(())
    }
}

fn dedup_transports<T: ?Sized>(iter: impl Iterator<Item = Arc<T>>) -> Vec<Arc<T>> {
    let mut out: Vec<Arc<T>> = Vec::new();
    for item in iter {
        if !out.iter().any(|existing| Arc::ptr_eq(existing, &item)) {
            out.push(item);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryBroker;

    #[test]
    fn falls_back_to_default_transport() {
        let registry = TransportRegistry::new();
        let broker = MemoryBroker::new();
        registry.set_rpc_transport(DEFAULT_KEY, broker.rpc_transport());
        let resolved = registry.get_rpc_transport("whatever.api").unwrap();
        assert!(Arc::ptr_eq(&resolved, &broker.rpc_transport()));
    }

    #[test]
    fn no_transport_is_an_error_without_default() {
        let registry = TransportRegistry::new();
        assert!(registry.get_rpc_transport("whatever.api").is_err());
    }

    #[test]
    fn groups_apis_by_identical_transport() {
        let registry = TransportRegistry::new();
        let broker_a = MemoryBroker::new();
        let broker_b = MemoryBroker::new();
        registry.set_rpc_transport("api_a", broker_a.rpc_transport());
        registry.set_rpc_transport("api_b", broker_b.rpc_transport());
        registry.set_rpc_transport("api_a2", broker_a.rpc_transport());

        let groups = registry
            .get_rpc_transports(&["api_a".into(), "api_b".into(), "api_a2".into()])
            .unwrap();
        assert_eq!(groups.len(), 2);
        let a_group = groups.iter().find(|(t, _)| Arc::ptr_eq(t, &broker_a.rpc_transport())).unwrap();
        let mut names = a_group.1.clone();
        names.sort();
        assert_eq!(names, vec!["api_a".to_string(), "api_a2".to_string()]);
    }
}
