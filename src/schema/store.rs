use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, info};

use crate::api::Api;
use crate::error::{Error, Result};
use crate::transport::SchemaTransport;

use super::{api_to_schema, make_file_safe_api_name, ApiSchema};

/// Holds two disjoint logical pools of API schemas — local (produced by
/// APIs this process serves, or loaded from local files) and remote
/// (retrieved from the schema transport) — and validates RPC/event
/// payloads against them.
///
/// A schema may exist in local XOR remote XOR both; lookups merge the two
/// pools, local taking priority, matching `Schema.get_api_schema` in
/// `lightbus/schema/schema.py`.
pub struct SchemaStore {
    schema_transport: Arc<dyn SchemaTransport>,
    ttl_seconds: u64,
    human_readable: bool,
    local: RwLock<HashMap<String, ApiSchema>>,
    remote: RwLock<HashMap<String, ApiSchema>>,
}

impl SchemaStore {
    pub fn new(schema_transport: Arc<dyn SchemaTransport>, ttl_seconds: u64, human_readable: bool) -> Self {
        SchemaStore {
            schema_transport,
            ttl_seconds,
            human_readable,
            local: RwLock::new(HashMap::new()),
            remote: RwLock::new(HashMap::new()),
        }
    }

    pub fn contains(&self, api_name: &str) -> bool {
        self.local.read().unwrap().contains_key(api_name) || self.remote.read().unwrap().contains_key(api_name)
    }

    pub fn api_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.local.read().unwrap().keys().cloned().collect();
        for name in self.remote.read().unwrap().keys() {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }

    /// Derive `api`'s schema, stash it locally, and push it to the bus with
    /// a fresh lease.
    pub async fn add_api(&self, api: &Api) -> Result<()> {
        let schema = api_to_schema(api);
        self.local.write().unwrap().insert(api.name().to_string(), schema.clone());
        self.schema_transport.store(api.name(), &schema, self.ttl_seconds).await?;
        debug!(api = api.name(), "added local schema and stored it on the bus");
        Ok(())
    }

    /// Replace the remote pool wholesale with the transport's current view.
    pub async fn load_from_bus(&self) -> Result<()> {
        let schemas = self.schema_transport.load().await?;
        info!(count = schemas.len(), "loaded remote schemas");
        *self.remote.write().unwrap() = schemas;
        Ok(())
    }

    /// Re-store every local schema with a fresh TTL.
    pub async fn save_to_bus(&self) -> Result<()> {
        let local = self.local.read().unwrap().clone();
        for (api_name, schema) in local {
            self.schema_transport.store(&api_name, &schema, self.ttl_seconds).await?;
        }
        Ok(())
    }

    /// Renew local schema leases and refresh the remote pool every
    /// `interval` (default `0.8 * ttl`), until `shutdown` resolves.
    pub async fn monitor(&self, interval: Option<Duration>, mut shutdown: tokio::sync::oneshot::Receiver<()>) {
        let interval = interval.unwrap_or_else(|| Duration::from_secs_f64(self.ttl_seconds as f64 * 0.8));
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = &mut shutdown => {
                    debug!("schema monitor cancelled");
                    return;
                }
            }

            let local = self.local.read().unwrap().clone();
            for (api_name, schema) in &local {
                if let Err(err) = self.schema_transport.ping(api_name, schema, self.ttl_seconds).await {
                    tracing::warn!(api = api_name.as_str(), error = %err, "failed to renew schema lease");
                }
            }

            if let Err(err) = self.load_from_bus().await {
                tracing::warn!(error = %err, "failed to refresh remote schemas");
            }
        }
    }

    pub fn get_api_schema(&self, api_name: &str) -> Result<ApiSchema> {
        if let Some(schema) = self.local.read().unwrap().get(api_name) {
            return Ok(schema.clone());
        }
        if let Some(schema) = self.remote.read().unwrap().get(api_name) {
            return Ok(schema.clone());
        }
        Err(Error::SchemaNotFound {
            api_name: api_name.to_string(),
            name: String::new(),
        })
    }

    pub fn get_rpc_schema(&self, api_name: &str, rpc_name: &str) -> Result<super::RpcSchema> {
        let schema = self.get_api_schema(api_name)?;
        schema.rpcs.get(rpc_name).cloned().ok_or_else(|| Error::SchemaNotFound {
            api_name: api_name.to_string(),
            name: rpc_name.to_string(),
        })
    }

    pub fn get_event_schema(&self, api_name: &str, event_name: &str) -> Result<super::EventSchema> {
        let schema = self.get_api_schema(api_name)?;
        schema.events.get(event_name).cloned().ok_or_else(|| Error::SchemaNotFound {
            api_name: api_name.to_string(),
            name: event_name.to_string(),
        })
    }

    pub fn get_event_or_rpc_schema(&self, api_name: &str, name: &str) -> Result<serde_json::Value> {
        if let Ok(event) = self.get_event_schema(api_name, name) {
            return Ok(event.parameters);
        }
        if let Ok(rpc) = self.get_rpc_schema(api_name, name) {
            return Ok(rpc.parameters);
        }
        Err(Error::SchemaNotFound {
            api_name: api_name.to_string(),
            name: name.to_string(),
        })
    }

    pub fn validate_parameters(&self, api_name: &str, event_or_rpc_name: &str, kwargs: &serde_json::Value) -> Result<()> {
        let json_schema = self.get_event_or_rpc_schema(api_name, event_or_rpc_name)?;
        jsonschema::validate(&json_schema, kwargs).map_err(|e| Error::Validation {
            canonical_name: format!("{api_name}.{event_or_rpc_name}"),
            direction: "parameters",
            message: e.to_string(),
        })
    }

    pub fn validate_response(&self, api_name: &str, rpc_name: &str, response: &serde_json::Value) -> Result<()> {
        let json_schema = self.get_rpc_schema(api_name, rpc_name)?.response;
        jsonschema::validate(&json_schema, response).map_err(|e| Error::Validation {
            canonical_name: format!("{api_name}.{rpc_name}"),
            direction: "response",
            message: e.to_string(),
        })
    }

    /// Dump every known schema (local + remote) to `destination`: a
    /// directory (one JSON file per API) or a single file.
    pub fn save_local(&self, destination: &Path) -> Result<()> {
        if destination.is_dir() {
            for api_name in self.api_names() {
                let schema = self.get_api_schema(&api_name)?;
                let file_name = format!("{}.json", make_file_safe_api_name(&api_name));
                let body = self.dump_one(&schema)?;
                std::fs::write(destination.join(file_name), body)?;
            }
        } else {
            let mut all = HashMap::new();
            for api_name in self.api_names() {
                all.insert(api_name.clone(), self.get_api_schema(&api_name)?);
            }
            let body = if self.human_readable {
                serde_json::to_string_pretty(&all)?
            } else {
                serde_json::to_string(&all)?
            };
            std::fs::write(destination, body)?;
        }
        Ok(())
    }

    fn dump_one(&self, schema: &ApiSchema) -> Result<String> {
        if self.human_readable {
            Ok(serde_json::to_string_pretty(schema)?)
        } else {
            Ok(serde_json::to_string(schema)?)
        }
    }

    /// Load schemas from a file, a directory of `*.json` files, or stdin
    /// (when `source` is `None`). Loaded schemas land in the local pool —
    /// they are never pushed back to the bus.
    pub fn load_local(&self, source: Option<&Path>) -> Result<()> {
        let loaded: HashMap<String, ApiSchema> = match source {
            None => {
                let mut buf = String::new();
                std::io::stdin().read_to_string(&mut buf)?;
                serde_json::from_str(&buf)?
            }
            Some(path) if path.is_dir() => {
                let mut merged = HashMap::new();
                for entry in std::fs::read_dir(path)? {
                    let entry = entry?;
                    let path = entry.path();
                    if path.extension().and_then(|e| e.to_str()) != Some("json") {
                        continue;
                    }
                    let body = std::fs::read_to_string(&path)?;
                    let partial: HashMap<String, ApiSchema> = serde_json::from_str(&body)?;
                    merged.extend(partial);
                }
                merged
            }
            Some(path) => {
                let body = std::fs::read_to_string(path)?;
                serde_json::from_str(&body)?
            }
        };

        let mut local = self.local.write().unwrap();
        for (api_name, schema) in loaded {
            local.insert(api_name, schema);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryBroker;
    use serde_json::json;

    fn store() -> SchemaStore {
        let broker = MemoryBroker::new();
        SchemaStore::new(broker.schema_transport(), 60, true)
    }

    #[tokio::test]
    async fn add_api_then_lookup_round_trips() {
        let store = store();
        let api = Api::builder("my.dummy")
            .procedure(
                "my_proc",
                json!({"type": "object"}),
                json!({"type": "string"}),
                |_| async { Ok(json!("ok")) },
            )
            .build()
            .unwrap();

        store.add_api(&api).await.unwrap();
        let schema = store.get_rpc_schema("my.dummy", "my_proc").unwrap();
        assert_eq!(schema.response, json!({"type": "string"}));
    }

    #[tokio::test]
    async fn save_then_load_from_bus_is_idempotent() {
        let store = store();
        let api = Api::builder("my.dummy")
            .procedure("p", json!({}), json!({}), |_| async { Ok(json!(null)) })
            .build()
            .unwrap();
        store.add_api(&api).await.unwrap();
        store.save_to_bus().await.unwrap();
        store.load_from_bus().await.unwrap();
        assert!(store.remote.read().unwrap().contains_key("my.dummy"));
        assert_eq!(*store.local.read().unwrap(), *store.remote.read().unwrap());
    }

    #[test]
    fn missing_schema_is_not_found() {
        let store = store();
        assert!(matches!(
            store.get_rpc_schema("nope", "p"),
            Err(Error::SchemaNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn save_local_writes_one_file_per_api_in_a_directory() {
        let store = store();
        let api = Api::builder("my.dummy")
            .procedure("p", json!({}), json!({}), |_| async { Ok(json!(null)) })
            .build()
            .unwrap();
        store.add_api(&api).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        store.save_local(dir.path()).unwrap();
        assert!(dir.path().join("my_dummy.json").exists());
    }
}
