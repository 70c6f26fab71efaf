//! Configuration surface: the keys enumerated in spec §6.
//!
//! Parsing from TOML/JSON/env files is a documented external concern (spec
//! §1); what lives here is the typed shape those layers deserialize into.
//! Loading is delegated to `figment`, the config crate `acton-service`
//! (the closest ambient-stack example in the pack for a layered,
//! environment-aware config loader) uses.

use std::collections::HashMap;
use std::time::Duration;

use figment::providers::{Env, Format, Json, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

fn default_schema_ttl() -> u64 {
    24 * 60 * 60
}

fn default_load_timeout() -> f64 {
    5.0
}

fn default_add_api_timeout() -> f64 {
    5.0
}

fn default_rpc_timeout() -> f64 {
    5.0
}

fn default_event_fire_timeout() -> f64 {
    5.0
}

fn default_event_listener_setup_timeout() -> f64 {
    5.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaConfig {
    #[serde(default = "default_schema_ttl")]
    pub ttl: u64,
    #[serde(default)]
    pub human_readable: bool,
    #[serde(default = "default_load_timeout")]
    pub load_timeout: f64,
    #[serde(default = "default_add_api_timeout")]
    pub add_api_timeout: f64,
    /// `bus.schema.transport`: a typed sub-object identifying the schema
    /// transport, e.g. `{"redis": {"url": "..."}}`. Left as a raw JSON
    /// value since transport construction is out of this crate's scope.
    #[serde(default)]
    pub transport: Option<serde_json::Value>,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        SchemaConfig {
            ttl: default_schema_ttl(),
            human_readable: false,
            load_timeout: default_load_timeout(),
            add_api_timeout: default_add_api_timeout(),
            transport: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BusConfig {
    #[serde(default)]
    pub schema: SchemaConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ValidateConfig {
    #[serde(default)]
    pub incoming: bool,
    #[serde(default)]
    pub outgoing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout: f64,
    #[serde(default = "default_event_fire_timeout")]
    pub event_fire_timeout: f64,
    #[serde(default = "default_event_listener_setup_timeout")]
    pub event_listener_setup_timeout: f64,
    #[serde(default)]
    pub validate: ValidateConfig,
    #[serde(default)]
    pub strict_validation: bool,
    #[serde(default)]
    pub rpc_transport: Option<serde_json::Value>,
    #[serde(default)]
    pub result_transport: Option<serde_json::Value>,
    #[serde(default)]
    pub event_transport: Option<serde_json::Value>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            rpc_timeout: default_rpc_timeout(),
            event_fire_timeout: default_event_fire_timeout(),
            event_listener_setup_timeout: default_event_listener_setup_timeout(),
            validate: ValidateConfig::default(),
            strict_validation: false,
            rpc_transport: None,
            result_transport: None,
            event_transport: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub apis: HashMap<String, ApiConfig>,
    #[serde(default)]
    pub service_name: Option<String>,
    #[serde(default)]
    pub process_name: Option<String>,
}

impl Config {
    /// The effective per-API config: an explicit entry if present, else the
    /// defaults. Never fails — an unconfigured API simply gets defaults,
    /// matching the reference implementation's `config.api(name)` fallback.
    pub fn api(&self, api_name: &str) -> ApiConfig {
        self.apis.get(api_name).cloned().unwrap_or_default()
    }

    pub fn rpc_timeout(&self, api_name: &str) -> Duration {
        Duration::from_secs_f64(self.api(api_name).rpc_timeout)
    }

    /// Build a [`Figment`] layering (in increasing precedence) a base TOML
    /// file, an optional JSON override file, and `MESHBUS_`-prefixed
    /// environment variables, then extract it into a [`Config`].
    pub fn load(toml_path: Option<&str>, json_path: Option<&str>) -> Result<Config> {
        let mut figment = Figment::new();
        if let Some(path) = toml_path {
            figment = figment.merge(Toml::file(path));
        }
        if let Some(path) = json_path {
            figment = figment.merge(Json::file(path));
        }
        figment = figment.merge(Env::prefixed("MESHBUS_").split("__"));
        figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_api_gets_defaults() {
        let config = Config::default();
        let api_config = config.api("unknown.api");
        assert_eq!(api_config.rpc_timeout, default_rpc_timeout());
        assert!(!api_config.strict_validation);
    }

    #[test]
    fn schema_ttl_defaults_to_a_day() {
        let config = Config::default();
        assert_eq!(config.bus.schema.ttl, 24 * 60 * 60);
    }
}
