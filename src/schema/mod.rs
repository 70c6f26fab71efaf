//! Schema registry: local + remote API schemas, JSON-schema validation, and
//! periodic renewal. Grounded on `lightbus/schema/schema.py`
//! (`examples/original_source`).

mod derive;
mod store;

pub use derive::api_to_schema;
pub use store::SchemaStore;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RpcSchema {
    pub parameters: serde_json::Value,
    pub response: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventSchema {
    pub parameters: serde_json::Value,
}

/// `{rpcs: {name -> {parameters, response}}, events: {name -> {parameters}}}`,
/// derived deterministically from an [`crate::api::Api`] instance by
/// [`api_to_schema`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ApiSchema {
    pub rpcs: HashMap<String, RpcSchema>,
    pub events: HashMap<String, EventSchema>,
}

/// Turn a dotted API name into a filesystem-safe file stem, e.g.
/// `my.dummy` -> `my_dummy`. Used by [`SchemaStore::save_local`]'s
/// directory dump.
pub fn make_file_safe_api_name(api_name: &str) -> String {
    api_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_safe_name_replaces_dots() {
        assert_eq!(make_file_safe_api_name("my.dummy"), "my_dummy");
        assert_eq!(make_file_safe_api_name("my.dummy-api"), "my_dummy-api");
    }
}
