//! `api_to_schema`: deterministic derivation of an [`ApiSchema`] from an
//! [`Api`] instance.
//!
//! The reference implementation walks `inspect.getmembers(api)`, skipping
//! names starting with `_` and names inherited from the base `Api` class,
//! classifying methods as RPCs and `Event` descriptors as events. Since our
//! [`Api`] is an explicit registration rather than a reflected class, the
//! "skip private / skip inherited" filtering is already enforced at
//! registration time (`api::validate_name`); this just reads the two maps
//! straight across.

use super::{ApiSchema, EventSchema, RpcSchema};
use crate::api::Api;

pub fn api_to_schema(api: &Api) -> ApiSchema {
    let mut schema = ApiSchema::default();

    for procedure in api.procedures() {
        schema.rpcs.insert(
            procedure.name.clone(),
            RpcSchema {
                parameters: procedure.parameters_schema.clone(),
                response: procedure.response_schema.clone(),
            },
        );
    }

    for event in api.events() {
        schema.events.insert(
            event.name.clone(),
            EventSchema {
                parameters: event.parameters_schema.clone(),
            },
        );
    }

    schema
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Kwargs;
    use serde_json::json;

    #[test]
    fn derives_rpcs_and_events() {
        let api = Api::builder("my.dummy")
            .procedure(
                "my_proc",
                json!({"type": "object", "properties": {"field": {"type": "string"}}, "required": ["field"]}),
                json!({"type": "string"}),
                |_: Kwargs| async { Ok(json!("ok")) },
            )
            .event("my_event", &["field"], json!({"type": "object"}))
            .build()
            .unwrap();

        let schema = api_to_schema(&api);
        assert!(schema.rpcs.contains_key("my_proc"));
        assert!(schema.events.contains_key("my_event"));
        assert_eq!(schema.rpcs["my_proc"].response, json!({"type": "string"}));
    }
}
