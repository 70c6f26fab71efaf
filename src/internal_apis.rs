//! The two APIs every bus client registers in [`crate::client::BusClient::run_forever`]:
//! a state/presence API and a metrics snapshot API.
//!
//! `lightbus.internal_apis.LightbusStateApi`/`LightbusMetricsApi` are
//! referenced by name in `lightbus/bus.py` but their module is not part of
//! `examples/original_source` (see `_INDEX.md`) — this reconstructs their
//! shape from that call site: a liveness-check RPC plus a presence event for
//! state, and an RPC snapshot of call/fire counters for metrics.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::json;

use crate::api::Api;
use crate::message::Kwargs;

static RPC_CALL_COUNT: AtomicU64 = AtomicU64::new(0);
static EVENT_FIRE_COUNT: AtomicU64 = AtomicU64::new(0);

pub(crate) fn record_rpc_call() {
    RPC_CALL_COUNT.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_event_fire() {
    EVENT_FIRE_COUNT.fetch_add(1, Ordering::Relaxed);
}

/// `internal.state`: a `ping` RPC for liveness checks, plus a declared
/// `state` event a deployment can fire on startup/shutdown to announce
/// presence. Firing that event is left to the embedding application — this
/// crate only reserves the name and its schema.
pub fn state_api() -> Api {
    Api::builder("internal.state")
        .procedure("ping", json!({}), json!({"type": "string"}), |_: Kwargs| async { Ok(json!("pong")) })
        .event(
            "state",
            &["service_name", "process_name", "online"],
            json!({
                "type": "object",
                "properties": {
                    "service_name": {"type": "string"},
                    "process_name": {"type": "string"},
                    "online": {"type": "boolean"},
                },
                "required": ["service_name", "process_name", "online"],
            }),
        )
        .build()
        .expect("internal.state api name/member names are valid by construction")
}

/// `internal.metrics`: a single RPC returning a point-in-time snapshot of
/// the process-wide RPC-call and event-fire counters.
pub fn metrics_api() -> Api {
    Api::builder("internal.metrics")
        .procedure(
            "get_metrics",
            json!({}),
            json!({
                "type": "object",
                "properties": {
                    "rpc_call_count": {"type": "integer"},
                    "event_fire_count": {"type": "integer"},
                },
            }),
            |_: Kwargs| async {
                Ok(json!({
                    "rpc_call_count": RPC_CALL_COUNT.load(Ordering::Relaxed),
                    "event_fire_count": EVENT_FIRE_COUNT.load(Ordering::Relaxed),
                }))
            },
        )
        .build()
        .expect("internal.metrics api name/member names are valid by construction")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Kwargs;

    #[tokio::test]
    async fn ping_replies_pong() {
        let api = state_api();
        let result = api.call("ping", Kwargs::new()).await.unwrap();
        assert_eq!(result, json!("pong"));
    }

    #[tokio::test]
    async fn metrics_snapshot_reflects_recorded_counters() {
        record_rpc_call();
        record_event_fire();
        let api = metrics_api();
        let result = api.call("get_metrics", Kwargs::new()).await.unwrap();
        assert!(result["rpc_call_count"].as_u64().unwrap() >= 1);
        assert!(result["event_fire_count"].as_u64().unwrap() >= 1);
    }
}
