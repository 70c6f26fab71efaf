//! Immutable value objects exchanged between the bus client and transports:
//! [`RpcMessage`], [`ResultMessage`], and [`EventMessage`].
//!
//! Grounded on `lightbus/message.py` (`examples/original_source`): the three
//! message types, their required metadata fields, and the `canonical_name`
//! convention are carried over verbatim in meaning; the `rpc_id` scheme
//! (base64 of a time-ordered UUID) is reproduced with `uuid`'s `Timestamp`
//! v7 generator instead of the original's UUIDv1.

use std::collections::HashMap;
use std::fmt;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A keyword-argument bag. All three message kinds carry one.
pub type Kwargs = HashMap<String, Value>;

/// Mint a new rpc_id: base64 of a time-ordered (v7) UUID's raw bytes.
///
/// Time-ordered ids keep ids roughly sortable by issue time, which is handy
/// for log correlation; this mirrors the reference implementation's choice
/// of UUIDv1 for the same reason.
pub fn new_rpc_id() -> String {
    let uuid = Uuid::now_v7();
    STANDARD_NO_PAD.encode(uuid.as_bytes())
}

/// A remote-procedure-call request in flight.
///
/// `rpc_id` is assigned at construction and never changes; `return_path` is
/// filled in once the result transport has reserved a reply slot (see
/// `ResultTransport::get_return_path`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcMessage {
    pub rpc_id: String,
    pub api_name: String,
    pub procedure_name: String,
    pub kwargs: Kwargs,
    pub return_path: Option<String>,
}

impl RpcMessage {
    pub fn new(api_name: impl Into<String>, procedure_name: impl Into<String>, kwargs: Kwargs) -> Self {
        RpcMessage {
            rpc_id: new_rpc_id(),
            api_name: api_name.into(),
            procedure_name: procedure_name.into(),
            kwargs,
            return_path: None,
        }
    }

    pub fn canonical_name(&self) -> String {
        format!("{}.{}", self.api_name, self.procedure_name)
    }
}

impl fmt::Display for RpcMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args = self
            .kwargs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "{}({})", self.canonical_name(), args)
    }
}

/// The reply to exactly one [`RpcMessage`], matched by `rpc_id`.
///
/// Constructing one from a raised error (see [`ResultMessage::from_error`])
/// sets `error = true` and stringifies the error plus a best-effort trace,
/// matching the reference implementation's `ResultMessage.__init__` taking
/// a `BaseException`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMessage {
    pub rpc_id: String,
    pub result: Value,
    pub error: bool,
    pub trace: Option<String>,
}

impl ResultMessage {
    pub fn success(rpc_id: impl Into<String>, result: Value) -> Self {
        ResultMessage {
            rpc_id: rpc_id.into(),
            result,
            error: false,
            trace: None,
        }
    }

    /// Build an error result from a displayable error, capturing its debug
    /// representation as a stand-in for a stack trace (Rust errors do not
    /// carry a traceback the way Python exceptions do).
    pub fn from_error(rpc_id: impl Into<String>, err: &impl std::fmt::Debug) -> Self {
        ResultMessage {
            rpc_id: rpc_id.into(),
            result: Value::String(format!("{err:?}")),
            error: true,
            trace: Some(format!("{err:#?}")),
        }
    }
}

impl fmt::Display for ResultMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.error {
            write!(f, "<ResultMessage (ERROR): {}>", self.result)
        } else {
            write!(f, "<ResultMessage (SUCCESS): {}>", self.result)
        }
    }
}

/// A fire-and-forget notification, delivered at-least-once to zero or more
/// listeners.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    pub api_name: String,
    pub event_name: String,
    pub kwargs: Kwargs,
}

impl EventMessage {
    pub fn new(api_name: impl Into<String>, event_name: impl Into<String>, kwargs: Kwargs) -> Self {
        EventMessage {
            api_name: api_name.into(),
            event_name: event_name.into(),
            kwargs,
        }
    }

    pub fn canonical_name(&self) -> String {
        format!("{}.{}", self.api_name, self.event_name)
    }
}

impl fmt::Display for EventMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args = self
            .kwargs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "{}({})", self.canonical_name(), args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_ids_are_unique_and_non_empty() {
        let a = new_rpc_id();
        let b = new_rpc_id();
        assert!(!a.is_empty());
        assert_ne!(a, b);
    }

    #[test]
    fn canonical_names_join_api_and_member() {
        let rpc = RpcMessage::new("my.dummy", "my_proc", Kwargs::new());
        assert_eq!(rpc.canonical_name(), "my.dummy.my_proc");

        let event = EventMessage::new("my.dummy", "my_event", Kwargs::new());
        assert_eq!(event.canonical_name(), "my.dummy.my_event");
    }

    #[test]
    fn result_display_distinguishes_error_from_success() {
        let ok = ResultMessage::success("abc", Value::from("value: hi"));
        assert!(format!("{ok}").contains("SUCCESS"));

        let err = ResultMessage::from_error("abc", &"boom".to_string());
        assert!(err.error);
        assert!(format!("{err}").contains("ERROR"));
    }
}
