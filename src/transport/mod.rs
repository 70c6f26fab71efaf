//! Transport contracts: the abstract channels the engines depend on.
//!
//! Concrete wire protocols (a Redis/NATS/stream broker, a websocket, ...)
//! are explicitly out of scope for this crate (spec §1) — these traits are
//! the seam an implementer plugs a real backend into. [`memory`] ships one
//! reference implementation (used by this crate's own tests) and [`stdio`]
//! a second, line-delimited one for talking to a child process, grounded on
//! the teacher's `IoInterface`/`StdioInterface`
//! (`examples/kunkunsh-kkrpc/packages/kkrpc-rs/src/main.rs`).

pub mod memory;
pub mod registry;
pub mod stdio;

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::Result;
use crate::message::{EventMessage, RpcMessage, ResultMessage};
use crate::schema::ApiSchema;

pub use registry::{TransportRegistry, TransportResolver};

/// Per-call options threaded through to a transport: timeouts, consumer
/// group overrides, and anything else a concrete transport wants to read
/// out of a loosely-typed bag. Kept as a JSON object so transports the core
/// doesn't know about can carry their own options without the core needing
/// a matching field.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub timeout: Option<std::time::Duration>,
    pub consumer_group: Option<String>,
    pub extra: HashMap<String, serde_json::Value>,
}

#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Dispatch `msg` to whatever queue/topic serves `msg.api_name`. Must
    /// not block waiting for a result — that is `ResultTransport`'s job.
    async fn call_rpc(&self, msg: &RpcMessage, options: &CallOptions) -> Result<()>;

    /// Block until at least one RPC message is available for one of
    /// `apis`, then return the whole batch.
    async fn consume_rpcs(&self, apis: &[String]) -> Result<Vec<RpcMessage>>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait ResultTransport: Send + Sync {
    /// Reserve a reply slot for `msg` and return the opaque token telling
    /// this transport where to deliver the reply. Reserving synchronously
    /// (before the caller starts waiting) is what closes the race
    /// documented in spec §9 (DESIGN NOTES, open question (b)).
    async fn get_return_path(&self, msg: &RpcMessage) -> Result<String>;

    async fn send_result(
        &self,
        rpc_msg: &RpcMessage,
        result_msg: &ResultMessage,
        return_path: &str,
    ) -> Result<()>;

    async fn receive_result(
        &self,
        rpc_msg: &RpcMessage,
        return_path: &str,
        options: &CallOptions,
    ) -> Result<ResultMessage>;

    async fn close(&self) -> Result<()>;
}

/// A lazy, two-phase-acknowledged sequence of events, as required by spec
/// §4.5: one advance yields a message, the next acknowledges it. Modelled
/// here as an explicit `ack()` rather than literally requiring a second
/// `next()` call (spec §9 DESIGN NOTES), since an explicit method is the
/// idiomatic Rust rendition of "advance the underlying generator a second
/// time."
#[async_trait]
pub trait EventConsumer: Send {
    /// Returns `None` when the transport is closed / the subscription ends.
    async fn next(&mut self) -> Option<Result<EventMessage>>;

    /// Acknowledge the most recently yielded message. Must be called
    /// exactly once per message returned by `next()`, before the next call
    /// to `next()`.
    async fn ack(&mut self) -> Result<()>;
}

#[async_trait]
pub trait EventTransport: Send + Sync {
    async fn send_event(&self, msg: &EventMessage, options: &CallOptions) -> Result<()>;

    /// Open a consumer for the given `(api_name, event_name)` pairs.
    /// `consumer_group` in `options` determines whether multiple clients
    /// compete for the same queue or each see every event.
    async fn consume(
        &self,
        listen_for: &[(String, String)],
        options: &CallOptions,
    ) -> Result<Box<dyn EventConsumer>>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait SchemaTransport: Send + Sync {
    async fn store(&self, api_name: &str, schema: &ApiSchema, ttl_seconds: u64) -> Result<()>;

    async fn ping(&self, api_name: &str, schema: &ApiSchema, ttl_seconds: u64) -> Result<()>;

    async fn load(&self) -> Result<HashMap<String, ApiSchema>>;

    async fn close(&self) -> Result<()>;
}
