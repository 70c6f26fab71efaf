//! A message-bus client runtime: synchronous RPC and fire-and-forget
//! events over a pluggable transport, with a schema registry and a plugin
//! hook bus. Grounded throughout on `examples/original_source/lightbus`
//! (see `DESIGN.md` for the full grounding ledger); the concrete wire
//! protocol a deployment talks to a broker with is out of scope — bring
//! your own [`transport::RpcTransport`]/[`transport::EventTransport`]/
//! [`transport::ResultTransport`]/[`transport::SchemaTransport`], or use
//! the bundled [`transport::memory`] or [`transport::stdio`] reference
//! implementations.

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod internal_apis;
pub mod message;
pub mod node;
pub mod plugin;
pub mod rpc;
pub mod schema;
pub mod transport;

pub use api::{Api, ApiBuilder, ApiRegistry};
pub use client::BusClient;
pub use config::Config;
pub use error::{Error, Result};
pub use event::EventListener;
pub use message::{EventMessage, Kwargs, ResultMessage, RpcMessage};
pub use node::BusNode;
pub use plugin::{Hook, HookContext, Plugin, PluginHookBus};
pub use schema::{ApiSchema, SchemaStore};
pub use transport::{CallOptions, TransportRegistry, TransportResolver};

use std::sync::Arc;

/// Build a [`BusClient`] (and its root [`BusNode`]) from a loaded
/// [`Config`] and a resolver that knows how to turn the config's transport
/// specs into concrete transports. Mirrors `lightbus.bus.create`
/// (`examples/original_source/lightbus/bus.py`), minus the process-wide
/// API registry singleton the reference implementation relies on — here
/// the caller builds and owns an [`ApiRegistry`] explicitly.
pub fn create(config: Config, registry: Arc<ApiRegistry>, resolver: &dyn TransportResolver) -> Result<Arc<BusNode>> {
    let transports = Arc::new(TransportRegistry::new());
    transports.load_config(&config, resolver)?;

    let schema_transport = transports.get_schema_transport()?;
    let schema = Arc::new(SchemaStore::new(schema_transport, config.bus.schema.ttl, config.bus.schema.human_readable));

    let client = Arc::new(BusClient::new(config, registry, transports, schema));
    Ok(BusNode::root(client))
}
