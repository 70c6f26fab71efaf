//! `BusNode`: a hierarchical path built by chaining segments
//! (`bus.child("my").child("dummy").child("my_proc")`), resolving to an
//! `api_name`/member pair by joining everything between the root and the
//! leaf. Grounded on `lightbus.bus.BusNode` (`examples/original_source`).
//!
//! The reference implementation builds this path via `__getattr__`,
//! synthesizing a child node for any attribute access. Rust has no
//! attribute-miss hook, so [`BusNode::child`] makes that traversal step
//! explicit — the same "keep HOW, replace WHAT" seam used for
//! [`crate::api::Api`]'s reflection-free registration.

use std::sync::Arc;

use crate::client::BusClient;
use crate::error::{Error, Result};
use crate::event::EventListener;
use crate::message::Kwargs;
use crate::schema::SchemaStore;
use crate::transport::CallOptions;

pub struct BusNode {
    name: String,
    parent: Option<Arc<BusNode>>,
    bus_client: Arc<BusClient>,
}

impl BusNode {
    /// The bus root: the node you get back from composing a client. Calling
    /// RPC/event operations directly on it is a configuration error (there
    /// is no API name yet) — descend via [`child`](Self::child) first.
    pub fn root(bus_client: Arc<BusClient>) -> Arc<Self> {
        Arc::new(BusNode { name: String::new(), parent: None, bus_client })
    }

    pub fn child(self: &Arc<Self>, name: impl Into<String>) -> Result<Arc<Self>> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::InvalidBusNodeConfiguration { reason: "node segment name must not be empty" });
        }
        Ok(Arc::new(BusNode { name, parent: Some(Arc::clone(self)), bus_client: Arc::clone(&self.bus_client) }))
    }

    fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    fn ancestor_names(&self, include_self: bool) -> Vec<String> {
        let mut names = Vec::new();
        let mut current = Some(self);
        let mut first = true;
        while let Some(node) = current {
            if !first || include_self {
                names.push(node.name.clone());
            }
            first = false;
            current = node.parent.as_deref();
        }
        names.reverse();
        names
    }

    /// Every segment between the root and this node's parent, dot-joined —
    /// the API name this node's leaf segment belongs to.
    pub fn api_name(&self) -> String {
        let mut names = self.ancestor_names(false);
        if !names.is_empty() {
            names.remove(0);
        }
        names.join(".")
    }

    pub fn fully_qualified_name(&self) -> String {
        let mut names = self.ancestor_names(true);
        if !names.is_empty() {
            names.remove(0);
        }
        names.join(".")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn call(&self, kwargs: Kwargs) -> Result<serde_json::Value> {
        self.call_with_options(kwargs, CallOptions::default()).await
    }

    pub async fn call_with_options(&self, kwargs: Kwargs, options: CallOptions) -> Result<serde_json::Value> {
        self.bus_client.call_rpc_remote(&self.api_name(), &self.name, kwargs, options).await
    }

    pub async fn fire(&self, kwargs: Kwargs) -> Result<()> {
        self.fire_with_options(kwargs, CallOptions::default()).await
    }

    pub async fn fire_with_options(&self, kwargs: Kwargs, options: CallOptions) -> Result<()> {
        self.bus_client.fire_event(&self.api_name(), &self.name, kwargs, options).await
    }

    pub async fn listen(self: &Arc<Self>, listener: EventListener) -> Result<()> {
        self.listen_with_options(listener, CallOptions::default()).await
    }

    pub async fn listen_with_options(self: &Arc<Self>, listener: EventListener, options: CallOptions) -> Result<()> {
        self.bus_client.listen_for_event(&self.api_name(), &self.name, listener, options).await
    }

    /// Only callable on the bus root — mirrors the reference
    /// implementation raising `OnlyAvailableOnRootNode` for any
    /// non-root `listen_multiple`/`listen_multiple_async` call.
    pub async fn listen_multiple(self: &Arc<Self>, events: &[Arc<BusNode>], listener: EventListener) -> Result<()> {
        self.listen_multiple_with_options(events, listener, CallOptions::default()).await
    }

    pub async fn listen_multiple_with_options(
        self: &Arc<Self>,
        events: &[Arc<BusNode>],
        listener: EventListener,
        options: CallOptions,
    ) -> Result<()> {
        if !self.is_root() {
            return Err(Error::OnlyAvailableOnRootNode { operation: "listen_multiple" });
        }
        let pairs = events.iter().map(|node| (node.api_name(), node.name.clone())).collect();
        self.bus_client.listen_for_events(pairs, listener, options).await
    }

    pub async fn run_forever(self: Arc<Self>, consume_rpcs: bool) -> Result<()> {
        Arc::clone(&self.bus_client).run_forever(consume_rpcs).await
    }

    /// Only callable on the bus root — mirrors `BusNode.schema` raising
    /// `AttributeError` off-root.
    pub fn schema(&self) -> Result<&SchemaStore> {
        if self.is_root() {
            Ok(self.bus_client.schema())
        } else {
            Err(Error::OnlyAvailableOnRootNode { operation: "schema" })
        }
    }

    pub fn validate_parameters(&self, parameters: &serde_json::Value) -> Result<()> {
        self.bus_client.schema().validate_parameters(&self.api_name(), &self.name, parameters)
    }

    pub fn validate_response(&self, response: &serde_json::Value) -> Result<()> {
        self.bus_client.schema().validate_response(&self.api_name(), &self.name, response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiRegistry;
    use crate::config::Config;
    use crate::schema::SchemaStore;
    use crate::transport::memory::MemoryBroker;
    use crate::transport::TransportRegistry;

    fn make_client() -> Arc<BusClient> {
        let broker = MemoryBroker::new();
        let transports = Arc::new(TransportRegistry::new());
        transports.set_rpc_transport("default", broker.rpc_transport());
        transports.set_result_transport("default", broker.result_transport());
        transports.set_event_transport("default", broker.event_transport());
        transports.set_schema_transport(broker.schema_transport());
        let schema = Arc::new(SchemaStore::new(broker.schema_transport(), 60, true));
        Arc::new(BusClient::new(Config::default(), Arc::new(ApiRegistry::new()), transports, schema))
    }

    #[test]
    fn api_name_joins_intermediate_segments() {
        let root = BusNode::root(make_client());
        let node = root.child("my").unwrap().child("dummy").unwrap().child("my_proc").unwrap();
        assert_eq!(node.api_name(), "my.dummy");
        assert_eq!(node.name(), "my_proc");
        assert_eq!(node.fully_qualified_name(), "my.dummy.my_proc");
    }

    #[test]
    fn empty_segment_is_rejected() {
        let root = BusNode::root(make_client());
        assert!(root.child("").is_err());
    }

    #[tokio::test]
    async fn listen_multiple_requires_root() {
        let root = BusNode::root(make_client());
        let child = root.child("my").unwrap();
        let listener: EventListener = Arc::new(|_, _, _| Box::pin(async { Ok(()) }));
        let err = child.listen_multiple(&[], listener).await.unwrap_err();
        assert!(matches!(err, Error::OnlyAvailableOnRootNode { .. }));
    }
}
