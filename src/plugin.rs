//! Plugin hook bus: an ordered fan-out of lifecycle notifications to every
//! registered plugin. Grounded on `lightbus.plugins.plugin_hook` (referenced
//! throughout `lightbus/bus.py` but not itself included in
//! `examples/original_source`) — each call site in `bus.py` names the hook
//! and the keyword context it passes, which is what [`Hook`] and
//! [`HookContext`] reproduce.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::message::{EventMessage, ResultMessage, RpcMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    BeforeServerStart,
    AfterServerStopped,
    BeforeRpcCall,
    AfterRpcCall,
    BeforeRpcExecution,
    AfterRpcExecution,
    BeforeEventSent,
    AfterEventSent,
    BeforeEventExecution,
    AfterEventExecution,
}

/// The keyword context lightbus passes to each hook call site, collapsed
/// into one struct. Most hooks only populate one or two of these fields;
/// unused fields stay `None`.
#[derive(Debug, Clone, Default)]
pub struct HookContext {
    pub rpc_message: Option<RpcMessage>,
    pub result_message: Option<ResultMessage>,
    pub event_message: Option<EventMessage>,
}

impl HookContext {
    pub fn for_rpc(rpc_message: RpcMessage) -> Self {
        HookContext { rpc_message: Some(rpc_message), ..Default::default() }
    }

    pub fn for_rpc_result(rpc_message: RpcMessage, result_message: ResultMessage) -> Self {
        HookContext {
            rpc_message: Some(rpc_message),
            result_message: Some(result_message),
            ..Default::default()
        }
    }

    pub fn for_event(event_message: EventMessage) -> Self {
        HookContext { event_message: Some(event_message), ..Default::default() }
    }
}

/// A plugin observing bus lifecycle events. Every method has a no-op
/// default, matching "plugins not implementing a hook are skipped" (spec
/// §4.3); a plugin overrides only the hooks it cares about. Errors
/// propagate to the caller uncaught — they are not swallowed.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str {
        "plugin"
    }

    async fn before_server_start(&self, _ctx: &HookContext) -> Result<()> {
        Ok(())
    }
    async fn after_server_stopped(&self, _ctx: &HookContext) -> Result<()> {
        Ok(())
    }
    async fn before_rpc_call(&self, _ctx: &HookContext) -> Result<()> {
        Ok(())
    }
    async fn after_rpc_call(&self, _ctx: &HookContext) -> Result<()> {
        Ok(())
    }
    async fn before_rpc_execution(&self, _ctx: &HookContext) -> Result<()> {
        Ok(())
    }
    async fn after_rpc_execution(&self, _ctx: &HookContext) -> Result<()> {
        Ok(())
    }
    async fn before_event_sent(&self, _ctx: &HookContext) -> Result<()> {
        Ok(())
    }
    async fn after_event_sent(&self, _ctx: &HookContext) -> Result<()> {
        Ok(())
    }
    async fn before_event_execution(&self, _ctx: &HookContext) -> Result<()> {
        Ok(())
    }
    async fn after_event_execution(&self, _ctx: &HookContext) -> Result<()> {
        Ok(())
    }
}

/// Ordered registry of plugins; fires each hook across all of them in
/// registration order, awaiting each one before moving to the next.
#[derive(Default)]
pub struct PluginHookBus {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginHookBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.plugins.iter().map(|p| p.name().to_string()).collect()
    }

    pub async fn fire(&self, hook: Hook, ctx: &HookContext) -> Result<()> {
        for plugin in &self.plugins {
            match hook {
                Hook::BeforeServerStart => plugin.before_server_start(ctx).await?,
                Hook::AfterServerStopped => plugin.after_server_stopped(ctx).await?,
                Hook::BeforeRpcCall => plugin.before_rpc_call(ctx).await?,
                Hook::AfterRpcCall => plugin.after_rpc_call(ctx).await?,
                Hook::BeforeRpcExecution => plugin.before_rpc_execution(ctx).await?,
                Hook::AfterRpcExecution => plugin.after_rpc_execution(ctx).await?,
                Hook::BeforeEventSent => plugin.before_event_sent(ctx).await?,
                Hook::AfterEventSent => plugin.after_event_sent(ctx).await?,
                Hook::BeforeEventExecution => plugin.before_event_execution(ctx).await?,
                Hook::AfterEventExecution => plugin.after_event_execution(ctx).await?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;

    struct CountingPlugin {
        count: StdArc<AtomicUsize>,
    }

    #[async_trait]
    impl Plugin for CountingPlugin {
        async fn before_rpc_call(&self, _ctx: &HookContext) -> Result<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingPlugin;

    #[async_trait]
    impl Plugin for FailingPlugin {
        async fn before_rpc_call(&self, _ctx: &HookContext) -> Result<()> {
            Err(crate::error::Error::Transport("boom".into()))
        }
    }

    #[tokio::test]
    async fn fires_registered_plugins_in_order_and_skips_unimplemented_hooks() {
        let count = StdArc::new(AtomicUsize::new(0));
        let mut bus = PluginHookBus::new();
        bus.register(StdArc::new(CountingPlugin { count: count.clone() }));

        bus.fire(Hook::BeforeRpcCall, &HookContext::default()).await.unwrap();
        bus.fire(Hook::AfterRpcCall, &HookContext::default()).await.unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn plugin_errors_propagate_to_the_caller() {
        let mut bus = PluginHookBus::new();
        bus.register(StdArc::new(FailingPlugin));
        assert!(bus.fire(Hook::BeforeRpcCall, &HookContext::default()).await.is_err());
    }
}
