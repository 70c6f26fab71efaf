//! The event engine: `fire_event` and `listen_for_events`. Grounded on
//! `BusClient.fire_event` / `BusClient.listen_for_events` in
//! `lightbus/bus.py` (`examples/original_source`).

use std::collections::HashSet;
use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::info;

use crate::client::BusClient;
use crate::error::{Error, Result};
use crate::message::{EventMessage, Kwargs};
use crate::plugin::{Hook, HookContext};
use crate::transport::{CallOptions, EventTransport};

/// A listener callback: receives the firing API and event name plus the
/// event's kwargs. Boxed and `Send + Sync` so it can be stored and invoked
/// from a spawned task, mirroring how `listen_for_events` accepts an
/// arbitrary Python callable.
pub type EventListener = Arc<dyn Fn(String, String, Kwargs) -> crate::api::BoxFuture<'static, Result<()>> + Send + Sync>;

fn random_consumer_group() -> String {
    rand::thread_rng().sample_iter(&Alphanumeric).take(4).map(char::from).collect()
}

/// Releases this listener's `(api_name, event_name)` refcounts on drop —
/// normal loop exit, an early `?` return, or the owning task being aborted
/// — per spec §5's "scoped acquisition" requirement.
struct ListenerRefcountGuard<'a> {
    refcounts: &'a dashmap::DashMap<(String, String), usize>,
    keys: Vec<(String, String)>,
}

impl<'a> ListenerRefcountGuard<'a> {
    fn new(refcounts: &'a dashmap::DashMap<(String, String), usize>, keys: Vec<(String, String)>) -> Self {
        ListenerRefcountGuard { refcounts, keys }
    }
}

impl Drop for ListenerRefcountGuard<'_> {
    fn drop(&mut self) {
        for key in &self.keys {
            let mut hit_zero = false;
            if let Some(mut count) = self.refcounts.get_mut(key) {
                *count = count.saturating_sub(1);
                hit_zero = *count == 0;
            }
            if hit_zero {
                self.refcounts.remove(key);
            }
        }
    }
}

impl BusClient {
    /// Fire an event. The firing process must be authoritative for
    /// `api_name` (i.e. have it registered), and `kwargs` must supply
    /// exactly the event's declared parameter set — not a subset, not a
    /// superset (spec §4.4 invariant).
    pub async fn fire_event(&self, api_name: &str, event_name: &str, kwargs: Kwargs, options: CallOptions) -> Result<()> {
        let api = self.registry.get(api_name)?;
        crate::api::validate_name(api_name)?;
        crate::api::validate_name(event_name)?;

        let event_def = api.event(event_name).ok_or_else(|| Error::EventNotFound {
            api_name: api_name.to_string(),
            event_name: event_name.to_string(),
        })?;

        let got: HashSet<String> = kwargs.keys().cloned().collect();
        if got != event_def.parameters {
            let mut expected: Vec<&String> = event_def.parameters.iter().collect();
            expected.sort();
            let mut got_sorted: Vec<&String> = got.iter().collect();
            got_sorted.sort();
            return Err(Error::InvalidEventArguments {
                canonical_name: format!("{api_name}.{event_name}"),
                expected: expected.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", "),
                got: got_sorted.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", "),
            });
        }

        let event_message = EventMessage::new(api.name(), event_name, kwargs);

        let api_config = self.config.api(api_name);
        self.validate_parameters_if_configured(
            api_config.validate.outgoing,
            api_config.strict_validation,
            api_name,
            event_name,
            &serde_json::to_value(&event_message.kwargs)?,
        )?;

        let event_transport = self.transports.get_event_transport(api_name)?;
        self.fire_hook(Hook::BeforeEventSent, &HookContext::for_event(event_message.clone())).await?;
        info!(api = api_name, event = event_name, "sending event");
        crate::internal_apis::record_event_fire();
        event_transport.send_event(&event_message, &options).await?;
        self.fire_hook(Hook::AfterEventSent, &HookContext::for_event(event_message)).await?;
        Ok(())
    }

    pub async fn listen_for_event(
        self: &Arc<Self>,
        api_name: &str,
        event_name: &str,
        listener: EventListener,
        options: CallOptions,
    ) -> Result<()> {
        self.listen_for_events(vec![(api_name.to_string(), event_name.to_string())], listener, options).await
    }

    /// Spawn one listener task per distinct event transport serving `events`
    /// (spec §4.1's grouping algorithm, reused from the RPC side), each
    /// running the two-phase consume-then-ack loop. Tracked via
    /// `listener_tasks` so `close_async` can cancel them.
    pub async fn listen_for_events(
        self: &Arc<Self>,
        events: Vec<(String, String)>,
        listener: EventListener,
        mut options: CallOptions,
    ) -> Result<()> {
        if events.is_empty() {
            return Err(Error::InvalidEventListener { reason: "no events supplied" });
        }
        for (api_name, event_name) in &events {
            crate::api::validate_name(api_name)?;
            crate::api::validate_name(event_name)?;
        }

        if options.consumer_group.is_none() {
            options.consumer_group = Some(random_consumer_group());
        }

        for (api_name, event_name) in &events {
            self.listener_refcounts
                .entry((api_name.clone(), event_name.clone()))
                .and_modify(|count| *count += 1)
                .or_insert(1);
        }

        let api_names: Vec<String> = events.iter().map(|(api, _)| api.clone()).collect();
        let groups = self.transports.get_event_transports(&api_names)?;

        for (event_transport, group_api_names) in groups {
            let group_events: Vec<(String, String)> =
                events.iter().filter(|(api, _)| group_api_names.contains(api)).cloned().collect();
            let this = Arc::clone(self);
            let listener = Arc::clone(&listener);
            let options = options.clone();
            let handle = tokio::spawn(async move {
                if let Err(err) = this.run_event_listener(event_transport, group_events, listener, options).await {
                    tracing::error!(error = %err, "event listener task ended with an error");
                }
            });
            self.listener_tasks.track(handle);
        }

        Ok(())
    }

    async fn run_event_listener(
        &self,
        event_transport: Arc<dyn EventTransport>,
        events: Vec<(String, String)>,
        listener: EventListener,
        options: CallOptions,
    ) -> Result<()> {
        let _refcount_guard = ListenerRefcountGuard::new(&self.listener_refcounts, events.clone());

        let mut consumer = event_transport.consume(&events, &options).await?;

        while let Some(event_result) = consumer.next().await {
            let event_message = event_result?;
            info!(api = event_message.api_name, event = event_message.event_name, "received event");

            let api_config = self.config.api(&event_message.api_name);
            self.validate_parameters_if_configured(
                api_config.validate.incoming,
                api_config.strict_validation,
                &event_message.api_name,
                &event_message.event_name,
                &serde_json::to_value(&event_message.kwargs)?,
            )?;

            self.fire_hook(Hook::BeforeEventExecution, &HookContext::for_event(event_message.clone())).await?;

            listener(event_message.api_name.clone(), event_message.event_name.clone(), event_message.kwargs.clone())
                .await?;

            consumer.ack().await?;
            self.fire_hook(Hook::AfterEventExecution, &HookContext::for_event(event_message)).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Api, ApiRegistry};
    use crate::config::Config;
    use crate::schema::SchemaStore;
    use crate::transport::memory::MemoryBroker;
    use crate::transport::TransportRegistry;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn make_client(broker: &Arc<MemoryBroker>) -> Arc<BusClient> {
        let transports = Arc::new(TransportRegistry::new());
        transports.set_rpc_transport("default", broker.rpc_transport());
        transports.set_result_transport("default", broker.result_transport());
        transports.set_event_transport("default", broker.event_transport());
        transports.set_schema_transport(broker.schema_transport());
        let schema = Arc::new(SchemaStore::new(broker.schema_transport(), 60, true));
        Arc::new(BusClient::new(Config::default(), Arc::new(ApiRegistry::new()), transports, schema))
    }

    #[tokio::test]
    async fn fire_then_listen_delivers_exact_kwargs() {
        let broker = MemoryBroker::new();
        let client = make_client(&broker);

        let api = Api::builder("my.dummy").event("my_event", &["field"], json!({"type": "object"})).build().unwrap();
        client.registry.add(api);

        let received = Arc::new(AtomicUsize::new(0));
        let received_clone = Arc::clone(&received);
        let listener: EventListener = Arc::new(move |api_name, event_name, kwargs| {
            let received = Arc::clone(&received_clone);
            Box::pin(async move {
                assert_eq!(api_name, "my.dummy");
                assert_eq!(event_name, "my_event");
                assert_eq!(kwargs.get("field").and_then(|v| v.as_str()), Some("hi"));
                received.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });

        client
            .listen_for_event("my.dummy", "my_event", listener, CallOptions::default())
            .await
            .unwrap();

        // give the listener task a moment to subscribe before firing
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut kwargs = Kwargs::new();
        kwargs.insert("field".into(), json!("hi"));
        client.fire_event("my.dummy", "my_event", kwargs, CallOptions::default()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(received.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn firing_with_wrong_kwargs_is_rejected_before_any_transport_traffic() {
        let broker = MemoryBroker::new();
        let client = make_client(&broker);
        let api = Api::builder("my.dummy").event("my_event", &["field"], json!({})).build().unwrap();
        client.registry.add(api);

        let err = client.fire_event("my.dummy", "my_event", Kwargs::new(), CallOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidEventArguments { .. }));
    }

    #[tokio::test]
    async fn listener_refcount_is_released_when_the_listener_task_is_cancelled() {
        let broker = MemoryBroker::new();
        let client = make_client(&broker);
        let api = Api::builder("my.dummy").event("my_event", &["field"], json!({"type": "object"})).build().unwrap();
        client.registry.add(api);

        assert_eq!(client.listener_refcount("my.dummy", "my_event"), 0);

        let listener: EventListener = Arc::new(|_, _, _| Box::pin(async { Ok(()) }));
        client
            .listen_for_event("my.dummy", "my_event", listener, CallOptions::default())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(client.listener_refcount("my.dummy", "my_event"), 1);

        client.close_async().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(client.listener_refcount("my.dummy", "my_event"), 0);
    }
}
