//! The RPC engine: `call_rpc_remote`, `call_rpc_local`, and `consume_rpcs`.
//! Grounded line-for-line on `BusClient.call_rpc_remote` /
//! `BusClient.call_rpc_local` / `BusClient.consume_rpcs` /
//! `BusClient._consume_rpcs_with_transport` in `lightbus/bus.py`
//! (`examples/original_source`).

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::api::Api;
use crate::client::BusClient;
use crate::error::{Error, Result};
use crate::message::{Kwargs, ResultMessage, RpcMessage};
use crate::plugin::{Hook, HookContext};
use crate::transport::CallOptions;

impl BusClient {
    /// Call a remote procedure and wait for its result.
    ///
    /// Reserves a reply slot *before* dispatching the call (closing the
    /// race the reference implementation flags as a TODO — spec §9, open
    /// question (b)) then runs send and receive concurrently, matching
    /// `asyncio.gather(receive_result(...), rpc_transport.call_rpc(...))`.
    pub async fn call_rpc_remote(
        &self,
        api_name: &str,
        procedure_name: &str,
        kwargs: Kwargs,
        options: CallOptions,
    ) -> Result<serde_json::Value> {
        crate::api::validate_name(api_name)?;
        crate::api::validate_name(procedure_name)?;

        let rpc_transport = self.transports.get_rpc_transport(api_name)?;
        let result_transport = self.transports.get_result_transport(api_name)?;

        let mut rpc_message = RpcMessage::new(api_name, procedure_name, kwargs);
        let return_path = result_transport.get_return_path(&rpc_message).await?;
        rpc_message.return_path = Some(return_path.clone());

        let api_config = self.config.api(api_name);
        let timeout = options.timeout.unwrap_or_else(|| Duration::from_secs_f64(api_config.rpc_timeout));
        let mut options = options;
        options.timeout = Some(timeout);

        self.validate_parameters_if_configured(
            api_config.validate.outgoing,
            api_config.strict_validation,
            api_name,
            procedure_name,
            &serde_json::to_value(&rpc_message.kwargs)?,
        )?;

        info!(api = api_name, procedure = procedure_name, "calling remote rpc");
        let start = Instant::now();
        crate::internal_apis::record_rpc_call();

        self.fire_hook(Hook::BeforeRpcCall, &HookContext::for_rpc(rpc_message.clone())).await?;

        let call_result = tokio::time::timeout(timeout, async {
            let (result, _) = tokio::try_join!(
                result_transport.receive_result(&rpc_message, &return_path, &options),
                rpc_transport.call_rpc(&rpc_message, &options),
            )?;
            Ok::<ResultMessage, Error>(result)
        })
        .await;

        let result_message = match call_result {
            Ok(inner) => inner?,
            Err(_) => {
                return Err(Error::Timeout {
                    canonical_name: rpc_message.canonical_name(),
                    timeout_secs: timeout.as_secs_f64(),
                })
            }
        };

        self.fire_hook(
            Hook::AfterRpcCall,
            &HookContext::for_rpc_result(rpc_message.clone(), result_message.clone()),
        )
        .await?;

        if result_message.error {
            warn!(
                api = api_name,
                procedure = procedure_name,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "server error during remote call"
            );
            return Err(Error::server_error_from_result(rpc_message.canonical_name(), &result_message));
        }

        info!(
            api = api_name,
            procedure = procedure_name,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "remote call completed"
        );

        self.validate_response_if_configured(
            api_config.validate.incoming,
            api_config.strict_validation,
            api_name,
            procedure_name,
            &result_message.result,
        )?;

        Ok(result_message.result)
    }

    /// Invoke a procedure this process is authoritative for. Errors other
    /// than [`Error::SuddenDeath`]/[`Error::Cancelled`] are caught and
    /// turned into a value the caller converts into an error
    /// [`ResultMessage`]; those two propagate unconverted, matching the
    /// reference implementation re-raising `CancelledError` and
    /// `SuddenDeathException`.
    pub async fn call_rpc_local(&self, api_name: &str, procedure_name: &str, kwargs: Kwargs) -> Result<serde_json::Value> {
        let api = self.registry.get(api_name)?;
        crate::api::validate_name(procedure_name)?;

        let start = Instant::now();
        match api.call(procedure_name, kwargs).await {
            Err(err) if err.is_propagate_only() => Err(err),
            Err(err) => {
                warn!(
                    api = api_name,
                    procedure = procedure_name,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    error = %err,
                    "error while executing procedure"
                );
                Err(err)
            }
            Ok(value) => {
                info!(
                    api = api_name,
                    procedure = procedure_name,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "executed procedure"
                );
                Ok(value)
            }
        }
    }

    /// Consume RPCs for `apis` (or every registered API) forever, grouping
    /// by transport so each distinct transport gets exactly one consumer
    /// loop (spec §4.1's grouping algorithm).
    pub async fn consume_rpcs(&self, apis: Option<Vec<Arc<Api>>>) -> Result<()> {
        let apis = apis.unwrap_or_else(|| self.registry.all());
        if apis.is_empty() {
            return Err(Error::NoApisToListenOn);
        }

        let api_names: Vec<String> = apis.iter().map(|a| a.name().to_string()).collect();
        let groups = self.transports.get_rpc_transports(&api_names)?;

        let mut handles = Vec::new();
        for (rpc_transport, group_names) in groups {
            let group_apis: Vec<Arc<Api>> = group_names
                .iter()
                .filter_map(|name| apis.iter().find(|a| a.name() == name).cloned())
                .collect();
            handles.push(self.consume_rpcs_with_transport(rpc_transport, group_apis));
        }

        futures::future::try_join_all(handles).await?;
        Ok(())
    }

    async fn consume_rpcs_with_transport(
        &self,
        rpc_transport: Arc<dyn crate::transport::RpcTransport>,
        apis: Vec<Arc<Api>>,
    ) -> Result<()> {
        let api_names: Vec<String> = apis.iter().map(|a| a.name().to_string()).collect();
        loop {
            let messages = rpc_transport.consume_rpcs(&api_names).await?;
            for rpc_message in messages {
                self.handle_one_rpc(&rpc_message).await?;
            }
        }
    }

    async fn handle_one_rpc(&self, rpc_message: &RpcMessage) -> Result<()> {
        let api_config = self.config.api(&rpc_message.api_name);
        self.validate_parameters_if_configured(
            api_config.validate.incoming,
            api_config.strict_validation,
            &rpc_message.api_name,
            &rpc_message.procedure_name,
            &serde_json::to_value(&rpc_message.kwargs)?,
        )?;

        self.fire_hook(Hook::BeforeRpcExecution, &HookContext::for_rpc(rpc_message.clone())).await?;

        let outcome = self
            .call_rpc_local(&rpc_message.api_name, &rpc_message.procedure_name, rpc_message.kwargs.clone())
            .await;

        let result_message = match outcome {
            Err(err) if err.is_propagate_only() => {
                // Simulated fault injection / task cancellation: drop the
                // call without emitting a result, matching the reference
                // implementation's bare `except SuddenDeathException: pass`.
                return Ok(());
            }
            Err(err) => ResultMessage::from_error(rpc_message.rpc_id.clone(), &err),
            Ok(value) => ResultMessage::success(rpc_message.rpc_id.clone(), value),
        };

        self.fire_hook(
            Hook::AfterRpcExecution,
            &HookContext::for_rpc_result(rpc_message.clone(), result_message.clone()),
        )
        .await?;

        if !result_message.error {
            self.validate_response_if_configured(
                api_config.validate.outgoing,
                api_config.strict_validation,
                &rpc_message.api_name,
                &rpc_message.procedure_name,
                &result_message.result,
            )?;
        }

        let return_path = rpc_message
            .return_path
            .as_deref()
            .ok_or_else(|| Error::Transport("rpc message has no return path".to_string()))?;
        let result_transport = self.transports.get_result_transport(&rpc_message.api_name)?;
        result_transport.send_result(rpc_message, &result_message, return_path).await
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
    use serde_json::json;

    fn make_client(broker: &Arc<MemoryBroker>) -> BusClient {
        let transports = Arc::new(TransportRegistry::new());
        transports.set_rpc_transport("default", broker.rpc_transport());
        transports.set_result_transport("default", broker.result_transport());
        transports.set_event_transport("default", broker.event_transport());
        transports.set_schema_transport(broker.schema_transport());

        let schema = Arc::new(SchemaStore::new(broker.schema_transport(), 60, true));
        BusClient::new(Config::default(), Arc::new(ApiRegistry::new()), transports, schema)
    }

    #[tokio::test]
    async fn my_proc_round_trips_with_unicode_kwargs() {
        let broker = MemoryBroker::new();
        let client = make_client(&broker);

        let api = Api::builder("my.dummy")
            .procedure("my_proc", json!({}), json!({}), |kwargs: Kwargs| async move {
                let field = kwargs.get("field").and_then(|v| v.as_str()).unwrap_or_default();
                Ok(json!(format!("value: {field}")))
            })
            .build()
            .unwrap();
        client.registry.add(api);

        let client = Arc::new(client);
        let server = Arc::clone(&client);
        let consume_handle = tokio::spawn(async move {
            let apis = server.registry.all();
            let _ = server.consume_rpcs(Some(apis)).await;
        });

        let mut kwargs = Kwargs::new();
        kwargs.insert("field".into(), json!("Hello! \u{1F60E}"));
        let result = client
            .call_rpc_remote("my.dummy", "my_proc", kwargs, CallOptions::default())
            .await
            .unwrap();

        assert_eq!(result, json!("value: Hello! \u{1F60E}"));
        consume_handle.abort();
    }

    #[tokio::test]
    async fn general_error_surfaces_as_server_error() {
        let broker = MemoryBroker::new();
        let client = make_client(&broker);
        let api = Api::builder("my.dummy")
            .procedure("boom", json!({}), json!({}), |_: Kwargs| async move {
                Err(Error::Transport("kaboom".into()))
            })
            .build()
            .unwrap();
        client.registry.add(api);

        let client = Arc::new(client);
        let server = Arc::clone(&client);
        let consume_handle = tokio::spawn(async move {
            let apis = server.registry.all();
            let _ = server.consume_rpcs(Some(apis)).await;
        });

        let err = client
            .call_rpc_remote("my.dummy", "boom", Kwargs::new(), CallOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ServerError { .. }));
        consume_handle.abort();
    }

    #[tokio::test]
    async fn sudden_death_times_out_the_caller() {
        let broker = MemoryBroker::new();
        let client = make_client(&broker);
        let api = Api::builder("my.dummy")
            .procedure("vanish", json!({}), json!({}), |_: Kwargs| async move { Err(Error::SuddenDeath) })
            .build()
            .unwrap();
        client.registry.add(api);

        let client = Arc::new(client);
        let server = Arc::clone(&client);
        let consume_handle = tokio::spawn(async move {
            let apis = server.registry.all();
            let _ = server.consume_rpcs(Some(apis)).await;
        });

        let mut options = CallOptions::default();
        options.timeout = Some(Duration::from_millis(100));
        let err = client
            .call_rpc_remote("my.dummy", "vanish", Kwargs::new(), options)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        consume_handle.abort();
    }

    #[tokio::test]
    async fn strict_validation_rejects_bad_parameters_before_any_transport_traffic() {
        let broker = MemoryBroker::new();
        let transports = Arc::new(TransportRegistry::new());
        transports.set_rpc_transport("default", broker.rpc_transport());
        transports.set_result_transport("default", broker.result_transport());
        transports.set_event_transport("default", broker.event_transport());
        transports.set_schema_transport(broker.schema_transport());

        let schema = Arc::new(SchemaStore::new(broker.schema_transport(), 60, true));
        let api = Api::builder("my.dummy")
            .procedure(
                "my_proc",
                json!({"type": "object", "properties": {"field": {"type": "string"}}, "required": ["field"]}),
                json!({}),
                |_: Kwargs| async move { Ok(json!(null)) },
            )
            .build()
            .unwrap();
        schema.add_api(&api).await.unwrap();

        let mut config = Config::default();
        config.apis.insert(
            "my.dummy".to_string(),
            crate::config::ApiConfig {
                validate: crate::config::ValidateConfig { outgoing: true, incoming: false },
                strict_validation: true,
                ..Default::default()
            },
        );

        let client = BusClient::new(config, Arc::new(ApiRegistry::new()), Arc::clone(&transports), schema);

        let mut kwargs = Kwargs::new();
        kwargs.insert("field".into(), json!(123));
        let err = client
            .call_rpc_remote("my.dummy", "my_proc", kwargs, CallOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));

        let rpc_transport = broker.rpc_transport();
        let arrived =
            tokio::time::timeout(Duration::from_millis(50), rpc_transport.consume_rpcs(&["my.dummy".to_string()])).await;
        assert!(arrived.is_err(), "no rpc message should have reached the transport");
    }
}
