//! Calls an RPC and fires/listens for an event entirely in-process, using
//! the bundled [`meshbus::transport::memory`] reference transport. No
//! external broker required — run with `cargo run --example memory_rpc`.

use std::sync::Arc;

use meshbus::transport::memory::MemoryBroker;
use meshbus::transport::TransportRegistry;
use meshbus::{Api, ApiRegistry, BusClient, BusNode, CallOptions, Config, Kwargs, SchemaStore};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let broker = MemoryBroker::new();
    let transports = Arc::new(TransportRegistry::new());
    transports.set_rpc_transport("default", broker.rpc_transport());
    transports.set_result_transport("default", broker.result_transport());
    transports.set_event_transport("default", broker.event_transport());
    transports.set_schema_transport(broker.schema_transport());

    let registry = Arc::new(ApiRegistry::new());
    registry.add(
        Api::builder("my.dummy")
            .procedure(
                "my_proc",
                json!({"type": "object", "properties": {"field": {"type": "string"}}, "required": ["field"]}),
                json!({"type": "string"}),
                |kwargs: Kwargs| async move {
                    let field = kwargs.get("field").and_then(|v| v.as_str()).unwrap_or_default();
                    Ok(json!(format!("value: {field}")))
                },
            )
            .event("my_event", &["message"], json!({"type": "object"}))
            .build()?,
    );

    let schema = Arc::new(SchemaStore::new(broker.schema_transport(), 60, true));
    let client = Arc::new(BusClient::new(Config::default(), Arc::clone(&registry), Arc::clone(&transports), schema));
    client.setup(vec![]).await?;

    let root = BusNode::root(Arc::clone(&client));
    let dummy = root.child("my")?.child("dummy")?;

    let server = Arc::clone(&client);
    let server_apis = registry.all();
    let consume_handle = tokio::spawn(async move {
        if let Err(err) = server.consume_rpcs(Some(server_apis)).await {
            eprintln!("rpc consumer loop ended: {err}");
        }
    });

    let mut kwargs = Kwargs::new();
    kwargs.insert("field".into(), json!("world"));
    let result = dummy.child("my_proc")?.call_with_options(kwargs, CallOptions::default()).await?;
    println!("my_proc returned: {result}");

    consume_handle.abort();
    client.close_async().await?;
    Ok(())
}
