//! A line-delimited transport that multiplexes all four transport families
//! over a single byte stream — one process's stdio, or (see `demos/`) a
//! spawned child process's stdin/stdout.
//!
//! Grounded on the teacher's `IoInterface`/`StdioInterface` and its
//! newline-delimited JSON framing loop
//! (`examples/kunkunsh-kkrpc/packages/kkrpc-rs/src/main.rs`): a background
//! task reads lines, deserializes a tagged [`Frame`], and routes it to
//! whichever local structure is waiting on it, exactly as `RPCChannel`
//! dispatches `MessageType::{Request,Response,Callback}`. The actual wire
//! protocol is out of this crate's scope (spec §1); this exists so the
//! demos in `demos/` have something concrete to run against a child
//! process, and is not meant as the one true wire format.
//!
//! Event delivery over this transport is best-effort broadcast: because a
//! single stdio pipe has exactly one peer, there is no meaningful
//! competing-consumer-group semantics the way [`super::memory`] can offer
//! in-process, and acking is a local no-op.

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Write as _};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot, Mutex};

use crate::error::{Error, Result};
use crate::message::{EventMessage, ResultMessage, RpcMessage};
use crate::schema::ApiSchema;

use super::{CallOptions, EventConsumer, EventTransport, ResultTransport, RpcTransport, SchemaTransport};

/// The read/write half of whatever byte stream carries frames. Mirrors the
/// teacher's `IoInterface` so a child-process demo can plug in its own
/// `ChildStdin`/`ChildStdout` pair the same way it plugs into `RPCChannel`.
#[async_trait]
pub trait IoInterface: Send + Sync {
    fn name(&self) -> &str;
    async fn read_line(&self) -> Option<String>;
    async fn write_line(&self, line: String) -> io::Result<()>;
}

pub struct StdioInterface {
    reader: std::sync::Mutex<BufReader<io::Stdin>>,
}

impl StdioInterface {
    pub fn new() -> Self {
        StdioInterface { reader: std::sync::Mutex::new(BufReader::new(io::stdin())) }
    }
}

impl Default for StdioInterface {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IoInterface for StdioInterface {
    fn name(&self) -> &str {
        "stdio"
    }

    async fn read_line(&self) -> Option<String> {
        let reader = &self.reader;
        tokio::task::block_in_place(|| {
            let mut buf = String::new();
            let mut reader = reader.lock().unwrap();
            match reader.read_line(&mut buf) {
                Ok(0) => None,
                Ok(_) => Some(buf),
                Err(_) => None,
            }
        })
    }

    async fn write_line(&self, mut line: String) -> io::Result<()> {
        if !line.ends_with('\n') {
            line.push('\n');
        }
        let mut stdout = io::stdout();
        stdout.write_all(line.as_bytes())?;
        stdout.flush()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
enum Frame {
    Rpc(RpcMessage),
    Result { return_path: String, message: ResultMessage },
    Event(EventMessage),
    SchemaStore { api_name: String, schema: ApiSchema, ttl_seconds: u64 },
    SchemaLoadRequest,
    SchemaLoadResponse { schemas: HashMap<String, ApiSchema> },
}

struct Shared {
    io: Arc<dyn IoInterface>,
    rpc_inbox: DashMap<String, std::sync::Mutex<std::collections::VecDeque<RpcMessage>>>,
    rpc_notify: tokio::sync::Notify,
    pending_result_senders: DashMap<String, oneshot::Sender<ResultMessage>>,
    pending_result_receivers: DashMap<String, oneshot::Receiver<ResultMessage>>,
    events: broadcast::Sender<EventMessage>,
    schemas: std::sync::Mutex<HashMap<String, ApiSchema>>,
    pending_schema_loads: Mutex<Vec<oneshot::Sender<HashMap<String, ApiSchema>>>>,
}

/// Owns the background read loop and hands out the four transport handles
/// that write to / are fed by it.
pub struct StdioHub {
    shared: Arc<Shared>,
}

impl StdioHub {
    pub fn new(io: Arc<dyn IoInterface>) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(1024);
        let shared = Arc::new(Shared {
            io,
            rpc_inbox: DashMap::new(),
            rpc_notify: tokio::sync::Notify::new(),
            pending_result_senders: DashMap::new(),
            pending_result_receivers: DashMap::new(),
            events: events_tx,
            schemas: std::sync::Mutex::new(HashMap::new()),
            pending_schema_loads: Mutex::new(Vec::new()),
        });

        let reader_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            read_loop(reader_shared).await;
        });

        Arc::new(StdioHub { shared })
    }

    pub fn rpc_transport(self: &Arc<Self>) -> Arc<dyn RpcTransport> {
        Arc::new(StdioRpcTransport { shared: Arc::clone(&self.shared) })
    }

    pub fn result_transport(self: &Arc<Self>) -> Arc<dyn ResultTransport> {
        Arc::new(StdioResultTransport { shared: Arc::clone(&self.shared) })
    }

    pub fn event_transport(self: &Arc<Self>) -> Arc<dyn EventTransport> {
        Arc::new(StdioEventTransport { shared: Arc::clone(&self.shared) })
    }

    pub fn schema_transport(self: &Arc<Self>) -> Arc<dyn SchemaTransport> {
        Arc::new(StdioSchemaTransport { shared: Arc::clone(&self.shared) })
    }
}

async fn read_loop(shared: Arc<Shared>) {
    loop {
        let Some(line) = shared.io.read_line().await else {
            tracing::debug!(io = shared.io.name(), "stdio transport read loop ended");
            return;
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let frame: Frame = match serde_json::from_str(trimmed) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(error = %err, line = trimmed, "dropping unparseable stdio frame");
                continue;
            }
        };

        match frame {
            Frame::Rpc(msg) => {
                shared
                    .rpc_inbox
                    .entry(msg.api_name.clone())
                    .or_insert_with(|| std::sync::Mutex::new(std::collections::VecDeque::new()))
                    .value()
                    .lock()
                    .unwrap()
                    .push_back(msg);
                shared.rpc_notify.notify_one();
            }
            Frame::Result { return_path, message } => {
                if let Some((_, sender)) = shared.pending_result_senders.remove(&return_path) {
                    let _ = sender.send(message);
                }
            }
            Frame::Event(msg) => {
                let _ = shared.events.send(msg);
            }
            Frame::SchemaStore { api_name, schema, .. } => {
                shared.schemas.lock().unwrap().insert(api_name, schema);
            }
            Frame::SchemaLoadRequest => {
                // Only meaningful on the side holding authoritative schemas;
                // this demo-grade transport doesn't serve load requests.
            }
            Frame::SchemaLoadResponse { schemas } => {
                let mut waiters = shared.pending_schema_loads.lock().await;
                if let Some(sender) = waiters.pop() {
                    let _ = sender.send(schemas);
                } else {
                    shared.schemas.lock().unwrap().extend(schemas);
                }
            }
        }
    }
}

async fn send_frame(shared: &Shared, frame: &Frame) -> Result<()> {
    let line = serde_json::to_string(frame)?;
    shared.io.write_line(line).await.map_err(Error::Io)
}

pub struct StdioRpcTransport {
    shared: Arc<Shared>,
}

#[async_trait]
impl RpcTransport for StdioRpcTransport {
    async fn call_rpc(&self, msg: &RpcMessage, _options: &CallOptions) -> Result<()> {
        send_frame(&self.shared, &Frame::Rpc(msg.clone())).await
    }

    async fn consume_rpcs(&self, apis: &[String]) -> Result<Vec<RpcMessage>> {
        if apis.is_empty() {
            return Err(Error::NoApisToListenOn);
        }
        loop {
            for api in apis {
                if let Some(inbox) = self.shared.rpc_inbox.get(api) {
                    if let Some(msg) = inbox.lock().unwrap().pop_front() {
                        return Ok(vec![msg]);
                    }
                }
            }
            self.shared.rpc_notify.notified().await;
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub struct StdioResultTransport {
    shared: Arc<Shared>,
}

#[async_trait]
impl ResultTransport for StdioResultTransport {
    async fn get_return_path(&self, msg: &RpcMessage) -> Result<String> {
        let return_path = format!("stdio-return:{}", msg.rpc_id);
        let (tx, rx) = oneshot::channel();
        self.shared.pending_result_senders.insert(return_path.clone(), tx);
        self.shared.pending_result_receivers.insert(return_path.clone(), rx);
        Ok(return_path)
    }

    async fn send_result(&self, _rpc_msg: &RpcMessage, result_msg: &ResultMessage, return_path: &str) -> Result<()> {
        send_frame(
            &self.shared,
            &Frame::Result { return_path: return_path.to_string(), message: result_msg.clone() },
        )
        .await
    }

    async fn receive_result(&self, rpc_msg: &RpcMessage, return_path: &str, options: &CallOptions) -> Result<ResultMessage> {
        let rx = self
            .shared
            .pending_result_receivers
            .remove(return_path)
            .map(|(_, rx)| rx)
            .ok_or_else(|| Error::Transport(format!("return path {return_path} already awaited")))?;

        let result = match options.timeout {
            Some(timeout) => tokio::time::timeout(timeout, rx).await.map_err(|_| Error::Timeout {
                canonical_name: rpc_msg.canonical_name(),
                timeout_secs: timeout.as_secs_f64(),
            })?,
            None => rx.await,
        };
        result.map_err(|_| Error::Transport("stdio result sender dropped".to_string()))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub struct StdioEventTransport {
    shared: Arc<Shared>,
}

#[async_trait]
impl EventTransport for StdioEventTransport {
    async fn send_event(&self, msg: &EventMessage, _options: &CallOptions) -> Result<()> {
        send_frame(&self.shared, &Frame::Event(msg.clone())).await
    }

    async fn consume(&self, listen_for: &[(String, String)], _options: &CallOptions) -> Result<Box<dyn EventConsumer>> {
        Ok(Box::new(StdioEventConsumer {
            receiver: self.shared.events.subscribe(),
            listen_for: listen_for.to_vec(),
        }))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct StdioEventConsumer {
    receiver: broadcast::Receiver<EventMessage>,
    listen_for: Vec<(String, String)>,
}

#[async_trait]
impl EventConsumer for StdioEventConsumer {
    async fn next(&mut self) -> Option<Result<EventMessage>> {
        loop {
            match self.receiver.recv().await {
                Ok(msg) => {
                    if self.listen_for.iter().any(|(api, event)| *api == msg.api_name && *event == msg.event_name) {
                        return Some(Ok(msg));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "stdio event consumer fell behind and dropped events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    async fn ack(&mut self) -> Result<()> {
        // No redelivery mechanism over a one-shot pipe: delivery here is
        // best-effort, not the at-least-once guarantee the in-memory
        // transport provides.
        Ok(())
    }
}

pub struct StdioSchemaTransport {
    shared: Arc<Shared>,
}

#[async_trait]
impl SchemaTransport for StdioSchemaTransport {
    async fn store(&self, api_name: &str, schema: &ApiSchema, ttl_seconds: u64) -> Result<()> {
        self.shared.schemas.lock().unwrap().insert(api_name.to_string(), schema.clone());
        send_frame(
            &self.shared,
            &Frame::SchemaStore { api_name: api_name.to_string(), schema: schema.clone(), ttl_seconds },
        )
        .await
    }

    async fn ping(&self, api_name: &str, schema: &ApiSchema, ttl_seconds: u64) -> Result<()> {
        self.store(api_name, schema, ttl_seconds).await
    }

    async fn load(&self) -> Result<HashMap<String, ApiSchema>> {
        let (tx, rx) = oneshot::channel();
        self.shared.pending_schema_loads.lock().await.push(tx);
        send_frame(&self.shared, &Frame::SchemaLoadRequest).await?;
        match tokio::time::timeout(std::time::Duration::from_secs(5), rx).await {
            Ok(Ok(schemas)) => Ok(schemas),
            _ => Ok(self.shared.schemas.lock().unwrap().clone()),
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc;

    /// An in-process loopback IoInterface: whatever is written is, after a
    /// yield, fed right back in as input. Lets the read loop and the
    /// frame-sending methods be exercised without a real process.
    struct LoopbackIo {
        outbox: mpsc::UnboundedSender<String>,
        inbox: StdMutex<mpsc::UnboundedReceiver<String>>,
    }

    impl LoopbackIo {
        fn pair() -> (Arc<LoopbackIo>, Arc<LoopbackIo>) {
            let (a_tx, a_rx) = mpsc::unbounded_channel();
            let (b_tx, b_rx) = mpsc::unbounded_channel();
            let a = Arc::new(LoopbackIo { outbox: a_tx, inbox: StdMutex::new(b_rx) });
            let b = Arc::new(LoopbackIo { outbox: b_tx, inbox: StdMutex::new(a_rx) });
            (a, b)
        }
    }

    #[async_trait]
    impl IoInterface for LoopbackIo {
        fn name(&self) -> &str {
            "loopback"
        }

        async fn read_line(&self) -> Option<String> {
            let mut guard = self.inbox.lock().unwrap();
            guard.recv().await
        }

        async fn write_line(&self, line: String) -> io::Result<()> {
            let _ = self.outbox.send(line);
            Ok(())
        }
    }

    #[tokio::test]
    async fn rpc_round_trips_over_the_wire() {
        let (io_a, io_b) = LoopbackIo::pair();
        let hub_a = StdioHub::new(io_a);
        let hub_b = StdioHub::new(io_b);

        let client_rpc = hub_a.rpc_transport();
        let client_result = hub_a.result_transport();
        let server_rpc = hub_b.rpc_transport();
        let server_result = hub_b.result_transport();

        let mut msg = RpcMessage::new("my.dummy", "my_proc", crate::message::Kwargs::new());
        let return_path = client_result.get_return_path(&msg).await.unwrap();
        msg.return_path = Some(return_path.clone());

        client_rpc.call_rpc(&msg, &CallOptions::default()).await.unwrap();
        let received = server_rpc.consume_rpcs(&["my.dummy".to_string()]).await.unwrap();
        assert_eq!(received[0].rpc_id, msg.rpc_id);

        let result_msg = ResultMessage::success(msg.rpc_id.clone(), serde_json::json!("ok"));
        server_result.send_result(&msg, &result_msg, &return_path).await.unwrap();

        let got = client_result.receive_result(&msg, &return_path, &CallOptions::default()).await.unwrap();
        assert_eq!(got.result, serde_json::json!("ok"));
    }
}
