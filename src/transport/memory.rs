//! An in-process reference transport implementing all four transport
//! families. Used by this crate's own test suite and doctests in lieu of a
//! real broker — the concrete wire protocol is explicitly out of scope
//! (spec §1), but the engines need *something* to drive end-to-end.
//!
//! Grounded on the teacher's single-process `RPCChannel`
//! (`examples/kunkunsh-kkrpc/packages/kkrpc-rs/src/main.rs`): a shared hub
//! correlates requests and replies with a map keyed by an opaque id,
//! exactly as `RPCChannel::pending_requests` does, generalized here to also
//! carry events with at-least-once, two-phase-acked delivery.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{oneshot, Notify};

use crate::error::{Error, Result};
use crate::message::{EventMessage, ResultMessage, RpcMessage};
use crate::schema::ApiSchema;

use super::{CallOptions, EventConsumer, EventTransport, ResultTransport, RpcTransport, SchemaTransport};

struct ApiQueue {
    queue: Mutex<VecDeque<RpcMessage>>,
    notify: Notify,
}

impl Default for ApiQueue {
    fn default() -> Self {
        ApiQueue {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }
}

struct PendingResult {
    sender: Option<oneshot::Sender<ResultMessage>>,
    receiver: Option<oneshot::Receiver<ResultMessage>>,
}

struct GroupQueue {
    queue: Mutex<VecDeque<(u64, EventMessage)>>,
    notify: Notify,
}

impl Default for GroupQueue {
    fn default() -> Self {
        GroupQueue {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }
}

#[derive(Default)]
struct SchemaEntry {
    schema: ApiSchema,
    expires_at: Option<Instant>,
}

/// The shared in-process hub. Clone-free: transports obtained from one
/// broker share the same underlying queues, so firing an event from one
/// handle is visible to a listener built from another handle to the same
/// broker.
pub struct MemoryBroker {
    rpc_queues: DashMap<String, Arc<ApiQueue>>,
    pending: DashMap<String, Mutex<PendingResult>>,
    event_groups: DashMap<(String, String, String), Arc<GroupQueue>>,
    event_seq: AtomicU64,
    schemas: Mutex<HashMap<String, SchemaEntry>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        MemoryBroker {
            rpc_queues: DashMap::new(),
            pending: DashMap::new(),
            event_groups: DashMap::new(),
            event_seq: AtomicU64::new(0),
            schemas: Mutex::new(HashMap::new()),
        }
    }
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn queue_for(&self, api_name: &str) -> Arc<ApiQueue> {
        Arc::clone(
            self.rpc_queues
                .entry(api_name.to_string())
                .or_insert_with(|| Arc::new(ApiQueue::default()))
                .value(),
        )
    }

    fn group_for(&self, api_name: &str, event_name: &str, group: &str) -> Arc<GroupQueue> {
        let key = (api_name.to_string(), event_name.to_string(), group.to_string());
        Arc::clone(self.event_groups.entry(key).or_insert_with(|| Arc::new(GroupQueue::default())).value())
    }

    /// All consumer groups currently registered for `(api_name, event_name)`.
    fn groups_for_topic(&self, api_name: &str, event_name: &str) -> Vec<Arc<GroupQueue>> {
        self.event_groups
            .iter()
            .filter(|entry| entry.key().0 == api_name && entry.key().1 == event_name)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn rpc_transport(self: &Arc<Self>) -> Arc<dyn RpcTransport> {
        Arc::new(MemoryRpcTransport { broker: Arc::clone(self) })
    }

    pub fn result_transport(self: &Arc<Self>) -> Arc<dyn ResultTransport> {
        Arc::new(MemoryResultTransport { broker: Arc::clone(self) })
    }

    pub fn event_transport(self: &Arc<Self>) -> Arc<dyn EventTransport> {
        Arc::new(MemoryEventTransport { broker: Arc::clone(self) })
    }

    pub fn schema_transport(self: &Arc<Self>) -> Arc<dyn SchemaTransport> {
        Arc::new(MemorySchemaTransport { broker: Arc::clone(self) })
    }
}

pub struct MemoryRpcTransport {
    broker: Arc<MemoryBroker>,
}

#[async_trait]
impl RpcTransport for MemoryRpcTransport {
    async fn call_rpc(&self, msg: &RpcMessage, _options: &CallOptions) -> Result<()> {
        let queue = self.broker.queue_for(&msg.api_name);
        queue.queue.lock().unwrap().push_back(msg.clone());
        queue.notify.notify_one();
        Ok(())
    }

    async fn consume_rpcs(&self, apis: &[String]) -> Result<Vec<RpcMessage>> {
        if apis.is_empty() {
            return Err(Error::NoApisToListenOn);
        }
        let queues: Vec<Arc<ApiQueue>> = apis.iter().map(|a| self.broker.queue_for(a)).collect();
        loop {
            for queue in &queues {
                let mut locked = queue.queue.lock().unwrap();
                if let Some(msg) = locked.pop_front() {
                    return Ok(vec![msg]);
                }
            }
            let notified: Vec<_> = queues.iter().map(|q| Box::pin(q.notify.notified())).collect();
            futures::future::select_all(notified).await;
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub struct MemoryResultTransport {
    broker: Arc<MemoryBroker>,
}

#[async_trait]
impl ResultTransport for MemoryResultTransport {
    async fn get_return_path(&self, msg: &RpcMessage) -> Result<String> {
        let return_path = format!("return:{}", msg.rpc_id);
        let (tx, rx) = oneshot::channel();
        self.broker.pending.insert(
            return_path.clone(),
            Mutex::new(PendingResult { sender: Some(tx), receiver: Some(rx) }),
        );
        Ok(return_path)
    }

    async fn send_result(&self, _rpc_msg: &RpcMessage, result_msg: &ResultMessage, return_path: &str) -> Result<()> {
        let entry = self
            .broker
            .pending
            .get(return_path)
            .ok_or_else(|| Error::Transport(format!("unknown return path {return_path}")))?;
        let sender = entry.lock().unwrap().sender.take();
        match sender {
            Some(sender) => {
                let _ = sender.send(result_msg.clone());
                Ok(())
            }
            None => Err(Error::Transport(format!("return path {return_path} already used"))),
        }
    }

    async fn receive_result(&self, rpc_msg: &RpcMessage, return_path: &str, options: &CallOptions) -> Result<ResultMessage> {
        let receiver = {
            let entry = self
                .broker
                .pending
                .get(return_path)
                .ok_or_else(|| Error::Transport(format!("unknown return path {return_path}")))?;
            entry
                .lock()
                .unwrap()
                .receiver
                .take()
                .ok_or_else(|| Error::Transport(format!("return path {return_path} already awaited")))?
        };

        let result = match options.timeout {
            Some(timeout) => tokio::time::timeout(timeout, receiver)
                .await
                .map_err(|_| Error::Timeout {
                    canonical_name: rpc_msg.canonical_name(),
                    timeout_secs: timeout.as_secs_f64(),
                })?,
            None => receiver.await,
        };

        self.broker.pending.remove(return_path);
        result.map_err(|_| Error::Transport("result sender dropped".to_string()))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub struct MemoryEventTransport {
    broker: Arc<MemoryBroker>,
}

#[async_trait]
impl EventTransport for MemoryEventTransport {
    async fn send_event(&self, msg: &EventMessage, _options: &CallOptions) -> Result<()> {
        for group in self.broker.groups_for_topic(&msg.api_name, &msg.event_name) {
            let seq = self.broker.event_seq.fetch_add(1, Ordering::SeqCst);
            group.queue.lock().unwrap().push_back((seq, msg.clone()));
            group.notify.notify_one();
        }
        Ok(())
    }

    async fn consume(&self, listen_for: &[(String, String)], options: &CallOptions) -> Result<Box<dyn EventConsumer>> {
        let group_name = options.consumer_group.clone().unwrap_or_else(|| "default".to_string());
        let groups: Vec<((String, String), Arc<GroupQueue>)> = listen_for
            .iter()
            .map(|(api, event)| ((api.clone(), event.clone()), self.broker.group_for(api, event, &group_name)))
            .collect();
        Ok(Box::new(MemoryEventConsumer { groups, pending: None }))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct MemoryEventConsumer {
    groups: Vec<((String, String), Arc<GroupQueue>)>,
    /// The group queue and message last handed out by `next()`, kept around
    /// so `Drop` can push it back to the front if it was never acked.
    pending: Option<(Arc<GroupQueue>, u64, EventMessage)>,
}

#[async_trait]
impl EventConsumer for MemoryEventConsumer {
    async fn next(&mut self) -> Option<Result<EventMessage>> {
        loop {
            for (_, group) in &self.groups {
                let mut locked = group.queue.lock().unwrap();
                if let Some((seq, msg)) = locked.front().cloned() {
                    locked.pop_front();
                    drop(locked);
                    self.pending = Some((Arc::clone(group), seq, msg.clone()));
                    return Some(Ok(msg));
                }
            }
            let notified: Vec<_> = self.groups.iter().map(|(_, g)| Box::pin(g.notify.notified())).collect();
            if notified.is_empty() {
                return None;
            }
            futures::future::select_all(notified).await;
        }
    }

    async fn ack(&mut self) -> Result<()> {
        // The in-memory queue already removed the message in `next()`; ack
        // simply clears the in-flight marker. See `Drop` for what happens
        // when a consumer disappears before calling this.
        self.pending = None;
        Ok(())
    }
}

impl Drop for MemoryEventConsumer {
    fn drop(&mut self) {
        // Simulates redelivery after a listener crash/restart: an unacked
        // message is pushed back to the front of its group's queue instead
        // of being lost, preserving at-least-once delivery.
        if let Some((group, seq, msg)) = self.pending.take() {
            let mut locked = group.queue.lock().unwrap();
            locked.push_front((seq, msg));
            drop(locked);
            group.notify.notify_one();
        }
    }
}

pub struct MemorySchemaTransport {
    broker: Arc<MemoryBroker>,
}

#[async_trait]
impl SchemaTransport for MemorySchemaTransport {
    async fn store(&self, api_name: &str, schema: &ApiSchema, ttl_seconds: u64) -> Result<()> {
        self.broker.schemas.lock().unwrap().insert(
            api_name.to_string(),
            SchemaEntry {
                schema: schema.clone(),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_seconds)),
            },
        );
        Ok(())
    }

    async fn ping(&self, api_name: &str, schema: &ApiSchema, ttl_seconds: u64) -> Result<()> {
        self.store(api_name, schema, ttl_seconds).await
    }

    async fn load(&self) -> Result<HashMap<String, ApiSchema>> {
        let now = Instant::now();
        let schemas = self.broker.schemas.lock().unwrap();
        Ok(schemas
            .iter()
            .filter(|(_, entry)| entry.expires_at.map(|exp| exp > now).unwrap_or(true))
            .map(|(name, entry)| (name.clone(), entry.schema.clone()))
            .collect())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Kwargs;
    use serde_json::json;

    #[tokio::test]
    async fn rpc_round_trips_through_the_broker() {
        let broker = MemoryBroker::new();
        let rpc = broker.rpc_transport();
        let result = broker.result_transport();

        let mut msg = RpcMessage::new("my.dummy", "my_proc", Kwargs::new());
        let return_path = result.get_return_path(&msg).await.unwrap();
        msg.return_path = Some(return_path.clone());

        rpc.call_rpc(&msg, &CallOptions::default()).await.unwrap();
        let consumed = rpc.consume_rpcs(&["my.dummy".to_string()]).await.unwrap();
        assert_eq!(consumed.len(), 1);
        assert_eq!(consumed[0].rpc_id, msg.rpc_id);

        let result_msg = ResultMessage::success(msg.rpc_id.clone(), json!("value: hi"));
        result.send_result(&msg, &result_msg, &return_path).await.unwrap();

        let received = result.receive_result(&msg, &return_path, &CallOptions::default()).await.unwrap();
        assert_eq!(received.rpc_id, msg.rpc_id);
        assert_eq!(received.result, json!("value: hi"));
    }

    #[tokio::test]
    async fn event_delivered_to_each_consumer_group_once() {
        let broker = MemoryBroker::new();
        let events = broker.event_transport();

        let mut group_a_opts = CallOptions::default();
        group_a_opts.consumer_group = Some("a".into());
        let mut group_b_opts = CallOptions::default();
        group_b_opts.consumer_group = Some("b".into());

        let listen_for = vec![("my.dummy".to_string(), "my_event".to_string())];
        let mut consumer_a = events.consume(&listen_for, &group_a_opts).await.unwrap();
        let mut consumer_b = events.consume(&listen_for, &group_b_opts).await.unwrap();

        let msg = EventMessage::new("my.dummy", "my_event", Kwargs::new());
        events.send_event(&msg, &CallOptions::default()).await.unwrap();

        let got_a = consumer_a.next().await.unwrap().unwrap();
        let got_b = consumer_b.next().await.unwrap().unwrap();
        assert_eq!(got_a.canonical_name(), "my.dummy.my_event");
        assert_eq!(got_b.canonical_name(), "my.dummy.my_event");
        consumer_a.ack().await.unwrap();
        consumer_b.ack().await.unwrap();
    }
}
