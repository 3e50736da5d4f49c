//! 内存中间件（InMemoryBroker）
//!
//! 进程内模拟 AMQP 0-9-1 的最小语义：
//! - 直连交换机路由，`mandatory` 发布无法路由时记录为 unroutable；
//! - 队列可由中间件分配名称，多个消费者轮询投递；
//! - 未确认消息按通道跟踪，通道关闭时重新入队并标记 `redelivered`；
//! - 故障注入：不可达、发布失败、连接关闭/阻塞、回调异常；
//! - 计数与拓扑查询，供测试与示例观察。
//!
use super::{
    BrokerChannel, BrokerConnection, BrokerListener, ConnectionFactory, Delivery, DeliveryMode,
    QueueOptions, SharedChannel, notify,
};
use async_trait::async_trait;
use eventbus::{EventBusError, EventBusResult as Result};
use futures_core::stream::BoxStream;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, trace};

const ENDPOINT: &str = "memory://localhost";

/// 内存中间件句柄，克隆后共享同一份状态
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<BrokerShared>,
}

struct BrokerShared {
    topology: Mutex<Topology>,
    connections: Mutex<Vec<Weak<MemoryConnection>>>,
    reachable: AtomicBool,
    publish_failures: AtomicUsize,
    connection_attempts: AtomicUsize,
    published: AtomicUsize,
    acked: AtomicUsize,
    next_id: AtomicU64,
}

impl BrokerShared {
    fn topology(&self) -> MutexGuard<'_, Topology> {
        self.topology.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn take_publish_failure(&self) -> bool {
        self.publish_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn open_connections(&self) -> Vec<Arc<MemoryConnection>> {
        let mut connections = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        connections.retain(|weak| weak.strong_count() > 0);
        connections
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|conn| conn.is_open())
            .collect()
    }
}

#[derive(Clone)]
struct Message {
    routing_key: String,
    body: Vec<u8>,
    redelivered: bool,
}

struct Consumer {
    channel_id: u64,
    tx: mpsc::UnboundedSender<Result<Delivery>>,
}

struct QueueState {
    options: QueueOptions,
    bindings: HashSet<(String, String)>,
    ready: VecDeque<Message>,
    consumers: Vec<Consumer>,
    next_consumer: usize,
}

impl QueueState {
    fn new(options: QueueOptions) -> Self {
        Self {
            options,
            bindings: HashSet::new(),
            ready: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
        }
    }
}

struct Unacked {
    queue: String,
    message: Message,
}

#[derive(Default)]
struct Topology {
    exchanges: HashSet<String>,
    queues: HashMap<String, QueueState>,
    // 通道 -> (投递标签 -> 未确认消息)
    unacked: HashMap<u64, HashMap<u64, Unacked>>,
    next_tags: HashMap<u64, u64>,
    unroutable: Vec<String>,
}

impl Topology {
    fn route(
        &mut self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        body: &[u8],
    ) -> Result<()> {
        if !self.exchanges.contains(exchange) {
            return Err(EventBusError::broker(format!("no exchange '{exchange}'")));
        }

        let targets: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, queue)| {
                queue.bindings.iter().any(|(bound_exchange, key)| {
                    bound_exchange == exchange && key == routing_key
                })
            })
            .map(|(name, _)| name.clone())
            .collect();

        if targets.is_empty() {
            if mandatory {
                debug!(exchange, routing_key, "message returned as unroutable");
                self.unroutable.push(routing_key.to_string());
            }
            return Ok(());
        }

        for name in targets {
            if let Some(queue) = self.queues.get_mut(&name) {
                queue.ready.push_back(Message {
                    routing_key: routing_key.to_string(),
                    body: body.to_vec(),
                    redelivered: false,
                });
            }
            self.dispatch(&name);
        }
        Ok(())
    }

    /// 将就绪消息轮询投递给队列的消费者
    fn dispatch(&mut self, queue_name: &str) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };

        while !queue.consumers.is_empty() {
            let Some(message) = queue.ready.pop_front() else {
                break;
            };
            let index = queue.next_consumer % queue.consumers.len();
            let channel_id = queue.consumers[index].channel_id;

            let tag = self.next_tags.entry(channel_id).or_insert(0);
            *tag += 1;
            let delivery = Delivery {
                delivery_tag: *tag,
                routing_key: message.routing_key.clone(),
                body: message.body.clone(),
                redelivered: message.redelivered,
            };
            let delivery_tag = delivery.delivery_tag;

            if queue.consumers[index].tx.send(Ok(delivery)).is_err() {
                // 消费端已丢弃投递流
                queue.consumers.remove(index);
                queue.ready.push_front(message);
                continue;
            }

            trace!(queue = queue_name, delivery_tag, "message delivered");
            self.unacked.entry(channel_id).or_default().insert(
                delivery_tag,
                Unacked {
                    queue: queue_name.to_string(),
                    message,
                },
            );
            queue.next_consumer = index + 1;
        }
    }

    /// 移除通道上的消费者，未确认消息按原顺序重新入队
    fn close_channel(&mut self, channel_id: u64) {
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.channel_id != channel_id);
        }
        self.next_tags.remove(&channel_id);

        let mut pending: Vec<(u64, Unacked)> = self
            .unacked
            .remove(&channel_id)
            .unwrap_or_default()
            .into_iter()
            .collect();
        pending.sort_by_key(|(tag, _)| *tag);

        let mut touched = HashSet::new();
        for (_, Unacked { queue, mut message }) in pending.into_iter().rev() {
            if let Some(state) = self.queues.get_mut(&queue) {
                message.redelivered = true;
                state.ready.push_front(message);
                touched.insert(queue);
            }
        }
        for queue in touched {
            self.dispatch(&queue);
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(BrokerShared {
                topology: Mutex::new(Topology::default()),
                connections: Mutex::new(Vec::new()),
                reachable: AtomicBool::new(true),
                publish_failures: AtomicUsize::new(0),
                connection_attempts: AtomicUsize::new(0),
                published: AtomicUsize::new(0),
                acked: AtomicUsize::new(0),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    // -------- 故障注入 --------

    /// 不可达时建立连接返回 `BrokerUnreachable`
    pub fn set_reachable(&self, reachable: bool) {
        self.shared.reachable.store(reachable, Ordering::SeqCst);
    }

    /// 接下来的 `count` 次发布返回套接字错误
    pub fn fail_next_publishes(&self, count: usize) {
        self.shared.publish_failures.store(count, Ordering::SeqCst);
    }

    /// 关闭全部连接（含其通道）并触发关闭通知
    pub fn shutdown_connections(&self, reason: &str) {
        for conn in self.shared.open_connections() {
            conn.shutdown(reason);
        }
    }

    /// 对全部连接触发阻塞通知，连接保持打开
    pub fn block_connections(&self, reason: &str) {
        for conn in self.shared.open_connections() {
            let listeners = conn.listeners().blocked.clone();
            notify(&listeners, reason);
        }
    }

    /// 对全部连接触发连接级回调异常
    pub fn raise_connection_exception(&self, reason: &str) {
        for conn in self.shared.open_connections() {
            let listeners = conn.listeners().callback_exception.clone();
            notify(&listeners, reason);
        }
    }

    /// 对全部打开的通道触发回调异常
    pub fn raise_channel_exception(&self, reason: &str) {
        for conn in self.shared.open_connections() {
            for channel in conn.open_channels() {
                let listeners = channel.listeners().clone();
                notify(&listeners, reason);
            }
        }
    }

    // -------- 观察 --------

    pub fn connection_attempts(&self) -> usize {
        self.shared.connection_attempts.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        self.shared.open_connections().len()
    }

    pub fn published(&self) -> usize {
        self.shared.published.load(Ordering::SeqCst)
    }

    pub fn acked(&self) -> usize {
        self.shared.acked.load(Ordering::SeqCst)
    }

    pub fn has_exchange(&self, exchange: &str) -> bool {
        self.shared.topology().exchanges.contains(exchange)
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.topology().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn queue_options(&self, queue: &str) -> Option<QueueOptions> {
        self.shared.topology().queues.get(queue).map(|q| q.options)
    }

    /// 队列上绑定的路由键（已排序）
    pub fn bindings(&self, queue: &str) -> Vec<String> {
        let topology = self.shared.topology();
        let mut keys: Vec<String> = topology
            .queues
            .get(queue)
            .map(|q| q.bindings.iter().map(|(_, key)| key.clone()).collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.shared
            .topology()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    /// 队列中等待投递的消息数
    pub fn message_count(&self, queue: &str) -> usize {
        self.shared
            .topology()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    pub fn unacked_count(&self) -> usize {
        self.shared.topology().unacked.values().map(HashMap::len).sum()
    }

    /// 以 mandatory 发布但无法路由的路由键
    pub fn unroutable(&self) -> Vec<String> {
        self.shared.topology().unroutable.clone()
    }
}

#[async_trait]
impl ConnectionFactory for InMemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>> {
        self.shared.connection_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.shared.reachable.load(Ordering::SeqCst) {
            return Err(EventBusError::broker_unreachable(format!(
                "{ENDPOINT} is unreachable"
            )));
        }

        let conn = Arc::new(MemoryConnection {
            id: self.shared.next_id(),
            broker: self.shared.clone(),
            open: AtomicBool::new(true),
            channels: Mutex::new(Vec::new()),
            listeners: Mutex::new(ConnectionListeners::default()),
        });
        self.shared
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(&conn));
        debug!(connection_id = conn.id, "memory connection opened");
        Ok(conn)
    }

    fn endpoint(&self) -> String {
        ENDPOINT.to_string()
    }
}

#[derive(Default)]
struct ConnectionListeners {
    shutdown: Vec<BrokerListener>,
    blocked: Vec<BrokerListener>,
    callback_exception: Vec<BrokerListener>,
}

struct MemoryConnection {
    id: u64,
    broker: Arc<BrokerShared>,
    open: AtomicBool,
    channels: Mutex<Vec<Arc<MemoryChannel>>>,
    listeners: Mutex<ConnectionListeners>,
}

impl MemoryConnection {
    fn listeners(&self) -> MutexGuard<'_, ConnectionListeners> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_channels(&self) -> Vec<Arc<MemoryChannel>> {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|ch| ch.is_open())
            .cloned()
            .collect()
    }

    /// 关闭连接及其全部通道，随后发出关闭通知
    fn shutdown(&self, reason: &str) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        let channels =
            std::mem::take(&mut *self.channels.lock().unwrap_or_else(PoisonError::into_inner));
        for channel in channels {
            channel.shutdown();
        }
        debug!(connection_id = self.id, reason, "memory connection closed");

        let listeners = self.listeners().shutdown.clone();
        notify(&listeners, reason);
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn endpoint(&self) -> String {
        ENDPOINT.to_string()
    }

    async fn create_channel(&self) -> Result<SharedChannel> {
        if !self.is_open() {
            return Err(EventBusError::unavailable("connection is closed"));
        }
        let channel = Arc::new(MemoryChannel {
            id: self.broker.next_id(),
            broker: self.broker.clone(),
            open: AtomicBool::new(true),
            listeners: Mutex::new(Vec::new()),
        });
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(channel.clone());
        Ok(channel)
    }

    fn on_shutdown(&self, listener: BrokerListener) {
        self.listeners().shutdown.push(listener);
    }

    fn on_blocked(&self, listener: BrokerListener) {
        self.listeners().blocked.push(listener);
    }

    fn on_callback_exception(&self, listener: BrokerListener) {
        self.listeners().callback_exception.push(listener);
    }

    async fn close(&self) -> Result<()> {
        self.shutdown("closed by application");
        Ok(())
    }
}

struct MemoryChannel {
    id: u64,
    broker: Arc<BrokerShared>,
    open: AtomicBool,
    listeners: Mutex<Vec<BrokerListener>>,
}

impl MemoryChannel {
    fn listeners(&self) -> MutexGuard<'_, Vec<BrokerListener>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(EventBusError::unavailable("channel is closed"))
        }
    }

    fn shutdown(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.broker.topology().close_channel(self.id);
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn exchange_declare(&self, exchange: &str) -> Result<()> {
        self.ensure_open()?;
        self.broker
            .topology()
            .exchanges
            .insert(exchange.to_string());
        Ok(())
    }

    async fn queue_declare(&self, queue: &str, options: QueueOptions) -> Result<String> {
        self.ensure_open()?;
        let name = if queue.is_empty() {
            format!("amq.gen-{}", uuid::Uuid::new_v4().simple())
        } else {
            queue.to_string()
        };

        let mut topology = self.broker.topology();
        match topology.queues.get(&name) {
            Some(existing) if existing.options != options => Err(EventBusError::broker(format!(
                "queue '{name}' already declared with different options"
            ))),
            Some(_) => Ok(name),
            None => {
                topology.queues.insert(name.clone(), QueueState::new(options));
                Ok(name)
            }
        }
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;
        let mut topology = self.broker.topology();
        if !topology.exchanges.contains(exchange) {
            return Err(EventBusError::broker(format!("no exchange '{exchange}'")));
        }
        let state = topology
            .queues
            .get_mut(queue)
            .ok_or_else(|| EventBusError::broker(format!("no queue '{queue}'")))?;
        state
            .bindings
            .insert((exchange.to_string(), routing_key.to_string()));
        Ok(())
    }

    async fn queue_unbind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;
        if let Some(state) = self.broker.topology().queues.get_mut(queue) {
            state
                .bindings
                .remove(&(exchange.to_string(), routing_key.to_string()));
        }
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        mode: DeliveryMode,
        body: &[u8],
    ) -> Result<()> {
        self.ensure_open()?;
        if self.broker.take_publish_failure() {
            return Err(EventBusError::socket("connection reset while publishing"));
        }
        trace!(exchange, routing_key, delivery_mode = mode.as_u8(), "publishing");
        self.broker
            .topology()
            .route(exchange, routing_key, mandatory, body)?;
        self.broker.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn basic_consume(&self, queue: &str) -> Result<BoxStream<'static, Result<Delivery>>> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut topology = self.broker.topology();
            let state = topology
                .queues
                .get_mut(queue)
                .ok_or_else(|| EventBusError::broker(format!("no queue '{queue}'")))?;
            state.consumers.push(Consumer {
                channel_id: self.id,
                tx,
            });
            topology.dispatch(queue);
        }
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()> {
        self.ensure_open()?;
        self.broker
            .topology()
            .unacked
            .get_mut(&self.id)
            .and_then(|pending| pending.remove(&delivery_tag))
            .ok_or_else(|| EventBusError::broker(format!("unknown delivery tag {delivery_tag}")))?;
        self.broker.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_callback_exception(&self, listener: BrokerListener) {
        self.listeners().push(listener);
    }

    async fn close(&self) -> Result<()> {
        self.shutdown();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::sync::atomic::AtomicUsize;

    const EXCHANGE: &str = "test_bus";

    async fn channel(broker: &InMemoryBroker) -> (Arc<dyn BrokerConnection>, SharedChannel) {
        let conn = broker.connect().await.unwrap();
        let channel = conn.create_channel().await.unwrap();
        channel.exchange_declare(EXCHANGE).await.unwrap();
        (conn, channel)
    }

    async fn publish(channel: &SharedChannel, key: &str, body: &str) {
        channel
            .basic_publish(EXCHANGE, key, true, DeliveryMode::Persistent, body.as_bytes())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn direct_routing_matches_exact_key() {
        let broker = InMemoryBroker::new();
        let (_conn, ch) = channel(&broker).await;
        let queue = ch.queue_declare("", QueueOptions::durable()).await.unwrap();
        assert!(queue.starts_with("amq.gen-"));
        ch.queue_bind(&queue, EXCHANGE, "OrderCreated").await.unwrap();

        publish(&ch, "OrderCreated", "{}").await;
        publish(&ch, "ordercreated", "{}").await;

        assert_eq!(broker.message_count(&queue), 1);
        assert_eq!(broker.unroutable(), vec!["ordercreated".to_string()]);
        assert_eq!(broker.published(), 2);
    }

    #[tokio::test]
    async fn consumers_receive_round_robin_and_ack() {
        let broker = InMemoryBroker::new();
        let (conn, ch) = channel(&broker).await;
        let queue = ch.queue_declare("q", QueueOptions::durable()).await.unwrap();
        ch.queue_bind(&queue, EXCHANGE, "E").await.unwrap();

        let other = conn.create_channel().await.unwrap();
        let mut first = ch.basic_consume(&queue).await.unwrap();
        let mut second = other.basic_consume(&queue).await.unwrap();

        publish(&ch, "E", "1").await;
        publish(&ch, "E", "2").await;

        let a = first.next().await.unwrap().unwrap();
        let b = second.next().await.unwrap().unwrap();
        assert_eq!(a.body, b"1");
        assert_eq!(b.body, b"2");
        assert_eq!(broker.unacked_count(), 2);

        ch.basic_ack(a.delivery_tag).await.unwrap();
        other.basic_ack(b.delivery_tag).await.unwrap();
        assert_eq!(broker.acked(), 2);
        assert!(ch.basic_ack(a.delivery_tag).await.is_err());
    }

    #[tokio::test]
    async fn closing_channel_requeues_unacked() {
        let broker = InMemoryBroker::new();
        let (conn, ch) = channel(&broker).await;
        let queue = ch.queue_declare("q", QueueOptions::durable()).await.unwrap();
        ch.queue_bind(&queue, EXCHANGE, "E").await.unwrap();

        let consumer_channel = conn.create_channel().await.unwrap();
        let mut deliveries = consumer_channel.basic_consume(&queue).await.unwrap();
        publish(&ch, "E", "x").await;
        let first = deliveries.next().await.unwrap().unwrap();
        assert!(!first.redelivered);

        consumer_channel.close().await.unwrap();
        assert!(deliveries.next().await.is_none());
        assert_eq!(broker.message_count(&queue), 1);

        let mut again = ch.basic_consume(&queue).await.unwrap();
        let second = again.next().await.unwrap().unwrap();
        assert!(second.redelivered);
        assert_eq!(second.body, b"x");
    }

    #[tokio::test]
    async fn shutdown_closes_channels_and_notifies() {
        let broker = InMemoryBroker::new();
        let (conn, ch) = channel(&broker).await;
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        conn.on_shutdown(Arc::new(move |_reason: &str| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        broker.shutdown_connections("connection forced");

        assert!(!conn.is_open());
        assert!(!ch.is_open());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(broker.open_connections(), 0);
        assert!(conn.create_channel().await.is_err());

        conn.close().await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unreachable_and_publish_faults() {
        let broker = InMemoryBroker::new();
        broker.set_reachable(false);
        let err = broker.connect().await.err().unwrap();
        assert!(matches!(err, EventBusError::BrokerUnreachable { .. }));
        assert_eq!(broker.connection_attempts(), 1);

        broker.set_reachable(true);
        let (_conn, ch) = channel(&broker).await;
        broker.fail_next_publishes(1);
        let err = ch
            .basic_publish(EXCHANGE, "E", false, DeliveryMode::Persistent, b"{}")
            .await
            .unwrap_err();
        assert!(err.is_transient());
        publish(&ch, "E", "{}").await;
        assert_eq!(broker.published(), 1);
    }

    #[tokio::test]
    async fn exchange_is_required_for_bind_and_publish() {
        let broker = InMemoryBroker::new();
        let conn = broker.connect().await.unwrap();
        let ch = conn.create_channel().await.unwrap();
        let queue = ch.queue_declare("", QueueOptions::durable()).await.unwrap();

        assert!(ch.queue_bind(&queue, EXCHANGE, "E").await.is_err());
        assert!(
            ch.basic_publish(EXCHANGE, "E", true, DeliveryMode::Persistent, b"{}")
                .await
                .is_err()
        );

        // 重复声明无副作用
        ch.exchange_declare(EXCHANGE).await.unwrap();
        ch.exchange_declare(EXCHANGE).await.unwrap();
        assert!(broker.has_exchange(EXCHANGE));
        ch.queue_bind(&queue, EXCHANGE, "E").await.unwrap();
        assert_eq!(broker.bindings(&queue), vec!["E".to_string()]);
    }
}
