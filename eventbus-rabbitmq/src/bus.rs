//! RabbitMQ 事件总线（RabbitMqEventBus）
//!
//! 组合持久连接、订阅注册表与消息处理器：
//! - 发布：确保连接可用，每次使用独立的临时通道，声明直连交换机后以事件名为路由键、
//!   持久化且 `mandatory` 方式发布，发布本身按重试策略重试；
//! - 订阅：事件名首次被订阅时将消费队列绑定到该路由键，随后登记订阅并确保消费循环运行；
//! - 退订：事件名的最后一个订阅被移除时解绑路由键，注册表为空时关闭消费通道；
//!   经由注册表直接移除的订阅同样在后台任务中解绑；
//! - 消费：每条投递作为独立任务分发，无论处理是否成功都确认一次；
//! - 消费通道出现回调异常或意外关闭时自动重建并重新开始消费；
//!   重建耗尽重试后，连接恢复时再次恢复消费。
//!
use crate::config::EventBusConfig;
use crate::connection::PersistentConnection;
use crate::retry::RetryPolicy;
use crate::transport::{
    BrokerChannel, BrokerListener, Delivery, DeliveryMode, QueueOptions, SharedChannel,
};
use async_trait::async_trait;
use bon::bon;
use eventbus::subscriptions::EventTypeDescriptor;
use eventbus::{
    DynamicIntegrationEventHandler, EventBus, EventBusResult as Result, EventProcessor, HandlerId,
    HandlerResolver, InMemorySubscriptionsManager, IntegrationEvent, IntegrationEventHandler,
    SubscriptionInfo, SubscriptionsManager,
};
use futures_core::stream::BoxStream;
use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct RabbitMqEventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    connection: PersistentConnection,
    subscriptions: Arc<dyn SubscriptionsManager>,
    processor: EventProcessor,
    config: EventBusConfig,
    policy: RetryPolicy,
    consumer: tokio::sync::Mutex<ConsumerState>,
    // 注册表“事件已移除”通知，在持有 consumer 锁时处理
    removed: Mutex<mpsc::UnboundedReceiver<String>>,
}

struct ConsumerState {
    channel: Option<SharedChannel>,
    queue_name: String,
    generation: u64,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

#[bon]
impl RabbitMqEventBus {
    #[builder]
    pub fn new(
        connection: PersistentConnection,
        resolver: Arc<dyn HandlerResolver>,
        subscriptions: Option<Arc<dyn SubscriptionsManager>>,
        #[builder(default)] config: EventBusConfig,
    ) -> Self {
        let subscriptions: Arc<dyn SubscriptionsManager> =
            subscriptions.unwrap_or_else(|| Arc::new(InMemorySubscriptionsManager::new()));

        let inner = Arc::new_cyclic(|bus: &Weak<BusInner>| {
            let (tx, rx) = mpsc::unbounded_channel();
            let removed_bus = bus.clone();
            subscriptions.on_event_removed(Arc::new(move |event_name: &str| {
                if tx.send(event_name.to_string()).is_err() {
                    return;
                }
                if let Some(inner) = removed_bus.upgrade() {
                    spawn_detached(inner.handle_removed());
                }
            }));

            let connected_bus = bus.clone();
            connection.on_connected(Arc::new(move |_endpoint: &str| {
                if let Some(inner) = connected_bus.upgrade() {
                    spawn_detached(inner.resume_consumer());
                }
            }));

            BusInner {
                processor: EventProcessor::new(subscriptions.clone(), resolver),
                policy: RetryPolicy::from_config(&config),
                consumer: tokio::sync::Mutex::new(ConsumerState {
                    channel: None,
                    queue_name: config.queue_name.clone(),
                    generation: 0,
                    cancel: None,
                    task: None,
                }),
                removed: Mutex::new(rx),
                connection,
                subscriptions,
                config,
            }
        });

        Self { inner }
    }
}

impl RabbitMqEventBus {
    pub fn connection(&self) -> &PersistentConnection {
        &self.inner.connection
    }

    pub fn subscriptions(&self) -> &Arc<dyn SubscriptionsManager> {
        &self.inner.subscriptions
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.inner.config
    }

    /// 当前消费队列名；由中间件分配且尚未声明时为空
    pub async fn queue_name(&self) -> String {
        self.inner.consumer.lock().await.queue_name.clone()
    }

    /// 消费通道打开且消费循环在运行
    pub async fn is_consuming(&self) -> bool {
        let consumer = self.inner.consumer.lock().await;
        consumer.channel.as_ref().is_some_and(|c| c.is_open())
            && consumer.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// 清空订阅并关闭消费通道；共享连接由宿主负责关闭
    pub async fn shutdown(&self) {
        let mut consumer = self.inner.consumer.lock().await;
        self.inner.subscriptions.clear();
        self.inner.stop_consumer(&mut consumer).await;
        info!("event bus shut down");
    }
}

#[async_trait]
impl EventBus for RabbitMqEventBus {
    async fn publish<E>(&self, event: &E) -> Result<()>
    where
        E: IntegrationEvent,
    {
        let body = serde_json::to_vec(event)?;
        self.inner
            .publish(event.event_name(), event.id(), &body)
            .await
    }

    async fn subscribe<E, H>(&self) -> Result<()>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E> + 'static,
    {
        self.inner
            .subscribe(
                E::EVENT_NAME,
                SubscriptionInfo::typed::<E, H>(),
                Some(EventTypeDescriptor::of::<E>()),
            )
            .await
    }

    async fn subscribe_dynamic<H>(&self, event_name: &str) -> Result<()>
    where
        H: DynamicIntegrationEventHandler + 'static,
    {
        self.inner
            .subscribe(event_name, SubscriptionInfo::dynamic::<H>(), None)
            .await
    }

    async fn unsubscribe<E, H>(&self) -> Result<()>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E> + 'static,
    {
        self.inner
            .unsubscribe(E::EVENT_NAME, &HandlerId::of::<H>())
            .await
    }

    async fn unsubscribe_dynamic<H>(&self, event_name: &str) -> Result<()>
    where
        H: DynamicIntegrationEventHandler + 'static,
    {
        self.inner
            .unsubscribe(event_name, &HandlerId::of::<H>())
            .await
    }
}

impl BusInner {
    // -------- 发布 --------

    async fn publish(&self, event_name: &str, event_id: Uuid, body: &[u8]) -> Result<()> {
        self.connection.ensure_connected().await?;

        trace!(%event_id, event_name, "creating channel to publish event");
        let channel = self.connection.create_channel().await?;
        let result = self
            .publish_on(channel.as_ref(), event_name, event_id, body)
            .await;
        close_quietly(channel.as_ref()).await;
        result
    }

    async fn publish_on(
        &self,
        channel: &dyn BrokerChannel,
        event_name: &str,
        event_id: Uuid,
        body: &[u8],
    ) -> Result<()> {
        let exchange = self.config.exchange_name.as_str();
        channel.exchange_declare(exchange).await?;

        trace!(%event_id, "publishing event to broker");
        self.policy
            .execute(
                || channel.basic_publish(exchange, event_name, true, DeliveryMode::Persistent, body),
                |err, attempt, delay| {
                    warn!(
                        %event_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "could not publish event after {:.1}s",
                        delay.as_secs_f64()
                    );
                },
            )
            .await?;

        debug!(%event_id, event_name, "event published");
        Ok(())
    }

    // -------- 订阅 --------

    async fn subscribe(
        self: &Arc<Self>,
        event_name: &str,
        subscription: SubscriptionInfo,
        descriptor: Option<EventTypeDescriptor>,
    ) -> Result<()> {
        let mut consumer = self.consumer.lock().await;
        // 先处理其他途径产生的移除通知，避免迟到的解绑覆盖本次绑定
        if let Err(err) = self.drain_removed(&mut consumer).await {
            debug!(error = %err, "pending removals were not fully unbound");
        }

        let first = !self.subscriptions.has_subscriptions_for_event(event_name);
        if first {
            self.bind(&mut consumer, event_name).await?;
        }

        info!(
            event_name,
            handler = %subscription.handler_id(),
            dynamic = subscription.is_dynamic(),
            "subscribing to event"
        );
        if let Err(err) = self
            .subscriptions
            .add_subscription(event_name, subscription, descriptor)
        {
            if first {
                if let Err(unbind_err) = self.unbind(&consumer, event_name).await {
                    warn!(event_name, error = %unbind_err, "failed to roll back routing key binding");
                }
            }
            return Err(err);
        }

        self.start_basic_consume(&mut consumer).await
    }

    async fn unsubscribe(self: &Arc<Self>, event_name: &str, handler_id: &HandlerId) -> Result<()> {
        let mut consumer = self.consumer.lock().await;

        info!(event_name, handler = %handler_id, "unsubscribing from event");
        if !self.subscriptions.remove_subscription(event_name, handler_id) {
            debug!(event_name, handler = %handler_id, "handler was not subscribed");
        }
        self.drain_removed(&mut consumer).await
    }

    async fn bind(self: &Arc<Self>, consumer: &mut ConsumerState, event_name: &str) -> Result<()> {
        self.ensure_consumer_channel(consumer).await?;

        let channel = self.connection.create_channel().await?;
        let result = channel
            .queue_bind(&consumer.queue_name, &self.config.exchange_name, event_name)
            .await;
        close_quietly(channel.as_ref()).await;
        result?;

        debug!(event_name, queue = %consumer.queue_name, "routing key bound");
        Ok(())
    }

    async fn unbind(&self, consumer: &ConsumerState, event_name: &str) -> Result<()> {
        if consumer.queue_name.is_empty() {
            return Ok(());
        }
        self.connection.ensure_connected().await?;

        let channel = self.connection.create_channel().await?;
        let result = channel
            .queue_unbind(&consumer.queue_name, &self.config.exchange_name, event_name)
            .await;
        close_quietly(channel.as_ref()).await;
        result?;

        debug!(event_name, queue = %consumer.queue_name, "routing key unbound");
        Ok(())
    }

    /// 处理注册表发出的“事件已移除”通知
    async fn drain_removed(&self, consumer: &mut ConsumerState) -> Result<()> {
        let removed: Vec<String> = {
            let mut rx = self.removed.lock().unwrap_or_else(PoisonError::into_inner);
            std::iter::from_fn(|| rx.try_recv().ok()).collect()
        };

        let mut outcome = Ok(());
        for event_name in removed {
            if let Err(err) = self.on_event_removed(consumer, &event_name).await {
                warn!(event_name, error = %err, "failed to unbind removed event");
                if outcome.is_ok() {
                    outcome = Err(err);
                }
            }
        }
        outcome
    }

    /// 后台处理经由注册表直接移除产生的通知
    fn handle_removed(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let mut consumer = self.consumer.lock().await;
            if let Err(err) = self.drain_removed(&mut consumer).await {
                debug!(error = %err, "removed events were not fully unbound");
            }
        })
    }

    async fn on_event_removed(&self, consumer: &mut ConsumerState, event_name: &str) -> Result<()> {
        if self.subscriptions.has_subscriptions_for_event(event_name) {
            debug!(event_name, "event subscribed again, routing key kept");
            return Ok(());
        }
        let unbound = self.unbind(consumer, event_name).await;

        if self.subscriptions.is_empty() {
            info!("no subscriptions left, closing consumer channel");
            self.stop_consumer(consumer).await;
            // 中间件分配的队列名不再复用
            consumer.queue_name = self.config.queue_name.clone();
        }
        unbound
    }

    // -------- 消费 --------

    async fn ensure_consumer_channel(
        self: &Arc<Self>,
        consumer: &mut ConsumerState,
    ) -> Result<SharedChannel> {
        if let Some(channel) = consumer.channel.as_ref().filter(|c| c.is_open()) {
            return Ok(channel.clone());
        }
        self.stop_consumer(consumer).await;
        self.connection.ensure_connected().await?;

        trace!("creating consumer channel");
        let channel = self.connection.create_channel().await?;
        let queue_name = match self.declare_topology(channel.as_ref(), &consumer.queue_name).await
        {
            Ok(queue_name) => queue_name,
            Err(err) => {
                close_quietly(channel.as_ref()).await;
                return Err(err);
            }
        };

        consumer.generation += 1;
        channel.on_callback_exception(self.recreate_listener(consumer.generation));
        consumer.queue_name = queue_name;
        consumer.channel = Some(channel.clone());

        debug!(queue = %consumer.queue_name, generation = consumer.generation, "consumer channel created");
        Ok(channel)
    }

    async fn declare_topology(&self, channel: &dyn BrokerChannel, queue_name: &str) -> Result<String> {
        channel.exchange_declare(&self.config.exchange_name).await?;
        channel.queue_declare(queue_name, QueueOptions::durable()).await
    }

    async fn start_basic_consume(self: &Arc<Self>, consumer: &mut ConsumerState) -> Result<()> {
        let running = consumer.task.as_ref().is_some_and(|t| !t.is_finished());
        let open = consumer.channel.as_ref().is_some_and(|c| c.is_open());
        if running && open {
            return Ok(());
        }

        trace!("starting basic consume");
        let channel = self.ensure_consumer_channel(consumer).await?;
        let deliveries = channel.basic_consume(&consumer.queue_name).await?;

        let token = CancellationToken::new();
        consumer.cancel = Some(token.clone());
        consumer.task = Some(tokio::spawn(consume_loop(
            ConsumeContext {
                processor: self.processor.clone(),
                channel,
                bus: Arc::downgrade(self),
                generation: consumer.generation,
            },
            deliveries,
            token,
        )));

        debug!(queue = %consumer.queue_name, "consumer started");
        Ok(())
    }

    /// 停止消费循环并关闭消费通道，保留队列名
    async fn stop_consumer(&self, consumer: &mut ConsumerState) {
        if let Some(token) = consumer.cancel.take() {
            token.cancel();
        }
        consumer.task.take();
        if let Some(channel) = consumer.channel.take() {
            close_quietly(channel.as_ref()).await;
            // 使旧通道上的迟到通知失效
            consumer.generation += 1;
        }
    }

    fn recreate_listener(self: &Arc<Self>, generation: u64) -> BrokerListener {
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = Handle::current();
        Arc::new(move |reason: &str| {
            if let Some(inner) = weak.upgrade() {
                handle.spawn(inner.recreate_consumer(generation, reason.to_string()));
            }
        })
    }

    fn recreate_consumer(self: Arc<Self>, generation: u64, reason: String) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let mut consumer = self.consumer.lock().await;
            if consumer.generation != generation {
                debug!(generation, "stale consumer channel event ignored");
                return;
            }

            warn!(reason = %reason, "recreating consumer channel");
            self.stop_consumer(&mut consumer).await;
            if self.subscriptions.is_empty() {
                return;
            }
            if let Err(err) = self.start_basic_consume(&mut consumer).await {
                error!(error = %err, "failed to recreate consumer channel");
            }
        })
    }

    /// 连接恢复后，仍有订阅但消费循环未运行时重新开始消费
    fn resume_consumer(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let mut consumer = self.consumer.lock().await;
            if self.subscriptions.is_empty() {
                return;
            }
            if let Err(err) = self.start_basic_consume(&mut consumer).await {
                error!(error = %err, "failed to resume consumer after reconnect");
            }
        })
    }
}

/// 在当前运行时上执行后台任务；不在运行时内时由下一次订阅变更处理
fn spawn_detached(task: BoxFuture<'static, ()>) {
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(task);
        }
        Err(_) => debug!("no tokio runtime, background bus work deferred"),
    }
}

impl Drop for BusInner {
    fn drop(&mut self) {
        if let Some(token) = self.consumer.get_mut().cancel.take() {
            token.cancel();
        }
    }
}

struct ConsumeContext {
    processor: EventProcessor,
    channel: SharedChannel,
    bus: Weak<BusInner>,
    generation: u64,
}

async fn consume_loop(
    ctx: ConsumeContext,
    mut deliveries: BoxStream<'static, Result<Delivery>>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            next = deliveries.next() => {
                match next {
                    Some(Ok(delivery)) => {
                        let processor = ctx.processor.clone();
                        let channel = ctx.channel.clone();
                        tokio::spawn(async move {
                            handle_delivery(&processor, channel.as_ref(), delivery).await;
                        });
                    }
                    Some(Err(err)) => warn!(error = %err, "consumer delivery error"),
                    None => {
                        if !token.is_cancelled() {
                            if let Some(inner) = ctx.bus.upgrade() {
                                tokio::spawn(inner.recreate_consumer(
                                    ctx.generation,
                                    "consumer stream ended".to_string(),
                                ));
                            }
                        }
                        break;
                    }
                }
            }
        }
    }
    trace!(generation = ctx.generation, "consume loop stopped");
}

/// 分发一条投递并确认；处理失败只记录告警，不重投
async fn handle_delivery(processor: &EventProcessor, channel: &dyn BrokerChannel, delivery: Delivery) {
    let event_name = delivery.routing_key.as_str();
    let message = String::from_utf8_lossy(&delivery.body);
    trace!(
        event_name,
        delivery_tag = delivery.delivery_tag,
        redelivered = delivery.redelivered,
        "processing message"
    );

    if let Err(err) = processor.process_event(event_name, &message).await {
        warn!(event_name, error = %err, "error processing message");
    }

    if let Err(err) = channel.basic_ack(delivery.delivery_tag).await {
        warn!(
            event_name,
            delivery_tag = delivery.delivery_tag,
            error = %err,
            "failed to acknowledge message"
        );
    }
}

async fn close_quietly(channel: &dyn BrokerChannel) {
    if let Err(err) = channel.close().await {
        debug!(error = %err, "failed to close channel");
    }
}
