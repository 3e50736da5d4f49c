use async_trait::async_trait;
use eventbus::{
    DynamicIntegrationEventHandler, EventBus, EventBusError, HandlerId, HandlerRegistry,
    IntegrationEvent, IntegrationEventHandler, SubscriptionsManager,
};
use eventbus_macros::integration_event;
use eventbus_rabbitmq::{
    ConnectionState, EventBusConfig, InMemoryBroker, PersistentConnection, RabbitMqEventBus,
    RetryPolicy,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[integration_event]
struct OrderCreated {
    order_id: i64,
    customer: String,
}

type Journal = Arc<Mutex<Vec<String>>>;

struct H1 {
    journal: Journal,
}

struct H2 {
    journal: Journal,
}

struct Exploding {
    journal: Journal,
}

struct RawHandler {
    seen: Arc<Mutex<Vec<serde_json::Value>>>,
}

#[async_trait]
impl IntegrationEventHandler<OrderCreated> for H1 {
    async fn handle(&self, event: OrderCreated) -> anyhow::Result<()> {
        self.journal.lock().unwrap().push(format!("h1:{}", event.id()));
        Ok(())
    }
}

#[async_trait]
impl IntegrationEventHandler<OrderCreated> for H2 {
    async fn handle(&self, event: OrderCreated) -> anyhow::Result<()> {
        self.journal
            .lock()
            .unwrap()
            .push(format!("h2:{}:{}", event.order_id, event.customer));
        Ok(())
    }
}

#[async_trait]
impl IntegrationEventHandler<OrderCreated> for Exploding {
    async fn handle(&self, _event: OrderCreated) -> anyhow::Result<()> {
        self.journal.lock().unwrap().push("exploding".to_string());
        anyhow::bail!("handler failed on purpose")
    }
}

#[async_trait]
impl DynamicIntegrationEventHandler for RawHandler {
    async fn handle(&self, event_data: serde_json::Value) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(event_data);
        Ok(())
    }
}

struct Harness {
    broker: InMemoryBroker,
    bus: RabbitMqEventBus,
    journal: Journal,
    raw: Arc<Mutex<Vec<serde_json::Value>>>,
}

impl Harness {
    fn new() -> Self {
        Self::with_retries(2)
    }

    fn with_retries(retry_count: u32) -> Self {
        let broker = InMemoryBroker::new();
        let journal: Journal = Arc::default();
        let raw = Arc::new(Mutex::new(Vec::new()));

        let registry = Arc::new(HandlerRegistry::new());
        registry.register_instance(Arc::new(H1 {
            journal: journal.clone(),
        }));
        registry.register_instance(Arc::new(H2 {
            journal: journal.clone(),
        }));
        registry.register_instance(Arc::new(Exploding {
            journal: journal.clone(),
        }));
        registry.register_instance(Arc::new(RawHandler { seen: raw.clone() }));

        let config = EventBusConfig {
            retry_count,
            retry_base_delay: Duration::from_millis(1),
            ..EventBusConfig::default()
        };
        let connection = PersistentConnection::new(
            Arc::new(broker.clone()),
            RetryPolicy::from_config(&config),
        );
        let bus = RabbitMqEventBus::builder()
            .connection(connection)
            .resolver(registry)
            .config(config)
            .build();

        Self {
            broker,
            bus,
            journal,
            raw,
        }
    }

    fn journal(&self) -> Vec<String> {
        self.journal.lock().unwrap().clone()
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

#[tokio::test(flavor = "multi_thread")]
async fn typed_subscriber_receives_published_event() {
    let h = Harness::new();
    h.bus.subscribe::<OrderCreated, H1>().await.unwrap();

    let queue = h.bus.queue_name().await;
    assert_eq!(h.broker.bindings(&queue), vec!["OrderCreated".to_string()]);
    assert!(h.bus.is_consuming().await);

    let event = OrderCreated::new(1, "alice".into());
    h.bus.publish(&event).await.unwrap();

    wait_until(|| h.broker.acked() == 1).await;
    assert_eq!(h.journal(), vec![format!("h1:{}", event.id())]);
    assert_eq!(h.broker.unacked_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn removed_handler_is_no_longer_invoked() {
    let h = Harness::new();
    h.bus.subscribe::<OrderCreated, H1>().await.unwrap();
    h.bus.subscribe::<OrderCreated, H2>().await.unwrap();
    h.bus.unsubscribe::<OrderCreated, H1>().await.unwrap();

    // 仍有订阅，路由键保持绑定
    let queue = h.bus.queue_name().await;
    assert_eq!(h.broker.bindings(&queue), vec!["OrderCreated".to_string()]);

    h.bus
        .publish(&OrderCreated::new(2, "bob".into()))
        .await
        .unwrap();

    wait_until(|| h.broker.acked() == 1).await;
    assert_eq!(h.journal(), vec!["h2:2:bob".to_string()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn dynamic_subscriber_sees_body_verbatim() {
    let h = Harness::new();
    h.bus.subscribe_dynamic::<RawHandler>("Raw").await.unwrap();

    #[integration_event(name = "Raw")]
    struct RawPayload {
        #[serde(rename = "Sku")]
        sku: String,
        #[serde(rename = "Lines")]
        lines: Vec<u32>,
    }

    let payload = RawPayload::new("A-1".into(), vec![1, 2]);
    h.bus.publish(&payload).await.unwrap();

    wait_until(|| h.broker.acked() == 1).await;
    let seen = h.raw.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0]["Sku"], "A-1");
    assert_eq!(seen[0]["Lines"], serde_json::json!([1, 2]));
    assert_eq!(seen[0]["Id"], serde_json::json!(payload.id()));
    assert!(seen[0].get("CreationDate").is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_handler_still_acknowledges_once() {
    let h = Harness::new();
    h.bus.subscribe::<OrderCreated, Exploding>().await.unwrap();
    h.bus.subscribe::<OrderCreated, H2>().await.unwrap();

    h.bus
        .publish(&OrderCreated::new(3, "carol".into()))
        .await
        .unwrap();

    wait_until(|| h.broker.acked() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // 失败中止后续分发，消息不重投
    assert_eq!(h.broker.acked(), 1);
    assert_eq!(h.journal(), vec!["exploding".to_string()]);
    let queue = h.bus.queue_name().await;
    assert_eq!(h.broker.message_count(&queue), 0);
    assert_eq!(h.broker.unacked_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_subscription_is_rejected() {
    let h = Harness::new();
    h.bus.subscribe::<OrderCreated, H1>().await.unwrap();

    let err = h.bus.subscribe::<OrderCreated, H1>().await.unwrap_err();
    assert!(matches!(err, EventBusError::DuplicateHandler { .. }));
    assert_eq!(h.bus.subscriptions().handlers_for_event("OrderCreated").len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn unsubscribing_everything_closes_consumer() {
    let h = Harness::new();
    h.bus.subscribe::<OrderCreated, H1>().await.unwrap();
    h.bus.subscribe_dynamic::<RawHandler>("Raw").await.unwrap();
    let queue = h.bus.queue_name().await;
    assert_eq!(h.broker.consumer_count(&queue), 1);

    h.bus.unsubscribe::<OrderCreated, H1>().await.unwrap();
    assert_eq!(h.broker.bindings(&queue), vec!["Raw".to_string()]);
    assert!(h.bus.is_consuming().await);

    h.bus.unsubscribe_dynamic::<RawHandler>("Raw").await.unwrap();
    assert!(h.broker.bindings(&queue).is_empty());
    assert!(h.bus.subscriptions().is_empty());
    assert!(!h.bus.is_consuming().await);
    assert_eq!(h.broker.consumer_count(&queue), 0);

    // 注册表为空后不再有消费者，新订阅会重新开始消费
    h.bus.subscribe::<OrderCreated, H2>().await.unwrap();
    assert!(h.bus.is_consuming().await);
}

#[tokio::test(flavor = "multi_thread")]
async fn registry_removal_unbinds_and_closes_consumer() {
    let h = Harness::new();
    h.bus.subscribe_dynamic::<RawHandler>("Raw").await.unwrap();
    h.bus.subscribe::<OrderCreated, H1>().await.unwrap();
    let queue = h.bus.queue_name().await;

    // 绕过总线直接操作注册表
    assert!(
        h.bus
            .subscriptions()
            .remove_subscription("Raw", &HandlerId::of::<RawHandler>())
    );
    wait_until(|| h.broker.bindings(&queue) == vec!["OrderCreated".to_string()]).await;
    assert!(h.bus.is_consuming().await);

    assert!(
        h.bus
            .subscriptions()
            .remove_subscription("OrderCreated", &HandlerId::of::<H1>())
    );
    wait_until(|| h.broker.bindings(&queue).is_empty() && h.broker.consumer_count(&queue) == 0)
        .await;
    assert!(!h.bus.is_consuming().await);
}

#[tokio::test(flavor = "multi_thread")]
async fn resubscribing_right_after_registry_removal_keeps_binding() {
    let h = Harness::new();
    h.bus.subscribe::<OrderCreated, H1>().await.unwrap();

    h.bus
        .subscriptions()
        .remove_subscription("OrderCreated", &HandlerId::of::<H1>());
    h.bus.subscribe::<OrderCreated, H2>().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let queue = h.bus.queue_name().await;
    assert_eq!(h.broker.bindings(&queue), vec!["OrderCreated".to_string()]);
    assert!(h.bus.is_consuming().await);

    h.bus
        .publish(&OrderCreated::new(11, "kim".into()))
        .await
        .unwrap();
    wait_until(|| h.broker.acked() == 1).await;
    assert_eq!(h.journal(), vec!["h2:11:kim".to_string()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn unsubscribing_unknown_handler_is_a_noop() {
    let h = Harness::new();
    h.bus.subscribe::<OrderCreated, H1>().await.unwrap();
    h.bus.unsubscribe::<OrderCreated, H2>().await.unwrap();

    assert!(h.bus.subscriptions().has_subscriptions_for_event("OrderCreated"));
    assert!(h.bus.is_consuming().await);
}

#[tokio::test(flavor = "multi_thread")]
async fn channel_exception_recreates_consumer() {
    let h = Harness::new();
    h.bus.subscribe::<OrderCreated, H2>().await.unwrap();
    let queue = h.bus.queue_name().await;

    h.broker.raise_channel_exception("consumer callback failed");
    // 重建在后台任务中完成
    tokio::time::sleep(Duration::from_millis(100)).await;
    wait_until(|| h.broker.consumer_count(&queue) == 1).await;

    h.bus
        .publish(&OrderCreated::new(4, "dave".into()))
        .await
        .unwrap();
    wait_until(|| h.broker.acked() == 1).await;
    assert_eq!(h.journal(), vec!["h2:4:dave".to_string()]);
    assert!(h.bus.is_consuming().await);
}

#[tokio::test(flavor = "multi_thread")]
async fn consumer_recovers_after_connection_shutdown() {
    let h = Harness::new();
    h.bus.subscribe::<OrderCreated, H2>().await.unwrap();
    let queue = h.bus.queue_name().await;

    h.broker.shutdown_connections("connection forced");
    wait_until(|| h.broker.open_connections() == 1 && h.broker.consumer_count(&queue) == 1)
        .await;

    h.bus
        .publish(&OrderCreated::new(5, "erin".into()))
        .await
        .unwrap();
    wait_until(|| h.broker.acked() == 1).await;
    assert_eq!(h.journal(), vec!["h2:5:erin".to_string()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn consumer_resumes_once_broker_returns_after_outage() {
    let h = Harness::with_retries(1);
    h.bus.subscribe::<OrderCreated, H2>().await.unwrap();
    let queue = h.bus.queue_name().await;

    h.broker.set_reachable(false);
    h.broker.shutdown_connections("network down");
    // 自动重连与消费通道重建各自耗尽重试：首次连接 + 2 + 2
    wait_until(|| h.broker.connection_attempts() >= 5).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.broker.consumer_count(&queue), 0);
    assert!(!h.bus.is_consuming().await);

    h.broker.set_reachable(true);
    h.bus
        .publish(&OrderCreated::new(10, "judy".into()))
        .await
        .unwrap();

    wait_until(|| h.broker.acked() == 1).await;
    assert_eq!(h.journal(), vec!["h2:10:judy".to_string()]);
    assert_eq!(h.broker.consumer_count(&queue), 1);
    assert!(h.bus.is_consuming().await);
}

#[tokio::test(flavor = "multi_thread")]
async fn publish_while_disconnected_reconnects_once() {
    let h = Harness::with_retries(2);
    assert!(h.bus.connection().try_connect().await);

    h.broker.set_reachable(false);
    h.broker.shutdown_connections("network down");
    // 自动重连：首次尝试 + 2 次重试
    wait_until(|| {
        h.broker.connection_attempts() == 4
            && h.bus.connection().state() == ConnectionState::Disconnected
    })
    .await;

    h.broker.set_reachable(true);
    h.bus
        .publish(&OrderCreated::new(6, "frank".into()))
        .await
        .unwrap();

    assert_eq!(h.broker.connection_attempts(), 5);
    assert_eq!(h.broker.published(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn publish_retries_transient_failures() {
    let h = Harness::with_retries(3);
    h.broker.fail_next_publishes(2);

    h.bus
        .publish(&OrderCreated::new(7, "gina".into()))
        .await
        .unwrap();
    assert_eq!(h.broker.published(), 1);

    h.broker.fail_next_publishes(10);
    let err = h
        .bus
        .publish(&OrderCreated::new(8, "hank".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, EventBusError::Socket { .. }));
    assert_eq!(h.broker.published(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_broker_fails_connect_without_open_connection() {
    let h = Harness::with_retries(3);
    h.broker.set_reachable(false);

    assert!(!h.bus.connection().try_connect().await);
    assert_eq!(h.broker.connection_attempts(), 4);
    assert_eq!(h.broker.open_connections(), 0);

    let err = h
        .bus
        .publish(&OrderCreated::new(9, "ivy".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, EventBusError::Unavailable { .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_clears_subscriptions_but_keeps_connection() {
    let h = Harness::new();
    h.bus.subscribe::<OrderCreated, H1>().await.unwrap();
    let queue = h.bus.queue_name().await;

    h.bus.shutdown().await;

    assert!(h.bus.subscriptions().is_empty());
    assert!(!h.bus.is_consuming().await);
    assert_eq!(h.broker.consumer_count(&queue), 0);
    assert!(h.bus.connection().is_connected());

    h.bus.connection().close().await;
    assert_eq!(h.broker.open_connections(), 0);
}
