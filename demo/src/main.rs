use async_trait::async_trait;
use eventbus::{
    DynamicIntegrationEventHandler, EventBus, HandlerRegistry, IntegrationEvent,
    IntegrationEventHandler,
};
use eventbus_macros::integration_event;
use eventbus_rabbitmq::transport::ConnectionFactory;
use eventbus_rabbitmq::{
    EventBusConfig, InMemoryBroker, PersistentConnection, RabbitMqEventBus, RetryPolicy,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[integration_event]
struct ProductPriceChanged {
    product_id: i64,
    old_price: f64,
    new_price: f64,
}

#[integration_event(name = "ProductDeleted")]
struct ProductDeleted {
    product_id: i64,
}

/// 价格变更：强类型处理器
struct PriceChangedHandler {
    handled: AtomicUsize,
}

#[async_trait]
impl IntegrationEventHandler<ProductPriceChanged> for PriceChangedHandler {
    async fn handle(&self, event: ProductPriceChanged) -> anyhow::Result<()> {
        self.handled.fetch_add(1, Ordering::SeqCst);
        tracing::info!(
            event_id = %event.id(),
            product_id = event.product_id,
            old_price = event.old_price,
            new_price = event.new_price,
            "price changed"
        );
        Ok(())
    }
}

/// 审计：动态处理器，按原始 JSON 记录
struct AuditHandler;

#[async_trait]
impl DynamicIntegrationEventHandler for AuditHandler {
    async fn handle(&self, event_data: serde_json::Value) -> anyhow::Result<()> {
        tracing::info!(payload = %event_data, "audit");
        Ok(())
    }
}

#[cfg(feature = "amqp")]
fn connection_factory(broker: &InMemoryBroker) -> Arc<dyn ConnectionFactory> {
    match std::env::var("EVENTBUS_AMQP_URI") {
        Ok(uri) => Arc::new(eventbus_rabbitmq::transport::amqp::AmqpConnectionFactory::new(uri)),
        Err(_) => Arc::new(broker.clone()),
    }
}

#[cfg(not(feature = "amqp"))]
fn connection_factory(broker: &InMemoryBroker) -> Arc<dyn ConnectionFactory> {
    Arc::new(broker.clone())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "demo=info,eventbus=debug,eventbus_rabbitmq=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = EventBusConfig::from_env()?;
    tracing::info!(
        exchange = %config.exchange_name,
        queue = %config.queue_name,
        retry_count = config.retry_count,
        "loaded event bus configuration"
    );

    let broker = InMemoryBroker::new();
    let connection = PersistentConnection::new(
        connection_factory(&broker),
        RetryPolicy::from_config(&config),
    );

    let price_handler = Arc::new(PriceChangedHandler {
        handled: AtomicUsize::new(0),
    });
    let registry = Arc::new(HandlerRegistry::new());
    registry.register_instance(price_handler.clone());
    registry.register_factory(|| AuditHandler);

    let bus = RabbitMqEventBus::builder()
        .connection(connection.clone())
        .resolver(registry)
        .config(config)
        .build();

    bus.subscribe::<ProductPriceChanged, PriceChangedHandler>()
        .await?;
    bus.subscribe_dynamic::<AuditHandler>(ProductPriceChanged::EVENT_NAME)
        .await?;
    bus.subscribe_dynamic::<AuditHandler>(ProductDeleted::EVENT_NAME)
        .await?;

    bus.publish(&ProductPriceChanged::new(42, 9.99, 12.5)).await?;
    bus.publish(&ProductDeleted::new(7)).await?;

    // 模拟中间件强制断开，连接与消费者自动恢复
    broker.shutdown_connections("connection forced by demo");
    tokio::time::sleep(Duration::from_millis(200)).await;
    bus.publish(&ProductPriceChanged::new(42, 12.5, 11.0)).await?;

    tokio::time::sleep(Duration::from_millis(200)).await;
    tracing::info!(
        handled = price_handler.handled.load(Ordering::SeqCst),
        published = broker.published(),
        acked = broker.acked(),
        "demo finished"
    );

    bus.unsubscribe_dynamic::<AuditHandler>(ProductDeleted::EVENT_NAME)
        .await?;
    bus.shutdown().await;
    connection.close().await;
    Ok(())
}
