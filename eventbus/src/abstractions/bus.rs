//! 事件总线（EventBus）协议
//!
//! 定义集成事件的发布、订阅与退订。该 trait 带有泛型方法，
//! 通常以具体实现类型注入使用。
//!
use super::handler::{DynamicIntegrationEventHandler, IntegrationEventHandler};
use crate::{error::EventBusResult as Result, integration_event::IntegrationEvent};
use async_trait::async_trait;

/// 事件总线：发布集成事件并管理处理器订阅
#[async_trait]
pub trait EventBus: Send + Sync {
    /// 发布事件，事件名作为路由键
    async fn publish<E>(&self, event: &E) -> Result<()>
    where
        E: IntegrationEvent;

    /// 订阅强类型事件，事件名取 `E::EVENT_NAME`
    async fn subscribe<E, H>(&self) -> Result<()>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E> + 'static;

    /// 以动态处理器订阅指定事件名
    async fn subscribe_dynamic<H>(&self, event_name: &str) -> Result<()>
    where
        H: DynamicIntegrationEventHandler + 'static;

    async fn unsubscribe<E, H>(&self) -> Result<()>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E> + 'static;

    async fn unsubscribe_dynamic<H>(&self, event_name: &str) -> Result<()>
    where
        H: DynamicIntegrationEventHandler + 'static;
}
