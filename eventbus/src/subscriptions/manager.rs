use super::{EventTypeDescriptor, SubscriptionInfo};
use crate::abstractions::{DynamicIntegrationEventHandler, HandlerId, IntegrationEventHandler};
use crate::error::EventBusResult as Result;
use crate::integration_event::IntegrationEvent;
use std::sync::Arc;

/// “事件已移除”监听器，参数为事件名
pub type EventRemovedListener = Arc<dyn Fn(&str) + Send + Sync>;

/// 订阅注册表协议
///
/// 仅暴露窄的变更接口，不对外暴露内部映射。
pub trait SubscriptionsManager: Send + Sync {
    /// 追加订阅；同一事件名下处理器重复时返回 `DuplicateHandler`。
    /// 强类型订阅需同时给出事件类型描述。
    fn add_subscription(
        &self,
        event_name: &str,
        subscription: SubscriptionInfo,
        event_type: Option<EventTypeDescriptor>,
    ) -> Result<()>;

    /// 移除订阅，未找到时不做任何事；返回是否移除
    fn remove_subscription(&self, event_name: &str, handler_id: &HandlerId) -> bool;

    fn has_subscriptions_for_event(&self, event_name: &str) -> bool;

    /// 按注册顺序返回处理器快照；未知事件名返回空列表
    fn handlers_for_event(&self, event_name: &str) -> Vec<SubscriptionInfo>;

    fn event_type_by_name(&self, event_name: &str) -> Option<EventTypeDescriptor>;

    /// 没有任何事件名存在订阅
    fn is_empty(&self) -> bool;

    /// 丢弃全部订阅与事件类型描述，不发出通知
    fn clear(&self);

    /// 注册“事件已移除”监听器
    fn on_event_removed(&self, listener: EventRemovedListener);
}

/// 按类型参数注册/移除订阅的便捷方法
pub trait SubscriptionsManagerExt: SubscriptionsManager {
    fn add_typed<E, H>(&self) -> Result<()>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E> + 'static,
    {
        self.add_subscription(
            E::EVENT_NAME,
            SubscriptionInfo::typed::<E, H>(),
            Some(EventTypeDescriptor::of::<E>()),
        )
    }

    fn add_dynamic<H>(&self, event_name: &str) -> Result<()>
    where
        H: DynamicIntegrationEventHandler + 'static,
    {
        self.add_subscription(event_name, SubscriptionInfo::dynamic::<H>(), None)
    }

    fn remove_typed<E, H>(&self) -> bool
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E> + 'static,
    {
        self.remove_subscription(E::EVENT_NAME, &HandlerId::of::<H>())
    }

    fn remove_dynamic<H>(&self, event_name: &str) -> bool
    where
        H: DynamicIntegrationEventHandler + 'static,
    {
        self.remove_subscription(event_name, &HandlerId::of::<H>())
    }
}

impl<T: SubscriptionsManager + ?Sized> SubscriptionsManagerExt for T {}
