//! 消息处理（EventProcessor）
//!
//! 对一条已解码的消息执行分发：
//! 1. 事件名无订阅时记录告警并返回；
//! 2. 按注册顺序逐个解析处理器实例，解析不到的处理器直接跳过；
//! 3. 动态订阅将消息体解析为通用 JSON 对象，强类型订阅按事件类型描述反序列化；
//! 4. 任一步骤出错即中止后续分发并返回错误，由调用方记录并决定是否确认消息。
//!
use crate::abstractions::HandlerResolver;
use crate::error::{EventBusError, EventBusResult as Result};
use crate::subscriptions::{EventPayload, SubscriptionsManager};
use std::sync::Arc;
use tracing::{debug, trace, warn};

#[derive(Clone)]
pub struct EventProcessor {
    subscriptions: Arc<dyn SubscriptionsManager>,
    resolver: Arc<dyn HandlerResolver>,
}

impl EventProcessor {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionsManager>,
        resolver: Arc<dyn HandlerResolver>,
    ) -> Self {
        Self {
            subscriptions,
            resolver,
        }
    }

    pub fn subscriptions(&self) -> &Arc<dyn SubscriptionsManager> {
        &self.subscriptions
    }

    /// 分发一条消息，返回实际调用的处理器数量
    pub async fn process_event(&self, event_name: &str, message: &str) -> Result<usize> {
        trace!(event_name, "processing event");

        if !self.subscriptions.has_subscriptions_for_event(event_name) {
            warn!(event_name, "no subscription for event");
            return Ok(0);
        }

        let mut invoked = 0;
        for subscription in self.subscriptions.handlers_for_event(event_name) {
            let Some(handler) = self.resolver.resolve(subscription.handler_id()) else {
                debug!(
                    event_name,
                    handler = %subscription.handler_id(),
                    "handler not resolved, skipped"
                );
                continue;
            };

            let payload = if subscription.is_dynamic() {
                EventPayload::Dynamic(serde_json::from_str(message)?)
            } else {
                let descriptor = self
                    .subscriptions
                    .event_type_by_name(event_name)
                    .ok_or_else(|| EventBusError::UnknownEventType {
                        event_name: event_name.to_string(),
                    })?;
                EventPayload::Typed(descriptor.deserialize(message)?)
            };

            tokio::task::yield_now().await;
            subscription.invoke(handler, payload).await?;
            invoked += 1;
        }

        Ok(invoked)
    }
}
