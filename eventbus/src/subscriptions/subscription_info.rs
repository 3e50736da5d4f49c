use crate::abstractions::{
    AnyHandler, DynamicIntegrationEventHandler, HandlerId, IntegrationEventHandler,
};
use crate::error::{EventBusError, EventBusResult as Result};
use crate::integration_event::IntegrationEvent;
use std::any::{Any, type_name};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// 待分发的事件载荷
pub enum EventPayload {
    /// 已按事件类型描述反序列化的事件
    Typed(Box<dyn Any + Send>),
    /// 通用 JSON 对象
    Dynamic(serde_json::Value),
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

type InvokeFn = Arc<dyn Fn(AnyHandler, EventPayload) -> HandlerFuture + Send + Sync>;

/// 处理器注册信息
/// - 处理器标识（同一事件名下唯一）；
/// - 是否为动态订阅；
/// - 注册时按具体类型生成的调用函数，分发时直接调用而无需运行时类型检查。
#[derive(Clone)]
pub struct SubscriptionInfo {
    handler_id: HandlerId,
    is_dynamic: bool,
    invoker: InvokeFn,
}

impl SubscriptionInfo {
    /// 强类型订阅：载荷需为 `E`，处理器实例需为 `H`
    pub fn typed<E, H>() -> Self
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E> + 'static,
    {
        let invoker: InvokeFn = Arc::new(|handler: AnyHandler, payload: EventPayload| -> HandlerFuture {
            Box::pin(async move {
                let handler = downcast_handler::<H>(handler)?;
                let event = match payload {
                    EventPayload::Typed(boxed) => {
                        boxed
                            .downcast::<E>()
                            .map_err(|_| EventBusError::TypeMismatch {
                                expected: type_name::<E>().to_string(),
                                found: "foreign event type".to_string(),
                            })?
                    }
                    EventPayload::Dynamic(_) => {
                        return Err(EventBusError::TypeMismatch {
                            expected: type_name::<E>().to_string(),
                            found: "dynamic payload".to_string(),
                        });
                    }
                };

                handler
                    .handle(*event)
                    .await
                    .map_err(handler_error::<H>)
            })
        });

        Self {
            handler_id: HandlerId::of::<H>(),
            is_dynamic: false,
            invoker,
        }
    }

    /// 动态订阅：载荷为通用 JSON 对象
    pub fn dynamic<H>() -> Self
    where
        H: DynamicIntegrationEventHandler + 'static,
    {
        let invoker: InvokeFn = Arc::new(|handler: AnyHandler, payload: EventPayload| -> HandlerFuture {
            Box::pin(async move {
                let handler = downcast_handler::<H>(handler)?;
                let data = match payload {
                    EventPayload::Dynamic(value) => value,
                    EventPayload::Typed(_) => {
                        return Err(EventBusError::TypeMismatch {
                            expected: "dynamic payload".to_string(),
                            found: "typed event".to_string(),
                        });
                    }
                };

                handler
                    .handle(data)
                    .await
                    .map_err(handler_error::<H>)
            })
        });

        Self {
            handler_id: HandlerId::of::<H>(),
            is_dynamic: true,
            invoker,
        }
    }

    pub fn handler_id(&self) -> &HandlerId {
        &self.handler_id
    }

    pub fn is_dynamic(&self) -> bool {
        self.is_dynamic
    }

    /// 以解析得到的处理器实例处理载荷
    pub fn invoke(&self, handler: AnyHandler, payload: EventPayload) -> HandlerFuture {
        (self.invoker)(handler, payload)
    }
}

impl fmt::Debug for SubscriptionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionInfo")
            .field("handler_id", &self.handler_id)
            .field("is_dynamic", &self.is_dynamic)
            .finish()
    }
}

fn downcast_handler<H: Any + Send + Sync>(handler: AnyHandler) -> Result<Arc<H>> {
    handler
        .downcast::<H>()
        .map_err(|_| EventBusError::TypeMismatch {
            expected: type_name::<H>().to_string(),
            found: "unrelated handler instance".to_string(),
        })
}

fn handler_error<H: 'static>(err: anyhow::Error) -> EventBusError {
    EventBusError::Handler {
        handler: HandlerId::of::<H>().to_string(),
        reason: format!("{err:#}"),
    }
}
