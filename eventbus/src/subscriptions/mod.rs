//! 订阅注册表（subscriptions）
//!
//! 维护“事件名 → 有序处理器注册列表”与“事件名 → 事件类型描述”两张表：
//! - 同一事件名下处理器标识唯一，重复注册直接拒绝；
//! - 注册顺序即分发顺序，强类型与动态订阅共用同一列表；
//! - 移除某事件名的最后一个订阅时，同步移除事件类型描述并发出“事件已移除”通知。
//!
mod descriptor;
mod inmemory;
mod manager;
mod subscription_info;

pub use descriptor::EventTypeDescriptor;
pub use inmemory::InMemorySubscriptionsManager;
pub use manager::{EventRemovedListener, SubscriptionsManager, SubscriptionsManagerExt};
pub use subscription_info::{EventPayload, HandlerFuture, SubscriptionInfo};
