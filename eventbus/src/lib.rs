//! 集成事件总线基础库（eventbus）
//!
//! 提供跨服务集成事件（Integration Event）的通用抽象与进程内构件：
//! - 集成事件信封（`integration_event`）：全局唯一 `Id` 与 UTC `CreationDate`；
//! - 处理器与总线协议（`abstractions`）：强类型/动态处理器、处理器解析器与 `EventBus`；
//! - 订阅注册表（`subscriptions`）：事件名到有序处理器列表的映射与事件类型目录；
//! - 消息处理（`processing`）：按注册顺序解析处理器、反序列化并调用。
//!
//! 本 crate 不绑定具体消息中间件，传输层（如 RabbitMQ）在独立的基础设施 crate 中实现。
//!
//! 典型用法：
//! 1. 使用 `#[integration_event]` 定义事件，实现 `IntegrationEventHandler<E>`；
//! 2. 在 `HandlerRegistry` 中注册处理器实例或工厂；
//! 3. 通过具体的 `EventBus` 实现订阅并发布事件。
//!
pub mod abstractions;
pub mod error;
pub mod integration_event;
pub mod processing;
pub mod subscriptions;

pub use abstractions::{
    DynamicIntegrationEventHandler, EventBus, HandlerId, HandlerRegistry, HandlerResolver,
    IntegrationEventHandler,
};
pub use error::{EventBusError, EventBusResult};
pub use integration_event::{IntegrationEvent, event_key};
pub use processing::EventProcessor;
pub use subscriptions::{
    EventTypeDescriptor, InMemorySubscriptionsManager, SubscriptionInfo, SubscriptionsManager,
};

// 供 `#[integration_event]` 生成代码引用，避免调用方直接依赖 uuid/chrono
pub use chrono;
pub use uuid;

// 允许在本 crate 内部通过 ::eventbus 进行自引用，
// 以便过程宏在本 crate 的单元测试中也能解析到 ::eventbus 路径。
extern crate self as eventbus;
