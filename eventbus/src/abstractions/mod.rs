//! 事件总线协议（abstractions）
//!
//! - `IntegrationEventHandler`/`DynamicIntegrationEventHandler`：强类型与动态处理器；
//! - `HandlerResolver`：按处理器标识解析实例，解耦具体的依赖注入容器；
//! - `EventBus`：发布、订阅与退订的统一接口。
//!
pub mod bus;
pub mod handler;
pub mod resolver;

pub use bus::EventBus;
pub use handler::{DynamicIntegrationEventHandler, HandlerId, IntegrationEventHandler};
pub use resolver::{AnyHandler, HandlerRegistry, HandlerResolver};
