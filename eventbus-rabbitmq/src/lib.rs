//! RabbitMQ 集成事件总线（eventbus-rabbitmq）
//!
//! 在 `eventbus` 抽象之上实现面向 AMQP 风格中间件的客户端：
//! - `connection`：单一共享连接，断线/阻塞/回调异常时自动重连；
//! - `bus`：直连交换机拓扑、带重试的发布、按订阅绑定/解绑路由键、消费与确认；
//! - `transport`：中间件接缝（连接/通道协议），内置内存中间件，`amqp` 特性下提供 lapin 适配；
//! - `retry`：指数退避重试策略；
//! - `config`：交换机、队列与重试参数。
//!
pub mod bus;
pub mod config;
pub mod connection;
pub mod retry;
pub mod transport;

pub use bus::RabbitMqEventBus;
pub use config::EventBusConfig;
pub use connection::{ConnectionState, PersistentConnection};
pub use retry::RetryPolicy;
pub use transport::memory::InMemoryBroker;
