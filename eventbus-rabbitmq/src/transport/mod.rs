//! 中间件接缝（transport）
//!
//! 以最小的 AMQP 0-9-1 子集描述事件总线所需的中间件能力：
//! - `ConnectionFactory`：建立物理连接；
//! - `BrokerConnection`：共享连接，可创建多路复用的逻辑通道，并上报关闭/阻塞/回调异常；
//! - `BrokerChannel`：声明拓扑、绑定/解绑、发布、消费与确认。
//!
//! 内置 `memory` 实现用于测试与本地开发；启用 `amqp` 特性后可使用基于 lapin 的真实连接。
//!
use async_trait::async_trait;
use eventbus::EventBusResult as Result;
use futures_core::stream::BoxStream;
use std::sync::Arc;

pub mod memory;

#[cfg(feature = "amqp")]
pub mod amqp;

/// 连接/通道事件监听器，参数为原因描述
pub type BrokerListener = Arc<dyn Fn(&str) + Send + Sync>;

/// 共享的逻辑通道句柄
pub type SharedChannel = Arc<dyn BrokerChannel>;

/// 消息投递模式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryMode {
    Transient,
    Persistent,
}

impl DeliveryMode {
    /// AMQP `delivery-mode` 属性值
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Transient => 1,
            Self::Persistent => 2,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueOptions {
    /// 持久、非独占、不自动删除
    pub fn durable() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }
}

/// 中间件投递到消费者的一条消息
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub redelivered: bool,
}

#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>>;

    /// 用于日志的目标地址（不含凭据）
    fn endpoint(&self) -> String;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    fn is_open(&self) -> bool;

    fn endpoint(&self) -> String;

    async fn create_channel(&self) -> Result<SharedChannel>;

    /// 连接关闭（包括中间件主动关闭与网络中断）
    fn on_shutdown(&self, listener: BrokerListener);

    /// 中间件因资源告警阻塞连接
    fn on_blocked(&self, listener: BrokerListener);

    /// 连接级回调异常
    fn on_callback_exception(&self, listener: BrokerListener);

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn is_open(&self) -> bool;

    /// 声明直连交换机（路由键精确匹配），重复声明无副作用
    async fn exchange_declare(&self, exchange: &str) -> Result<()>;

    /// 声明队列，`queue` 为空时由中间件分配名称；返回实际队列名
    async fn queue_declare(&self, queue: &str, options: QueueOptions) -> Result<String>;

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn queue_unbind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        mode: DeliveryMode,
        body: &[u8],
    ) -> Result<()>;

    /// 开始消费队列，返回 'static 生命周期的投递流；通道关闭时流结束
    async fn basic_consume(&self, queue: &str) -> Result<BoxStream<'static, Result<Delivery>>>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()>;

    /// 通道级回调异常（如消费回调失败）
    fn on_callback_exception(&self, listener: BrokerListener);

    async fn close(&self) -> Result<()>;
}

/// 依次调用监听器；调用前需释放持有的锁
pub(crate) fn notify(listeners: &[BrokerListener], reason: &str) {
    for listener in listeners {
        listener(reason);
    }
}
