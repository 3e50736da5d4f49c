//! 事件总线统一错误定义
//!
//! 按错误处理策略划分：
//! - 连接类（`BrokerUnreachable`/`Socket`）：可重试，按指数退避有限次重试；
//! - 拓扑/状态类（`Unavailable`/`Broker`）：未连接或中间件拒绝操作；
//! - 注册类（`DuplicateHandler`）：同步拒绝，不重试；
//! - 消息处理类（`Serde`/`UnknownEventType`/`Handler` 等）：按消息捕获并记录。
//!
use thiserror::Error;

/// 统一错误类型
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum EventBusError {
    // --- 连接（可重试） ---
    #[error("broker unreachable: {reason}")]
    BrokerUnreachable { reason: String },
    #[error("socket error: {reason}")]
    Socket { reason: String },

    // --- 拓扑/状态 ---
    #[error("unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("broker error: {reason}")]
    Broker { reason: String },

    // --- 订阅注册 ---
    #[error("handler already registered: handler={handler}, event={event_name}")]
    DuplicateHandler { handler: String, event_name: String },

    // --- 消息处理 ---
    #[error("serialization error: {source}")]
    Serde {
        #[from]
        source: serde_json::Error,
    },
    #[error("unknown event type: {event_name}")]
    UnknownEventType { event_name: String },
    #[error("type mismatch: expected={expected}, found={found}")]
    TypeMismatch { expected: String, found: String },
    #[error("event handler error: handler={handler}, reason={reason}")]
    Handler { handler: String, reason: String },

    // --- 配置 ---
    #[error("invalid config: {reason}")]
    Config { reason: String },
}

impl EventBusError {
    pub fn broker_unreachable(reason: impl Into<String>) -> Self {
        Self::BrokerUnreachable {
            reason: reason.into(),
        }
    }

    pub fn socket(reason: impl Into<String>) -> Self {
        Self::Socket {
            reason: reason.into(),
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn broker(reason: impl Into<String>) -> Self {
        Self::Broker {
            reason: reason.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// 是否属于可重试的连接类错误
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::BrokerUnreachable { .. } | Self::Socket { .. })
    }
}

impl From<std::io::Error> for EventBusError {
    fn from(err: std::io::Error) -> Self {
        Self::Socket {
            reason: err.to_string(),
        }
    }
}

/// 统一 Result 类型别名
pub type EventBusResult<T> = Result<T, EventBusError>;
