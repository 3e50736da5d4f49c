//! 集成事件处理器（IntegrationEventHandler）
//!
//! 处理器分为两类：
//! - 强类型：载荷在分发前反序列化为具体事件类型；
//! - 动态：接收通用 JSON 对象，不依赖编译期事件类型。
//!
use crate::integration_event::IntegrationEvent;
use async_trait::async_trait;
use std::any::{TypeId, type_name};
use std::fmt;
use std::hash::{Hash, Hasher};

/// 强类型处理器：处理某一具体类型的集成事件
#[async_trait]
pub trait IntegrationEventHandler<E>: Send + Sync
where
    E: IntegrationEvent,
{
    async fn handle(&self, event: E) -> anyhow::Result<()>;
}

/// 动态处理器：处理未经类型绑定的事件载荷
#[async_trait]
pub trait DynamicIntegrationEventHandler: Send + Sync {
    async fn handle(&self, event_data: serde_json::Value) -> anyhow::Result<()>;
}

/// 处理器标识
///
/// 以处理器类型的 `TypeId` 判等，类型名仅用于日志与错误信息。
#[derive(Clone, Copy)]
pub struct HandlerId {
    type_id: TypeId,
    name: &'static str,
}

impl HandlerId {
    pub fn of<H: ?Sized + 'static>() -> Self {
        Self {
            type_id: TypeId::of::<H>(),
            name: type_name::<H>(),
        }
    }

    /// 完整类型路径
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// 去掉模块路径后的类型名（保留泛型参数）
    pub fn short_name(&self) -> &'static str {
        let head_end = self.name.find('<').unwrap_or(self.name.len());
        let start = self.name[..head_end].rfind("::").map(|i| i + 2).unwrap_or(0);
        &self.name[start..]
    }
}

impl PartialEq for HandlerId {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for HandlerId {}

impl Hash for HandlerId {
    fn hash<S: Hasher>(&self, state: &mut S) {
        self.type_id.hash(state);
    }
}

impl fmt::Debug for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HandlerId").field(&self.name).finish()
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}
