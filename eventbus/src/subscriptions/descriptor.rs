use crate::error::EventBusResult as Result;
use crate::integration_event::IntegrationEvent;
use std::any::{Any, type_name};
use std::fmt;

type DeserializeFn = fn(&str) -> Result<Box<dyn Any + Send>>;

/// 事件类型描述：事件名、Rust 类型名与反序列化函数
///
/// 在强类型订阅注册时生成，消费消息时据此将消息体还原为具体事件类型。
#[derive(Clone, Copy)]
pub struct EventTypeDescriptor {
    name: &'static str,
    type_name: &'static str,
    deserialize: DeserializeFn,
}

impl EventTypeDescriptor {
    pub fn of<E: IntegrationEvent>() -> Self {
        Self {
            name: E::EVENT_NAME,
            type_name: type_name::<E>(),
            deserialize: deserialize_erased::<E>,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// 将消息体反序列化为类型擦除后的事件实例
    pub fn deserialize(&self, message: &str) -> Result<Box<dyn Any + Send>> {
        (self.deserialize)(message)
    }
}

impl PartialEq for EventTypeDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.type_name == other.type_name
    }
}

impl Eq for EventTypeDescriptor {}

impl fmt::Debug for EventTypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventTypeDescriptor")
            .field("name", &self.name)
            .field("type_name", &self.type_name)
            .finish()
    }
}

fn deserialize_erased<E: IntegrationEvent>(message: &str) -> Result<Box<dyn Any + Send>> {
    let event: E = serde_json::from_str(message)?;
    Ok(Box::new(event))
}
