//! 集成事件（Integration Event）
//!
//! 跨服务传递的不可变事件信封：每个实例携带全局唯一的 `Id` 与 UTC 创建时间 `CreationDate`，
//! 其余字段由具体事件类型定义。事件名（默认取类型名）同时作为注册表键与消息路由键。
//!
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// 集成事件需要满足的能力边界
///
/// 通常由 `#[integration_event]` 宏生成实现；序列化后的 JSON 至少包含 `Id` 与 `CreationDate`。
pub trait IntegrationEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// 事件名（区分大小写，作为路由键）
    const EVENT_NAME: &'static str;

    /// 事件实例唯一标识
    fn id(&self) -> uuid::Uuid;

    /// 事件创建时间（UTC）
    fn creation_date(&self) -> DateTime<Utc>;

    fn event_name(&self) -> &'static str {
        Self::EVENT_NAME
    }
}

/// 获取事件类型对应的事件名
pub fn event_key<E: IntegrationEvent>() -> &'static str {
    E::EVENT_NAME
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use uuid::Uuid;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct ProductPriceChanged {
        #[serde(rename = "Id")]
        id: Uuid,
        #[serde(rename = "CreationDate")]
        creation_date: DateTime<Utc>,
        product_id: i64,
        new_price: f64,
    }

    impl IntegrationEvent for ProductPriceChanged {
        const EVENT_NAME: &'static str = "ProductPriceChanged";

        fn id(&self) -> Uuid {
            self.id
        }

        fn creation_date(&self) -> DateTime<Utc> {
            self.creation_date
        }
    }

    #[test]
    fn envelope_fields_use_wire_names() {
        let ev = ProductPriceChanged {
            id: Uuid::new_v4(),
            creation_date: Utc::now(),
            product_id: 7,
            new_price: 12.5,
        };

        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["Id"], serde_json::json!(ev.id));
        assert!(json["CreationDate"].is_string());
        assert_eq!(json["product_id"], 7);

        let back: ProductPriceChanged = serde_json::from_value(json).unwrap();
        assert_eq!(back.id(), ev.id());
        assert_eq!(back.creation_date(), ev.creation_date());
    }

    #[test]
    fn event_key_matches_instance_name() {
        let ev = ProductPriceChanged {
            id: Uuid::new_v4(),
            creation_date: Utc::now(),
            product_id: 1,
            new_price: 1.0,
        };
        assert_eq!(event_key::<ProductPriceChanged>(), "ProductPriceChanged");
        assert_eq!(ev.event_name(), event_key::<ProductPriceChanged>());
    }
}
