//! 事件总线配置
//!
//! 默认值：
//! - 交换机 `jst_event_bus`（直连类型）；
//! - 队列名为空，由中间件分配；
//! - 连接与发布失败最多重试 5 次，基础退避 1 秒（第 n 次重试等待 2^n 秒）。
//!
use eventbus::{EventBusError, EventBusResult as Result};
use std::time::Duration;

pub const DEFAULT_EXCHANGE_NAME: &str = "jst_event_bus";

pub const ENV_EXCHANGE: &str = "EVENTBUS_EXCHANGE";
pub const ENV_QUEUE: &str = "EVENTBUS_QUEUE";
pub const ENV_RETRY_COUNT: &str = "EVENTBUS_RETRY_COUNT";
pub const ENV_RETRY_BASE_DELAY_MS: &str = "EVENTBUS_RETRY_BASE_DELAY_MS";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventBusConfig {
    /// 直连交换机名称
    pub exchange_name: String,
    /// 消费队列名称，空字符串表示由中间件分配
    pub queue_name: String,
    /// 首次尝试之后的最大重试次数
    pub retry_count: u32,
    /// 退避基础时长
    pub retry_base_delay: Duration,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            exchange_name: DEFAULT_EXCHANGE_NAME.to_string(),
            queue_name: String::new(),
            retry_count: 5,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

impl EventBusConfig {
    /// 从进程环境变量读取，未设置的项保留默认值
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 通过任意键值查找函数构建配置
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(exchange) = lookup(ENV_EXCHANGE).filter(|v| !v.trim().is_empty()) {
            config.exchange_name = exchange.trim().to_string();
        }
        if let Some(queue) = lookup(ENV_QUEUE) {
            config.queue_name = queue.trim().to_string();
        }
        if let Some(raw) = lookup(ENV_RETRY_COUNT) {
            config.retry_count = parse_number(ENV_RETRY_COUNT, &raw)?;
        }
        if let Some(raw) = lookup(ENV_RETRY_BASE_DELAY_MS) {
            config.retry_base_delay = Duration::from_millis(parse_number(ENV_RETRY_BASE_DELAY_MS, &raw)?);
        }

        Ok(config)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| EventBusError::config(format!("{key}={raw:?}: {e}")))
}
