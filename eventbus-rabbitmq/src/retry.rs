//! 指数退避重试策略
//!
//! 首次调用不计入重试，最多执行 `retry_count + 1` 次；第 n 次重试前等待
//! `base_delay * 2^n`。仅连接类错误（`EventBusError::is_transient`）会被重试，
//! 其余错误立即返回。
//!
use crate::config::EventBusConfig;
use eventbus::{EventBusError, EventBusResult as Result};
use std::future::Future;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    retry_count: u32,
    base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&EventBusConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(retry_count: u32, base_delay: Duration) -> Self {
        Self {
            retry_count,
            base_delay,
        }
    }

    pub fn from_config(config: &EventBusConfig) -> Self {
        Self::new(config.retry_count, config.retry_base_delay)
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// 第 `attempt` 次重试（从 1 开始）前的等待时长
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }

    /// 执行操作，失败时按策略重试；`on_retry` 在每次等待前被调用
    pub async fn execute<T, Op, Fut, OnRetry>(&self, mut op: Op, mut on_retry: OnRetry) -> Result<T>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        OnRetry: FnMut(&EventBusError, u32, Duration),
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.retry_count => {
                    attempt += 1;
                    let delay = self.delay_for(attempt);
                    on_retry(&err, attempt, delay);
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
