//! 重试策略（RetryPolicy）
//!
//! 连接与发布共用同一套策略：指数退避、有限次数，且只重试瞬时错误
//! （网络错误、broker 不可达）。第 n 次重试前的等待时间为
//! `first_delay × factor^(n-1)`，并以 `max_delay` 封顶；默认 2s、4s、8s、16s、32s。
//!
use crate::error::{BrokerError, BrokerResult, EventBusError};
use bon::Builder;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// 指数退避重试策略
#[derive(Clone, Copy, Debug, Builder)]
pub struct RetryPolicy {
    /// 最大重试次数（不含首次尝试）
    #[builder(default = 5)]
    pub max_retries: u32,
    /// 第一次重试前的等待时间
    #[builder(default = Duration::from_secs(2))]
    pub first_delay: Duration,
    /// 退避倍数
    #[builder(default = 2.0)]
    pub factor: f64,
    /// 单次等待上限
    #[builder(default = Duration::from_secs(60))]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// 重试失败的结果
#[derive(Debug, Clone, Error)]
pub enum RetryError {
    /// 瞬时错误重试耗尽
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: BrokerError },
    /// 非瞬时错误，未重试
    #[error(transparent)]
    Permanent(BrokerError),
}

impl RetryError {
    pub fn into_event_bus_error(self, operation: &'static str) -> EventBusError {
        match self {
            RetryError::Exhausted { attempts, last } => EventBusError::RetryExhausted {
                operation,
                attempts,
                source: last,
            },
            RetryError::Permanent(err) => EventBusError::Broker(err),
        }
    }
}

impl RetryPolicy {
    /// 第 `retry` 次重试（从 1 开始）前的等待时间
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.first_delay.as_secs_f64() * self.factor.powi(exp);

        if !secs.is_finite() || secs < 0.0 || secs > self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// 执行 `op`，对瞬时错误按策略退避重试
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut op: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BrokerResult<T>>,
    {
        let mut retry = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_transient() => return Err(RetryError::Permanent(err)),
                Err(err) if retry >= self.max_retries => {
                    return Err(RetryError::Exhausted {
                        attempts: retry + 1,
                        last: err,
                    });
                }
                Err(err) => {
                    retry += 1;
                    let delay = self.delay_for(retry);
                    tracing::warn!(
                        operation,
                        retry,
                        max_retries = self.max_retries,
                        ?delay,
                        error = %err,
                        "transient broker error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
