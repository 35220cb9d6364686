//! 重试 / 退避策略
//!
//! 健康检查（固定间隔）和连通性探测（指数退避）共用同一套策略

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// 退避函数
#[derive(Clone, Debug, PartialEq)]
pub enum Backoff {
    /// 固定间隔
    Fixed(Duration),
    /// 指数退避：`initial * factor^(n-1)`，不超过 `max`
    Exponential {
        initial: Duration,
        factor: u32,
        max: Duration,
    },
}

/// 重试结果错误
#[derive(Debug, PartialEq)]
pub enum RetryError<E> {
    /// 尝试次数耗尽，携带最后一次错误
    Exhausted { attempts: u32, last: E },
    /// 被取消
    Cancelled,
}

/// 重试策略
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// 最多尝试次数（含第一次）
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Fixed(interval),
        }
    }

    pub fn exponential(max_attempts: u32, initial: Duration, max: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Exponential {
                initial,
                factor: 2,
                max,
            },
        }
    }

    /// 第 `attempt` 次失败后的等待时间（从 1 开始）
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match &self.backoff {
            Backoff::Fixed(interval) => *interval,
            Backoff::Exponential { initial, factor, max } => {
                let exp = attempt.saturating_sub(1).min(31);
                let multiplier = factor.saturating_pow(exp);
                initial.saturating_mul(multiplier).min(*max)
            }
        }
    }

    /// 所有等待时间之和（全部失败时的总耗时下限）
    pub fn total_delay(&self) -> Duration {
        (1..self.max_attempts).map(|n| self.delay_after(n)).sum()
    }

    /// 执行操作直到成功、次数耗尽或被取消
    ///
    /// `op` 接收当前尝试序号（从 1 开始）。只在两次尝试之间等待，
    /// 因此 N 次全部失败的耗时为 N-1 个间隔
    pub async fn run<T, E, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                result = op(attempt) => result,
            };

            match result {
                Ok(value) => return Ok(value),
                Err(last) if attempt >= self.max_attempts => {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last,
                    });
                }
                Err(_) => {
                    let delay = self.delay_after(attempt);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }
}
