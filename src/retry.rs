//! 统一重试策略
//!
//! 所有外部调用点使用同一策略：只重试可重试错误，延迟为 base × factor^attempt。

use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::context::CorrelationContext;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            backoff_factor: config.backoff_factor,
        }
    }

    /// 不等待的策略（测试用）
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            backoff_factor: 1.0,
        }
    }

    /// 第 attempt 次失败后（从 0 开始）的等待时间
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.mul_f64(self.backoff_factor.powi(attempt as i32))
    }

    /// 执行操作，闭包参数为当前尝试序号（从 0 开始）
    pub async fn run<T, F, Fut>(&self, op: &str, ctx: &CorrelationContext, mut f: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match f(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        op,
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        correlation_id = %ctx.correlation_id,
                        error = %e,
                        "Retryable error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        tracing::error!(
                            op,
                            attempts = attempt + 1,
                            correlation_id = %ctx.correlation_id,
                            error = %e,
                            "Retry budget exhausted"
                        );
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_is_exponential() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
        };
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let ctx = CorrelationContext::new();
        let result = RetryPolicy::immediate(3)
            .run("op", &ctx, move |_| async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(AppError::remote("ThrottlingException", "slow down"))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let ctx = CorrelationContext::new();
        let result: Result<()> = RetryPolicy::immediate(3)
            .run("op", &ctx, move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(AppError::Throttled("sts".into()))
            })
            .await;

        assert!(matches!(result, Err(AppError::Throttled(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_short_circuits() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let ctx = CorrelationContext::new();
        let result: Result<()> = RetryPolicy::immediate(5)
            .run("op", &ctx, move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(AppError::AccessDenied("no trust".into()))
            })
            .await;

        assert!(matches!(result, Err(AppError::AccessDenied(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
