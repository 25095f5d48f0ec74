//! ResilienceGovernor：超时 ⊂ 重试 ⊂ 熔断
//!
//! 每次尝试前检查熔断器；每次尝试单独计时；重试循环包住整个序列。
//! 一个实例对应一个（供应商, 操作类别），熔断状态只在本实例的执行路径中修改。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::core::PipelineError;
use crate::resilience::{with_timeout, CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, RetryPolicy};

#[derive(Debug)]
pub struct ResilienceGovernor {
    name: String,
    policy: RetryPolicy,
    attempt_timeout: Duration,
    breaker: CircuitBreaker,
}

impl ResilienceGovernor {
    pub fn new(
        name: impl Into<String>,
        policy: RetryPolicy,
        attempt_timeout: Duration,
        breaker: CircuitBreakerConfig,
    ) -> Self {
        let name = name.into();
        Self {
            breaker: CircuitBreaker::new(name.clone(), breaker),
            name,
            policy,
            attempt_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// 熔断状态只读视图
    pub fn circuit(&self) -> CircuitSnapshot {
        self.breaker.snapshot()
    }

    pub async fn run<T, F, Fut>(&self, op: F) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        self.run_with(None, op).await
    }

    /// 以指定策略运行（None 使用实例策略）；重试耗尽返回最后一次错误，熔断打开立即失败
    ///
    /// 重试途中熔断器打开时，返回操作本身的最后一次错误而不是 CircuitOpen。
    pub async fn run_with<T, F, Fut>(
        &self,
        policy: Option<&RetryPolicy>,
        mut op: F,
    ) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let policy = policy.unwrap_or(&self.policy);
        let mut attempt: u32 = 1;
        let mut last_err: Option<PipelineError> = None;

        loop {
            // guard 在本 future 被取消时随之丢弃，未完成的探测会被释放
            let guard = match self.breaker.acquire() {
                Ok(guard) => guard,
                Err(open) => {
                    let Some(err) = last_err else {
                        return Err(open);
                    };
                    tracing::debug!(
                        governor = %self.name,
                        attempt,
                        error_kind = err.kind().as_str(),
                        "circuit opened during retries"
                    );
                    return Err(err);
                }
            };

            match with_timeout(self.attempt_timeout, op()).await {
                Ok(value) => {
                    guard.success();
                    return Ok(value);
                }
                Err(err) => {
                    if err.counts_toward_circuit() {
                        guard.failure();
                    } else {
                        guard.ignored();
                    }

                    if attempt >= policy.max_attempts || !policy.is_retryable(&err) {
                        tracing::debug!(
                            governor = %self.name,
                            attempt,
                            error_kind = err.kind().as_str(),
                            "giving up"
                        );
                        return Err(err);
                    }

                    let delay = policy.backoff_delay(attempt);
                    tracing::warn!(
                        governor = %self.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error_kind = err.kind().as_str(),
                        error = %err,
                        "retrying after failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    last_err = Some(err);
                }
            }
        }
    }
}

/// 高阶组合：把一个操作包装成受治理的操作，调用方无需感知重试与熔断
pub fn govern<T, F, Fut>(
    governor: Arc<ResilienceGovernor>,
    policy: Option<RetryPolicy>,
    op: F,
) -> impl Fn() -> BoxFuture<'static, Result<T, PipelineError>>
where
    T: Send + 'static,
    F: Fn() -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<T, PipelineError>> + Send + 'static,
{
    move || {
        let governor = governor.clone();
        let policy = policy.clone();
        let op = op.clone();
        async move { governor.run_with(policy.as_ref(), op).await }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;
    use crate::resilience::CircuitState;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    fn governor(max_attempts: u32, threshold: u32) -> ResilienceGovernor {
        ResilienceGovernor::new(
            "test:op",
            RetryPolicy::new(max_attempts)
                .with_initial_delay(Duration::from_millis(100))
                .with_max_delay(Duration::from_secs(2)),
            Duration::from_secs(1),
            CircuitBreakerConfig {
                failure_threshold: threshold,
                reset_timeout: Duration::from_secs(30),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_error_attempted_max_times() {
        let gov = governor(3, 100);
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = gov
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Err(PipelineError::Transient(format!("attempt {}", n))) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(PipelineError::Transient(msg)) => assert_eq!(msg, "attempt 3"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_returns_without_sleep() {
        let gov = governor(3, 100);
        let calls = AtomicUsize::new(0);
        let start = Instant::now();
        let result: Result<(), _> = gov
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(PipelineError::Llm(LlmError::Auth("bad key".into()))) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_on_later_attempt() {
        let gov = governor(3, 100);
        let calls = AtomicUsize::new(0);
        let start = Instant::now();
        let result = gov
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(PipelineError::Llm(LlmError::RateLimited { retry_after_ms: None }))
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), "ok");
        // 第一次退避：100ms + 至多 10% 抖动
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(100) && waited <= Duration::from_millis(110));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retried_per_attempt() {
        let gov = governor(2, 100);
        let calls = AtomicUsize::new(0);
        let result = gov
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                    }
                    Ok::<_, PipelineError>(n)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_skips_operation() {
        let gov = governor(1, 2);
        let calls = AtomicUsize::new(0);
        for _ in 0..2 {
            let _: Result<(), _> = gov
                .run(|| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(PipelineError::Transient("down".into())) }
                })
                .await;
        }
        assert_eq!(gov.circuit().state, CircuitState::Open);

        let result: Result<(), _> = gov
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;
        assert!(matches!(result, Err(PipelineError::CircuitOpen(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        tokio::time::advance(Duration::from_secs(30)).await;
        let result: Result<(), _> = gov
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(gov.circuit().state, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opening_mid_sequence_returns_last_error() {
        let gov = governor(5, 2);
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = gov
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Err(PipelineError::Transient(format!("down {}", n))) }
            })
            .await;
        match result {
            Err(PipelineError::Transient(msg)) => assert_eq!(msg, "down 2"),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(gov.circuit().state, CircuitState::Open);

        // 新的调用序列直接被熔断拒绝
        let result: Result<(), _> = gov.run(|| async { Ok(()) }).await;
        assert!(matches!(result, Err(PipelineError::CircuitOpen(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_probe_lets_next_call_probe() {
        let gov = governor(1, 1);
        let _: Result<(), _> = gov
            .run(|| async { Err(PipelineError::Transient("down".into())) })
            .await;
        assert_eq!(gov.circuit().state, CircuitState::Open);
        tokio::time::advance(Duration::from_secs(30)).await;

        // 探测在单次超时之前被外部取消
        let cancelled = tokio::time::timeout(
            Duration::from_millis(500),
            gov.run(|| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, PipelineError>(())
            }),
        )
        .await;
        assert!(cancelled.is_err());
        assert_eq!(gov.circuit().state, CircuitState::Open);

        let calls = AtomicUsize::new(0);
        let result = gov
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(gov.circuit().state, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_call_policy_override() {
        let gov = governor(3, 100);
        let calls = AtomicUsize::new(0);
        let once = RetryPolicy::no_retry();
        let _: Result<(), _> = gov
            .run_with(Some(&once), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(PipelineError::Timeout(5)) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_govern_wraps_operation() {
        let gov = Arc::new(governor(3, 100));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let governed = govern(gov, None, move || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(PipelineError::Transient("flaky".into()))
                } else {
                    Ok(n)
                }
            }
        });

        assert_eq!(governed().await.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
