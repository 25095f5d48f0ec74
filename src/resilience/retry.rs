//! 重试策略：指数退避 + 有界抖动 + 可重试判定

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::core::PipelineError;

/// 抖动上限：基础延迟的 10%
pub const MAX_JITTER_RATIO: f64 = 0.1;

/// 自定义可重试判定
pub type RetryPredicate = Arc<dyn Fn(&PipelineError) -> bool + Send + Sync>;

/// 重试策略；每个 ResilienceGovernor 持有一份，可按调用覆盖
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    retryable: Option<RetryPredicate>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("custom_predicate", &self.retryable.is_some())
            .finish()
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            backoff_multiplier: 2.0,
            retryable: None,
        }
    }

    /// 只尝试一次
    pub fn no_retry() -> Self {
        Self::new(1)
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = if multiplier.is_finite() && multiplier >= 1.0 {
            multiplier
        } else {
            1.0
        };
        self
    }

    pub fn with_retryable<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&PipelineError) -> bool + Send + Sync + 'static,
    {
        self.retryable = Some(Arc::new(predicate));
        self
    }

    pub fn is_retryable(&self, err: &PipelineError) -> bool {
        match &self.retryable {
            Some(predicate) => predicate(err),
            None => err.is_retryable(),
        }
    }

    /// 第 attempt 次（从 1 开始）失败后的基础延迟：initial * multiplier^(attempt-1)
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exp);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// 加上抖动后的延迟：min(base + base * jitter_ratio, max_delay)，jitter_ratio 截断到 [0, 0.1]
    pub fn delay_with_jitter(&self, attempt: u32, jitter_ratio: f64) -> Duration {
        let base = self.base_delay(attempt);
        let ratio = jitter_ratio.clamp(0.0, MAX_JITTER_RATIO);
        let jittered = base + base.mul_f64(ratio);
        jittered.min(self.max_delay)
    }

    /// 实际使用的退避：随机抖动，避免并发任务同步重试
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let ratio = rand::thread_rng().gen_range(0.0..=MAX_JITTER_RATIO);
        self.delay_with_jitter(attempt, ratio)
    }
}
