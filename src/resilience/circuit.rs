//! 熔断器：CLOSED → OPEN → HALF_OPEN
//!
//! 连续失败达到阈值后打开，冷却期内直接拒绝；冷却结束后只放行一个探测请求，
//! 探测成功则关闭并清零计数，失败则重新打开并重新计时。
//! 探测结果未上报就被丢弃时（外部取消），由 CircuitGuard 退回 OPEN，下一个调用成为新的探测。
//! 状态与计数均为原子量，状态迁移用 compare-and-swap，可被并发任务共享。

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::core::PipelineError;

const NEVER: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl CircuitState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

/// 放行凭证：普通调用或半开探测
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    Normal,
    Probe,
}

/// 只读快照
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    /// 距上次失败的时长；从未失败为 None
    pub since_last_failure: Option<Duration>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    origin: Instant,
    state: AtomicU8,
    failure_count: AtomicU32,
    last_failure_ms: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config: CircuitBreakerConfig {
                failure_threshold: config.failure_threshold.max(1),
                reset_timeout: config.reset_timeout,
            },
            origin: Instant::now(),
            state: AtomicU8::new(CircuitState::Closed as u8),
            failure_count: AtomicU32::new(0),
            last_failure_ms: AtomicU64::new(NEVER),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let last = self.last_failure_ms.load(Ordering::SeqCst);
        CircuitSnapshot {
            state: self.state(),
            failure_count: self.failure_count.load(Ordering::SeqCst),
            since_last_failure: (last != NEVER)
                .then(|| Duration::from_millis(self.now_ms().saturating_sub(last))),
        }
    }

    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn cooled_down(&self, since_ms: u64) -> bool {
        since_ms == NEVER
            || self.now_ms().saturating_sub(since_ms) >= self.config.reset_timeout.as_millis() as u64
    }

    fn transition(&self, from: CircuitState, to: CircuitState) -> bool {
        let swapped = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if swapped {
            let failure_count = self.failure_count.load(Ordering::SeqCst);
            if to == CircuitState::Open {
                tracing::warn!(
                    governor = %self.name,
                    from = from.as_str(),
                    to = to.as_str(),
                    failure_count,
                    "circuit breaker transition"
                );
            } else {
                tracing::info!(
                    governor = %self.name,
                    from = from.as_str(),
                    to = to.as_str(),
                    failure_count,
                    "circuit breaker transition"
                );
            }
        }
        swapped
    }

    /// 调用前检查；OPEN 或探测进行中时返回 CircuitOpen，不执行被保护的操作
    pub fn try_acquire(&self) -> Result<Permit, PipelineError> {
        loop {
            match self.state() {
                CircuitState::Closed => return Ok(Permit::Normal),
                CircuitState::Open => {
                    if !self.cooled_down(self.last_failure_ms.load(Ordering::SeqCst)) {
                        return Err(PipelineError::CircuitOpen(self.name.clone()));
                    }
                    if self.transition(CircuitState::Open, CircuitState::HalfOpen) {
                        return Ok(Permit::Probe);
                    }
                    // 另一个调用方抢先完成迁移，重新读取状态
                }
                // 探测进行中
                CircuitState::HalfOpen => {
                    return Err(PipelineError::CircuitOpen(self.name.clone()))
                }
            }
        }
    }

    /// 与 try_acquire 相同，但返回的凭证在未上报结果时被丢弃会释放探测
    pub fn acquire(&self) -> Result<CircuitGuard<'_>, PipelineError> {
        let permit = self.try_acquire()?;
        Ok(CircuitGuard {
            breaker: self,
            permit,
            settled: false,
        })
    }

    pub fn on_success(&self, permit: Permit) {
        self.failure_count.store(0, Ordering::SeqCst);
        if permit == Permit::Probe {
            self.transition(CircuitState::HalfOpen, CircuitState::Closed);
        }
    }

    pub fn on_failure(&self, permit: Permit) {
        self.last_failure_ms.store(self.now_ms(), Ordering::SeqCst);
        let count = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;

        if permit == Permit::Probe {
            self.transition(CircuitState::HalfOpen, CircuitState::Open);
            return;
        }
        if count >= self.config.failure_threshold {
            self.transition(CircuitState::Closed, CircuitState::Open);
        }
    }

    /// 不计入熔断的错误（输入、预算等）：探测视为依赖已响应
    pub fn on_ignored(&self, permit: Permit) {
        if permit == Permit::Probe {
            self.on_success(permit);
        }
    }

    /// 探测没有结果：退回 OPEN，不更新失败时间，冷却已过，下一个调用直接成为探测
    fn abandon_probe(&self) {
        if self.transition(CircuitState::HalfOpen, CircuitState::Open) {
            tracing::debug!(governor = %self.name, "probe abandoned");
        }
    }
}

/// 一次放行；success / failure / ignored 消费凭证并上报结果
#[derive(Debug)]
pub struct CircuitGuard<'a> {
    breaker: &'a CircuitBreaker,
    permit: Permit,
    settled: bool,
}

impl CircuitGuard<'_> {
    pub fn permit(&self) -> Permit {
        self.permit
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.permit);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.permit);
    }

    pub fn ignored(mut self) {
        self.settled = true;
        self.breaker.on_ignored(self.permit);
    }
}

impl Drop for CircuitGuard<'_> {
    fn drop(&mut self) {
        if !self.settled && self.permit == Permit::Probe {
            self.breaker.abandon_probe();
        }
    }
}
