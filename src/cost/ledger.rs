//! 成本账本：记录每次模型调用的用量与费用，执行告警阈值与日预算硬上限
//!
//! 跨日检测是惰性的：每次 record / get_daily_cost 在锁内读取时钟，日期晚于「上次重置日期」
//! 时先把当日累计清零。日期只向前推进；所有累计在同一把锁内更新，并发记录不会丢失。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::config::CostSection;
use crate::core::PipelineError;
use crate::cost::{Clock, PriceTable, SystemClock};
use crate::llm::TokenUsage;

/// 一次待记录的用量
#[derive(Debug, Clone)]
pub struct UsageInput {
    /// "provider/model" 或裸模型名
    pub provider_model: String,
    pub usage: TokenUsage,
    pub operation_type: String,
    pub metadata: Option<serde_json::Value>,
}

impl UsageInput {
    pub fn new(
        provider_model: impl Into<String>,
        usage: TokenUsage,
        operation_type: impl Into<String>,
    ) -> Self {
        Self {
            provider_model: provider_model.into(),
            usage,
            operation_type: operation_type.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// 账本中的一条记录，创建后不再修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub provider_model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    pub timestamp: DateTime<Utc>,
    pub operation_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// 统计时间窗口 [start, end)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CostStatistics {
    pub total_cost: f64,
    pub total_operations: usize,
    pub cost_by_model: HashMap<String, f64>,
    pub cost_by_operation: HashMap<String, f64>,
    pub average_cost_per_operation: f64,
}

#[derive(Debug)]
struct LedgerState {
    records: Vec<UsageRecord>,
    daily_total: f64,
    day: NaiveDate,
}

pub struct CostLedger {
    prices: PriceTable,
    warning_threshold: f64,
    daily_limit: Option<f64>,
    clock: Arc<dyn Clock>,
    state: Mutex<LedgerState>,
}

impl CostLedger {
    pub fn new(
        prices: PriceTable,
        warning_threshold: f64,
        daily_limit: Option<f64>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let day = clock.now().date_naive();
        Self {
            prices,
            warning_threshold,
            daily_limit,
            clock,
            state: Mutex::new(LedgerState {
                records: Vec::new(),
                daily_total: 0.0,
                day,
            }),
        }
    }

    pub fn from_config(cfg: &CostSection) -> Self {
        Self::new(
            PriceTable::with_overrides(&cfg.pricing),
            cfg.warning_threshold,
            cfg.daily_limit,
            Arc::new(SystemClock),
        )
    }

    pub fn daily_limit(&self) -> Option<f64> {
        self.daily_limit
    }

    pub fn prices(&self) -> &PriceTable {
        &self.prices
    }

    /// 记录一次用量；记录总会追加，随后若当日累计达到硬上限则返回 BudgetExceeded
    ///
    /// 当日累计每次达到告警阈值都会发出 warn 事件，去重交给下游告警。
    pub fn record(&self, input: UsageInput) -> Result<UsageRecord, PipelineError> {
        let cost = self.prices.cost(&input.provider_model, input.usage);

        let mut state = self.lock();
        let now = self.clock.now();
        Self::roll_forward(&mut state, now);

        let record = UsageRecord {
            provider_model: input.provider_model,
            input_tokens: input.usage.input_tokens,
            output_tokens: input.usage.output_tokens,
            cost,
            timestamp: now,
            operation_type: input.operation_type,
            metadata: input.metadata,
        };
        state.records.push(record.clone());
        // 时钟回拨得到的旧日期只进历史，不计入当日累计
        if now.date_naive() == state.day {
            state.daily_total += cost;
        }
        let daily = state.daily_total;
        drop(state);

        tracing::debug!(
            model = %record.provider_model,
            operation = %record.operation_type,
            input_tokens = record.input_tokens,
            output_tokens = record.output_tokens,
            cost = record.cost,
            daily_cost = daily,
            "usage recorded"
        );

        if daily >= self.warning_threshold {
            tracing::warn!(
                daily_cost = daily,
                threshold = self.warning_threshold,
                "daily cost reached warning threshold"
            );
        }

        if let Some(limit) = self.daily_limit {
            if daily >= limit {
                tracing::error!(daily_cost = daily, limit, "daily budget exceeded");
                return Err(PipelineError::BudgetExceeded {
                    spent: daily,
                    limit,
                });
            }
        }

        Ok(record)
    }

    /// 调用模型前的预检：当日累计已达上限则直接失败
    pub fn ensure_within_budget(&self) -> Result<(), PipelineError> {
        let Some(limit) = self.daily_limit else {
            return Ok(());
        };
        let spent = self.get_daily_cost();
        if spent >= limit {
            Err(PipelineError::BudgetExceeded { spent, limit })
        } else {
            Ok(())
        }
    }

    pub fn get_daily_cost(&self) -> f64 {
        let mut state = self.lock();
        Self::roll_forward(&mut state, self.clock.now());
        state.daily_total
    }

    /// 距当日上限的余额；未设上限时为 None
    pub fn daily_remaining(&self) -> Option<f64> {
        let limit = self.daily_limit?;
        Some((limit - self.get_daily_cost()).max(0.0))
    }

    pub fn records(&self) -> Vec<UsageRecord> {
        self.lock().records.clone()
    }

    pub fn get_statistics(&self, window: Option<TimeWindow>) -> CostStatistics {
        let state = self.lock();
        let mut stats = CostStatistics::default();

        for r in state
            .records
            .iter()
            .filter(|r| window.map_or(true, |w| w.contains(r.timestamp)))
        {
            stats.total_cost += r.cost;
            stats.total_operations += 1;
            *stats
                .cost_by_model
                .entry(r.provider_model.clone())
                .or_insert(0.0) += r.cost;
            *stats
                .cost_by_operation
                .entry(r.operation_type.clone())
                .or_insert(0.0) += r.cost;
        }

        if stats.total_operations > 0 {
            stats.average_cost_per_operation = stats.total_cost / stats.total_operations as f64;
        }
        stats
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn roll_forward(state: &mut LedgerState, now: DateTime<Utc>) {
        let today = now.date_naive();
        if today > state.day {
            tracing::info!(
                previous_day = %state.day,
                previous_total = state.daily_total,
                "daily cost counter reset"
            );
            state.day = today;
            state.daily_total = 0.0;
        }
    }
}

impl std::fmt::Debug for CostLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CostLedger")
            .field("warning_threshold", &self.warning_threshold)
            .field("daily_limit", &self.daily_limit)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelPricing;
    use crate::cost::ManualClock;
    use chrono::{Duration, TimeZone};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::Layer;

    /// 按顺序给出预设时间，用尽后停在最后一个
    struct ScriptedClock(Mutex<VecDeque<DateTime<Utc>>>);

    impl Clock for ScriptedClock {
        fn now(&self) -> DateTime<Utc> {
            let mut times = self.0.lock().unwrap();
            if times.len() > 1 {
                times.pop_front().unwrap()
            } else {
                *times.front().unwrap()
            }
        }
    }

    /// 统计 warn 级事件
    struct WarnCounter(Arc<AtomicUsize>);

    impl<S: tracing::Subscriber> Layer<S> for WarnCounter {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            if *event.metadata().level() == tracing::Level::WARN {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    fn priced_table() -> PriceTable {
        let mut table = PriceTable::default();
        table.set(
            "priced-model",
            ModelPricing {
                input_per_1k: 0.01,
                output_per_1k: 0.03,
            },
        );
        table
    }

    fn ledger(warn: f64, limit: Option<f64>) -> (CostLedger, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 23, 0, 0).unwrap(),
        ));
        (CostLedger::new(priced_table(), warn, limit, clock.clone()), clock)
    }

    fn usage(i: u64, o: u64) -> UsageInput {
        UsageInput::new("priced-model", TokenUsage::new(i, o), "lead_scoring")
    }

    #[test]
    fn test_record_cost_formula() {
        let (ledger, _) = ledger(100.0, None);
        let rec = ledger.record(usage(1000, 1000)).unwrap();
        assert!(close(rec.cost, 0.04));
        assert_eq!(rec.operation_type, "lead_scoring");
    }

    #[test]
    fn test_record_is_additive() {
        let (ledger, _) = ledger(100.0, None);
        let single = ledger.prices().cost("priced-model", TokenUsage::new(100, 50));
        ledger.record(usage(100, 50)).unwrap();
        ledger.record(usage(100, 50)).unwrap();

        let stats = ledger.get_statistics(None);
        assert_eq!(stats.total_operations, 2);
        assert!(close(stats.total_cost, 2.0 * single));
        assert!(close(stats.average_cost_per_operation, single));
        assert!(close(stats.cost_by_model["priced-model"], 2.0 * single));
        assert!(close(stats.cost_by_operation["lead_scoring"], 2.0 * single));
    }

    #[test]
    fn test_day_rollover_resets_daily_but_keeps_history() {
        let (ledger, clock) = ledger(100.0, None);
        let day_one = clock.now();
        ledger.record(usage(1000, 1000)).unwrap();
        assert!(close(ledger.get_daily_cost(), 0.04));

        clock.advance(Duration::hours(2));
        assert_eq!(ledger.get_daily_cost(), 0.0);

        let old_window = TimeWindow::new(day_one - Duration::hours(1), day_one + Duration::hours(1));
        let stats = ledger.get_statistics(Some(old_window));
        assert_eq!(stats.total_operations, 1);
        assert!(close(stats.total_cost, 0.04));
        assert_eq!(ledger.records().len(), 1);
    }

    #[test]
    fn test_daily_limit_fails_after_recording() {
        let (ledger, _) = ledger(0.05, Some(0.1));
        ledger.record(usage(1000, 1000)).unwrap();
        ledger.record(usage(1000, 1000)).unwrap();
        assert!(ledger.ensure_within_budget().is_ok());
        assert!(close(ledger.daily_remaining().unwrap(), 0.02));

        let err = ledger.record(usage(1000, 1000)).unwrap_err();
        assert!(matches!(err, PipelineError::BudgetExceeded { limit, .. } if limit == 0.1));
        // 超限的那一次也已入账
        assert_eq!(ledger.records().len(), 3);
        assert!(ledger.ensure_within_budget().is_err());
        assert_eq!(ledger.daily_remaining(), Some(0.0));
    }

    #[test]
    fn test_budget_recovers_next_day() {
        let (ledger, clock) = ledger(100.0, Some(0.04));
        assert!(ledger.record(usage(1000, 1000)).is_err());
        clock.advance(Duration::hours(1));
        assert!(ledger.ensure_within_budget().is_ok());
    }

    #[test]
    fn test_no_limit_never_fails() {
        let (ledger, _) = ledger(0.0, None);
        for _ in 0..5 {
            ledger.record(usage(10_000, 10_000)).unwrap();
        }
        assert_eq!(ledger.daily_remaining(), None);
        assert!(ledger.ensure_within_budget().is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_records_are_not_lost() {
        let (ledger, _) = ledger(1_000.0, None);
        let ledger = Arc::new(ledger);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    ledger.record(usage(1000, 0)).unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let stats = ledger.get_statistics(None);
        assert_eq!(stats.total_operations, 400);
        assert!(close(ledger.get_daily_cost(), 400.0 * 0.01));
    }

    #[test]
    fn test_stale_timestamp_does_not_roll_day_back() {
        let day1 = |h, m, s| Utc.with_ymd_and_hms(2024, 3, 1, h, m, s).unwrap();
        let day2 = |h, m, s| Utc.with_ymd_and_hms(2024, 3, 2, h, m, s).unwrap();
        let clock = Arc::new(ScriptedClock(Mutex::new(VecDeque::from(vec![
            day1(23, 0, 0),
            day2(0, 0, 1),
            day1(23, 59, 59),
            day2(0, 0, 2),
        ]))));
        let ledger = CostLedger::new(priced_table(), 100.0, Some(1.0), clock);

        ledger.record(usage(1000, 1000)).unwrap();
        // 先于上一条取到时间的调用，时间戳落在前一天
        let stale = ledger.record(usage(1000, 1000)).unwrap();
        assert_eq!(stale.timestamp, day1(23, 59, 59));

        assert!(close(ledger.get_daily_cost(), 0.04));
        assert_eq!(ledger.records().len(), 2);
    }

    #[test]
    fn test_warning_emitted_on_each_record_over_threshold() {
        let warnings = Arc::new(AtomicUsize::new(0));
        let subscriber =
            tracing_subscriber::registry().with(WarnCounter(warnings.clone()));

        tracing::subscriber::with_default(subscriber, || {
            let (ledger, clock) = ledger(0.05, None);
            ledger.record(usage(1000, 1000)).unwrap();
            assert_eq!(warnings.load(Ordering::SeqCst), 0);

            ledger.record(usage(1000, 1000)).unwrap();
            ledger.record(usage(1000, 1000)).unwrap();
            assert_eq!(warnings.load(Ordering::SeqCst), 2);

            // 跨日后累计清零，低于阈值不再告警
            clock.advance(Duration::hours(2));
            ledger.record(usage(1000, 1000)).unwrap();
            assert_eq!(warnings.load(Ordering::SeqCst), 2);
            ledger.record(usage(1000, 1000)).unwrap();
            assert_eq!(warnings.load(Ordering::SeqCst), 3);
        });
    }
}
