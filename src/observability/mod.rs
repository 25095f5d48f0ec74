//! 可观测性：tracing 订阅器初始化
//!
//! 事件字段约定：task_id / duration_ms / error_kind（任务）、governor / attempt / delay_ms（重试）、
//! governor / from / to / failure_count（熔断转换）、daily_cost / threshold / limit（成本阈值）。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 默认 info，可通过 RUST_LOG 覆盖；日志写到 stderr，stdout 留给结果输出
pub fn init() {
    init_with("info");
}

/// 重复初始化（如测试中）时静默忽略
pub fn init_with(default_directive: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
