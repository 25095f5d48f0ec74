//! 任务与统一结果信封
//!
//! Task 创建后不可变；AgentResult 每个任务恰好产生一次，成功与失败同形。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{ErrorKind, ResultSchema};

/// 进度检查点（0-100，仅供参考，不影响执行）
pub const PROGRESS_START: u8 = 10;
pub const PROGRESS_MODEL_DONE: u8 = 70;
pub const PROGRESS_COMPLETE: u8 = 100;

/// 进度上报接收端（由外部队列实现）
pub trait ProgressSink: Send + Sync {
    fn report(&self, correlation_id: Option<&str>, percent: u8);
}

/// 不上报
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn report(&self, _correlation_id: Option<&str>, _percent: u8) {}
}

/// 绑定 correlation id 的上报句柄
#[derive(Clone, Default)]
pub struct ProgressHandle {
    sink: Option<Arc<dyn ProgressSink>>,
    correlation_id: Option<String>,
}

impl ProgressHandle {
    pub fn new(sink: Arc<dyn ProgressSink>, correlation_id: Option<String>) -> Self {
        Self {
            sink: Some(sink),
            correlation_id,
        }
    }

    pub fn report(&self, percent: u8) {
        if let Some(sink) = &self.sink {
            sink.report(self.correlation_id.as_deref(), percent.min(100));
        }
    }
}

impl fmt::Debug for ProgressHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressHandle")
            .field("enabled", &self.sink.is_some())
            .field("correlation_id", &self.correlation_id)
            .finish()
    }
}

/// 单个工作单元：类型化输入 + 可选期望结果结构 + 可选上下文
pub struct Task<I, R> {
    pub id: String,
    pub description: String,
    pub input: I,
    pub expected_schema: Option<Arc<dyn ResultSchema<R>>>,
    pub context: HashMap<String, String>,
    pub progress: ProgressHandle,
}

impl<I, R> Task<I, R> {
    pub fn new(description: impl Into<String>, input: I) -> Self {
        Self {
            id: format!("task_{}", uuid::Uuid::new_v4()),
            description: description.into(),
            input,
            expected_schema: None,
            context: HashMap::new(),
            progress: ProgressHandle::default(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_schema(mut self, schema: Arc<dyn ResultSchema<R>>) -> Self {
        self.expected_schema = Some(schema);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_progress(mut self, progress: ProgressHandle) -> Self {
        self.progress = progress;
        self
    }
}

impl<I: fmt::Debug, R> fmt::Debug for Task<I, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("description", &self.description)
            .field("input", &self.input)
            .field(
                "expected_schema",
                &self.expected_schema.as_ref().map(|s| s.name().to_string()),
            )
            .field("context", &self.context)
            .finish()
    }
}

/// 统一的成功/失败信封
///
/// success 为 true 时 output 必有、error 必无；为 false 时相反，confidence 为 0。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResult<R> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<R>,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
}

impl<R> AgentResult<R> {
    pub fn succeeded(output: R, confidence: f64, reasoning: Option<String>, duration_ms: u64) -> Self {
        Self {
            success: true,
            output: Some(output),
            confidence: clamp_confidence(confidence),
            reasoning,
            error: None,
            error_kind: None,
            timestamp: Utc::now(),
            duration_ms,
        }
    }

    pub fn failed(error: impl Into<String>, kind: ErrorKind, duration_ms: u64) -> Self {
        Self {
            success: false,
            output: None,
            confidence: 0.0,
            reasoning: None,
            error: Some(error.into()),
            error_kind: Some(kind),
            timestamp: Utc::now(),
            duration_ms,
        }
    }

    /// 转换输出类型（如序列化为 serde_json::Value），信封字段不变
    pub fn map_output<U>(self, f: impl FnOnce(R) -> U) -> AgentResult<U> {
        AgentResult {
            success: self.success,
            output: self.output.map(f),
            confidence: self.confidence,
            reasoning: self.reasoning,
            error: self.error,
            error_kind: self.error_kind,
            timestamp: self.timestamp,
            duration_ms: self.duration_ms,
        }
    }
}

/// 非有限值按 0 处理，其余截断到 [0, 1]
pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}
