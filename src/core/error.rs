//! 管线错误类型与分类
//!
//! ErrorKind 决定：是否重试、是否计入熔断、是否走降级合成；同时作为日志中稳定的 error_kind 字段。

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::LlmError;
use crate::parse::ParseError;

/// 管线运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Attempt timed out after {0} ms")]
    Timeout(u64),

    /// 显式的可重试标记
    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Circuit breaker '{0}' is open")]
    CircuitOpen(String),

    #[error("Daily budget exceeded: spent {spent:.4} of {limit:.4}")]
    BudgetExceeded { spent: f64, limit: f64 },

    #[error("Invalid task input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("Result failed schema '{schema}': {issues}")]
    SchemaViolation { schema: String, issues: String },

    #[error("Retrieval failed: {0}")]
    Retrieval(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Task panicked: {0}")]
    Panicked(String),
}

/// 错误大类（对应重试 / 熔断 / 降级策略）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 限流、超时、连接重置：按策略重试并计入熔断
    Transient,
    /// 任务输入或结果不合法：立即失败，不重试，不影响熔断
    Input,
    /// 模型有回复但结构不合法：不重试，直接降级合成
    Parse,
    /// 超出日预算：快速失败，单独上报
    Budget,
    CircuitOpen,
    /// 供应商非瞬时错误（鉴权、API 拒绝等）
    Provider,
    Config,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Input => "input",
            ErrorKind::Parse => "parse",
            ErrorKind::Budget => "budget",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Provider => "provider",
            ErrorKind::Config => "config",
            ErrorKind::Internal => "internal",
        }
    }

    /// 预算、配置、内部错误不属于「降级但可用」，调用方应告警
    pub fn needs_alert(&self) -> bool {
        matches!(self, ErrorKind::Budget | ErrorKind::Config | ErrorKind::Internal)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 供应商只给出文本时识别瞬时故障的特征串
const TRANSIENT_SIGNATURES: &[&str] = &[
    "429",
    "rate limit",
    "timed out",
    "timeout",
    "connection reset",
    "econnreset",
    "503",
    "overloaded",
    "temporarily unavailable",
];

fn matches_transient_signature(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSIENT_SIGNATURES.iter().any(|s| lower.contains(s))
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Llm(e) if e.is_transient() => ErrorKind::Transient,
            PipelineError::Llm(LlmError::ApiError(msg)) if matches_transient_signature(msg) => {
                ErrorKind::Transient
            }
            PipelineError::Llm(_) => ErrorKind::Provider,
            PipelineError::Timeout(_) | PipelineError::Transient(_) => ErrorKind::Transient,
            PipelineError::CircuitOpen(_) => ErrorKind::CircuitOpen,
            PipelineError::BudgetExceeded { .. } => ErrorKind::Budget,
            PipelineError::InvalidInput(_) | PipelineError::SchemaViolation { .. } => {
                ErrorKind::Input
            }
            PipelineError::Parse(_) => ErrorKind::Parse,
            PipelineError::Retrieval(_) => ErrorKind::Provider,
            PipelineError::Config(_) => ErrorKind::Config,
            PipelineError::Panicked(_) => ErrorKind::Internal,
        }
    }

    /// 默认的可重试判定：显式标记、超时、限流、网络类特征
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// 只有瞬时故障与供应商故障推动熔断器；输入、解析、预算错误不计入
    pub fn counts_toward_circuit(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient | ErrorKind::Provider)
    }
}
