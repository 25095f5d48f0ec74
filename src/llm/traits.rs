//! 模型适配器抽象
//!
//! 所有后端（OpenAI 兼容 / Ollama / Mock）实现 ModelAdapter：给定渲染好的 prompt，返回原始文本或失败。
//! 供应商身份只是配置，韧性逻辑中不出现按供应商分支。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 单次调用的 token 用量（供应商返回，或由调用方估算）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// 模型返回：原始文本 + 可选用量
#[derive(Debug, Clone, Default)]
pub struct ModelResponse {
    pub content: String,
    pub usage: Option<TokenUsage>,
}

impl ModelResponse {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// 适配器层错误（网络、鉴权、限流等）
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    #[error("Request timed out")]
    Timeout,

    #[error("Rate limited (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("API error: {0}")]
    ApiError(String),

    /// 供应商已计费但未给出可用内容（空回复、截断等）
    #[error("Incomplete completion: {reason}")]
    Incomplete {
        reason: String,
        usage: Option<TokenUsage>,
    },
}

impl LlmError {
    /// 按错误文本特征归类（供应商 SDK 只给出字符串时使用）
    pub fn from_provider_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if lower.contains("429") || lower.contains("rate limit") || lower.contains("too many requests") {
            LlmError::RateLimited {
                retry_after_ms: None,
            }
        } else if lower.contains("timed out") || lower.contains("timeout") {
            LlmError::Timeout
        } else if lower.contains("401")
            || lower.contains("403")
            || lower.contains("invalid api key")
            || lower.contains("incorrect api key")
            || lower.contains("unauthorized")
        {
            LlmError::Auth(message)
        } else if lower.contains("error sending request")
            || lower.contains("connection")
            || lower.contains("dns")
        {
            LlmError::Network(message)
        } else if lower.contains("502") || lower.contains("503") || lower.contains("overloaded") {
            LlmError::Unavailable(message)
        } else {
            LlmError::ApiError(message)
        }
    }

    /// 网络 / 超时 / 限流 / 暂不可用：可重试
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::Timeout
                | LlmError::RateLimited { .. }
                | LlmError::Network(_)
                | LlmError::Unavailable(_)
        )
    }

    /// 失败但已产生的部分用量
    pub fn partial_usage(&self) -> Option<TokenUsage> {
        match self {
            LlmError::Incomplete { usage, .. } => *usage,
            _ => None,
        }
    }
}

/// 模型适配器 trait：一个供应商一个实现，启动时按配置选择
#[async_trait]
pub trait ModelAdapter: Send + Sync {
    /// 供应商名（openai / deepseek / ollama / mock）
    fn provider(&self) -> &str;

    /// 模型名，用于计价与日志
    fn model(&self) -> &str;

    async fn invoke(&self, prompt: &str) -> Result<ModelResponse, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rate_limit_message() {
        let err = LlmError::from_provider_message("HTTP 429 Too Many Requests");
        assert!(matches!(err, LlmError::RateLimited { .. }));
        assert!(err.is_transient());
    }

    #[test]
    fn test_classify_auth_message() {
        let err = LlmError::from_provider_message("Incorrect API key provided: sk-***");
        assert!(matches!(err, LlmError::Auth(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_classify_unknown_message() {
        let err = LlmError::from_provider_message("model does not support tools");
        assert!(matches!(err, LlmError::ApiError(_)));
    }

    #[test]
    fn test_partial_usage_only_on_incomplete() {
        let err = LlmError::Incomplete {
            reason: "empty completion".into(),
            usage: Some(TokenUsage::new(12, 0)),
        };
        assert_eq!(err.partial_usage(), Some(TokenUsage::new(12, 0)));
        assert_eq!(LlmError::Timeout.partial_usage(), None);
    }
}
