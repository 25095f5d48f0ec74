//! Token 估算（供应商未返回用量时使用）

use crate::llm::TokenUsage;

/// Token 估算器（简单的字符计数近似）
pub struct TokenEstimator;

impl TokenEstimator {
    /// 英文约 4 字符/token，非 ASCII（中文等）约 1.5 字符/token；空文本为 0
    pub fn estimate(text: &str) -> u64 {
        let mut ascii_chars = 0u64;
        let mut non_ascii_chars = 0u64;

        for c in text.chars() {
            if c.is_ascii() {
                ascii_chars += 1;
            } else {
                non_ascii_chars += 1;
            }
        }

        if ascii_chars + non_ascii_chars == 0 {
            return 0;
        }

        let tokens = ascii_chars / 4 + (non_ascii_chars as f64 / 1.5).ceil() as u64;
        tokens.max(1)
    }

    pub fn estimate_usage(prompt: &str, completion: &str) -> TokenUsage {
        TokenUsage::new(Self::estimate(prompt), Self::estimate(completion))
    }
}
