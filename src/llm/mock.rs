//! Mock 适配器（用于测试与无 Key 的本地运行）
//!
//! 按脚本依次返回预置结果；脚本耗尽后返回默认回复。记录调用次数与收到的 prompt。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::{LlmError, ModelAdapter, ModelResponse};

/// 可编排的 Mock：push_ok / push_err 预置结果，with_delay 模拟慢响应
#[derive(Debug)]
pub struct MockAdapter {
    model: String,
    script: Mutex<VecDeque<Result<ModelResponse, LlmError>>>,
    default_reply: String,
    delay: Option<Duration>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new("mock-model")
    }
}

impl MockAdapter {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            script: Mutex::new(VecDeque::new()),
            default_reply: "{}".to_string(),
            delay: None,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// 脚本耗尽后的默认回复
    pub fn with_default_reply(mut self, reply: impl Into<String>) -> Self {
        self.default_reply = reply.into();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push_ok(&self, content: impl Into<String>) -> &Self {
        self.push(Ok(ModelResponse::new(content)))
    }

    pub fn push_err(&self, err: LlmError) -> &Self {
        self.push(Err(err))
    }

    pub fn push(&self, result: Result<ModelResponse, LlmError>) -> &Self {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(result);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl ModelAdapter for MockAdapter {
    fn provider(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn invoke(&self, prompt: &str) -> Result<ModelResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(prompt.to_string());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        next.unwrap_or_else(|| Ok(ModelResponse::new(self.default_reply.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_then_default() {
        let mock = MockAdapter::new("m").with_default_reply("fallback");
        mock.push_ok("first").push_err(LlmError::Timeout);

        assert_eq!(mock.invoke("a").await.unwrap().content, "first");
        assert!(matches!(mock.invoke("b").await, Err(LlmError::Timeout)));
        assert_eq!(mock.invoke("c").await.unwrap().content, "fallback");
        assert_eq!(mock.calls(), 3);
        assert_eq!(mock.prompts(), vec!["a", "b", "c"]);
    }
}
