//! OpenAI 兼容 API 适配器
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；DeepSeek、OpenAI、自建代理均走此实现。

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::llm::{LlmError, ModelAdapter, ModelResponse, TokenUsage};

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";

const SYSTEM_INSTRUCTION: &str =
    "You are a precise assistant. Answer with a single JSON object that matches the requested schema.";

/// OpenAI 兼容适配器：持有 Client、供应商名与 model 名
pub struct OpenAiAdapter {
    client: Client<OpenAIConfig>,
    provider: String,
    model: String,
}

impl OpenAiAdapter {
    pub fn new(provider: &str, base_url: Option<&str>, model: &str, api_key: &str) -> Self {
        let config = match base_url {
            Some(url) => OpenAIConfig::new().with_api_base(url).with_api_key(api_key),
            None => OpenAIConfig::new().with_api_key(api_key),
        };

        Self {
            client: Client::with_config(config),
            provider: provider.to_string(),
            model: model.to_string(),
        }
    }

    /// DeepSeek 预设（OpenAI 兼容端点）
    pub fn deepseek(model: Option<&str>, api_key: &str) -> Self {
        Self::new(
            "deepseek",
            Some(DEEPSEEK_BASE_URL),
            model.unwrap_or(DEEPSEEK_CHAT),
            api_key,
        )
    }

    fn build_messages(&self, prompt: &str) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
        let system = ChatCompletionRequestSystemMessageArgs::default()
            .content(SYSTEM_INSTRUCTION.to_string())
            .build()
            .map_err(|e| LlmError::ApiError(e.to_string()))?;
        let user = ChatCompletionRequestUserMessageArgs::default()
            .content(prompt.to_string())
            .build()
            .map_err(|e| LlmError::ApiError(e.to_string()))?;
        Ok(vec![
            ChatCompletionRequestMessage::System(system),
            ChatCompletionRequestMessage::User(user),
        ])
    }
}

#[async_trait]
impl ModelAdapter for OpenAiAdapter {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn invoke(&self, prompt: &str) -> Result<ModelResponse, LlmError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(self.build_messages(prompt)?)
            .build()
            .map_err(|e| LlmError::ApiError(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| LlmError::from_provider_message(e.to_string()))?;

        let usage = response.usage.as_ref().map(|u| {
            TokenUsage::new(u.prompt_tokens as u64, u.completion_tokens as u64)
        });

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        if content.trim().is_empty() {
            return Err(LlmError::Incomplete {
                reason: "empty completion".to_string(),
                usage,
            });
        }

        let mut out = ModelResponse::new(content);
        out.usage = usage;
        Ok(out)
    }
}
