//! LLM 层：模型适配器抽象与实现（OpenAI 兼容 / DeepSeek / Ollama / Mock）

pub mod mock;
pub mod ollama;
pub mod openai;
pub mod traits;

use std::sync::Arc;

pub use mock::MockAdapter;
pub use ollama::OllamaAdapter;
pub use openai::{OpenAiAdapter, DEEPSEEK_CHAT};
pub use traits::{LlmError, ModelAdapter, ModelResponse, TokenUsage};

use crate::config::LlmSection;
use crate::core::PipelineError;

fn read_api_key(cfg: &LlmSection, default_env: &str) -> Result<String, PipelineError> {
    let env_name = cfg.api_key_env.as_deref().unwrap_or(default_env);
    std::env::var(env_name)
        .ok()
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| {
            PipelineError::Config(format!(
                "provider '{}' requires environment variable {}",
                cfg.provider, env_name
            ))
        })
}

/// 按配置选择模型适配器；未知供应商或缺少 Key 在启动时直接失败
pub fn create_adapter_from_config(cfg: &LlmSection) -> Result<Arc<dyn ModelAdapter>, PipelineError> {
    let provider = cfg.provider.trim().to_lowercase();
    let adapter: Arc<dyn ModelAdapter> = match provider.as_str() {
        "openai" => {
            let key = read_api_key(cfg, "OPENAI_API_KEY")?;
            Arc::new(OpenAiAdapter::new(
                "openai",
                cfg.base_url.as_deref(),
                &cfg.model,
                &key,
            ))
        }
        "deepseek" => {
            let key = read_api_key(cfg, "DEEPSEEK_API_KEY")?;
            match cfg.base_url.as_deref() {
                Some(url) => Arc::new(OpenAiAdapter::new("deepseek", Some(url), &cfg.model, &key)),
                None => Arc::new(OpenAiAdapter::deepseek(Some(&cfg.model), &key)),
            }
        }
        "ollama" => Arc::new(OllamaAdapter::new(cfg.base_url.as_deref(), &cfg.model)),
        "mock" => Arc::new(MockAdapter::new(cfg.model.clone())),
        other => {
            return Err(PipelineError::Config(format!(
                "unsupported llm provider '{}'",
                other
            )))
        }
    };

    tracing::info!(
        provider = adapter.provider(),
        model = adapter.model(),
        "Model adapter ready"
    );
    Ok(adapter)
}
