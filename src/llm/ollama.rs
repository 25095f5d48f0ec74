//! Ollama 本地推理适配器
//!
//! 通过 HTTP `/api/generate`（非流式、format=json）调用本地 Ollama；token 数取自 prompt_eval_count / eval_count。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::llm::{LlmError, ModelAdapter, ModelResponse, TokenUsage};

pub const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    format: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

pub struct OllamaAdapter {
    client: Client,
    base_url: String,
    model: String,
}

impl OllamaAdapter {
    pub fn new(base_url: Option<&str>, model: &str) -> Self {
        // 本地推理较慢，HTTP 层超时放宽；单次尝试的超时由 ResilienceGovernor 控制
        let client = Client::builder()
            .timeout(Duration::from_secs(180))
            .build()
            .unwrap_or_else(|e| {
                tracing::error!("Failed to build HTTP client, using default client: {}", e);
                Client::new()
            });

        Self {
            client,
            base_url: base_url
                .unwrap_or(OLLAMA_DEFAULT_URL)
                .trim_end_matches('/')
                .to_string(),
            model: model.to_string(),
        }
    }
}

fn map_status(status: StatusCode, body: String) -> LlmError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => LlmError::RateLimited {
            retry_after_ms: None,
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LlmError::Auth(body),
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            LlmError::Unavailable(format!("{}: {}", status, body))
        }
        _ => LlmError::ApiError(format!("{}: {}", status, body)),
    }
}

fn map_transport(err: reqwest::Error) -> LlmError {
    if err.is_timeout() {
        LlmError::Timeout
    } else if err.is_connect() || err.is_request() {
        LlmError::Network(err.to_string())
    } else {
        LlmError::ApiError(err.to_string())
    }
}

#[async_trait]
impl ModelAdapter for OllamaAdapter {
    fn provider(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn invoke(&self, prompt: &str) -> Result<ModelResponse, LlmError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            format: "json",
        };

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(map_transport)?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(map_status(status, text));
        }

        let parsed: GenerateResponse = resp.json().await.map_err(map_transport)?;
        let usage = match (parsed.prompt_eval_count, parsed.eval_count) {
            (None, None) => None,
            (input, output) => Some(TokenUsage::new(input.unwrap_or(0), output.unwrap_or(0))),
        };

        if parsed.response.trim().is_empty() {
            return Err(LlmError::Incomplete {
                reason: "empty completion".to_string(),
                usage,
            });
        }

        Ok(ModelResponse {
            content: parsed.response,
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            map_status(StatusCode::TOO_MANY_REQUESTS, String::new()),
            LlmError::RateLimited { .. }
        ));
        assert!(map_status(StatusCode::SERVICE_UNAVAILABLE, "loading".into()).is_transient());
        assert!(!map_status(StatusCode::BAD_REQUEST, "bad".into()).is_transient());
    }

    #[test]
    fn test_base_url_trimmed() {
        let adapter = OllamaAdapter::new(Some("http://gpu-box:11434/"), "llama3");
        assert_eq!(adapter.base_url, "http://gpu-box:11434");
        assert_eq!(adapter.model(), "llama3");
    }
}
