//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__LLM__PROVIDER=ollama`）。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::resilience::RetryPolicy;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub resilience: ResilienceSection,
    pub cost: CostSection,
    pub batch: BatchSection,
    pub rag: RagSection,
}

/// [app] 段
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [llm] 段：供应商、模型、端点
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// openai / deepseek / ollama / mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// 存放 API Key 的环境变量名；未设置时按供应商取 OPENAI_API_KEY / DEEPSEEK_API_KEY
    pub api_key_env: Option<String>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key_env: None,
        }
    }
}

/// [resilience] 段：重试、单次超时、熔断
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResilienceSection {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// 单次尝试超时（秒）
    pub attempt_timeout_secs: u64,
    pub failure_threshold: u32,
    pub reset_timeout_secs: u64,
}

impl Default for ResilienceSection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            attempt_timeout_secs: 30,
            failure_threshold: 5,
            reset_timeout_secs: 60,
        }
    }
}

impl ResilienceSection {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts)
            .with_initial_delay(Duration::from_millis(self.initial_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_backoff_multiplier(self.backoff_multiplier)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_secs)
    }
}

/// 单个模型的价格（每 1k token，美元）
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ModelPricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

/// [cost] 段：告警阈值、日预算上限、价格覆盖
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CostSection {
    pub warning_threshold: f64,
    /// 未设置则不做硬限制
    pub daily_limit: Option<f64>,
    /// 覆盖或扩展内置价格表，键为模型名
    pub pricing: HashMap<String, ModelPricing>,
}

impl Default for CostSection {
    fn default() -> Self {
        Self {
            warning_threshold: 10.0,
            daily_limit: None,
            pricing: HashMap::new(),
        }
    }
}

/// [batch] 段：批量任务的自限速
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchSection {
    pub requests_per_minute: u32,
}

impl Default for BatchSection {
    fn default() -> Self {
        Self {
            requests_per_minute: 30,
        }
    }
}

impl BatchSection {
    /// 相邻两次调用之间的间隔；0 表示不限速
    pub fn inter_request_delay(&self) -> Duration {
        if self.requests_per_minute == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(60_000 / self.requests_per_minute as u64)
        }
    }
}

/// [rag] 段：检索上下文数量与相关度下限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RagSection {
    pub max_context_items: usize,
    pub min_relevance: f64,
}

impl Default for RagSection {
    fn default() -> Self {
        Self {
            max_context_items: 5,
            min_relevance: 0.3,
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
