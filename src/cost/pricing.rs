//! 模型价格表（每 1k token，美元）
//!
//! 内置常见模型价格；配置可覆盖或扩展。未知模型按保守（偏贵）档位计价。

use std::collections::HashMap;

use crate::config::ModelPricing;
use crate::llm::TokenUsage;

/// 未知模型的保守档位
pub const DEFAULT_PRICING: ModelPricing = ModelPricing {
    input_per_1k: 0.01,
    output_per_1k: 0.03,
};

const LOCAL_PRICING: ModelPricing = ModelPricing {
    input_per_1k: 0.0,
    output_per_1k: 0.0,
};

const BUILTIN: &[(&str, ModelPricing)] = &[
    (
        "gpt-4o",
        ModelPricing {
            input_per_1k: 0.0025,
            output_per_1k: 0.01,
        },
    ),
    (
        "gpt-4o-mini",
        ModelPricing {
            input_per_1k: 0.00015,
            output_per_1k: 0.0006,
        },
    ),
    (
        "gpt-4-turbo",
        ModelPricing {
            input_per_1k: 0.01,
            output_per_1k: 0.03,
        },
    ),
    (
        "gpt-3.5-turbo",
        ModelPricing {
            input_per_1k: 0.0005,
            output_per_1k: 0.0015,
        },
    ),
    (
        "deepseek-chat",
        ModelPricing {
            input_per_1k: 0.00027,
            output_per_1k: 0.0011,
        },
    ),
    (
        "deepseek-reasoner",
        ModelPricing {
            input_per_1k: 0.00055,
            output_per_1k: 0.00219,
        },
    ),
];

/// 本地推理（Ollama）不计费
const LOCAL_PROVIDERS: &[&str] = &["ollama", "mock"];

#[derive(Debug, Clone)]
pub struct PriceTable {
    prices: HashMap<String, ModelPricing>,
    fallback: ModelPricing,
}

impl Default for PriceTable {
    fn default() -> Self {
        Self {
            prices: BUILTIN
                .iter()
                .map(|(name, p)| (name.to_string(), *p))
                .collect(),
            fallback: DEFAULT_PRICING,
        }
    }
}

impl PriceTable {
    /// 内置价格 + 配置覆盖
    pub fn with_overrides(overrides: &HashMap<String, ModelPricing>) -> Self {
        let mut table = Self::default();
        for (model, pricing) in overrides {
            table.prices.insert(model.clone(), *pricing);
        }
        table
    }

    pub fn set(&mut self, model: impl Into<String>, pricing: ModelPricing) {
        self.prices.insert(model.into(), pricing);
    }

    /// "provider/model" 形式时按 provider 判断是否本地；否则按模型名查表
    pub fn lookup(&self, provider_model: &str) -> ModelPricing {
        let (provider, model) = match provider_model.split_once('/') {
            Some((p, m)) => (Some(p), m),
            None => (None, provider_model),
        };
        if let Some(p) = self.prices.get(provider_model).or_else(|| self.prices.get(model)) {
            return *p;
        }
        if provider.is_some_and(|p| LOCAL_PROVIDERS.contains(&p)) {
            return LOCAL_PRICING;
        }
        self.fallback
    }

    pub fn cost(&self, provider_model: &str, usage: TokenUsage) -> f64 {
        let p = self.lookup(provider_model);
        usage.input_tokens as f64 / 1000.0 * p.input_per_1k
            + usage.output_tokens as f64 / 1000.0 * p.output_per_1k
    }
}
