//! 管线装配：启动时一次性构造适配器、熔断治理器、成本账本、各任务链与路由器
//!
//! 所有共享组件通过引用注入，不存在全局可变状态。配置错误在这里直接失败，而不是推迟到每个任务。

use std::collections::HashMap;
use std::sync::Arc;

use crate::chains::{
    Chain, ChainDeps, ChainSpec, LeadScoringSpec, NextActionSpec, RagSpec, RetrievalService,
    SentimentSpec,
};
use crate::config::AppConfig;
use crate::core::PipelineError;
use crate::cost::CostLedger;
use crate::llm::{create_adapter_from_config, ModelAdapter};
use crate::resilience::{CircuitBreakerConfig, ResilienceGovernor};
use crate::router::JobRouter;

pub struct PipelineComponents {
    pub adapter: Arc<dyn ModelAdapter>,
    pub ledger: Arc<CostLedger>,
    /// 按操作类别索引；每个（供应商, 操作）一个熔断器
    pub governors: HashMap<&'static str, Arc<ResilienceGovernor>>,
    pub router: JobRouter,
}

/// 构造期即可发现的配置错误
pub fn validate_config(cfg: &AppConfig) -> Result<(), PipelineError> {
    let r = &cfg.resilience;
    if r.max_attempts == 0 {
        return Err(PipelineError::Config("resilience.max_attempts must be at least 1".into()));
    }
    if r.failure_threshold == 0 {
        return Err(PipelineError::Config(
            "resilience.failure_threshold must be at least 1".into(),
        ));
    }
    if !r.backoff_multiplier.is_finite() || r.backoff_multiplier < 1.0 {
        return Err(PipelineError::Config(
            "resilience.backoff_multiplier must be >= 1.0".into(),
        ));
    }
    if r.initial_delay_ms > r.max_delay_ms {
        return Err(PipelineError::Config(
            "resilience.initial_delay_ms exceeds max_delay_ms".into(),
        ));
    }
    if !cfg.cost.warning_threshold.is_finite() || cfg.cost.warning_threshold < 0.0 {
        return Err(PipelineError::Config("cost.warning_threshold must be >= 0".into()));
    }
    if let Some(limit) = cfg.cost.daily_limit {
        if !limit.is_finite() || limit <= 0.0 {
            return Err(PipelineError::Config("cost.daily_limit must be > 0".into()));
        }
    }
    if !(0.0..=1.0).contains(&cfg.rag.min_relevance) {
        return Err(PipelineError::Config("rag.min_relevance must be within 0..=1".into()));
    }
    Ok(())
}

/// 按配置选择适配器并装配整条管线
pub fn create_components(
    cfg: &AppConfig,
    retrieval: Option<Arc<dyn RetrievalService>>,
) -> Result<PipelineComponents, PipelineError> {
    validate_config(cfg)?;
    let adapter = create_adapter_from_config(&cfg.llm)?;
    let ledger = Arc::new(CostLedger::from_config(&cfg.cost));
    assemble(cfg, adapter, ledger, retrieval)
}

/// 使用外部提供的适配器与账本装配（测试或嵌入场景）
pub fn assemble(
    cfg: &AppConfig,
    adapter: Arc<dyn ModelAdapter>,
    ledger: Arc<CostLedger>,
    retrieval: Option<Arc<dyn RetrievalService>>,
) -> Result<PipelineComponents, PipelineError> {
    validate_config(cfg)?;
    let mut governors = HashMap::new();

    let mut deps_for = |operation: &'static str| -> ChainDeps {
        let governor = Arc::new(ResilienceGovernor::new(
            format!("{}:{}", adapter.provider(), operation),
            cfg.resilience.retry_policy(),
            cfg.resilience.attempt_timeout(),
            CircuitBreakerConfig {
                failure_threshold: cfg.resilience.failure_threshold,
                reset_timeout: cfg.resilience.reset_timeout(),
            },
        ));
        governors.insert(operation, governor.clone());
        ChainDeps {
            adapter: adapter.clone(),
            governor,
            ledger: ledger.clone(),
        }
    };

    let rag_spec = RagSpec::new(retrieval, &cfg.rag);
    let lead_scoring = Chain::new(LeadScoringSpec, deps_for(LeadScoringSpec.operation()));
    let sentiment = Chain::new(SentimentSpec, deps_for(SentimentSpec.operation()));
    let rag_deps = deps_for(rag_spec.operation());
    let rag = Chain::new(rag_spec, rag_deps);
    let next_action = Chain::new(NextActionSpec, deps_for(NextActionSpec.operation()));

    let router = JobRouter::new(
        lead_scoring,
        sentiment,
        rag,
        next_action,
        cfg.batch.inter_request_delay(),
    );

    tracing::info!(
        provider = adapter.provider(),
        model = adapter.model(),
        governors = governors.len(),
        daily_limit = ?ledger.daily_limit(),
        "pipeline assembled"
    );

    Ok(PipelineComponents {
        adapter,
        ledger,
        governors,
        router,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockAdapter;
    use crate::resilience::CircuitState;

    fn mock_config() -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.llm.provider = "mock".into();
        cfg
    }

    #[test]
    fn test_one_governor_per_operation() {
        let c = create_components(&mock_config(), None).unwrap();
        let mut names: Vec<String> = c.governors.values().map(|g| g.name().to_string()).collect();
        names.sort();
        assert_eq!(
            names,
            vec!["mock:lead_scoring", "mock:next_action", "mock:rag_answer", "mock:sentiment"]
        );
        assert!(c
            .governors
            .values()
            .all(|g| g.circuit().state == CircuitState::Closed));
    }

    #[test]
    fn test_invalid_config_fails_at_startup() {
        let mut cfg = mock_config();
        cfg.resilience.failure_threshold = 0;
        assert!(matches!(
            create_components(&cfg, None),
            Err(PipelineError::Config(_))
        ));

        let mut cfg = mock_config();
        cfg.cost.daily_limit = Some(-1.0);
        assert!(validate_config(&cfg).is_err());

        let mut cfg = mock_config();
        cfg.llm.provider = "carrier-pigeon".into();
        assert!(create_components(&cfg, None).is_err());
    }

    #[test]
    fn test_assemble_shares_ledger() {
        let ledger = Arc::new(CostLedger::from_config(&mock_config().cost));
        let c = assemble(
            &mock_config(),
            Arc::new(MockAdapter::new("m")),
            ledger.clone(),
            None,
        )
        .unwrap();
        assert!(Arc::ptr_eq(&c.ledger, &ledger));
    }
}
