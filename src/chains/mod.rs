//! 任务链：prompt 渲染 + 受治理的模型调用 + 用量入账 + 结构化解析 + 降级合成
//!
//! 每种任务类型只需实现 ChainSpec（输入校验、prompt、降级结果），其余步骤由 Chain 统一完成：
//!
//! 1. 校验输入（不合法直接失败，不调用模型）
//! 2. 预算预检（当日已超限则快速失败）
//! 3. 收集上游上下文（如 RAG 检索，失败时降级为空上下文）
//! 4. 渲染 prompt 并附上输出类型的 JSON Schema
//! 5. 经 ResilienceGovernor 调用模型，每次完成的调用都记入 CostLedger
//! 6. 解析输出；供应商失败、熔断或解析失败时改用降级结果
//!
//! 预算超限与输入错误不会被降级掩盖，总是向上返回。

pub mod lead_scoring;
pub mod next_action;
pub mod rag;
pub mod sentiment;

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::core::{
    json_schema_for, ErrorKind, PipelineError, ProgressHandle, Schema, Task, TaskHandler,
    PROGRESS_MODEL_DONE,
};
use crate::cost::{CostLedger, TokenEstimator, UsageInput};
use crate::llm::{LlmError, ModelAdapter};
use crate::parse::{FallbackSynthesizer, StructuredResultParser};
use crate::resilience::ResilienceGovernor;

pub use lead_scoring::{score_batch, Lead, LeadScore, LeadScoringSpec, Qualification};
pub use next_action::{
    heuristic_recommendations, AccountContext, ActionType, NextActionSpec, Priority,
    Recommendation, Recommendations, DEFAULT_TOP_N,
};
pub use rag::{
    ContextItem, ContextStatus, GroundedAnswer, InMemoryRetrieval, KnowledgeQuery, RagContext,
    RagSpec, RetrievalService, SearchFilters, SearchResults,
};
pub use sentiment::{lexicon_polarity, LexiconHint, MessageInput, SentimentAssessment, SentimentLabel, SentimentSpec};

/// 降级结果的置信度上限
pub const MAX_FALLBACK_CONFIDENCE: f64 = 0.2;

/// 链输出的公共读取接口
pub trait ChainOutput {
    fn confidence(&self) -> f64;

    fn reasoning(&self) -> Option<String> {
        None
    }

    /// 是否为降级合成的结果
    fn is_degraded(&self) -> bool;
}

/// 某一任务类型的链定义
#[async_trait]
pub trait ChainSpec: Send + Sync + 'static {
    type Input: Send + Sync;
    type Output: DeserializeOwned + Serialize + JsonSchema + Schema + ChainOutput + Send + Sync;
    /// 上游数据步骤的产物，注入 prompt
    type Context: Default + Send + Sync;

    /// 操作类别名，用于日志、计费与熔断器命名
    fn operation(&self) -> &'static str;

    fn validate_input(&self, _input: &Self::Input) -> Result<(), PipelineError> {
        Ok(())
    }

    async fn gather(&self, _input: &Self::Input) -> Self::Context {
        Self::Context::default()
    }

    fn render_prompt(&self, input: &Self::Input, context: &Self::Context) -> String;

    /// 仅由输入得到的保守结果
    fn fallback(&self, input: &Self::Input) -> Self::Output;

    /// 对模型结果或降级结果的最后整理（排序、截断、写入上下文状态）
    fn finish(&self, output: Self::Output, _input: &Self::Input, _context: &Self::Context) -> Self::Output {
        output
    }

    fn confidence(&self, _input: &Self::Input, output: &Self::Output) -> f64 {
        output.confidence()
    }
}

/// 链运行所需的共享组件，启动时构造一次后注入
#[derive(Clone)]
pub struct ChainDeps {
    pub adapter: Arc<dyn ModelAdapter>,
    pub governor: Arc<ResilienceGovernor>,
    pub ledger: Arc<CostLedger>,
}

pub struct Chain<S: ChainSpec> {
    spec: S,
    deps: ChainDeps,
    parser: StructuredResultParser<S::Output>,
    schema_hint: String,
}

struct SpecFallback<'a, S>(&'a S);

impl<S: ChainSpec> FallbackSynthesizer<S::Input, S::Output> for SpecFallback<'_, S> {
    fn build(&self, input: &S::Input) -> S::Output {
        self.0.fallback(input)
    }
}

impl<S: ChainSpec> Chain<S> {
    pub fn new(spec: S, deps: ChainDeps) -> Self {
        Self {
            spec,
            deps,
            parser: StructuredResultParser::new(),
            schema_hint: json_schema_for::<S::Output>(),
        }
    }

    pub fn spec(&self) -> &S {
        &self.spec
    }

    pub fn deps(&self) -> &ChainDeps {
        &self.deps
    }

    pub fn fallback_synthesizer(&self) -> impl FallbackSynthesizer<S::Input, S::Output> + '_ {
        SpecFallback(&self.spec)
    }

    pub async fn invoke(&self, input: &S::Input) -> Result<S::Output, PipelineError> {
        self.invoke_with_progress(input, &ProgressHandle::default())
            .await
    }

    pub async fn invoke_with_progress(
        &self,
        input: &S::Input,
        progress: &ProgressHandle,
    ) -> Result<S::Output, PipelineError> {
        let operation = self.spec.operation();
        self.spec.validate_input(input)?;
        self.deps.ledger.ensure_within_budget()?;

        let context = self.spec.gather(input).await;
        let prompt = format!(
            "{}\n\nRespond with a single JSON object that conforms to this JSON Schema:\n{}",
            self.spec.render_prompt(input, &context),
            self.schema_hint
        );

        let reply = self.deps.governor.run(|| self.attempt(&prompt)).await;
        progress.report(PROGRESS_MODEL_DONE);

        let output = match reply {
            Ok(raw) => match self.parser.parse(&raw) {
                Ok(parsed) => parsed,
                Err(err) => {
                    tracing::warn!(
                        operation,
                        reason = %err.reason,
                        raw = %err.raw_excerpt,
                        error_kind = ErrorKind::Parse.as_str(),
                        "model output rejected, using fallback"
                    );
                    self.fallback_synthesizer().build(input)
                }
            },
            Err(err) => match err.kind() {
                ErrorKind::Transient | ErrorKind::Provider | ErrorKind::CircuitOpen | ErrorKind::Parse => {
                    tracing::warn!(
                        operation,
                        error_kind = err.kind().as_str(),
                        error = %err,
                        "model call failed, using fallback"
                    );
                    self.fallback_synthesizer().build(input)
                }
                _ => return Err(err),
            },
        };

        Ok(self.spec.finish(output, input, &context))
    }

    /// 单次模型调用；完成的调用（含带部分用量的失败）都会入账
    async fn attempt(&self, prompt: &str) -> Result<String, PipelineError> {
        let adapter = &self.deps.adapter;
        let provider_model = format!("{}/{}", adapter.provider(), adapter.model());

        match adapter.invoke(prompt).await {
            Ok(response) => {
                let usage = response
                    .usage
                    .unwrap_or_else(|| TokenEstimator::estimate_usage(prompt, &response.content));
                self.deps.ledger.record(UsageInput::new(
                    provider_model,
                    usage,
                    self.spec.operation(),
                ))?;
                Ok(response.content)
            }
            Err(err) => {
                if let LlmError::Incomplete { usage, .. } = &err {
                    let usage = usage.unwrap_or_else(|| TokenEstimator::estimate_usage(prompt, ""));
                    self.deps.ledger.record(
                        UsageInput::new(provider_model, usage, self.spec.operation())
                            .with_metadata(serde_json::json!({ "partial": true })),
                    )?;
                }
                Err(err.into())
            }
        }
    }
}

#[async_trait]
impl<S: ChainSpec> TaskHandler for Chain<S> {
    type Input = S::Input;
    type Output = S::Output;

    fn name(&self) -> &str {
        self.spec.operation()
    }

    async fn execute_task(
        &self,
        task: &Task<Self::Input, Self::Output>,
    ) -> Result<Self::Output, PipelineError> {
        self.invoke_with_progress(&task.input, &task.progress).await
    }

    fn confidence(&self, task: &Task<Self::Input, Self::Output>, output: &Self::Output) -> f64 {
        if output.is_degraded() {
            output.confidence().min(MAX_FALLBACK_CONFIDENCE)
        } else {
            self.spec.confidence(&task.input, output)
        }
    }

    fn reasoning(&self, output: &Self::Output) -> Option<String> {
        output.reasoning()
    }
}
