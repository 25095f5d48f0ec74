//! JobRouter：外部队列与管线之间的边界
//!
//! 接收 `{type, payload, correlationId?}` 工作项，解码为对应任务输入，经 TaskExecutor 执行，
//! 返回形状稳定的 JobResult。未知类型、载荷解码失败都得到失败结果，不会 panic。

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chains::{
    score_batch, Chain, ChainSpec, Lead, LeadScoringSpec, NextActionSpec, RagSpec, SentimentSpec,
};
use crate::core::{
    clamp_confidence, AgentResult, DeclaredSchema, ErrorKind, PipelineError, ProgressHandle,
    ProgressSink, ResultSchema, Task, TaskExecutor, PROGRESS_COMPLETE, PROGRESS_START,
};

/// 队列中的一个工作项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl WorkItem {
    pub fn new(job_type: impl Into<String>, payload: Value) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            correlation_id: None,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    ScoreLead,
    ScoreLeadBatch,
    AssessSentiment,
    AnswerWithContext,
    RecommendActions,
}

impl JobKind {
    pub const ALL: [JobKind; 5] = [
        JobKind::ScoreLead,
        JobKind::ScoreLeadBatch,
        JobKind::AssessSentiment,
        JobKind::AnswerWithContext,
        JobKind::RecommendActions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::ScoreLead => "score_lead",
            JobKind::ScoreLeadBatch => "score_lead_batch",
            JobKind::AssessSentiment => "assess_sentiment",
            JobKind::AnswerWithContext => "answer_with_context",
            JobKind::RecommendActions => "recommend_actions",
        }
    }

    pub fn parse(s: &str) -> Option<JobKind> {
        let s = s.trim();
        Self::ALL.into_iter().find(|k| k.as_str().eq_ignore_ascii_case(s))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub result: AgentResult<Value>,
}

/// score_lead_batch 的载荷
#[derive(Debug, Clone, Deserialize)]
struct LeadBatch {
    leads: Vec<Lead>,
}

pub struct JobRouter {
    lead_scoring: TaskExecutor<Chain<LeadScoringSpec>>,
    sentiment: TaskExecutor<Chain<SentimentSpec>>,
    rag: TaskExecutor<Chain<RagSpec>>,
    next_action: TaskExecutor<Chain<NextActionSpec>>,
    batch_delay: Duration,
    progress: Option<Arc<dyn ProgressSink>>,
}

impl JobRouter {
    pub fn new(
        lead_scoring: Chain<LeadScoringSpec>,
        sentiment: Chain<SentimentSpec>,
        rag: Chain<RagSpec>,
        next_action: Chain<NextActionSpec>,
        batch_delay: Duration,
    ) -> Self {
        Self {
            lead_scoring: TaskExecutor::new(lead_scoring),
            sentiment: TaskExecutor::new(sentiment),
            rag: TaskExecutor::new(rag),
            next_action: TaskExecutor::new(next_action),
            batch_delay,
            progress: None,
        }
    }

    pub fn with_progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    /// 各执行器累计执行次数之和
    pub fn executions(&self) -> u64 {
        self.lead_scoring.executions()
            + self.sentiment.executions()
            + self.rag.executions()
            + self.next_action.executions()
    }

    pub async fn route(&self, item: WorkItem) -> JobResult {
        let start = Instant::now();
        let progress = match &self.progress {
            Some(sink) => ProgressHandle::new(sink.clone(), item.correlation_id.clone()),
            None => ProgressHandle::default(),
        };
        progress.report(PROGRESS_START);

        let result = match JobKind::parse(&item.job_type) {
            None => failed(
                PipelineError::InvalidInput(format!("unknown work item type '{}'", item.job_type)),
                start,
            ),
            Some(JobKind::ScoreLead) => {
                run_single(&self.lead_scoring, "score lead", item.payload, &progress, start).await
            }
            Some(JobKind::AssessSentiment) => {
                run_single(&self.sentiment, "assess sentiment", item.payload, &progress, start)
                    .await
            }
            Some(JobKind::AnswerWithContext) => {
                run_single(&self.rag, "answer with context", item.payload, &progress, start).await
            }
            Some(JobKind::RecommendActions) => {
                run_single(&self.next_action, "recommend actions", item.payload, &progress, start)
                    .await
            }
            Some(JobKind::ScoreLeadBatch) => self.run_batch(item.payload, &progress, start).await,
        };
        progress.report(PROGRESS_COMPLETE);

        tracing::info!(
            job_type = %item.job_type,
            correlation_id = item.correlation_id.as_deref().unwrap_or("-"),
            success = result.success,
            duration_ms = result.duration_ms,
            error_kind = result.error_kind.map(|k| k.as_str()).unwrap_or("-"),
            "job finished"
        );

        JobResult {
            job_type: item.job_type,
            correlation_id: item.correlation_id,
            result,
        }
    }

    /// 并发处理多个互不相关的工作项，结果顺序与输入一致
    pub async fn route_many(&self, items: Vec<WorkItem>) -> Vec<JobResult> {
        join_all(items.into_iter().map(|item| self.route(item))).await
    }

    async fn run_batch(
        &self,
        payload: Value,
        progress: &ProgressHandle,
        start: Instant,
    ) -> AgentResult<Value> {
        let batch: LeadBatch = match decode(payload) {
            Ok(b) => b,
            Err(e) => return failed(e, start),
        };
        if batch.leads.is_empty() {
            return failed(PipelineError::InvalidInput("lead batch is empty".into()), start);
        }

        let total = batch.leads.len();
        let items = score_batch(&self.lead_scoring, batch.leads, self.batch_delay, progress).await;
        let succeeded = items.iter().filter(|r| r.success).count();
        let confidence = items.iter().map(|r| r.confidence).sum::<f64>() / total as f64;
        let reasoning = Some(format!("scored {} of {} leads", succeeded, total));

        match serde_json::to_value(&items) {
            Ok(v) => AgentResult::succeeded(
                v,
                clamp_confidence(confidence),
                reasoning,
                elapsed_ms(start),
            ),
            Err(e) => failed(PipelineError::Panicked(e.to_string()), start),
        }
    }
}

async fn run_single<S>(
    executor: &TaskExecutor<Chain<S>>,
    description: &str,
    payload: Value,
    progress: &ProgressHandle,
    start: Instant,
) -> AgentResult<Value>
where
    S: ChainSpec,
    S::Input: DeserializeOwned,
{
    let input: S::Input = match decode(payload) {
        Ok(i) => i,
        Err(e) => return failed(e, start),
    };
    let schema: Arc<dyn ResultSchema<S::Output>> =
        Arc::new(DeclaredSchema::new(executor.handler().spec().operation()));
    let task: Task<S::Input, S::Output> = Task::new(description, input)
        .with_schema(schema)
        .with_progress(progress.clone());
    into_json(executor.execute(task).await)
}

fn decode<T: DeserializeOwned>(payload: Value) -> Result<T, PipelineError> {
    serde_json::from_value(payload)
        .map_err(|e| PipelineError::InvalidInput(format!("payload does not match: {}", e)))
}

fn into_json<R: Serialize>(result: AgentResult<R>) -> AgentResult<Value> {
    let duration_ms = result.duration_ms;
    let output = match result.output.as_ref().map(serde_json::to_value).transpose() {
        Ok(v) => v,
        Err(e) => {
            return AgentResult::failed(
                format!("result could not be serialized: {}", e),
                ErrorKind::Internal,
                duration_ms,
            )
        }
    };
    AgentResult {
        success: result.success,
        output,
        confidence: result.confidence,
        reasoning: result.reasoning,
        error: result.error,
        error_kind: result.error_kind,
        timestamp: result.timestamp,
        duration_ms,
    }
}

fn failed(err: PipelineError, start: Instant) -> AgentResult<Value> {
    AgentResult::failed(err.to_string(), err.kind(), elapsed_ms(start))
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}
