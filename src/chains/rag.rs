//! 检索增强问答链
//!
//! 上游检索是可选协作方：未配置、检索失败、无命中都不会中止任务，
//! 而是以空上下文继续，并在结果的 context_status 中区分三种情形。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::chains::{ChainOutput, ChainSpec};
use crate::config::RagSection;
use crate::core::{IssueCollector, PipelineError, Schema, SchemaIssue};

const FALLBACK_CONFIDENCE: f64 = 0.1;
/// 没有检索上下文支撑的回答，置信度上限
const UNGROUNDED_CONFIDENCE_CAP: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContextItem {
    pub id: String,
    pub source: String,
    pub title: String,
    pub content: String,
    /// 0-1
    #[serde(default)]
    pub relevance_score: f64,
    pub citation: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SearchFilters {
    /// 为空表示不限来源
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub min_relevance: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResults {
    pub results: Vec<ContextItem>,
    pub total: usize,
    pub execution_time_ms: u64,
}

/// 外部检索服务
#[async_trait]
pub trait RetrievalService: Send + Sync {
    async fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<SearchResults, PipelineError>;
}

fn keywords(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 3)
        .map(|w| w.to_lowercase())
        .collect()
}

/// 内存检索：按查询关键词在标题与正文中的覆盖率打分
#[derive(Debug, Default)]
pub struct InMemoryRetrieval {
    documents: Vec<ContextItem>,
}

impl InMemoryRetrieval {
    pub fn new(documents: Vec<ContextItem>) -> Self {
        Self { documents }
    }

    pub fn add(&mut self, document: ContextItem) {
        self.documents.push(document);
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[async_trait]
impl RetrievalService for InMemoryRetrieval {
    async fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<SearchResults, PipelineError> {
        let start = Instant::now();
        let wanted = keywords(query);
        if wanted.is_empty() {
            return Ok(SearchResults::default());
        }

        let mut hits: Vec<ContextItem> = self
            .documents
            .iter()
            .filter(|d| filters.sources.is_empty() || filters.sources.contains(&d.source))
            .filter_map(|d| {
                let have = keywords(&format!("{} {}", d.title, d.content));
                let overlap = wanted.intersection(&have).count();
                (overlap > 0).then(|| ContextItem {
                    relevance_score: overlap as f64 / wanted.len() as f64,
                    ..d.clone()
                })
            })
            .filter(|d| filters.min_relevance.map_or(true, |m| d.relevance_score >= m))
            .collect();

        hits.sort_by(|a, b| b.relevance_score.total_cmp(&a.relevance_score));
        let total = hits.len();
        hits.truncate(limit);

        Ok(SearchResults {
            results: hits,
            total,
            execution_time_ms: start.elapsed().as_millis() as u64,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeQuery {
    pub question: String,
    #[serde(default)]
    pub filters: SearchFilters,
    #[serde(default)]
    pub max_items: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ContextStatus {
    Retrieved,
    /// 检索成功但没有足够相关的内容
    #[default]
    Empty,
    /// 未配置检索服务
    Unavailable,
    Failed,
}

/// 检索步骤的产物
#[derive(Debug, Clone, Default)]
pub struct RagContext {
    pub items: Vec<ContextItem>,
    pub status: ContextStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GroundedAnswer {
    pub answer: String,
    /// 引用的上下文 citation
    #[serde(default)]
    pub citations: Vec<String>,
    pub confidence: f64,
    #[serde(default, skip_deserializing)]
    #[schemars(skip)]
    pub context_status: ContextStatus,
    #[serde(default, skip_deserializing)]
    #[schemars(skip)]
    pub degraded: bool,
}

impl Schema for GroundedAnswer {
    fn schema_issues(&self) -> Vec<SchemaIssue> {
        let mut c = IssueCollector::new();
        c.non_empty("answer", &self.answer)
            .range("confidence", self.confidence, 0.0, 1.0)
            .max_len("citations", &self.citations, 20);
        c.finish()
    }
}

impl ChainOutput for GroundedAnswer {
    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn reasoning(&self) -> Option<String> {
        Some(format!(
            "context {:?} with {} citation(s)",
            self.context_status,
            self.citations.len()
        ))
    }

    fn is_degraded(&self) -> bool {
        self.degraded
    }
}

pub struct RagSpec {
    retrieval: Option<Arc<dyn RetrievalService>>,
    max_context_items: usize,
    min_relevance: f64,
}

impl RagSpec {
    pub fn new(retrieval: Option<Arc<dyn RetrievalService>>, cfg: &RagSection) -> Self {
        Self {
            retrieval,
            max_context_items: cfg.max_context_items,
            min_relevance: cfg.min_relevance,
        }
    }
}

#[async_trait]
impl ChainSpec for RagSpec {
    type Input = KnowledgeQuery;
    type Output = GroundedAnswer;
    type Context = RagContext;

    fn operation(&self) -> &'static str {
        "rag_answer"
    }

    fn validate_input(&self, query: &KnowledgeQuery) -> Result<(), PipelineError> {
        if query.question.trim().is_empty() {
            return Err(PipelineError::InvalidInput("question is empty".into()));
        }
        if query.max_items == Some(0) {
            return Err(PipelineError::InvalidInput("maxItems must be at least 1".into()));
        }
        Ok(())
    }

    async fn gather(&self, query: &KnowledgeQuery) -> RagContext {
        let Some(retrieval) = &self.retrieval else {
            tracing::info!(
                operation = self.operation(),
                reason = "no retrieval service",
                "answering without context"
            );
            return RagContext {
                items: Vec::new(),
                status: ContextStatus::Unavailable,
            };
        };

        let limit = query
            .max_items
            .unwrap_or(self.max_context_items)
            .min(self.max_context_items);
        let min_relevance = query.filters.min_relevance.unwrap_or(self.min_relevance);

        match retrieval.search(&query.question, &query.filters, limit).await {
            Ok(found) => {
                let mut items: Vec<ContextItem> = found
                    .results
                    .into_iter()
                    .filter(|i| i.relevance_score >= min_relevance)
                    .collect();
                items.truncate(limit);
                let status = if items.is_empty() {
                    ContextStatus::Empty
                } else {
                    ContextStatus::Retrieved
                };
                tracing::debug!(
                    operation = self.operation(),
                    hits = items.len(),
                    total = found.total,
                    search_ms = found.execution_time_ms,
                    "context retrieved"
                );
                RagContext { items, status }
            }
            Err(err) => {
                tracing::warn!(
                    operation = self.operation(),
                    reason = %err,
                    "retrieval failed, answering without context"
                );
                RagContext {
                    items: Vec::new(),
                    status: ContextStatus::Failed,
                }
            }
        }
    }

    fn render_prompt(&self, query: &KnowledgeQuery, context: &RagContext) -> String {
        let mut prompt = String::from(
            "Answer the question using only the reference material below. \
             Cite the citation strings you relied on; if the material is insufficient, say so.\n\n",
        );
        if context.items.is_empty() {
            prompt.push_str("Reference material: none available.\n");
        } else {
            prompt.push_str("Reference material:\n");
            for (i, item) in context.items.iter().enumerate() {
                prompt.push_str(&format!(
                    "[{}] {} ({})\ncitation: {}\n{}\n\n",
                    i + 1,
                    item.title,
                    item.source,
                    item.citation,
                    item.content.trim()
                ));
            }
        }
        prompt.push_str(&format!("\nQuestion: {}", query.question.trim()));
        prompt
    }

    fn fallback(&self, _query: &KnowledgeQuery) -> GroundedAnswer {
        GroundedAnswer {
            answer: "A grounded answer could not be produced right now; please consult the source material directly."
                .into(),
            citations: Vec::new(),
            confidence: FALLBACK_CONFIDENCE,
            context_status: ContextStatus::default(),
            degraded: true,
        }
    }

    /// 只保留确实出现在上下文中的引用；无上下文的回答限制置信度
    fn finish(
        &self,
        mut output: GroundedAnswer,
        _query: &KnowledgeQuery,
        context: &RagContext,
    ) -> GroundedAnswer {
        output.context_status = context.status;
        let known: HashSet<&str> = context
            .items
            .iter()
            .flat_map(|i| [i.citation.as_str(), i.id.as_str()])
            .collect();
        output.citations.retain(|c| known.contains(c.as_str()));
        if context.status != ContextStatus::Retrieved {
            output.confidence = output.confidence.min(UNGROUNDED_CONFIDENCE_CAP);
        }
        output
    }
}
