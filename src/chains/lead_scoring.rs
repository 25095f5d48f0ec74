//! 线索评分链
//!
//! 置信度按输入完整度加权：基础 0.6，每个已填写的可选字段 +0.05，上限 1.0。
//! 降级结果：未合格 / 0 分 / 置信度 0.1 / 需人工复核。

use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::chains::{Chain, ChainOutput, ChainSpec};
use crate::core::{
    AgentResult, IssueCollector, PipelineError, ProgressHandle, Schema, SchemaIssue, Task,
    TaskExecutor, PROGRESS_COMPLETE, PROGRESS_START,
};

const BASE_CONFIDENCE: f64 = 0.6;
const PER_FIELD_BONUS: f64 = 0.05;
const FALLBACK_CONFIDENCE: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Lead {
    pub id: String,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub job_title: Option<String>,
    #[serde(default)]
    pub industry: Option<String>,
    #[serde(default)]
    pub company_size: Option<u32>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl Lead {
    /// 已填写（非空）的可选字段数
    pub fn populated_optional_fields(&self) -> usize {
        let texts = [
            &self.company,
            &self.job_title,
            &self.industry,
            &self.phone,
            &self.source,
            &self.notes,
        ];
        texts
            .iter()
            .filter(|f| f.as_deref().is_some_and(|s| !s.trim().is_empty()))
            .count()
            + usize::from(self.company_size.is_some())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Qualification {
    Hot,
    Warm,
    Cold,
    Unqualified,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LeadScore {
    /// 0-100
    pub score: u32,
    pub qualification: Qualification,
    pub confidence: f64,
    pub reasoning: String,
    #[serde(default)]
    pub factors: Vec<String>,
    #[serde(default)]
    pub requires_review: bool,
    #[serde(default, skip_deserializing)]
    #[schemars(skip)]
    pub degraded: bool,
}

impl Schema for LeadScore {
    fn schema_issues(&self) -> Vec<SchemaIssue> {
        let mut c = IssueCollector::new();
        c.range("score", self.score as f64, 0.0, 100.0)
            .range("confidence", self.confidence, 0.0, 1.0)
            .non_empty("reasoning", &self.reasoning)
            .max_len("factors", &self.factors, 10);
        c.finish()
    }
}

impl ChainOutput for LeadScore {
    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn reasoning(&self) -> Option<String> {
        Some(self.reasoning.clone())
    }

    fn is_degraded(&self) -> bool {
        self.degraded
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LeadScoringSpec;

impl ChainSpec for LeadScoringSpec {
    type Input = Lead;
    type Output = LeadScore;
    type Context = ();

    fn operation(&self) -> &'static str {
        "lead_scoring"
    }

    fn validate_input(&self, lead: &Lead) -> Result<(), PipelineError> {
        if lead.name.trim().is_empty() {
            return Err(PipelineError::InvalidInput("lead name is required".into()));
        }
        let email = lead.email.trim();
        if !email.contains('@') || email.starts_with('@') || email.ends_with('@') {
            return Err(PipelineError::InvalidInput(format!(
                "lead email '{}' is not valid",
                lead.email
            )));
        }
        Ok(())
    }

    fn render_prompt(&self, lead: &Lead, _context: &()) -> String {
        let field = |v: &Option<String>| v.as_deref().unwrap_or("unknown").to_string();
        format!(
            "Score this B2B sales lead from 0 to 100 and classify it as HOT, WARM, COLD or UNQUALIFIED.\n\
             List the factors that drove the score and set requiresReview when the data is thin.\n\n\
             Name: {}\nEmail: {}\nCompany: {}\nJob title: {}\nIndustry: {}\nCompany size: {}\nSource: {}\nNotes: {}",
            lead.name,
            lead.email,
            field(&lead.company),
            field(&lead.job_title),
            field(&lead.industry),
            lead.company_size
                .map(|n| n.to_string())
                .unwrap_or_else(|| "unknown".into()),
            field(&lead.source),
            field(&lead.notes),
        )
    }

    fn fallback(&self, _lead: &Lead) -> LeadScore {
        LeadScore {
            score: 0,
            qualification: Qualification::Unqualified,
            confidence: FALLBACK_CONFIDENCE,
            reasoning: "Automatic scoring unavailable; requires manual review".into(),
            factors: Vec::new(),
            requires_review: true,
            degraded: true,
        }
    }

    fn confidence(&self, lead: &Lead, _output: &LeadScore) -> f64 {
        (BASE_CONFIDENCE + PER_FIELD_BONUS * lead.populated_optional_fields() as f64).min(1.0)
    }
}

/// 顺序评分一批线索，相邻两次之间按每分钟请求数限速；每条结果单独成功或失败
pub async fn score_batch(
    executor: &TaskExecutor<Chain<LeadScoringSpec>>,
    leads: Vec<Lead>,
    delay: Duration,
    progress: &ProgressHandle,
) -> Vec<AgentResult<LeadScore>> {
    let total = leads.len();
    let mut results = Vec::with_capacity(total);
    progress.report(PROGRESS_START);

    for (i, lead) in leads.into_iter().enumerate() {
        if i > 0 && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let task = Task::new(format!("score lead {}", lead.id), lead);
        results.push(executor.execute(task).await);

        let done = (i + 1) as u64;
        let pct = PROGRESS_START as u64
            + (PROGRESS_COMPLETE - PROGRESS_START) as u64 * done / total as u64;
        progress.report(pct.min(PROGRESS_COMPLETE as u64 - 1) as u8);
    }

    tracing::info!(total, "lead batch scored");
    results
}
