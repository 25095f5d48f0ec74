//! 下一步行动推荐链
//!
//! 降级时使用规则引擎：仅依据输入中的几个阈值信号，按固定优先级排序后取前 N 条。

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::chains::{ChainOutput, ChainSpec};
use crate::core::{IssueCollector, PipelineError, Schema, SchemaIssue};

pub const DEFAULT_TOP_N: usize = 3;
const FALLBACK_CONFIDENCE: f64 = 0.2;
const STALE_CONTACT_DAYS: u32 = 30;
const LOW_LEAD_SCORE: u32 = 40;
const PROPOSAL_SENT: &str = "PROPOSAL_SENT";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccountContext {
    pub account_id: String,
    #[serde(default)]
    pub lead_score: Option<u32>,
    #[serde(default)]
    pub days_since_last_contact: Option<u32>,
    #[serde(default)]
    pub opportunity_stage: Option<String>,
    #[serde(default)]
    pub recent_activities: Vec<String>,
    /// 返回条数上限，默认 3
    #[serde(default)]
    pub max_recommendations: Option<usize>,
}

impl AccountContext {
    fn top_n(&self) -> usize {
        self.max_recommendations.unwrap_or(DEFAULT_TOP_N).max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    FollowUp,
    ReEngage,
    Nurture,
    CloseDeal,
    ScheduleMeeting,
    SendProposal,
    Escalate,
}

/// 声明顺序即排序顺序：URGENT 最前
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Urgent,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub action: ActionType,
    pub priority: Priority,
    pub rationale: String,
    #[serde(default)]
    pub due_in_days: Option<u32>,
}

impl Recommendation {
    fn new(action: ActionType, priority: Priority, rationale: impl Into<String>, due_in_days: u32) -> Self {
        Self {
            action,
            priority,
            rationale: rationale.into(),
            due_in_days: Some(due_in_days),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Recommendations {
    pub recommendations: Vec<Recommendation>,
    pub confidence: f64,
    #[serde(default, skip_deserializing)]
    #[schemars(skip)]
    pub degraded: bool,
}

impl Schema for Recommendations {
    fn schema_issues(&self) -> Vec<SchemaIssue> {
        let mut c = IssueCollector::new();
        c.range("confidence", self.confidence, 0.0, 1.0)
            .max_len("recommendations", &self.recommendations, 10);
        if self.recommendations.is_empty() {
            c.push("recommendations", "must contain at least one item");
        }
        for (i, r) in self.recommendations.iter().enumerate() {
            c.non_empty(&format!("recommendations[{}].rationale", i), &r.rationale);
        }
        c.finish()
    }
}

impl ChainOutput for Recommendations {
    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn reasoning(&self) -> Option<String> {
        self.recommendations.first().map(|r| r.rationale.clone())
    }

    fn is_degraded(&self) -> bool {
        self.degraded
    }
}

/// 规则引擎：只看输入，无副作用
pub fn heuristic_recommendations(ctx: &AccountContext, top_n: usize) -> Vec<Recommendation> {
    let mut out = Vec::new();

    if let Some(days) = ctx.days_since_last_contact.filter(|d| *d > STALE_CONTACT_DAYS) {
        out.push(Recommendation::new(
            ActionType::ReEngage,
            Priority::High,
            format!("No contact for {} days", days),
            1,
        ));
    }
    if let Some(score) = ctx.lead_score.filter(|s| *s < LOW_LEAD_SCORE) {
        out.push(Recommendation::new(
            ActionType::Nurture,
            Priority::Low,
            format!("Lead score {} is below {}", score, LOW_LEAD_SCORE),
            14,
        ));
    }
    if ctx
        .opportunity_stage
        .as_deref()
        .is_some_and(|s| s.trim().eq_ignore_ascii_case(PROPOSAL_SENT))
    {
        out.push(Recommendation::new(
            ActionType::CloseDeal,
            Priority::High,
            "Proposal has been sent; push for a decision",
            3,
        ));
    }
    if out.is_empty() {
        out.push(Recommendation::new(
            ActionType::FollowUp,
            Priority::Medium,
            "No strong signal; schedule a routine follow-up",
            7,
        ));
    }

    out.sort_by_key(|r| r.priority);
    out.truncate(top_n.max(1));
    out
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NextActionSpec;

impl ChainSpec for NextActionSpec {
    type Input = AccountContext;
    type Output = Recommendations;
    type Context = ();

    fn operation(&self) -> &'static str {
        "next_action"
    }

    fn validate_input(&self, ctx: &AccountContext) -> Result<(), PipelineError> {
        if ctx.account_id.trim().is_empty() {
            return Err(PipelineError::InvalidInput("accountId is required".into()));
        }
        if ctx.lead_score.is_some_and(|s| s > 100) {
            return Err(PipelineError::InvalidInput("leadScore must be 0-100".into()));
        }
        Ok(())
    }

    fn render_prompt(&self, ctx: &AccountContext, _context: &()) -> String {
        let activities = if ctx.recent_activities.is_empty() {
            "none recorded".to_string()
        } else {
            ctx.recent_activities.join("; ")
        };
        format!(
            "Recommend the next best sales actions for this account, at most {} items.\n\
             Use action types FOLLOW_UP, RE_ENGAGE, NURTURE, CLOSE_DEAL, SCHEDULE_MEETING, SEND_PROPOSAL, ESCALATE \
             and priorities URGENT, HIGH, MEDIUM, LOW.\n\n\
             Account: {}\nLead score: {}\nDays since last contact: {}\nOpportunity stage: {}\nRecent activities: {}",
            ctx.top_n(),
            ctx.account_id,
            ctx.lead_score.map_or("unknown".into(), |s| s.to_string()),
            ctx.days_since_last_contact
                .map_or("unknown".into(), |d| d.to_string()),
            ctx.opportunity_stage.as_deref().unwrap_or("unknown"),
            activities,
        )
    }

    fn fallback(&self, ctx: &AccountContext) -> Recommendations {
        Recommendations {
            recommendations: heuristic_recommendations(ctx, ctx.top_n()),
            confidence: FALLBACK_CONFIDENCE,
            degraded: true,
        }
    }

    fn finish(&self, mut output: Recommendations, ctx: &AccountContext, _context: &()) -> Recommendations {
        output.recommendations.sort_by_key(|r| r.priority);
        output.recommendations.truncate(ctx.top_n());
        output
    }
}
