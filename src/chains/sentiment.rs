//! 情感判断链
//!
//! 先用词表做一次纯函数预判，作为提示注入 prompt；模型失败时以词表结论降级。

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::chains::{ChainOutput, ChainSpec};
use crate::core::{IssueCollector, PipelineError, Schema, SchemaIssue};

const MAX_MESSAGE_CHARS: usize = 10_000;
const FALLBACK_CONFIDENCE: f64 = 0.1;
/// 词表得分超过该值才判为正/负面
const POLARITY_MARGIN: f64 = 0.2;

const POSITIVE_WORDS: &[&str] = &[
    "great", "good", "excellent", "love", "happy", "thanks", "thank", "interested", "excited",
    "perfect", "awesome", "helpful", "pleased", "appreciate", "yes",
];
const NEGATIVE_WORDS: &[&str] = &[
    "bad", "terrible", "hate", "angry", "disappointed", "cancel", "refund", "broken", "slow",
    "expensive", "unhappy", "frustrated", "problem", "issue", "not", "never", "worst",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MessageInput {
    pub text: String,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SentimentLabel {
    Positive,
    Neutral,
    Negative,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SentimentAssessment {
    pub sentiment: SentimentLabel,
    /// -1（负面）到 1（正面）
    pub score: f64,
    pub confidence: f64,
    #[serde(default)]
    pub signals: Vec<String>,
    #[serde(default, skip_deserializing)]
    #[schemars(skip)]
    pub degraded: bool,
}

impl Schema for SentimentAssessment {
    fn schema_issues(&self) -> Vec<SchemaIssue> {
        let mut c = IssueCollector::new();
        c.range("score", self.score, -1.0, 1.0)
            .range("confidence", self.confidence, 0.0, 1.0)
            .max_len("signals", &self.signals, 20);
        c.finish()
    }
}

impl ChainOutput for SentimentAssessment {
    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn reasoning(&self) -> Option<String> {
        if self.signals.is_empty() {
            None
        } else {
            Some(format!("signals: {}", self.signals.join(", ")))
        }
    }

    fn is_degraded(&self) -> bool {
        self.degraded
    }
}

/// 词表预判结果
#[derive(Debug, Clone, PartialEq)]
pub struct LexiconHint {
    pub label: SentimentLabel,
    pub score: f64,
    pub positive_hits: Vec<String>,
    pub negative_hits: Vec<String>,
}

pub fn lexicon_polarity(text: &str) -> LexiconHint {
    let mut positive_hits = Vec::new();
    let mut negative_hits = Vec::new();

    for word in text
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .map(|w| w.trim_matches('\'').to_lowercase())
        .filter(|w| !w.is_empty())
    {
        if POSITIVE_WORDS.contains(&word.as_str()) {
            positive_hits.push(word);
        } else if NEGATIVE_WORDS.contains(&word.as_str()) {
            negative_hits.push(word);
        }
    }

    let pos = positive_hits.len() as f64;
    let neg = negative_hits.len() as f64;
    let score = if pos + neg == 0.0 {
        0.0
    } else {
        (pos - neg) / (pos + neg)
    };
    let label = if score > POLARITY_MARGIN {
        SentimentLabel::Positive
    } else if score < -POLARITY_MARGIN {
        SentimentLabel::Negative
    } else {
        SentimentLabel::Neutral
    };

    LexiconHint {
        label,
        score,
        positive_hits,
        negative_hits,
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SentimentSpec;

impl ChainSpec for SentimentSpec {
    type Input = MessageInput;
    type Output = SentimentAssessment;
    type Context = ();

    fn operation(&self) -> &'static str {
        "sentiment"
    }

    fn validate_input(&self, input: &MessageInput) -> Result<(), PipelineError> {
        if input.text.trim().is_empty() {
            return Err(PipelineError::InvalidInput("message text is empty".into()));
        }
        let len = input.text.chars().count();
        if len > MAX_MESSAGE_CHARS {
            return Err(PipelineError::InvalidInput(format!(
                "message is {} characters, limit is {}",
                len, MAX_MESSAGE_CHARS
            )));
        }
        Ok(())
    }

    fn render_prompt(&self, input: &MessageInput, _context: &()) -> String {
        let hint = lexicon_polarity(&input.text);
        format!(
            "Assess the sentiment of the customer message below as POSITIVE, NEUTRAL or NEGATIVE, \
             with a score from -1 to 1 and the phrases that signal it.\n\
             A keyword pre-check suggests {:?} (score {:.2}, positive: [{}], negative: [{}]); \
             treat it as a hint only.\n\nChannel: {}\nMessage:\n\"\"\"\n{}\n\"\"\"",
            hint.label,
            hint.score,
            hint.positive_hits.join(", "),
            hint.negative_hits.join(", "),
            input.channel.as_deref().unwrap_or("unknown"),
            input.text.trim(),
        )
    }

    fn fallback(&self, input: &MessageInput) -> SentimentAssessment {
        let hint = lexicon_polarity(&input.text);
        let mut signals = hint.positive_hits;
        signals.extend(hint.negative_hits);
        signals.truncate(20);
        SentimentAssessment {
            sentiment: hint.label,
            score: hint.score,
            confidence: FALLBACK_CONFIDENCE,
            signals,
            degraded: true,
        }
    }
}
