//! 模型输出的结构化解析
//!
//! 从原始文本中定位 JSON（```json 代码块，或第一个 `{` 到最后一个 `}`），解码为目标类型，
//! 再按类型自身的 Schema 校验取值范围。任何一步失败都得到同一种 ParseError，携带截断后的原文。

use std::fmt;
use std::marker::PhantomData;
use std::sync::OnceLock;

use regex::Regex;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::core::schema::join_issues;
use crate::core::{Schema, SchemaIssue, Validation};

/// 错误中保留的原文长度（字符）
pub const RAW_EXCERPT_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq)]
pub enum ParseFailure {
    /// 找不到任何 JSON 结构
    NoStructure,
    Decode(String),
    Schema(Vec<SchemaIssue>),
}

impl fmt::Display for ParseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseFailure::NoStructure => f.write_str("no JSON structure found"),
            ParseFailure::Decode(e) => write!(f, "decode failed: {}", e),
            ParseFailure::Schema(issues) => write!(f, "schema violation: {}", join_issues(issues)),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("Unparseable model output ({reason}); raw: {raw_excerpt}")]
pub struct ParseError {
    pub reason: ParseFailure,
    pub raw_excerpt: String,
}

impl ParseError {
    pub fn new(reason: ParseFailure, raw: &str) -> Self {
        Self {
            reason,
            raw_excerpt: excerpt(raw),
        }
    }
}

fn excerpt(raw: &str) -> String {
    let trimmed = raw.trim();
    match trimmed.char_indices().nth(RAW_EXCERPT_CHARS) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

static FENCED_JSON: OnceLock<Option<Regex>> = OnceLock::new();

fn fenced_json() -> Option<&'static Regex> {
    FENCED_JSON
        .get_or_init(|| Regex::new(r"(?s)```(?:json|JSON)?\s*\n?(.*?)```").ok())
        .as_ref()
}

/// 定位候选 JSON 片段
pub fn extract_json(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();

    if let Some(caps) = fenced_json().and_then(|re| re.captures(trimmed)) {
        if let Some(body) = caps.get(1) {
            let body = body.as_str().trim();
            if body.starts_with('{') || body.starts_with('[') {
                return Some(body);
            }
        }
    }

    let object = trimmed
        .find('{')
        .zip(trimmed.rfind('}'))
        .filter(|(s, e)| s < e)
        .map(|(s, e)| &trimmed[s..=e]);
    let array = trimmed
        .find('[')
        .zip(trimmed.rfind(']'))
        .filter(|(s, e)| s < e)
        .map(|(s, e)| &trimmed[s..=e]);

    match (object, array) {
        // 取先出现的那个（对象内含数组、或数组内含对象）
        (Some(o), Some(a)) => {
            if trimmed.find('[') < trimmed.find('{') {
                Some(a)
            } else {
                Some(o)
            }
        }
        (o, a) => o.or(a),
    }
}

/// 把模型原始输出解析为 R 并校验
pub struct StructuredResultParser<R> {
    _marker: PhantomData<fn() -> R>,
}

impl<R> Default for StructuredResultParser<R> {
    fn default() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<R> StructuredResultParser<R>
where
    R: DeserializeOwned + Schema,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(&self, raw: &str) -> Result<R, ParseError> {
        let json = extract_json(raw).ok_or_else(|| ParseError::new(ParseFailure::NoStructure, raw))?;
        let value: R = serde_json::from_str(json)
            .map_err(|e| ParseError::new(ParseFailure::Decode(e.to_string()), raw))?;
        match value.validate() {
            Validation::Valid(v) => Ok(v),
            Validation::Invalid(issues) => Err(ParseError::new(ParseFailure::Schema(issues), raw)),
        }
    }
}
