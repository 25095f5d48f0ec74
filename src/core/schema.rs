//! 结果结构校验
//!
//! 校验结论是带标签的值（Valid / Invalid），而不是运行时异常；
//! schemars 生成的 JSON Schema 拼入 prompt，减少模型输出格式错误。

use std::fmt;
use std::marker::PhantomData;

use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};

/// 单条校验问题：字段路径 + 描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaIssue {
    pub path: String,
    pub message: String,
}

impl SchemaIssue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for SchemaIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// 将多条问题拼成一行，便于日志与错误信息
pub fn join_issues(issues: &[SchemaIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// 校验结论
#[derive(Debug, Clone, PartialEq)]
pub enum Validation<T> {
    Valid(T),
    Invalid(Vec<SchemaIssue>),
}

impl<T> Validation<T> {
    pub fn from_issues(value: T, issues: Vec<SchemaIssue>) -> Self {
        if issues.is_empty() {
            Validation::Valid(value)
        } else {
            Validation::Invalid(issues)
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Validation::Valid(_))
    }

    pub fn into_result(self) -> Result<T, Vec<SchemaIssue>> {
        match self {
            Validation::Valid(v) => Ok(v),
            Validation::Invalid(issues) => Err(issues),
        }
    }
}

/// 自描述结构约束的类型（字段类型由 serde 保证，这里检查取值范围与必填项）
pub trait Schema {
    fn schema_issues(&self) -> Vec<SchemaIssue>;

    fn validate(self) -> Validation<Self>
    where
        Self: Sized,
    {
        let issues = self.schema_issues();
        Validation::from_issues(self, issues)
    }
}

/// 任务上声明的期望结果结构
pub trait ResultSchema<R>: Send + Sync {
    fn name(&self) -> &str;

    fn check(&self, value: &R) -> Vec<SchemaIssue>;
}

/// 以类型自身的 Schema 实现作为期望结构
pub struct DeclaredSchema<R> {
    name: String,
    _marker: PhantomData<fn(&R)>,
}

impl<R> DeclaredSchema<R> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            _marker: PhantomData,
        }
    }
}

impl<R: Schema> ResultSchema<R> for DeclaredSchema<R> {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, value: &R) -> Vec<SchemaIssue> {
        value.schema_issues()
    }
}

/// 返回类型的 JSON Schema 字符串，可拼入 prompt
pub fn json_schema_for<T: JsonSchema>() -> String {
    let schema = schema_for!(T);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

/// 逐项收集问题的小工具
#[derive(Debug, Default)]
pub struct IssueCollector {
    issues: Vec<SchemaIssue>,
}

impl IssueCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, path: &str, message: impl Into<String>) {
        self.issues.push(SchemaIssue::new(path, message));
    }

    pub fn range(&mut self, path: &str, value: f64, min: f64, max: f64) -> &mut Self {
        if !value.is_finite() || value < min || value > max {
            self.push(path, format!("expected {} ..= {}, got {}", min, max, value));
        }
        self
    }

    pub fn non_empty(&mut self, path: &str, value: &str) -> &mut Self {
        if value.trim().is_empty() {
            self.push(path, "must not be empty");
        }
        self
    }

    pub fn max_len<T>(&mut self, path: &str, items: &[T], max: usize) -> &mut Self {
        if items.len() > max {
            self.push(path, format!("at most {} items, got {}", max, items.len()));
        }
        self
    }

    pub fn finish(self) -> Vec<SchemaIssue> {
        self.issues
    }
}
