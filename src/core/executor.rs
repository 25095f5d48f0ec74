//! 任务执行器：每个任务都经过的外层信封
//!
//! 计时、执行计数、可选结果结构校验、置信度推导、结构化日志；
//! 任何错误（含 panic）都在此转为 success=false 的 AgentResult，绝不向调用方传播。

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use futures_util::FutureExt;

use crate::core::schema::join_issues;
use crate::core::{AgentResult, ErrorKind, PipelineError, Task};

/// 未覆盖 confidence 时的默认置信度
pub const DEFAULT_CONFIDENCE: f64 = 0.8;

/// 任务类型相关的执行逻辑（通常委托给某条 Chain）
#[async_trait]
pub trait TaskHandler: Send + Sync {
    type Input: Send + Sync;
    type Output: Send + Sync;

    fn name(&self) -> &str;

    async fn execute_task(
        &self,
        task: &Task<Self::Input, Self::Output>,
    ) -> Result<Self::Output, PipelineError>;

    /// 可插拔的置信度函数，默认常量
    fn confidence(&self, _task: &Task<Self::Input, Self::Output>, _output: &Self::Output) -> f64 {
        DEFAULT_CONFIDENCE
    }

    fn reasoning(&self, _output: &Self::Output) -> Option<String> {
        None
    }
}

pub struct TaskExecutor<H: TaskHandler> {
    handler: H,
    executions: AtomicU64,
}

impl<H: TaskHandler> TaskExecutor<H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            executions: AtomicU64::new(0),
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// 累计执行次数（仅用于观测）
    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    /// 清零计数；不影响正在执行的任务
    pub fn reset(&self) {
        self.executions.store(0, Ordering::Relaxed);
    }

    pub async fn execute(&self, task: Task<H::Input, H::Output>) -> AgentResult<H::Output> {
        let start = Instant::now();
        self.executions.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            task_id = %task.id,
            handler = self.handler.name(),
            "task started"
        );

        let outcome = match AssertUnwindSafe(self.handler.execute_task(&task))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(PipelineError::Panicked(panic_message(panic.as_ref()))),
        };
        let outcome = outcome.and_then(|output| self.check_schema(&task, output));

        let duration_ms = start.elapsed().as_millis() as u64;
        match outcome {
            Ok(output) => {
                let confidence = self.handler.confidence(&task, &output);
                let reasoning = self.handler.reasoning(&output);
                let result = AgentResult::succeeded(output, confidence, reasoning, duration_ms);
                tracing::info!(
                    task_id = %task.id,
                    handler = self.handler.name(),
                    duration_ms,
                    success = true,
                    confidence = result.confidence,
                    "task finished"
                );
                result
            }
            Err(err) => {
                let kind = err.kind();
                tracing::warn!(
                    task_id = %task.id,
                    handler = self.handler.name(),
                    duration_ms,
                    success = false,
                    error_kind = kind.as_str(),
                    error = %err,
                    "task failed"
                );
                AgentResult::failed(err.to_string(), kind, duration_ms)
            }
        }
    }

    fn check_schema(
        &self,
        task: &Task<H::Input, H::Output>,
        output: H::Output,
    ) -> Result<H::Output, PipelineError> {
        let Some(schema) = &task.expected_schema else {
            return Ok(output);
        };
        let issues = schema.check(&output);
        if issues.is_empty() {
            Ok(output)
        } else {
            Err(PipelineError::SchemaViolation {
                schema: schema.name().to_string(),
                issues: join_issues(&issues),
            })
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DeclaredSchema, ResultSchema, Schema, SchemaIssue};
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq)]
    struct Doubled(i64);

    impl Schema for Doubled {
        fn schema_issues(&self) -> Vec<SchemaIssue> {
            if self.0 >= 0 {
                Vec::new()
            } else {
                vec![SchemaIssue::new("value", "must be non-negative")]
            }
        }
    }

    struct Doubler;

    #[async_trait]
    impl TaskHandler for Doubler {
        type Input = i64;
        type Output = Doubled;

        fn name(&self) -> &str {
            "doubler"
        }

        async fn execute_task(&self, task: &Task<i64, Doubled>) -> Result<Doubled, PipelineError> {
            match task.input {
                0 => Err(PipelineError::InvalidInput("zero".into())),
                13 => panic!("unlucky input"),
                n => Ok(Doubled(n * 2)),
            }
        }
    }

    #[tokio::test]
    async fn test_success_uses_default_confidence() {
        let exec = TaskExecutor::new(Doubler);
        let result = exec.execute(Task::new("double", 4)).await;
        assert!(result.success);
        assert_eq!(result.output, Some(Doubled(8)));
        assert_eq!(result.confidence, DEFAULT_CONFIDENCE);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_error_is_contained() {
        let exec = TaskExecutor::new(Doubler);
        let result = exec.execute(Task::new("double", 0)).await;
        assert!(!result.success);
        assert!(result.output.is_none());
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.error_kind, Some(ErrorKind::Input));
        assert!(result.error.unwrap().contains("zero"));
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let exec = TaskExecutor::new(Doubler);
        let result = exec.execute(Task::new("double", 13)).await;
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Internal));
        assert!(result.error.unwrap().contains("unlucky input"));

        // 执行器在 panic 后仍可用
        assert!(exec.execute(Task::new("double", 1)).await.success);
    }

    #[tokio::test]
    async fn test_schema_violation_fails_task() {
        let exec = TaskExecutor::new(Doubler);
        let schema: Arc<dyn ResultSchema<Doubled>> = Arc::new(DeclaredSchema::new("doubled"));
        let result = exec
            .execute(Task::new("double", -3).with_schema(schema))
            .await;
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Input));
        assert!(result.error.unwrap().contains("doubled"));
    }

    #[tokio::test]
    async fn test_counter_and_reset() {
        let exec = TaskExecutor::new(Doubler);
        exec.execute(Task::new("a", 1)).await;
        exec.execute(Task::new("b", 0)).await;
        assert_eq!(exec.executions(), 2);
        exec.reset();
        assert_eq!(exec.executions(), 0);
    }
}
