//! 核心层：错误分类、任务与结果信封、结果结构校验、任务执行器

pub mod error;
pub mod executor;
pub mod schema;
pub mod task;

pub use error::{ErrorKind, PipelineError};
pub use executor::{TaskExecutor, TaskHandler, DEFAULT_CONFIDENCE};
pub use schema::{
    json_schema_for, DeclaredSchema, IssueCollector, ResultSchema, Schema, SchemaIssue, Validation,
};
pub use task::{
    clamp_confidence, AgentResult, NoopProgress, ProgressHandle, ProgressSink, Task,
    PROGRESS_COMPLETE, PROGRESS_MODEL_DONE, PROGRESS_START,
};
