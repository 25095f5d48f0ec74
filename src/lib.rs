//! Hive - LLM 任务执行与韧性管线
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、任务与结果信封、结果结构校验、任务执行器
//! - **llm**: 模型适配器抽象与实现（OpenAI 兼容 / DeepSeek / Ollama / Mock）
//! - **resilience**: 重试退避、熔断、单次超时及其组合
//! - **cost**: 价格表、token 估算、按日重置的成本账本
//! - **parse**: 模型输出结构化解析、降级合成
//! - **chains**: 各任务链（线索评分、情感、检索问答、下一步行动）
//! - **router**: 工作项路由（外部队列边界）
//! - **pipeline**: 启动时的组件装配
//! - **observability**: 日志初始化

pub mod chains;
pub mod config;
pub mod core;
pub mod cost;
pub mod llm;
pub mod observability;
pub mod parse;
pub mod pipeline;
pub mod resilience;
pub mod router;

pub use pipeline::{create_components, PipelineComponents};
pub use router::{JobResult, JobRouter, WorkItem};
