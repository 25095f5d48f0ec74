//! Hive 命令行入口
//!
//! 读取一个工作项（JSON 文件参数，或标准输入），经管线处理后把 JobResult 以 JSON 打印到标准输出。
//!
//! ```text
//! hive work_item.json
//! echo '{"type":"assess_sentiment","payload":{"text":"love it"}}' | hive
//! ```

use std::io::Read;

use anyhow::Context;
use hive::config::load_config;
use hive::{create_components, observability, WorkItem};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::var("HIVE_CONFIG").ok().map(Into::into);
    let cfg = load_config(config_path).context("Failed to load config")?;

    let components = create_components(&cfg, None).context("Failed to build pipeline")?;

    let raw = match std::env::args().nth(1) {
        Some(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read work item from {}", path))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read work item from stdin")?;
            buf
        }
    };
    let item: WorkItem = serde_json::from_str(&raw).context("Work item is not valid JSON")?;

    let result = components.router.route(item).await;
    println!(
        "{}",
        serde_json::to_string_pretty(&result).context("Failed to serialize result")?
    );

    let stats = components.ledger.get_statistics(None);
    tracing::info!(
        operations = stats.total_operations,
        total_cost = stats.total_cost,
        "run complete"
    );
    Ok(())
}
