//! 单次尝试超时：与计时器竞速，超时则放弃该次尝试（其结果被丢弃）

use std::future::Future;
use std::time::Duration;

use crate::core::PipelineError;

/// limit 为零表示不限时
pub async fn with_timeout<T, Fut>(limit: Duration, fut: Fut) -> Result<T, PipelineError>
where
    Fut: Future<Output = Result<T, PipelineError>>,
{
    if limit.is_zero() {
        return fut.await;
    }
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(PipelineError::Timeout(limit.as_millis() as u64)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_slow_operation_times_out() {
        let result: Result<(), _> = with_timeout(Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(PipelineError::Timeout(50))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_operation_passes_through() {
        let result = with_timeout(Duration::from_secs(1), async { Ok::<_, PipelineError>(7) }).await;
        assert_eq!(result.unwrap(), 7);

        let err: Result<(), _> = with_timeout(Duration::from_secs(1), async {
            Err(PipelineError::InvalidInput("bad".into()))
        })
        .await;
        assert!(matches!(err, Err(PipelineError::InvalidInput(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_limit_disables_timer() {
        let result = with_timeout(Duration::ZERO, async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, PipelineError>("done")
        })
        .await;
        assert_eq!(result.unwrap(), "done");
    }
}
