//! 降级合成：仅由任务输入得到保守、必然合法的结果（不调用模型）

/// 模型调用或解析失败后使用
pub trait FallbackSynthesizer<I, R>: Send + Sync {
    fn build(&self, input: &I) -> R;
}

impl<I, R, F> FallbackSynthesizer<I, R> for F
where
    F: Fn(&I) -> R + Send + Sync,
{
    fn build(&self, input: &I) -> R {
        self(input)
    }
}
