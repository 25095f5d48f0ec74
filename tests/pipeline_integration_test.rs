//! 管线集成测试：经 JobRouter 端到端驱动各任务链

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use hive::chains::{ContextItem, InMemoryRetrieval};
    use hive::config::{AppConfig, ModelPricing};
    use hive::core::{ProgressSink, PROGRESS_COMPLETE, PROGRESS_MODEL_DONE, PROGRESS_START};
    use hive::cost::{CostLedger, ManualClock, PriceTable};
    use hive::llm::{LlmError, MockAdapter};
    use hive::pipeline::assemble;
    use hive::{JobRouter, WorkItem};
    use serde_json::json;

    #[derive(Default)]
    struct ProgressLog(Mutex<Vec<(Option<String>, u8)>>);

    impl ProgressSink for ProgressLog {
        fn report(&self, correlation_id: Option<&str>, percent: u8) {
            self.0
                .lock()
                .unwrap()
                .push((correlation_id.map(String::from), percent));
        }
    }

    fn config() -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.llm.provider = "mock".into();
        cfg.resilience.max_attempts = 2;
        cfg.resilience.initial_delay_ms = 10;
        cfg.resilience.max_delay_ms = 100;
        cfg.resilience.failure_threshold = 2;
        cfg.batch.requests_per_minute = 60;
        cfg
    }

    fn ledger(limit: Option<f64>) -> Arc<CostLedger> {
        let mut prices = PriceTable::default();
        prices.set(
            "mock/m",
            ModelPricing {
                input_per_1k: 0.01,
                output_per_1k: 0.03,
            },
        );
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 3, 9, 0, 0).unwrap(),
        ));
        Arc::new(CostLedger::new(prices, 5.0, limit, clock))
    }

    fn router_with(
        cfg: &AppConfig,
        mock: Arc<MockAdapter>,
        ledger: Arc<CostLedger>,
    ) -> JobRouter {
        let docs = InMemoryRetrieval::new(vec![ContextItem {
            id: "pricing".into(),
            source: "handbook".into(),
            title: "Pricing tiers".into(),
            content: "The enterprise tier includes single sign-on and audit logs.".into(),
            relevance_score: 0.0,
            citation: "handbook/pricing".into(),
            metadata: Default::default(),
        }]);
        assemble(cfg, mock, ledger, Some(Arc::new(docs)))
            .unwrap()
            .router
    }

    fn lead(id: &str) -> serde_json::Value {
        json!({
            "id": id,
            "name": "Katherine Johnson",
            "email": "kj@nasa.gov",
            "company": "NASA",
            "jobTitle": "Mathematician"
        })
    }

    const HOT_LEAD: &str = r#"{"score": 91, "qualification": "HOT", "confidence": 0.9, "reasoning": "Decision maker"}"#;

    #[tokio::test]
    async fn test_score_lead_end_to_end_with_progress() {
        let mock = Arc::new(MockAdapter::new("m"));
        mock.push_ok(HOT_LEAD);
        let log = Arc::new(ProgressLog::default());
        let ledger = ledger(None);
        let router = router_with(&config(), mock, ledger.clone()).with_progress_sink(log.clone());

        let out = router
            .route(WorkItem::new("score_lead", lead("l-1")).with_correlation_id("job-1"))
            .await;

        assert!(out.result.success);
        assert_eq!(out.correlation_id.as_deref(), Some("job-1"));
        let output = out.result.output.clone().unwrap();
        assert_eq!(output["score"], 91);
        assert_eq!(output["qualification"], "HOT");
        // 0.6 + 2 个可选字段
        assert!((out.result.confidence - 0.7).abs() < 1e-9);
        assert_eq!(out.result.reasoning.as_deref(), Some("Decision maker"));

        let seen: Vec<u8> = log.0.lock().unwrap().iter().map(|(_, p)| *p).collect();
        assert_eq!(seen, vec![PROGRESS_START, PROGRESS_MODEL_DONE, PROGRESS_COMPLETE]);
        assert_eq!(ledger.get_statistics(None).total_operations, 1);

        let wire = serde_json::to_value(&out).unwrap();
        assert_eq!(wire["type"], "score_lead");
        assert_eq!(wire["correlationId"], "job-1");
        assert!(wire["result"]["durationMs"].is_u64());
    }

    #[tokio::test]
    async fn test_unknown_type_and_bad_payload_fail_cleanly() {
        let mock = Arc::new(MockAdapter::new("m"));
        let router = router_with(&config(), mock.clone(), ledger(None));

        let unknown = router.route(WorkItem::new("send_fax", json!({}))).await;
        assert!(!unknown.result.success);
        assert_eq!(unknown.result.confidence, 0.0);
        let wire = serde_json::to_value(&unknown).unwrap();
        assert_eq!(wire["result"]["errorKind"], "input");

        let bad = router
            .route(WorkItem::new("score_lead", json!({"name": 42})))
            .await;
        assert!(!bad.result.success);
        assert!(bad.result.output.is_none());
        assert!(bad.result.error.unwrap().contains("payload"));
        assert_eq!(mock.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opens_and_jobs_degrade() {
        let mock = Arc::new(MockAdapter::new("m"));
        mock.push_err(LlmError::Auth("key revoked".into()))
            .push_err(LlmError::Auth("key revoked".into()));
        let router = router_with(&config(), mock.clone(), ledger(None));

        for i in 0..4 {
            let out = router
                .route(WorkItem::new("score_lead", lead(&format!("l-{}", i))))
                .await;
            assert!(out.result.success, "job {} should degrade, not fail", i);
            let output = out.result.output.unwrap();
            assert_eq!(output["qualification"], "UNQUALIFIED");
            assert_eq!(output["requiresReview"], true);
            assert!(out.result.confidence <= 0.2);
        }
        // 第三个任务起熔断器打开，不再调用模型
        assert_eq!(mock.calls(), 2);

        // 其他操作类别有独立的熔断器
        mock.push_ok(r#"{"sentiment": "NEUTRAL", "score": 0.0, "confidence": 0.6}"#);
        let out = router
            .route(WorkItem::new("assess_sentiment", json!({"text": "ok then"})))
            .await;
        assert_eq!(out.result.output.unwrap()["degraded"], false);
        assert_eq!(mock.calls(), 3);
    }

    #[tokio::test]
    async fn test_budget_exceeded_is_surfaced() {
        let mock = Arc::new(MockAdapter::new("m"));
        mock.push(Ok(hive::llm::ModelResponse::new(HOT_LEAD)
            .with_usage(hive::llm::TokenUsage::new(100_000, 100_000))));
        let router = router_with(&config(), mock.clone(), ledger(Some(2.0)));

        let first = router.route(WorkItem::new("score_lead", lead("a"))).await;
        assert!(!first.result.success);
        let wire = serde_json::to_value(&first).unwrap();
        assert_eq!(wire["result"]["errorKind"], "budget");

        let second = router
            .route(WorkItem::new("recommend_actions", json!({"accountId": "acct"})))
            .await;
        assert!(!second.result.success);
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_scoring_is_throttled() {
        let mock = Arc::new(MockAdapter::new("m").with_default_reply(HOT_LEAD));
        let log = Arc::new(ProgressLog::default());
        let router =
            router_with(&config(), mock.clone(), ledger(None)).with_progress_sink(log.clone());

        let start = tokio::time::Instant::now();
        let out = router
            .route(WorkItem::new(
                "score_lead_batch",
                json!({"leads": [lead("a"), lead("b"), lead("c")]}),
            ))
            .await;

        assert!(out.result.success);
        let items = out.result.output.unwrap();
        assert_eq!(items.as_array().map(Vec::len), Some(3));
        assert_eq!(items[2]["output"]["score"], 91);
        assert_eq!(out.result.reasoning.as_deref(), Some("scored 3 of 3 leads"));
        assert_eq!(start.elapsed(), Duration::from_secs(2));
        assert_eq!(mock.calls(), 3);

        let seen: Vec<u8> = log.0.lock().unwrap().iter().map(|(_, p)| *p).collect();
        assert_eq!(seen.first(), Some(&PROGRESS_START));
        assert_eq!(seen.last(), Some(&PROGRESS_COMPLETE));
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));

        let empty = router
            .route(WorkItem::new("score_lead_batch", json!({"leads": []})))
            .await;
        assert!(!empty.result.success);
    }

    #[tokio::test]
    async fn test_route_many_mixed_jobs() {
        let mock = Arc::new(MockAdapter::new("m").with_default_reply("not json at all"));
        let router = router_with(&config(), mock, ledger(None));

        let results = router
            .route_many(vec![
                WorkItem::new("recommend_actions", json!({"accountId": "a", "daysSinceLastContact": 45}))
                    .with_correlation_id("1"),
                WorkItem::new("answer_with_context", json!({"question": "Does enterprise include audit logs?"}))
                    .with_correlation_id("2"),
                WorkItem::new("assess_sentiment", json!({"text": ""})).with_correlation_id("3"),
            ])
            .await;

        let ids: Vec<_> = results
            .iter()
            .map(|r| r.correlation_id.clone().unwrap())
            .collect();
        assert_eq!(ids, vec!["1", "2", "3"]);

        let recs = results[0].result.output.as_ref().unwrap();
        assert_eq!(recs["recommendations"][0]["action"], "RE_ENGAGE");
        assert_eq!(recs["recommendations"][0]["priority"], "HIGH");

        let answer = results[1].result.output.as_ref().unwrap();
        assert_eq!(answer["contextStatus"], "retrieved");
        assert_eq!(answer["degraded"], true);

        assert!(!results[2].result.success);
        assert_eq!(router.executions(), 3);
    }
}
