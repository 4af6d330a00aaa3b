//! # State Store Integration Tests
//!
//! Exercises the scheduler/reconciler semantics end to end against the
//! embedded SQLite store: sequential claiming, retry scheduling, the
//! pending watchdog, skip/rerun, duplicate-delivery idempotency, and
//! concurrent claim distinctness.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pipelogiq_domain::entities::{ContextItem, PipelineStatus, StageOptions, StageStatus};
use pipelogiq_domain::events::{ContextUpdate, StageLogDraft, StageResultMessage};
use pipelogiq_domain::repositories::{CreatePipelineRequest, StageDraft, StateStore};
use pipelogiq_domain::value_objects::StageId;
use pipelogiq_domain::PipelineError;

use pipelogiq::infrastructure::repositories::SqliteStateStore;

fn stage(name: &str, handler: &str) -> StageDraft {
    StageDraft {
        name: name.to_string(),
        stage_handler: handler.to_string(),
        input: serde_json::json!({ "stage": name }),
        description: None,
        is_event: false,
        options: None,
    }
}

fn request(name: &str, stages: Vec<StageDraft>) -> CreatePipelineRequest {
    CreatePipelineRequest {
        name: name.to_string(),
        stages,
        pipeline_keywords: vec![],
        pipeline_context: vec![],
        trace_id: None,
    }
}

fn success(stage_id: StageId) -> StageResultMessage {
    StageResultMessage {
        stage_id,
        success: true,
        output: Some(serde_json::json!({ "ok": true })),
        logs: vec![],
        context_updates: vec![],
    }
}

fn failure(stage_id: StageId) -> StageResultMessage {
    StageResultMessage {
        stage_id,
        success: false,
        output: Some(serde_json::json!({ "error": "boom" })),
        logs: vec![],
        context_updates: vec![],
    }
}

async fn store_with_app() -> (SqliteStateStore, pipelogiq_domain::value_objects::ApplicationId) {
    let store = SqliteStateStore::in_memory().await.unwrap();
    let app = store.seed_application("test-app", "key-1").await.unwrap();
    (store, app)
}

#[tokio::test]
async fn test_happy_three_stage_pipeline() {
    let (store, app) = store_with_app().await;
    let created = store
        .create_pipeline(request("etl", vec![stage("A", "handlerA"), stage("B", "handlerB"), stage("C", "handlerC")]), app)
        .await
        .unwrap();
    let pipeline_id = created.pipeline.id();

    for expected in ["handlerA", "handlerB", "handlerC"] {
        let job = store.claim_next_stage().await.unwrap().expect("a stage should be claimable");
        assert_eq!(job.handler, expected);
        assert_eq!(job.pipeline_id, pipeline_id);

        // While this stage is Pending, nothing else is claimable.
        assert!(store.claim_next_stage().await.unwrap().is_none());

        let snapshot = store.apply_stage_result(success(job.stage_id)).await.unwrap().unwrap();
        assert_eq!(snapshot.stage_status, StageStatus::Completed);
    }

    let detail = store.get_pipeline(pipeline_id).await.unwrap();
    assert_eq!(detail.pipeline.status(), PipelineStatus::Completed);
    assert!(detail.pipeline.is_completed());
    let finished_at = detail.pipeline.finished_at().expect("finished_at set");
    assert!((Utc::now() - finished_at).num_seconds() < 5);
    assert!(detail.stages.iter().all(|s| s.status() == StageStatus::Completed));
}

#[tokio::test]
async fn test_claim_respects_ordering_and_trace() {
    let (store, app) = store_with_app().await;
    let created = store
        .create_pipeline(request("p", vec![stage("A", "h"), stage("B", "h")]), app)
        .await
        .unwrap();

    let job = store.claim_next_stage().await.unwrap().unwrap();
    assert_eq!(job.stage_id, created.stages[0].id());
    assert_eq!(&job.trace_id, created.pipeline.trace_id());
    assert_eq!(&job.span_id, created.stages[0].span_id());
    assert_eq!(job.input["stage"], "A");

    let detail = store.get_pipeline(created.pipeline.id()).await.unwrap();
    assert_eq!(detail.pipeline.status(), PipelineStatus::Running);
    assert_eq!(detail.stages[0].status(), StageStatus::Pending);
    assert!(detail.stages[0].started_at().is_some());
}

#[tokio::test]
async fn test_single_retry_then_success() {
    let (store, app) = store_with_app().await;
    let mut draft = stage("A", "h");
    draft.options = Some(StageOptions {
        max_retries: 1,
        retry_interval_sec: 1,
        ..StageOptions::default()
    });
    let created = store.create_pipeline(request("retry", vec![draft]), app).await.unwrap();
    let stage_id = created.stages[0].id();

    let job = store.claim_next_stage().await.unwrap().unwrap();
    let snapshot = store.apply_stage_result(failure(job.stage_id)).await.unwrap().unwrap();
    assert_eq!(snapshot.stage_status, StageStatus::RetryScheduled);
    assert_eq!(snapshot.pipeline_status, PipelineStatus::Running);

    let stages = store.get_stages(created.pipeline.id()).await.unwrap();
    assert_eq!(stages[0].retry_attempt(), 1);
    let next_retry = stages[0].next_retry_at().expect("next_retry_at set");
    assert!(next_retry > Utc::now() - chrono::Duration::seconds(1));

    // Not claimable before the retry instant.
    assert!(store.claim_next_stage().await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(1200)).await;
    let job = store.claim_next_stage().await.unwrap().expect("retry due");
    assert_eq!(job.stage_id, stage_id);

    let snapshot = store.apply_stage_result(success(stage_id)).await.unwrap().unwrap();
    assert_eq!(snapshot.stage_status, StageStatus::Completed);
    assert_eq!(snapshot.pipeline_status, PipelineStatus::Completed);
}

#[tokio::test]
async fn test_retry_exhaustion_fails_pipeline() {
    let (store, app) = store_with_app().await;
    let mut draft = stage("A", "h");
    draft.options = Some(StageOptions {
        max_retries: 1,
        retry_interval_sec: 1,
        ..StageOptions::default()
    });
    let created = store.create_pipeline(request("retry", vec![draft]), app).await.unwrap();

    let job = store.claim_next_stage().await.unwrap().unwrap();
    store.apply_stage_result(failure(job.stage_id)).await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_millis(1200)).await;
    let job = store.claim_next_stage().await.unwrap().unwrap();
    let snapshot = store.apply_stage_result(failure(job.stage_id)).await.unwrap().unwrap();

    assert_eq!(snapshot.stage_status, StageStatus::Failed);
    assert_eq!(snapshot.pipeline_status, PipelineStatus::Failed);
    assert!(snapshot.is_completed);

    let stages = store.get_stages(created.pipeline.id()).await.unwrap();
    assert_eq!(stages[0].retry_attempt(), 1);
}

#[tokio::test]
async fn test_failure_without_retry_budget_is_terminal() {
    let (store, app) = store_with_app().await;
    let created = store
        .create_pipeline(request("p", vec![stage("A", "h"), stage("B", "h")]), app)
        .await
        .unwrap();

    let job = store.claim_next_stage().await.unwrap().unwrap();
    let snapshot = store.apply_stage_result(failure(job.stage_id)).await.unwrap().unwrap();
    assert_eq!(snapshot.stage_status, StageStatus::Failed);
    assert_eq!(snapshot.pipeline_status, PipelineStatus::Failed);

    // The failed pipeline schedules nothing further.
    assert!(store.claim_next_stage().await.unwrap().is_none());
    let detail = store.get_pipeline(created.pipeline.id()).await.unwrap();
    assert_eq!(detail.stages[1].status(), StageStatus::NotStarted);
}

#[tokio::test]
async fn test_duplicate_result_is_idempotent() {
    let (store, app) = store_with_app().await;
    let created = store.create_pipeline(request("p", vec![stage("A", "h")]), app).await.unwrap();

    let job = store.claim_next_stage().await.unwrap().unwrap();
    let first = store.apply_stage_result(success(job.stage_id)).await.unwrap();
    assert!(first.is_some());

    // Second delivery of the same result is a quiet no-op.
    let second = store.apply_stage_result(success(job.stage_id)).await.unwrap();
    assert!(second.is_none());

    let detail = store.get_pipeline(created.pipeline.id()).await.unwrap();
    assert_eq!(detail.pipeline.status(), PipelineStatus::Completed);
}

#[tokio::test]
async fn test_result_for_unknown_stage_is_not_found() {
    let (store, _app) = store_with_app().await;
    let err = store.apply_stage_result(success(StageId::new(999))).await.unwrap_err();
    assert!(matches!(err, PipelineError::NotFound(_)));
}

#[tokio::test]
async fn test_pending_watchdog_fails_stage_and_pipeline() {
    let (store, app) = store_with_app().await;
    let created = store.create_pipeline(request("p", vec![stage("B", "h")]), app).await.unwrap();

    let job = store.claim_next_stage().await.unwrap().unwrap();

    let stalled = store.mark_pending_too_long(Duration::from_secs(0)).await.unwrap();
    assert_eq!(stalled.len(), 1);
    assert_eq!(stalled[0].stage_id, job.stage_id);

    let detail = store.get_pipeline(created.pipeline.id()).await.unwrap();
    assert_eq!(detail.pipeline.status(), PipelineStatus::Failed);
    assert!(detail.pipeline.is_completed());
    assert_eq!(detail.stages[0].status(), StageStatus::Failed);

    let output = detail.stages[0].io().output.as_ref().expect("explanatory output");
    assert!(output.as_str().unwrap().contains("pending for too long"));

    // A late result for the reaped stage is ignored.
    assert!(store.apply_stage_result(success(job.stage_id)).await.unwrap().is_none());
}

#[tokio::test]
async fn test_watchdog_ignores_fresh_pending() {
    let (store, app) = store_with_app().await;
    store.create_pipeline(request("p", vec![stage("A", "h")]), app).await.unwrap();
    store.claim_next_stage().await.unwrap().unwrap();

    let stalled = store.mark_pending_too_long(Duration::from_secs(600)).await.unwrap();
    assert!(stalled.is_empty());
}

#[tokio::test]
async fn test_skip_then_scheduler_jumps_over() {
    let (store, app) = store_with_app().await;
    let created = store
        .create_pipeline(request("p", vec![stage("X", "hx"), stage("Y", "hy"), stage("Z", "hz")]), app)
        .await
        .unwrap();

    // X goes Pending.
    let job_x = store.claim_next_stage().await.unwrap().unwrap();
    assert_eq!(job_x.handler, "hx");

    // Skip Y while X is in flight; the pipeline keeps running.
    let snapshot = store.skip_stage(created.stages[1].id()).await.unwrap();
    assert_eq!(snapshot.stage_status, StageStatus::Skipped);
    assert_eq!(snapshot.pipeline_status, PipelineStatus::Running);

    store.apply_stage_result(success(job_x.stage_id)).await.unwrap().unwrap();

    // The scheduler claims Z directly.
    let job_z = store.claim_next_stage().await.unwrap().unwrap();
    assert_eq!(job_z.handler, "hz");

    let snapshot = store.apply_stage_result(success(job_z.stage_id)).await.unwrap().unwrap();
    assert_eq!(snapshot.pipeline_status, PipelineStatus::Completed);
    assert!(snapshot.is_completed);
}

#[tokio::test]
async fn test_rerun_resets_stage_and_following() {
    let (store, app) = store_with_app().await;
    let created = store
        .create_pipeline(request("p", vec![stage("A", "h"), stage("B", "h"), stage("C", "h")]), app)
        .await
        .unwrap();
    let pipeline_id = created.pipeline.id();

    for _ in 0..3 {
        let job = store.claim_next_stage().await.unwrap().unwrap();
        store.apply_stage_result(success(job.stage_id)).await.unwrap().unwrap();
    }
    assert!(store.get_pipeline(pipeline_id).await.unwrap().pipeline.is_completed());

    store.rerun_stage(created.stages[1].id(), true).await.unwrap();

    let detail = store.get_pipeline(pipeline_id).await.unwrap();
    assert_eq!(detail.pipeline.status(), PipelineStatus::Running);
    assert!(!detail.pipeline.is_completed());
    assert_eq!(detail.stages[0].status(), StageStatus::Completed);
    assert_eq!(detail.stages[1].status(), StageStatus::NotStarted);
    assert_eq!(detail.stages[2].status(), StageStatus::NotStarted);
    assert!(detail.stages[1].io().output.is_none());

    // Scheduling resumes at B.
    let job = store.claim_next_stage().await.unwrap().unwrap();
    assert_eq!(job.stage_id, created.stages[1].id());
}

#[tokio::test]
async fn test_set_stage_status_override() {
    let (store, app) = store_with_app().await;
    let created = store.create_pipeline(request("p", vec![stage("A", "h")]), app).await.unwrap();

    let job = store.claim_next_stage().await.unwrap().unwrap();
    let snapshot = store.set_stage_status(job.stage_id, StageStatus::Failed).await.unwrap();
    assert_eq!(snapshot.stage_status, StageStatus::Failed);
    assert_eq!(snapshot.pipeline_status, PipelineStatus::Failed);

    let logs = store.get_stage_logs(created.pipeline.id(), Some(job.stage_id)).await.unwrap();
    assert!(logs.iter().any(|l| l.message.contains("Status changed to Failed")));
}

#[tokio::test]
async fn test_event_stage_bypasses_scheduler() {
    let (store, app) = store_with_app().await;
    let mut event = stage("notify", "notifier");
    event.is_event = true;
    let created = store
        .create_pipeline(request("p", vec![event, stage("A", "h")]), app)
        .await
        .unwrap();

    // The event stage is leased out at creation.
    assert_eq!(created.event_jobs.len(), 1);
    assert_eq!(created.event_jobs[0].handler, "notifier");
    assert_eq!(created.stages[0].status(), StageStatus::Pending);

    // The sequential scheduler ignores it and claims A.
    let job = store.claim_next_stage().await.unwrap().unwrap();
    assert_eq!(job.handler, "h");

    // Its result still applies.
    let snapshot = store
        .apply_stage_result(success(created.event_jobs[0].stage_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.stage_status, StageStatus::Completed);
}

#[tokio::test]
async fn test_context_snapshot_and_upsert() {
    let (store, app) = store_with_app().await;
    let mut req = request("p", vec![stage("A", "h"), stage("B", "h")]);
    req.pipeline_context = vec![ContextItem {
        key: "batch".to_string(),
        value: serde_json::json!("2026-07"),
        value_type: Some("string".to_string()),
    }];
    let created = store.create_pipeline(req, app).await.unwrap();

    let job = store.claim_next_stage().await.unwrap().unwrap();
    assert_eq!(job.context.get("batch").unwrap(), &serde_json::json!("2026-07"));

    store
        .apply_stage_result(StageResultMessage {
            stage_id: job.stage_id,
            success: true,
            output: None,
            logs: vec![StageLogDraft {
                level: Some("warn".to_string()),
                message: "slow extract".to_string(),
            }],
            context_updates: vec![
                ContextUpdate {
                    key: "batch".to_string(),
                    value: serde_json::json!("2026-08"),
                    value_type: Some("string".to_string()),
                },
                ContextUpdate {
                    key: "rows".to_string(),
                    value: serde_json::json!(1042),
                    value_type: Some("number".to_string()),
                },
            ],
        })
        .await
        .unwrap()
        .unwrap();

    // The next claim sees the updated context.
    let job_b = store.claim_next_stage().await.unwrap().unwrap();
    assert_eq!(job_b.context.get("batch").unwrap(), &serde_json::json!("2026-08"));
    assert_eq!(job_b.context.get("rows").unwrap(), &serde_json::json!(1042));

    let context = store.get_context(created.pipeline.id()).await.unwrap();
    assert_eq!(context.len(), 2);

    let logs = store.get_stage_logs(created.pipeline.id(), None).await.unwrap();
    assert!(logs.iter().any(|l| l.message == "slow extract"));
}

#[tokio::test]
async fn test_concurrent_claims_get_distinct_stages() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("claims.db").display());
    let store = Arc::new(SqliteStateStore::connect(&url).await.unwrap());
    let app = store.seed_application("test-app", "key-1").await.unwrap();

    store.create_pipeline(request("p1", vec![stage("A", "h")]), app).await.unwrap();
    store.create_pipeline(request("p2", vec![stage("A", "h")]), app).await.unwrap();

    let s1 = store.clone();
    let s2 = store.clone();
    let (a, b) = tokio::join!(
        tokio::spawn(async move { s1.claim_next_stage().await }),
        tokio::spawn(async move { s2.claim_next_stage().await }),
    );

    let a = a.unwrap().unwrap().expect("first claim");
    let b = b.unwrap().unwrap().expect("second claim");
    assert_ne!(a.stage_id, b.stage_id);
    assert_ne!(a.pipeline_id, b.pipeline_id);
}

#[tokio::test]
async fn test_api_key_validation() {
    let (store, app) = store_with_app().await;
    assert_eq!(store.validate_api_key("key-1").await.unwrap(), app);

    let err = store.validate_api_key("nope").await.unwrap_err();
    assert!(matches!(err, PipelineError::AuthError(_)));
}

#[tokio::test]
async fn test_create_rejects_invalid_request() {
    let (store, app) = store_with_app().await;
    let err = store.create_pipeline(request("empty", vec![]), app).await.unwrap_err();
    assert!(matches!(err, PipelineError::ValidationError(_)));

    let mut req = request("p", vec![stage("A", "h")]);
    req.trace_id = Some("not-hex".to_string());
    let err = store.create_pipeline(req, app).await.unwrap_err();
    assert!(matches!(err, PipelineError::ValidationError(_)));
}

#[tokio::test]
async fn test_keywords_deduplicated_and_listable() {
    let (store, app) = store_with_app().await;
    let mut req = request("nightly-etl", vec![stage("A", "h")]);
    req.pipeline_keywords = vec![
        pipelogiq_domain::entities::PipelineKeyword {
            key: "env".to_string(),
            value: "prod".to_string(),
        },
        pipelogiq_domain::entities::PipelineKeyword {
            key: "env".to_string(),
            value: "prod".to_string(),
        },
    ];
    let created = store.create_pipeline(req, app).await.unwrap();

    let detail = store.get_pipeline(created.pipeline.id()).await.unwrap();
    assert_eq!(detail.keywords.len(), 1);

    // Filter by keyword and by substring.
    let filter = pipelogiq_domain::repositories::PipelineFilter {
        keywords: detail.keywords.clone(),
        search: Some("nightly".to_string()),
        ..Default::default()
    };
    let page = store.list_pipelines(filter).await.unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].stage_count, 1);

    let filter = pipelogiq_domain::repositories::PipelineFilter {
        search: Some("no-such".to_string()),
        ..Default::default()
    };
    assert_eq!(store.list_pipelines(filter).await.unwrap().total, 0);
}
