// /////////////////////////////////////////////////////////////////////////////
// Pipelogiq
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Postgres State Store
//!
//! The production implementation of the `StateStore` contract. Shares the
//! SQL shape and transactional semantics of the SQLite store; the
//! differences are the placeholder syntax (`$n`), native booleans and
//! `TIMESTAMPTZ` columns, and the claim query's `FOR UPDATE SKIP LOCKED`
//! row lock, which lets N concurrent schedulers claim N distinct stages
//! without serializing on the table.
//!
//! The schema is managed by the external migration tool; this store
//! expects it to exist and fails fast on `ping` when it does not.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use pipelogiq_domain::entities::derive_pipeline_status;
use pipelogiq_domain::entities::worker::{
    EVENT_WORKER_BOOTSTRAP, EVENT_WORKER_EVENT, EVENT_WORKER_STATE_CHANGED, EVENT_WORKER_STOPPED,
};
use pipelogiq_domain::entities::{
    ApiKey, ContextItem, LogLevel, Pipeline, PipelineKeyword, PipelineStatus, Stage, StageIO, StageLog,
    StageOptions, StageStatus, WorkerClient, WorkerEvent, WorkerMetrics, WorkerState,
};
use pipelogiq_domain::events::{StageJob, StageResultMessage};
use pipelogiq_domain::repositories::{
    AlertSink, AppLogEntry, CreatePipelineRequest, CreatedPipeline, HeartbeatUpdate, PipelineDetail,
    PipelineFilter, PipelinePage, PipelineSnapshot, PipelineSummary, SessionIssue, StalledStage, StateStore,
    WorkerEventDraft, WorkerRegistration,
};
use pipelogiq_domain::services::{decide_result_outcome, ResultOutcome};
use pipelogiq_domain::value_objects::{ApplicationId, PipelineId, SpanId, StageId, TraceId, WorkerId};
use pipelogiq_domain::PipelineError;

use crate::infrastructure::repositories::notify::{self, SinkSlot};

const STAGE_SELECT: &str = "SELECT s.id, s.pipeline_id, s.ordinal, s.handler, s.name, s.description, s.span_id, \
     s.status, s.is_skipped, s.is_event, s.retry_attempt, \
     s.created_at, s.started_at, s.finished_at, s.next_retry_at, \
     io.input AS input, io.output AS output, \
     COALESCE(o.max_retries, 0) AS max_retries, \
     COALESCE(o.retry_interval_sec, 0) AS retry_interval_sec, \
     o.timeout_sec AS timeout_sec, \
     COALESCE(o.notify_on_failure, FALSE) AS notify_on_failure, \
     o.retry_only_policy AS retry_only_policy \
     FROM stage s \
     LEFT JOIN stage_io io ON io.stage_id = s.id \
     LEFT JOIN stage_options o ON o.stage_id = s.id";

fn db_err(context: &str, e: sqlx::Error) -> PipelineError {
    PipelineError::database(format!("{}: {}", context, e))
}

fn corrupt(context: &str, detail: impl std::fmt::Display) -> PipelineError {
    PipelineError::internal(format!("corrupt row ({}): {}", context, detail))
}

fn parse_json_text(text: Option<String>) -> Result<Option<serde_json::Value>, PipelineError> {
    match text {
        None => Ok(None),
        Some(text) => serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| corrupt("json column", e)),
    }
}

fn map_pipeline(row: &PgRow) -> Result<Pipeline, PipelineError> {
    let status: String = row.try_get("status").map_err(|e| db_err("pipeline.status", e))?;
    let trace: String = row.try_get("trace_id").map_err(|e| db_err("pipeline.trace_id", e))?;
    Ok(Pipeline::from_parts(
        PipelineId::new(row.try_get("id").map_err(|e| db_err("pipeline.id", e))?),
        ApplicationId::new(row.try_get("application_id").map_err(|e| db_err("pipeline.application_id", e))?),
        row.try_get("name").map_err(|e| db_err("pipeline.name", e))?,
        status.parse::<PipelineStatus>().map_err(|e| corrupt("pipeline.status", e))?,
        TraceId::parse(&trace).map_err(|e| corrupt("pipeline.trace_id", e))?,
        row.try_get("is_completed").map_err(|e| db_err("pipeline.is_completed", e))?,
        row.try_get("created_at").map_err(|e| db_err("pipeline.created_at", e))?,
        row.try_get("finished_at").map_err(|e| db_err("pipeline.finished_at", e))?,
    ))
}

fn map_stage(row: &PgRow) -> Result<Stage, PipelineError> {
    let status: String = row.try_get("status").map_err(|e| db_err("stage.status", e))?;
    let span: String = row.try_get("span_id").map_err(|e| db_err("stage.span_id", e))?;
    let input = parse_json_text(row.try_get("input").map_err(|e| db_err("stage.input", e))?)?
        .unwrap_or(serde_json::Value::Null);
    let output = parse_json_text(row.try_get("output").map_err(|e| db_err("stage.output", e))?)?;

    let timeout_sec: Option<i32> = row.try_get("timeout_sec").map_err(|e| db_err("stage.timeout_sec", e))?;
    let options = StageOptions {
        max_retries: row.try_get::<i32, _>("max_retries").map_err(|e| db_err("stage.max_retries", e))? as u32,
        retry_interval_sec: row
            .try_get::<i32, _>("retry_interval_sec")
            .map_err(|e| db_err("stage.retry_interval_sec", e))? as u32,
        timeout_sec: timeout_sec.map(|v| v as u32),
        notify_on_failure: row.try_get("notify_on_failure").map_err(|e| db_err("stage.notify_on_failure", e))?,
        retry_only_policy: row.try_get("retry_only_policy").map_err(|e| db_err("stage.retry_only_policy", e))?,
    };

    Ok(Stage::from_parts(
        StageId::new(row.try_get("id").map_err(|e| db_err("stage.id", e))?),
        PipelineId::new(row.try_get("pipeline_id").map_err(|e| db_err("stage.pipeline_id", e))?),
        row.try_get::<i32, _>("ordinal").map_err(|e| db_err("stage.ordinal", e))?,
        row.try_get("handler").map_err(|e| db_err("stage.handler", e))?,
        row.try_get("name").map_err(|e| db_err("stage.name", e))?,
        row.try_get("description").map_err(|e| db_err("stage.description", e))?,
        SpanId::parse(&span).map_err(|e| corrupt("stage.span_id", e))?,
        status.parse::<StageStatus>().map_err(|e| corrupt("stage.status", e))?,
        row.try_get("is_skipped").map_err(|e| db_err("stage.is_skipped", e))?,
        row.try_get("is_event").map_err(|e| db_err("stage.is_event", e))?,
        row.try_get::<i32, _>("retry_attempt").map_err(|e| db_err("stage.retry_attempt", e))? as u32,
        row.try_get("created_at").map_err(|e| db_err("stage.created_at", e))?,
        row.try_get("started_at").map_err(|e| db_err("stage.started_at", e))?,
        row.try_get("finished_at").map_err(|e| db_err("stage.finished_at", e))?,
        row.try_get("next_retry_at").map_err(|e| db_err("stage.next_retry_at", e))?,
        StageIO { input, output },
        options,
    ))
}

fn map_stage_log(row: &PgRow) -> Result<StageLog, PipelineError> {
    let level: String = row.try_get("log_level").map_err(|e| db_err("stage_log.log_level", e))?;
    Ok(StageLog {
        stage_id: StageId::new(row.try_get("stage_id").map_err(|e| db_err("stage_log.stage_id", e))?),
        created_at: row.try_get("created_at").map_err(|e| db_err("stage_log.created_at", e))?,
        log_level: LogLevel::normalize(&level),
        message: row.try_get("message").map_err(|e| db_err("stage_log.message", e))?,
    })
}

fn map_worker(row: &PgRow) -> Result<WorkerClient, PipelineError> {
    let id: String = row.try_get("id").map_err(|e| db_err("worker_client.id", e))?;
    let state: String = row.try_get("state").map_err(|e| db_err("worker_client.state", e))?;
    let capabilities: String = row.try_get("capabilities").map_err(|e| db_err("worker_client.capabilities", e))?;
    let handlers: String = row.try_get("handlers").map_err(|e| db_err("worker_client.handlers", e))?;

    let metrics = WorkerMetrics::from_raw(
        row.try_get::<i64, _>("in_flight").map_err(|e| db_err("worker_client.in_flight", e))?,
        row.try_get::<i64, _>("jobs_processed").map_err(|e| db_err("worker_client.jobs_processed", e))?,
        row.try_get::<i64, _>("jobs_failed").map_err(|e| db_err("worker_client.jobs_failed", e))?,
        row.try_get::<i64, _>("queue_lag").map_err(|e| db_err("worker_client.queue_lag", e))?,
        row.try_get::<f64, _>("cpu_percent").map_err(|e| db_err("worker_client.cpu_percent", e))?,
        row.try_get::<f64, _>("memory_mb").map_err(|e| db_err("worker_client.memory_mb", e))?,
    );

    Ok(WorkerClient::from_parts(
        id.parse::<WorkerId>().map_err(|e| corrupt("worker_client.id", e))?,
        ApplicationId::new(
            row.try_get("application_id")
                .map_err(|e| db_err("worker_client.application_id", e))?,
        ),
        row.try_get("worker_name").map_err(|e| db_err("worker_client.worker_name", e))?,
        row.try_get("instance_id").map_err(|e| db_err("worker_client.instance_id", e))?,
        state.parse::<WorkerState>().map_err(|e| corrupt("worker_client.state", e))?,
        metrics,
        row.try_get("last_error").map_err(|e| db_err("worker_client.last_error", e))?,
        serde_json::from_str(&capabilities).map_err(|e| corrupt("worker_client.capabilities", e))?,
        serde_json::from_str(&handlers).map_err(|e| corrupt("worker_client.handlers", e))?,
        row.try_get("session_token").map_err(|e| db_err("worker_client.session_token", e))?,
        row.try_get("session_expires_at")
            .map_err(|e| db_err("worker_client.session_expires_at", e))?,
        row.try_get("last_seen_at").map_err(|e| db_err("worker_client.last_seen_at", e))?,
        row.try_get("created_at").map_err(|e| db_err("worker_client.created_at", e))?,
        row.try_get("updated_at").map_err(|e| db_err("worker_client.updated_at", e))?,
        row.try_get("stopped_at").map_err(|e| db_err("worker_client.stopped_at", e))?,
    ))
}

fn map_worker_event(row: &PgRow) -> Result<WorkerEvent, PipelineError> {
    let worker_id: String = row.try_get("worker_id").map_err(|e| db_err("worker_event.worker_id", e))?;
    let level: String = row.try_get("level").map_err(|e| db_err("worker_event.level", e))?;
    Ok(WorkerEvent {
        worker_id: worker_id.parse::<WorkerId>().map_err(|e| corrupt("worker_event.worker_id", e))?,
        ts: row.try_get("ts").map_err(|e| db_err("worker_event.ts", e))?,
        level: LogLevel::normalize(&level),
        event_type: row.try_get("event_type").map_err(|e| db_err("worker_event.event_type", e))?,
        message: row.try_get("message").map_err(|e| db_err("worker_event.message", e))?,
        details: parse_json_text(row.try_get("details").map_err(|e| db_err("worker_event.details", e))?)?,
    })
}

/// Postgres implementation of the state store.
pub struct PostgresStateStore {
    pool: PgPool,
    sink: SinkSlot,
}

impl PostgresStateStore {
    /// Connects to Postgres. The schema must already exist.
    pub async fn connect(url: &str) -> Result<Self, PipelineError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await
            .map_err(|e| db_err("failed to connect to postgres", e))?;

        let store = Self {
            pool,
            sink: notify::empty_slot(),
        };
        store.ping().await?;
        info!("postgres state store ready");
        Ok(store)
    }

    async fn recompute_pipeline<'t>(
        tx: &mut sqlx::Transaction<'t, Postgres>,
        pipeline_id: PipelineId,
        now: DateTime<Utc>,
    ) -> Result<(PipelineStatus, bool, Option<DateTime<Utc>>), PipelineError> {
        let rows = sqlx::query("SELECT status, is_skipped FROM stage WHERE pipeline_id = $1")
            .bind(pipeline_id.value())
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| db_err("failed to read sibling stages", e))?;

        let mut pairs = Vec::with_capacity(rows.len());
        for row in &rows {
            let status: String = row.try_get("status").map_err(|e| db_err("stage.status", e))?;
            let is_skipped: bool = row.try_get("is_skipped").map_err(|e| db_err("stage.is_skipped", e))?;
            pairs.push((status.parse::<StageStatus>().map_err(|e| corrupt("stage.status", e))?, is_skipped));
        }

        let status = derive_pipeline_status(pairs);
        let is_completed = status.is_terminal();
        let finished_at = if is_completed { Some(now) } else { None };

        sqlx::query("UPDATE pipeline SET status = $1, is_completed = $2, finished_at = $3 WHERE id = $4")
            .bind(status.as_str())
            .bind(is_completed)
            .bind(finished_at)
            .bind(pipeline_id.value())
            .execute(&mut **tx)
            .await
            .map_err(|e| db_err("failed to update pipeline status", e))?;

        Ok((status, is_completed, finished_at))
    }

    async fn insert_stage_log<'t>(
        tx: &mut sqlx::Transaction<'t, Postgres>,
        stage_id: StageId,
        level: LogLevel,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), PipelineError> {
        sqlx::query("INSERT INTO stage_log (stage_id, created_at, log_level, message) VALUES ($1, $2, $3, $4)")
            .bind(stage_id.value())
            .bind(now)
            .bind(level.as_str())
            .bind(message)
            .execute(&mut **tx)
            .await
            .map_err(|e| db_err("failed to append stage log", e))?;
        Ok(())
    }

    async fn upsert_keyword<'t>(
        tx: &mut sqlx::Transaction<'t, Postgres>,
        keyword: &PipelineKeyword,
    ) -> Result<i64, PipelineError> {
        sqlx::query("INSERT INTO keyword (key, value) VALUES ($1, $2) ON CONFLICT (key, value) DO NOTHING")
            .bind(&keyword.key)
            .bind(&keyword.value)
            .execute(&mut **tx)
            .await
            .map_err(|e| db_err("failed to upsert keyword", e))?;
        sqlx::query_scalar("SELECT id FROM keyword WHERE key = $1 AND value = $2")
            .bind(&keyword.key)
            .bind(&keyword.value)
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| db_err("failed to read keyword id", e))
    }

    async fn keywords_for(&self, pipeline_id: PipelineId) -> Result<Vec<PipelineKeyword>, PipelineError> {
        let rows = sqlx::query(
            "SELECT k.key, k.value FROM pipeline_keyword pk \
             JOIN keyword k ON k.id = pk.keyword_id WHERE pk.pipeline_id = $1 ORDER BY k.key, k.value",
        )
        .bind(pipeline_id.value())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("failed to read pipeline keywords", e))?;

        rows.iter()
            .map(|row| {
                Ok(PipelineKeyword {
                    key: row.try_get("key").map_err(|e| db_err("keyword.key", e))?,
                    value: row.try_get("value").map_err(|e| db_err("keyword.value", e))?,
                })
            })
            .collect()
    }

    fn push_pipeline_filters<'q>(qb: &mut QueryBuilder<'q, Postgres>, filter: &'q PipelineFilter) {
        if let Some(app) = filter.application_id {
            qb.push(" AND p.application_id = ").push_bind(app.value());
        }
        if !filter.statuses.is_empty() {
            qb.push(" AND p.status IN (");
            let mut separated = qb.separated(", ");
            for status in &filter.statuses {
                separated.push_bind(status.as_str());
            }
            qb.push(")");
        }
        if let Some(search) = &filter.search {
            qb.push(" AND p.name ILIKE ").push_bind(format!("%{}%", search));
        }
        if let Some(from) = filter.created_from {
            qb.push(" AND p.created_at >= ").push_bind(from);
        }
        if let Some(to) = filter.created_to {
            qb.push(" AND p.created_at <= ").push_bind(to);
        }
        if let Some(from) = filter.finished_from {
            qb.push(" AND p.finished_at >= ").push_bind(from);
        }
        if let Some(to) = filter.finished_to {
            qb.push(" AND p.finished_at <= ").push_bind(to);
        }
        if !filter.keywords.is_empty() {
            qb.push(
                " AND EXISTS (SELECT 1 FROM pipeline_keyword pk JOIN keyword k ON k.id = pk.keyword_id \
                 WHERE pk.pipeline_id = p.id AND (",
            );
            let mut first = true;
            for keyword in &filter.keywords {
                if !first {
                    qb.push(" OR ");
                }
                first = false;
                qb.push("(k.key = ")
                    .push_bind(keyword.key.clone())
                    .push(" AND k.value = ")
                    .push_bind(keyword.value.clone())
                    .push(")");
            }
            qb.push("))");
        }
    }
}

#[async_trait]
impl StateStore for PostgresStateStore {
    async fn ping(&self) -> Result<(), PipelineError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| db_err("ping failed", e))
    }

    async fn validate_api_key(&self, key: &str) -> Result<ApplicationId, PipelineError> {
        let now = Utc::now();
        let row = sqlx::query(
            "SELECT key, application_id, created_at, expires_at, disabled_at FROM api_key WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_err("failed to look up api key", e))?;

        let row = row.ok_or_else(|| PipelineError::auth("unknown API key"))?;
        let api_key = ApiKey {
            key: row.try_get("key").map_err(|e| db_err("api_key.key", e))?,
            application_id: ApplicationId::new(
                row.try_get("application_id").map_err(|e| db_err("api_key.application_id", e))?,
            ),
            created_at: row.try_get("created_at").map_err(|e| db_err("api_key.created_at", e))?,
            expires_at: row.try_get("expires_at").map_err(|e| db_err("api_key.expires_at", e))?,
            disabled_at: row.try_get("disabled_at").map_err(|e| db_err("api_key.disabled_at", e))?,
        };

        if !api_key.is_valid(now) {
            return Err(PipelineError::auth("API key is disabled or expired"));
        }

        if let Err(e) = sqlx::query("UPDATE api_key SET last_used_at = $1 WHERE key = $2")
            .bind(now)
            .bind(key)
            .execute(&self.pool)
            .await
        {
            debug!(error = %e, "failed to update api key last_used_at");
        }

        Ok(api_key.application_id)
    }

    async fn create_pipeline(
        &self,
        req: CreatePipelineRequest,
        application_id: ApplicationId,
    ) -> Result<CreatedPipeline, PipelineError> {
        req.validate()?;
        let now = Utc::now();
        let trace_id = match &req.trace_id {
            Some(raw) => TraceId::parse(raw)?,
            None => TraceId::new(),
        };

        let mut tx = self.pool.begin().await.map_err(|e| db_err("failed to begin transaction", e))?;

        let pipeline_id: i64 = sqlx::query_scalar(
            "INSERT INTO pipeline (application_id, name, status, trace_id, is_completed, created_at) \
             VALUES ($1, $2, 'NotStarted', $3, FALSE, $4) RETURNING id",
        )
        .bind(application_id.value())
        .bind(&req.name)
        .bind(trace_id.as_str())
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| db_err("failed to insert pipeline", e))?;
        let pipeline_id = PipelineId::new(pipeline_id);

        let context_snapshot: BTreeMap<String, serde_json::Value> = req
            .pipeline_context
            .iter()
            .map(|item| (item.key.clone(), item.value.clone()))
            .collect();

        let mut stages = Vec::with_capacity(req.stages.len());
        let mut event_jobs = Vec::new();

        for (ordinal, draft) in req.stages.iter().enumerate() {
            let span_id = SpanId::new();
            let (status, started_at) = if draft.is_event {
                (StageStatus::Pending, Some(now))
            } else {
                (StageStatus::NotStarted, None)
            };

            let stage_id: i64 = sqlx::query_scalar(
                "INSERT INTO stage (pipeline_id, ordinal, handler, name, description, span_id, status, \
                 is_skipped, is_event, retry_attempt, created_at, started_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, FALSE, $8, 0, $9, $10) RETURNING id",
            )
            .bind(pipeline_id.value())
            .bind(ordinal as i32)
            .bind(&draft.stage_handler)
            .bind(&draft.name)
            .bind(&draft.description)
            .bind(span_id.as_str())
            .bind(status.as_str())
            .bind(draft.is_event)
            .bind(now)
            .bind(started_at)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| db_err("failed to insert stage", e))?;
            let stage_id = StageId::new(stage_id);

            sqlx::query("INSERT INTO stage_io (stage_id, input, output) VALUES ($1, $2, NULL)")
                .bind(stage_id.value())
                .bind(draft.input.to_string())
                .execute(&mut *tx)
                .await
                .map_err(|e| db_err("failed to insert stage io", e))?;

            if let Some(options) = &draft.options {
                sqlx::query(
                    "INSERT INTO stage_options \
                     (stage_id, max_retries, retry_interval_sec, timeout_sec, notify_on_failure, retry_only_policy) \
                     VALUES ($1, $2, $3, $4, $5, $6)",
                )
                .bind(stage_id.value())
                .bind(options.max_retries as i32)
                .bind(options.retry_interval_sec as i32)
                .bind(options.timeout_sec.map(|v| v as i32))
                .bind(options.notify_on_failure)
                .bind(&options.retry_only_policy)
                .execute(&mut *tx)
                .await
                .map_err(|e| db_err("failed to insert stage options", e))?;
            }

            if draft.is_event {
                event_jobs.push(StageJob {
                    application_id,
                    pipeline_id,
                    stage_id,
                    trace_id: trace_id.clone(),
                    span_id: span_id.clone(),
                    handler: draft.stage_handler.clone(),
                    name: draft.name.clone(),
                    input: draft.input.clone(),
                    context: context_snapshot.clone(),
                });
            }

            stages.push(Stage::from_parts(
                stage_id,
                pipeline_id,
                ordinal as i32,
                draft.stage_handler.clone(),
                draft.name.clone(),
                draft.description.clone(),
                span_id,
                status,
                false,
                draft.is_event,
                0,
                now,
                started_at,
                None,
                None,
                StageIO {
                    input: draft.input.clone(),
                    output: None,
                },
                draft.options.clone().unwrap_or_default(),
            ));
        }

        let mut seen = HashSet::new();
        for keyword in &req.pipeline_keywords {
            if !seen.insert((keyword.key.clone(), keyword.value.clone())) {
                continue;
            }
            let keyword_id = Self::upsert_keyword(&mut tx, keyword).await?;
            sqlx::query(
                "INSERT INTO pipeline_keyword (pipeline_id, keyword_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
            )
            .bind(pipeline_id.value())
            .bind(keyword_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_err("failed to link pipeline keyword", e))?;
        }

        for item in &req.pipeline_context {
            sqlx::query(
                "INSERT INTO pipeline_context_item (pipeline_id, key, value, value_type) VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (pipeline_id, key) DO UPDATE SET value = EXCLUDED.value, value_type = EXCLUDED.value_type",
            )
            .bind(pipeline_id.value())
            .bind(&item.key)
            .bind(item.value.to_string())
            .bind(&item.value_type)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_err("failed to insert context item", e))?;
        }

        tx.commit().await.map_err(|e| db_err("failed to commit pipeline creation", e))?;

        let pipeline = Pipeline::from_parts(
            pipeline_id,
            application_id,
            req.name.clone(),
            PipelineStatus::NotStarted,
            trace_id,
            false,
            now,
            None,
        );

        info!(pipeline_id = %pipeline_id, stages = stages.len(), "pipeline created");
        Ok(CreatedPipeline {
            pipeline,
            stages,
            event_jobs,
        })
    }

    async fn claim_next_stage(&self) -> Result<Option<StageJob>, PipelineError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(|e| db_err("failed to begin transaction", e))?;

        // SKIP LOCKED makes concurrent schedulers pick distinct rows
        // instead of queueing on the same one.
        let claimed = sqlx::query(
            "UPDATE stage SET status = 'Pending', started_at = $1, finished_at = NULL, next_retry_at = NULL \
             WHERE id = (\
                 SELECT s.id FROM stage s \
                 JOIN pipeline p ON p.id = s.pipeline_id \
                 WHERE p.is_completed = FALSE \
                   AND s.is_skipped = FALSE \
                   AND s.is_event = FALSE \
                   AND (s.status = 'NotStarted' OR (s.status = 'RetryScheduled' AND s.next_retry_at <= $1)) \
                   AND NOT EXISTS (\
                       SELECT 1 FROM stage f \
                       WHERE f.pipeline_id = s.pipeline_id AND f.is_event = FALSE \
                         AND f.status IN ('Pending', 'Running')) \
                   AND NOT EXISTS (\
                       SELECT 1 FROM stage prior \
                       WHERE prior.pipeline_id = s.pipeline_id AND prior.is_event = FALSE \
                         AND prior.ordinal < s.ordinal \
                         AND prior.status NOT IN ('Completed', 'Skipped')) \
                 ORDER BY s.pipeline_id ASC, s.ordinal ASC \
                 LIMIT 1 \
                 FOR UPDATE OF s SKIP LOCKED) \
             RETURNING id, pipeline_id, handler, name, span_id",
        )
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| db_err("failed to claim stage", e))?;

        let Some(row) = claimed else {
            tx.commit().await.map_err(|e| db_err("failed to commit empty claim", e))?;
            return Ok(None);
        };

        let stage_id = StageId::new(row.try_get("id").map_err(|e| db_err("stage.id", e))?);
        let pipeline_id = PipelineId::new(row.try_get("pipeline_id").map_err(|e| db_err("stage.pipeline_id", e))?);
        let handler: String = row.try_get("handler").map_err(|e| db_err("stage.handler", e))?;
        let name: String = row.try_get("name").map_err(|e| db_err("stage.name", e))?;
        let span: String = row.try_get("span_id").map_err(|e| db_err("stage.span_id", e))?;

        sqlx::query("UPDATE pipeline SET status = 'Running' WHERE id = $1")
            .bind(pipeline_id.value())
            .execute(&mut *tx)
            .await
            .map_err(|e| db_err("failed to mark pipeline running", e))?;

        let pipeline_row = sqlx::query("SELECT application_id, trace_id FROM pipeline WHERE id = $1")
            .bind(pipeline_id.value())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| db_err("failed to read pipeline for claim", e))?;
        let application_id =
            ApplicationId::new(pipeline_row.try_get("application_id").map_err(|e| db_err("pipeline.application_id", e))?);
        let trace: String = pipeline_row.try_get("trace_id").map_err(|e| db_err("pipeline.trace_id", e))?;

        let input_text: Option<String> = sqlx::query_scalar("SELECT input FROM stage_io WHERE stage_id = $1")
            .bind(stage_id.value())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| db_err("failed to read stage input", e))?
            .flatten();
        let input = parse_json_text(input_text)?.unwrap_or(serde_json::Value::Null);

        let context_rows = sqlx::query("SELECT key, value FROM pipeline_context_item WHERE pipeline_id = $1")
            .bind(pipeline_id.value())
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| db_err("failed to snapshot context", e))?;
        let mut context = BTreeMap::new();
        for row in &context_rows {
            let key: String = row.try_get("key").map_err(|e| db_err("context.key", e))?;
            let value: String = row.try_get("value").map_err(|e| db_err("context.value", e))?;
            context.insert(key, serde_json::from_str(&value).map_err(|e| corrupt("context.value", e))?);
        }

        tx.commit().await.map_err(|e| db_err("failed to commit claim", e))?;

        debug!(stage_id = %stage_id, pipeline_id = %pipeline_id, handler = %handler, "stage claimed");
        Ok(Some(StageJob {
            application_id,
            pipeline_id,
            stage_id,
            trace_id: TraceId::parse(&trace).map_err(|e| corrupt("pipeline.trace_id", e))?,
            span_id: SpanId::parse(&span).map_err(|e| corrupt("stage.span_id", e))?,
            handler,
            name,
            input,
            context,
        }))
    }

    async fn apply_stage_result(
        &self,
        result: StageResultMessage,
    ) -> Result<Option<PipelineSnapshot>, PipelineError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(|e| db_err("failed to begin transaction", e))?;

        // Lock the stage row; racing duplicate deliveries serialize here
        // and the loser sees the already-terminal status.
        let row = sqlx::query(
            "SELECT s.pipeline_id, s.status, s.retry_attempt, \
             COALESCE(o.max_retries, 0) AS max_retries, \
             COALESCE(o.retry_interval_sec, 0) AS retry_interval_sec \
             FROM stage s LEFT JOIN stage_options o ON o.stage_id = s.id WHERE s.id = $1 FOR UPDATE OF s",
        )
        .bind(result.stage_id.value())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| db_err("failed to read stage for result", e))?;

        let row = row.ok_or_else(|| PipelineError::not_found(format!("stage {}", result.stage_id)))?;
        let pipeline_id = PipelineId::new(row.try_get("pipeline_id").map_err(|e| db_err("stage.pipeline_id", e))?);
        let status: String = row.try_get("status").map_err(|e| db_err("stage.status", e))?;
        let status = status.parse::<StageStatus>().map_err(|e| corrupt("stage.status", e))?;

        if !status.is_in_flight() {
            tx.rollback().await.ok();
            debug!(stage_id = %result.stage_id, %status, "ignoring result for stage not in flight");
            return Ok(None);
        }

        let retry_attempt = row.try_get::<i32, _>("retry_attempt").map_err(|e| db_err("stage.retry_attempt", e))? as u32;
        let options = StageOptions {
            max_retries: row.try_get::<i32, _>("max_retries").map_err(|e| db_err("stage.max_retries", e))? as u32,
            retry_interval_sec: row
                .try_get::<i32, _>("retry_interval_sec")
                .map_err(|e| db_err("stage.retry_interval_sec", e))? as u32,
            ..StageOptions::default()
        };

        let outcome = decide_result_outcome(result.success, retry_attempt, &options, now);
        let stage_status = match &outcome {
            ResultOutcome::Completed => {
                sqlx::query("UPDATE stage SET status = 'Completed', finished_at = $1, next_retry_at = NULL WHERE id = $2")
                    .bind(now)
                    .bind(result.stage_id.value())
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| db_err("failed to complete stage", e))?;
                StageStatus::Completed
            }
            ResultOutcome::RetryScheduled {
                retry_attempt,
                next_retry_at,
            } => {
                sqlx::query(
                    "UPDATE stage SET status = 'RetryScheduled', retry_attempt = $1, next_retry_at = $2, \
                     finished_at = $3 WHERE id = $4",
                )
                .bind(*retry_attempt as i32)
                .bind(next_retry_at)
                .bind(now)
                .bind(result.stage_id.value())
                .execute(&mut *tx)
                .await
                .map_err(|e| db_err("failed to schedule retry", e))?;
                StageStatus::RetryScheduled
            }
            ResultOutcome::Failed => {
                sqlx::query("UPDATE stage SET status = 'Failed', finished_at = $1, next_retry_at = NULL WHERE id = $2")
                    .bind(now)
                    .bind(result.stage_id.value())
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| db_err("failed to fail stage", e))?;
                StageStatus::Failed
            }
        };

        if let Some(output) = &result.output {
            sqlx::query("UPDATE stage_io SET output = $1 WHERE stage_id = $2")
                .bind(output.to_string())
                .bind(result.stage_id.value())
                .execute(&mut *tx)
                .await
                .map_err(|e| db_err("failed to write stage output", e))?;
        }

        for log in &result.logs {
            let level = LogLevel::normalize(log.level.as_deref().unwrap_or("INFO"));
            Self::insert_stage_log(&mut tx, result.stage_id, level, &log.message, now).await?;
        }

        for update in &result.context_updates {
            sqlx::query(
                "INSERT INTO pipeline_context_item (pipeline_id, key, value, value_type) VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (pipeline_id, key) DO UPDATE SET value = EXCLUDED.value, value_type = EXCLUDED.value_type",
            )
            .bind(pipeline_id.value())
            .bind(&update.key)
            .bind(update.value.to_string())
            .bind(&update.value_type)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_err("failed to upsert context item", e))?;
        }

        let (pipeline_status, is_completed, finished_at) =
            Self::recompute_pipeline(&mut tx, pipeline_id, now).await?;

        tx.commit().await.map_err(|e| db_err("failed to commit result", e))?;

        let snapshot = PipelineSnapshot {
            pipeline_id,
            stage_id: result.stage_id,
            pipeline_status,
            stage_status,
            is_completed,
            finished_at,
        };
        notify::stage_changed(&self.sink, &snapshot);

        info!(
            stage_id = %result.stage_id,
            pipeline_id = %pipeline_id,
            success = result.success,
            stage_status = %stage_status,
            pipeline_status = %pipeline_status,
            "stage result applied"
        );
        Ok(Some(snapshot))
    }

    async fn set_stage_status(
        &self,
        stage_id: StageId,
        status: StageStatus,
    ) -> Result<PipelineSnapshot, PipelineError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(|e| db_err("failed to begin transaction", e))?;

        let row = sqlx::query("SELECT pipeline_id, is_skipped FROM stage WHERE id = $1 FOR UPDATE")
            .bind(stage_id.value())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| db_err("failed to read stage", e))?
            .ok_or_else(|| PipelineError::not_found(format!("stage {}", stage_id)))?;
        let pipeline_id = PipelineId::new(row.try_get("pipeline_id").map_err(|e| db_err("stage.pipeline_id", e))?);
        let was_skipped: bool = row.try_get("is_skipped").map_err(|e| db_err("stage.is_skipped", e))?;

        let is_skipped = status == StageStatus::Skipped || (was_skipped && status != StageStatus::NotStarted);
        let finished_at = if status.is_terminal() { Some(now) } else { None };

        sqlx::query("UPDATE stage SET status = $1, is_skipped = $2, finished_at = $3 WHERE id = $4")
            .bind(status.as_str())
            .bind(is_skipped)
            .bind(finished_at)
            .bind(stage_id.value())
            .execute(&mut *tx)
            .await
            .map_err(|e| db_err("failed to set stage status", e))?;

        Self::insert_stage_log(
            &mut tx,
            stage_id,
            LogLevel::Info,
            &format!("Status changed to {}", status),
            now,
        )
        .await?;

        let (pipeline_status, is_completed, pipeline_finished_at) =
            Self::recompute_pipeline(&mut tx, pipeline_id, now).await?;

        tx.commit().await.map_err(|e| db_err("failed to commit status change", e))?;

        let snapshot = PipelineSnapshot {
            pipeline_id,
            stage_id,
            pipeline_status,
            stage_status: status,
            is_completed,
            finished_at: pipeline_finished_at,
        };
        notify::stage_changed(&self.sink, &snapshot);
        Ok(snapshot)
    }

    async fn rerun_stage(&self, stage_id: StageId, include_following: bool) -> Result<(), PipelineError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(|e| db_err("failed to begin transaction", e))?;

        let row = sqlx::query("SELECT pipeline_id, ordinal FROM stage WHERE id = $1 FOR UPDATE")
            .bind(stage_id.value())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| db_err("failed to read stage", e))?
            .ok_or_else(|| PipelineError::not_found(format!("stage {}", stage_id)))?;
        let pipeline_id = PipelineId::new(row.try_get("pipeline_id").map_err(|e| db_err("stage.pipeline_id", e))?);
        let ordinal: i32 = row.try_get("ordinal").map_err(|e| db_err("stage.ordinal", e))?;

        let affected: Vec<i64> = if include_following {
            sqlx::query_scalar("SELECT id FROM stage WHERE pipeline_id = $1 AND ordinal >= $2 ORDER BY ordinal")
                .bind(pipeline_id.value())
                .bind(ordinal)
                .fetch_all(&mut *tx)
                .await
                .map_err(|e| db_err("failed to collect stages for rerun", e))?
        } else {
            vec![stage_id.value()]
        };

        for id in &affected {
            sqlx::query(
                "UPDATE stage SET status = 'NotStarted', is_skipped = FALSE, retry_attempt = 0, \
                 started_at = NULL, finished_at = NULL, next_retry_at = NULL WHERE id = $1",
            )
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_err("failed to reset stage", e))?;

            sqlx::query("UPDATE stage_io SET output = NULL WHERE stage_id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(|e| db_err("failed to clear stage output", e))?;

            Self::insert_stage_log(&mut tx, StageId::new(*id), LogLevel::Info, "Stage reset for rerun", now).await?;
        }

        sqlx::query("UPDATE pipeline SET status = 'Running', is_completed = FALSE, finished_at = NULL WHERE id = $1")
            .bind(pipeline_id.value())
            .execute(&mut *tx)
            .await
            .map_err(|e| db_err("failed to reopen pipeline", e))?;

        tx.commit().await.map_err(|e| db_err("failed to commit rerun", e))?;

        info!(stage_id = %stage_id, pipeline_id = %pipeline_id, stages = affected.len(), "stages reset for rerun");
        Ok(())
    }

    async fn skip_stage(&self, stage_id: StageId) -> Result<PipelineSnapshot, PipelineError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(|e| db_err("failed to begin transaction", e))?;

        let row = sqlx::query("SELECT pipeline_id FROM stage WHERE id = $1 FOR UPDATE")
            .bind(stage_id.value())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| db_err("failed to read stage", e))?
            .ok_or_else(|| PipelineError::not_found(format!("stage {}", stage_id)))?;
        let pipeline_id = PipelineId::new(row.try_get("pipeline_id").map_err(|e| db_err("stage.pipeline_id", e))?);

        sqlx::query("UPDATE stage SET status = 'Skipped', is_skipped = TRUE, finished_at = $1 WHERE id = $2")
            .bind(now)
            .bind(stage_id.value())
            .execute(&mut *tx)
            .await
            .map_err(|e| db_err("failed to skip stage", e))?;

        Self::insert_stage_log(&mut tx, stage_id, LogLevel::Info, "Stage skipped", now).await?;

        let (pipeline_status, is_completed, finished_at) =
            Self::recompute_pipeline(&mut tx, pipeline_id, now).await?;

        tx.commit().await.map_err(|e| db_err("failed to commit skip", e))?;

        let snapshot = PipelineSnapshot {
            pipeline_id,
            stage_id,
            pipeline_status,
            stage_status: StageStatus::Skipped,
            is_completed,
            finished_at,
        };
        notify::stage_changed(&self.sink, &snapshot);
        Ok(snapshot)
    }

    async fn mark_pending_too_long(&self, older_than: std::time::Duration) -> Result<Vec<StalledStage>, PipelineError> {
        let now = Utc::now();
        let cutoff = now
            - chrono::Duration::from_std(older_than)
                .map_err(|e| PipelineError::invalid_config(format!("invalid watchdog threshold: {}", e)))?;

        let candidates: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM stage WHERE status = 'Pending' AND COALESCE(started_at, created_at) <= $1",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("failed to select stalled stages", e))?;

        let mut stalled = Vec::new();

        for id in candidates {
            let stage_id = StageId::new(id);
            let mut tx = self.pool.begin().await.map_err(|e| db_err("failed to begin transaction", e))?;

            let row = sqlx::query(
                "SELECT pipeline_id, status, started_at, created_at FROM stage WHERE id = $1 FOR UPDATE",
            )
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| db_err("failed to re-read stalled stage", e))?;

            let Some(row) = row else {
                tx.rollback().await.ok();
                continue;
            };
            let status: String = row.try_get("status").map_err(|e| db_err("stage.status", e))?;
            if status.parse::<StageStatus>().map_err(|e| corrupt("stage.status", e))? != StageStatus::Pending {
                tx.rollback().await.ok();
                continue;
            }

            let pipeline_id = PipelineId::new(row.try_get("pipeline_id").map_err(|e| db_err("stage.pipeline_id", e))?);
            let started_at: Option<DateTime<Utc>> = row.try_get("started_at").map_err(|e| db_err("stage.started_at", e))?;
            let created_at: DateTime<Utc> = row.try_get("created_at").map_err(|e| db_err("stage.created_at", e))?;
            let pending_secs = (now - started_at.unwrap_or(created_at)).num_seconds();
            let message = format!("Stage has been pending for too long - {} seconds", pending_secs);

            sqlx::query("UPDATE stage SET status = 'Failed', finished_at = $1, next_retry_at = NULL WHERE id = $2")
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(|e| db_err("failed to fail stalled stage", e))?;

            sqlx::query("UPDATE stage_io SET output = $1 WHERE stage_id = $2")
                .bind(serde_json::Value::String(message.clone()).to_string())
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(|e| db_err("failed to write stalled output", e))?;

            Self::insert_stage_log(&mut tx, stage_id, LogLevel::Error, &message, now).await?;

            sqlx::query("UPDATE pipeline SET status = 'Failed', is_completed = TRUE, finished_at = $1 WHERE id = $2")
                .bind(now)
                .bind(pipeline_id.value())
                .execute(&mut *tx)
                .await
                .map_err(|e| db_err("failed to fail pipeline of stalled stage", e))?;

            tx.commit().await.map_err(|e| db_err("failed to commit stalled stage", e))?;

            let snapshot = PipelineSnapshot {
                pipeline_id,
                stage_id,
                pipeline_status: PipelineStatus::Failed,
                stage_status: StageStatus::Failed,
                is_completed: true,
                finished_at: Some(now),
            };
            notify::stage_changed(&self.sink, &snapshot);

            stalled.push(StalledStage {
                stage_id,
                pipeline_id,
                pending_secs,
            });
        }

        Ok(stalled)
    }

    async fn list_pipelines(&self, filter: PipelineFilter) -> Result<PipelinePage, PipelineError> {
        let mut count_qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM pipeline p WHERE 1=1");
        Self::push_pipeline_filters(&mut count_qb, &filter);
        let total: i64 = count_qb
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| db_err("failed to count pipelines", e))?;

        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT p.id, p.application_id, p.name, p.status, p.trace_id, p.is_completed, \
             p.created_at, p.finished_at FROM pipeline p WHERE 1=1",
        );
        Self::push_pipeline_filters(&mut qb, &filter);
        qb.push(" ORDER BY p.id DESC LIMIT ")
            .push_bind(filter.page_size() as i64)
            .push(" OFFSET ")
            .push_bind(filter.offset() as i64);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("failed to list pipelines", e))?;

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            let pipeline = map_pipeline(row)?;
            let keywords = self.keywords_for(pipeline.id()).await?;
            let stage_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM stage WHERE pipeline_id = $1")
                .bind(pipeline.id().value())
                .fetch_one(&self.pool)
                .await
                .map_err(|e| db_err("failed to count stages", e))?;
            items.push(PipelineSummary {
                pipeline,
                keywords,
                stage_count,
            });
        }

        Ok(PipelinePage {
            items,
            total,
            page: filter.page(),
            page_size: filter.page_size(),
        })
    }

    async fn get_pipeline(&self, id: PipelineId) -> Result<PipelineDetail, PipelineError> {
        let row = sqlx::query(
            "SELECT id, application_id, name, status, trace_id, is_completed, created_at, finished_at \
             FROM pipeline WHERE id = $1",
        )
        .bind(id.value())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_err("failed to read pipeline", e))?
        .ok_or_else(|| PipelineError::not_found(format!("pipeline {}", id)))?;

        let pipeline = map_pipeline(&row)?;
        let stages = self.get_stages(id).await?;
        let keywords = self.keywords_for(id).await?;
        let context = self.get_context(id).await?;
        let logs = self.get_stage_logs(id, None).await?;

        Ok(PipelineDetail {
            pipeline,
            stages,
            keywords,
            context,
            logs,
        })
    }

    async fn get_stages(&self, pipeline_id: PipelineId) -> Result<Vec<Stage>, PipelineError> {
        let sql = format!("{} WHERE s.pipeline_id = $1 ORDER BY s.ordinal", STAGE_SELECT);
        let rows = sqlx::query(&sql)
            .bind(pipeline_id.value())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("failed to read stages", e))?;
        rows.iter().map(map_stage).collect()
    }

    async fn get_context(&self, pipeline_id: PipelineId) -> Result<Vec<ContextItem>, PipelineError> {
        let rows = sqlx::query(
            "SELECT key, value, value_type FROM pipeline_context_item WHERE pipeline_id = $1 ORDER BY key",
        )
        .bind(pipeline_id.value())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("failed to read context", e))?;

        rows.iter()
            .map(|row| {
                let value: String = row.try_get("value").map_err(|e| db_err("context.value", e))?;
                Ok(ContextItem {
                    key: row.try_get("key").map_err(|e| db_err("context.key", e))?,
                    value: serde_json::from_str(&value).map_err(|e| corrupt("context.value", e))?,
                    value_type: row.try_get("value_type").map_err(|e| db_err("context.value_type", e))?,
                })
            })
            .collect()
    }

    async fn get_stage_logs(
        &self,
        pipeline_id: PipelineId,
        stage_id: Option<StageId>,
    ) -> Result<Vec<StageLog>, PipelineError> {
        let rows = match stage_id {
            Some(stage_id) => {
                sqlx::query(
                    "SELECT sl.stage_id, sl.created_at, sl.log_level, sl.message FROM stage_log sl \
                     JOIN stage s ON s.id = sl.stage_id \
                     WHERE s.pipeline_id = $1 AND sl.stage_id = $2 ORDER BY sl.id",
                )
                .bind(pipeline_id.value())
                .bind(stage_id.value())
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT sl.stage_id, sl.created_at, sl.log_level, sl.message FROM stage_log sl \
                     JOIN stage s ON s.id = sl.stage_id WHERE s.pipeline_id = $1 ORDER BY sl.id",
                )
                .bind(pipeline_id.value())
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(|e| db_err("failed to read stage logs", e))?;

        rows.iter().map(map_stage_log).collect()
    }

    async fn append_app_log(&self, application_id: ApplicationId, entry: AppLogEntry) -> Result<(), PipelineError> {
        let now = Utc::now();
        let level = LogLevel::normalize(entry.level.as_deref().unwrap_or("INFO"));
        let mut tx = self.pool.begin().await.map_err(|e| db_err("failed to begin transaction", e))?;

        let log_id: i64 = sqlx::query_scalar(
            "INSERT INTO log (application_id, created_at, log_level, message) VALUES ($1, $2, $3, $4) RETURNING id",
        )
        .bind(application_id.value())
        .bind(now)
        .bind(level.as_str())
        .bind(&entry.message)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| db_err("failed to append log", e))?;

        for keyword in &entry.keywords {
            let keyword_id = Self::upsert_keyword(&mut tx, keyword).await?;
            sqlx::query("INSERT INTO log_keyword (log_id, keyword_id) VALUES ($1, $2) ON CONFLICT DO NOTHING")
                .bind(log_id)
                .bind(keyword_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| db_err("failed to link log keyword", e))?;
        }

        tx.commit().await.map_err(|e| db_err("failed to commit log", e))
    }

    async fn bootstrap_worker(
        &self,
        application_id: ApplicationId,
        registration: WorkerRegistration,
        session: SessionIssue,
    ) -> Result<WorkerClient, PipelineError> {
        registration.validate()?;
        let now = Utc::now();
        let capabilities = serde_json::to_string(&registration.capabilities)?;
        let handlers = serde_json::to_string(&registration.handlers)?;

        let mut tx = self.pool.begin().await.map_err(|e| db_err("failed to begin transaction", e))?;

        let existing: Option<String> = sqlx::query_scalar(
            "SELECT id FROM worker_client WHERE application_id = $1 AND instance_id = $2 FOR UPDATE",
        )
        .bind(application_id.value())
        .bind(&registration.instance_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| db_err("failed to look up worker", e))?;

        let worker_id = match existing {
            Some(id) => {
                let worker_id = id.parse::<WorkerId>().map_err(|e| corrupt("worker_client.id", e))?;
                sqlx::query(
                    "UPDATE worker_client SET worker_name = $1, state = 'starting', in_flight = 0, \
                     jobs_processed = 0, jobs_failed = 0, queue_lag = 0, cpu_percent = 0, memory_mb = 0, \
                     last_error = NULL, capabilities = $2, handlers = $3, session_token = $4, \
                     session_expires_at = $5, last_seen_at = $6, updated_at = $6, stopped_at = NULL WHERE id = $7",
                )
                .bind(&registration.worker_name)
                .bind(&capabilities)
                .bind(&handlers)
                .bind(&session.token)
                .bind(session.expires_at)
                .bind(now)
                .bind(&id)
                .execute(&mut *tx)
                .await
                .map_err(|e| db_err("failed to refresh worker", e))?;
                worker_id
            }
            None => {
                let worker_id = WorkerId::new();
                sqlx::query(
                    "INSERT INTO worker_client (id, application_id, worker_name, instance_id, state, \
                     capabilities, handlers, session_token, session_expires_at, last_seen_at, created_at, updated_at) \
                     VALUES ($1, $2, $3, $4, 'starting', $5, $6, $7, $8, $9, $9, $9)",
                )
                .bind(worker_id.to_string())
                .bind(application_id.value())
                .bind(&registration.worker_name)
                .bind(&registration.instance_id)
                .bind(&capabilities)
                .bind(&handlers)
                .bind(&session.token)
                .bind(session.expires_at)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(|e| db_err("failed to insert worker", e))?;
                worker_id
            }
        };

        let details = serde_json::json!({
            "instanceId": registration.instance_id,
            "handlers": registration.handlers,
        });
        sqlx::query(
            "INSERT INTO worker_event (worker_id, ts, level, event_type, message, details) \
             VALUES ($1, $2, 'INFO', $3, $4, $5)",
        )
        .bind(worker_id.to_string())
        .bind(now)
        .bind(EVENT_WORKER_BOOTSTRAP)
        .bind("worker bootstrapped")
        .bind(details.to_string())
        .execute(&mut *tx)
        .await
        .map_err(|e| db_err("failed to append bootstrap event", e))?;

        tx.commit().await.map_err(|e| db_err("failed to commit bootstrap", e))?;

        let event = WorkerEvent {
            worker_id,
            ts: now,
            level: LogLevel::Info,
            event_type: EVENT_WORKER_BOOTSTRAP.to_string(),
            message: "worker bootstrapped".to_string(),
            details: Some(details),
        };
        notify::worker_event(&self.sink, &event);

        let row = sqlx::query("SELECT * FROM worker_client WHERE id = $1")
            .bind(worker_id.to_string())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| db_err("failed to re-read worker", e))?;
        map_worker(&row)
    }

    async fn find_worker_by_session(&self, token: &str) -> Result<WorkerClient, PipelineError> {
        let row = sqlx::query("SELECT * FROM worker_client WHERE session_token = $1")
            .bind(token)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("failed to look up session", e))?
            .ok_or_else(|| PipelineError::auth("unknown worker session"))?;

        let worker = map_worker(&row)?;
        if !worker.session_is_valid(token, Utc::now()) {
            return Err(PipelineError::auth("worker session expired"));
        }
        Ok(worker)
    }

    async fn heartbeat_worker(&self, worker_id: WorkerId, update: HeartbeatUpdate) -> Result<(), PipelineError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(|e| db_err("failed to begin transaction", e))?;

        let previous: Option<String> = sqlx::query_scalar("SELECT state FROM worker_client WHERE id = $1 FOR UPDATE")
            .bind(worker_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| db_err("failed to read worker state", e))?;
        let previous = previous
            .ok_or_else(|| PipelineError::not_found(format!("worker {}", worker_id)))?
            .parse::<WorkerState>()
            .map_err(|e| corrupt("worker_client.state", e))?;

        let next = update.state.unwrap_or(previous);
        let metrics = update.metrics;

        sqlx::query(
            "UPDATE worker_client SET state = $1, in_flight = $2, jobs_processed = $3, jobs_failed = $4, \
             queue_lag = $5, cpu_percent = $6, memory_mb = $7, last_error = $8, last_seen_at = $9, \
             updated_at = $9 WHERE id = $10",
        )
        .bind(next.as_str())
        .bind(metrics.in_flight as i64)
        .bind(metrics.jobs_processed as i64)
        .bind(metrics.jobs_failed as i64)
        .bind(metrics.queue_lag as i64)
        .bind(metrics.cpu_percent)
        .bind(metrics.memory_mb)
        .bind(&update.last_error)
        .bind(now)
        .bind(worker_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(|e| db_err("failed to persist heartbeat", e))?;

        sqlx::query(
            "INSERT INTO worker_heartbeat (worker_id, ts, state, in_flight, jobs_processed, jobs_failed, \
             queue_lag, cpu_percent, memory_mb) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(worker_id.to_string())
        .bind(now)
        .bind(next.as_str())
        .bind(metrics.in_flight as i64)
        .bind(metrics.jobs_processed as i64)
        .bind(metrics.jobs_failed as i64)
        .bind(metrics.queue_lag as i64)
        .bind(metrics.cpu_percent)
        .bind(metrics.memory_mb)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_err("failed to append heartbeat row", e))?;

        let state_changed = next != previous;
        if state_changed {
            sqlx::query(
                "INSERT INTO worker_event (worker_id, ts, level, event_type, message) VALUES ($1, $2, 'INFO', $3, $4)",
            )
            .bind(worker_id.to_string())
            .bind(now)
            .bind(EVENT_WORKER_STATE_CHANGED)
            .bind(format!("state changed from {} to {}", previous, next))
            .execute(&mut *tx)
            .await
            .map_err(|e| db_err("failed to append state change event", e))?;
        }

        tx.commit().await.map_err(|e| db_err("failed to commit heartbeat", e))?;

        if state_changed {
            let event = WorkerEvent {
                worker_id,
                ts: now,
                level: LogLevel::Info,
                event_type: EVENT_WORKER_STATE_CHANGED.to_string(),
                message: format!("state changed from {} to {}", previous, next),
                details: None,
            };
            notify::worker_event(&self.sink, &event);
        }
        Ok(())
    }

    async fn append_worker_events(
        &self,
        worker_id: WorkerId,
        events: Vec<WorkerEventDraft>,
    ) -> Result<(), PipelineError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(|e| db_err("failed to begin transaction", e))?;

        let exists: Option<String> = sqlx::query_scalar("SELECT id FROM worker_client WHERE id = $1")
            .bind(worker_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| db_err("failed to check worker", e))?;
        if exists.is_none() {
            return Err(PipelineError::not_found(format!("worker {}", worker_id)));
        }

        let mut appended = Vec::with_capacity(events.len());
        for draft in &events {
            let level = LogLevel::normalize(draft.level.as_deref().unwrap_or("INFO"));
            let event_type = draft.event_type.clone().unwrap_or_else(|| EVENT_WORKER_EVENT.to_string());
            sqlx::query(
                "INSERT INTO worker_event (worker_id, ts, level, event_type, message, details) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(worker_id.to_string())
            .bind(now)
            .bind(level.as_str())
            .bind(&event_type)
            .bind(&draft.message)
            .bind(draft.details.as_ref().map(|d| d.to_string()))
            .execute(&mut *tx)
            .await
            .map_err(|e| db_err("failed to append worker event", e))?;

            appended.push(WorkerEvent {
                worker_id,
                ts: now,
                level,
                event_type,
                message: draft.message.clone(),
                details: draft.details.clone(),
            });
        }

        tx.commit().await.map_err(|e| db_err("failed to commit worker events", e))?;

        for event in &appended {
            notify::worker_event(&self.sink, event);
        }
        Ok(())
    }

    async fn shutdown_worker(&self, worker_id: WorkerId, reason: Option<String>) -> Result<(), PipelineError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(|e| db_err("failed to begin transaction", e))?;

        let updated = sqlx::query(
            "UPDATE worker_client SET state = 'stopped', stopped_at = $1, updated_at = $1 WHERE id = $2",
        )
        .bind(now)
        .bind(worker_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(|e| db_err("failed to stop worker", e))?;
        if updated.rows_affected() == 0 {
            return Err(PipelineError::not_found(format!("worker {}", worker_id)));
        }

        let message = match &reason {
            Some(reason) => format!("worker stopped: {}", reason),
            None => "worker stopped".to_string(),
        };
        sqlx::query(
            "INSERT INTO worker_event (worker_id, ts, level, event_type, message) VALUES ($1, $2, 'INFO', $3, $4)",
        )
        .bind(worker_id.to_string())
        .bind(now)
        .bind(EVENT_WORKER_STOPPED)
        .bind(&message)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_err("failed to append stop event", e))?;

        tx.commit().await.map_err(|e| db_err("failed to commit shutdown", e))?;

        let event = WorkerEvent {
            worker_id,
            ts: now,
            level: LogLevel::Info,
            event_type: EVENT_WORKER_STOPPED.to_string(),
            message,
            details: None,
        };
        notify::worker_event(&self.sink, &event);
        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerClient>, PipelineError> {
        let rows = sqlx::query("SELECT * FROM worker_client ORDER BY worker_name, instance_id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("failed to list workers", e))?;
        rows.iter().map(map_worker).collect()
    }

    async fn get_worker_events(
        &self,
        worker_id: Option<WorkerId>,
        limit: u32,
    ) -> Result<Vec<WorkerEvent>, PipelineError> {
        let rows = match worker_id {
            Some(worker_id) => {
                sqlx::query(
                    "SELECT worker_id, ts, level, event_type, message, details FROM worker_event \
                     WHERE worker_id = $1 ORDER BY id DESC LIMIT $2",
                )
                .bind(worker_id.to_string())
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT worker_id, ts, level, event_type, message, details FROM worker_event \
                     ORDER BY id DESC LIMIT $1",
                )
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(|e| db_err("failed to read worker events", e))?;

        rows.iter().map(map_worker_event).collect()
    }

    fn set_alert_sink(&self, sink: Arc<dyn AlertSink>) {
        *self.sink.write() = Some(sink);
    }
}
