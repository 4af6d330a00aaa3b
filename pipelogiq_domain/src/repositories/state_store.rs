// /////////////////////////////////////////////////////////////////////////////
// Pipelogiq
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # State Store Contract
//!
//! The transactional port every other component mutates durable state
//! through. Each operation completes or fails atomically; partial updates
//! are never observable. Two infrastructure implementations exist — the
//! embedded SQLite store for development and the Postgres store for
//! production — sharing these semantics exactly.
//!
//! ## Concurrency Contract
//!
//! - `claim_next_stage` uses row locking so N concurrent schedulers receive
//!   N distinct stages (or `None`), never the same stage twice.
//! - `apply_stage_result` re-reads the stage under lock and quietly returns
//!   `None` when the stage is no longer Pending/Running, which makes
//!   duplicate broker deliveries safe.
//! - `mark_pending_too_long` runs one transaction per stalled stage, so a
//!   crash mid-sweep leaves every already-failed stage consistent.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::entities::{
    ContextItem, Pipeline, PipelineKeyword, PipelineStatus, Stage, StageLog, StageOptions, StageStatus,
    WorkerClient, WorkerEvent, WorkerMetrics, WorkerState,
};
use crate::events::{StageJob, StageResultMessage, StageUpdatedEvent};
use crate::repositories::AlertSink;
use crate::value_objects::{ApplicationId, PipelineId, StageId, WorkerId};
use crate::PipelineError;

/// One stage in a pipeline creation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageDraft {
    pub name: String,
    pub stage_handler: String,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_event: bool,
    #[serde(default)]
    pub options: Option<StageOptions>,
}

/// A pipeline creation request, as posted by SDKs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePipelineRequest {
    pub name: String,
    pub stages: Vec<StageDraft>,
    #[serde(default)]
    pub pipeline_keywords: Vec<PipelineKeyword>,
    #[serde(default)]
    pub pipeline_context: Vec<ContextItem>,
    /// Optional caller-provided trace id (32-hex); a fresh one is assigned
    /// when absent.
    #[serde(default)]
    pub trace_id: Option<String>,
}

impl CreatePipelineRequest {
    /// Validates the request shape before any row is written.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.name.trim().is_empty() {
            return Err(PipelineError::validation("pipeline name must not be empty"));
        }
        if self.stages.is_empty() {
            return Err(PipelineError::validation("pipeline must define at least one stage"));
        }
        for (idx, stage) in self.stages.iter().enumerate() {
            if stage.name.trim().is_empty() {
                return Err(PipelineError::validation(format!("stage {} has an empty name", idx)));
            }
            if stage.stage_handler.trim().is_empty() {
                return Err(PipelineError::validation(format!(
                    "stage {:?} has an empty stageHandler",
                    stage.name
                )));
            }
        }
        Ok(())
    }
}

/// A freshly created pipeline, including the job descriptors of its event
/// stages so the caller can publish them immediately.
#[derive(Debug, Clone)]
pub struct CreatedPipeline {
    pub pipeline: Pipeline,
    pub stages: Vec<Stage>,
    pub event_jobs: Vec<StageJob>,
}

/// The post-mutation view of a stage and its pipeline, returned by the
/// mutating operations so callers can log and broadcast without re-reading.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSnapshot {
    pub pipeline_id: PipelineId,
    pub stage_id: StageId,
    pub pipeline_status: PipelineStatus,
    pub stage_status: StageStatus,
    pub is_completed: bool,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineSnapshot {
    /// Converts the snapshot into the broadcast event shape.
    pub fn into_event(self, ts: DateTime<Utc>) -> StageUpdatedEvent {
        StageUpdatedEvent {
            pipeline_id: self.pipeline_id,
            stage_id: self.stage_id,
            pipeline_status: self.pipeline_status,
            stage_status: self.stage_status,
            is_completed: self.is_completed,
            ts,
        }
    }
}

/// One stage failed by the pending watchdog.
#[derive(Debug, Clone)]
pub struct StalledStage {
    pub stage_id: StageId,
    pub pipeline_id: PipelineId,
    pub pending_secs: i64,
}

/// Filters and paging for the pipeline listing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineFilter {
    #[serde(default)]
    pub application_id: Option<ApplicationId>,
    #[serde(default)]
    pub statuses: Vec<PipelineStatus>,
    #[serde(default)]
    pub keywords: Vec<PipelineKeyword>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub created_from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub page_size: Option<u32>,
}

impl PipelineFilter {
    /// Maximum page size the listing will serve.
    pub const MAX_PAGE_SIZE: u32 = 200;

    /// Effective 1-based page number.
    pub fn page(&self) -> u32 {
        self.page.unwrap_or(1).max(1)
    }

    /// Effective page size, clamped to [1, MAX_PAGE_SIZE].
    pub fn page_size(&self) -> u32 {
        self.page_size.unwrap_or(50).clamp(1, Self::MAX_PAGE_SIZE)
    }

    /// Row offset for the effective page.
    pub fn offset(&self) -> u32 {
        (self.page() - 1) * self.page_size()
    }
}

/// One row of the pipeline listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSummary {
    #[serde(flatten)]
    pub pipeline: Pipeline,
    pub keywords: Vec<PipelineKeyword>,
    pub stage_count: i64,
}

/// A page of the pipeline listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelinePage {
    pub items: Vec<PipelineSummary>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
}

/// The full pipeline detail served to the dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineDetail {
    #[serde(flatten)]
    pub pipeline: Pipeline,
    pub stages: Vec<Stage>,
    pub keywords: Vec<PipelineKeyword>,
    pub context: Vec<ContextItem>,
    pub logs: Vec<StageLog>,
}

/// One application log line posted through the external surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppLogEntry {
    #[serde(default)]
    pub level: Option<String>,
    pub message: String,
    #[serde(default)]
    pub keywords: Vec<PipelineKeyword>,
}

/// Identity a worker presents at bootstrap.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRegistration {
    pub worker_name: String,
    pub instance_id: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub handlers: Vec<String>,
}

impl WorkerRegistration {
    /// Validates the registration shape.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.worker_name.trim().is_empty() {
            return Err(PipelineError::validation("workerName must not be empty"));
        }
        if self.instance_id.trim().is_empty() {
            return Err(PipelineError::validation("instanceId must not be empty"));
        }
        Ok(())
    }
}

/// A freshly minted session, persisted alongside the worker row.
#[derive(Debug, Clone)]
pub struct SessionIssue {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// The persisted effect of one heartbeat.
#[derive(Debug, Clone)]
pub struct HeartbeatUpdate {
    /// `None` keeps the previous state (the payload carried no valid state).
    pub state: Option<WorkerState>,
    pub metrics: WorkerMetrics,
    pub last_error: Option<String>,
}

/// One worker-submitted event, before normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerEventDraft {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub event_type: Option<String>,
    pub message: String,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}

/// The transactional state store port.
///
/// Implementations own all durable rows; no other component touches the
/// database directly.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Cheap readiness probe against the backing database.
    async fn ping(&self) -> Result<(), PipelineError>;

    // ---- authentication -------------------------------------------------

    /// Resolves an API key to its owning application.
    ///
    /// Rejects disabled and expired keys with `AuthError`. On success the
    /// key's `last_used` column is updated best-effort — a failure there
    /// must not fail the call.
    async fn validate_api_key(&self, key: &str) -> Result<ApplicationId, PipelineError>;

    // ---- pipeline lifecycle ---------------------------------------------

    /// Creates a pipeline with all of its stages, IO rows, options,
    /// deduplicated keywords, and context items in one transaction.
    /// Assigns a fresh trace id when the request carries none.
    async fn create_pipeline(
        &self,
        req: CreatePipelineRequest,
        application_id: ApplicationId,
    ) -> Result<CreatedPipeline, PipelineError>;

    /// Atomically claims the next runnable stage across all pipelines.
    ///
    /// Selection predicate (all must hold):
    /// - owning pipeline not complete;
    /// - status NotStarted, or RetryScheduled with `next_retry_at <= now`;
    /// - not skipped, not an event stage;
    /// - no sibling stage in flight;
    /// - every prior non-event sibling Completed or Skipped.
    ///
    /// Ordered by pipeline id, then ordinal. In the same transaction the
    /// pipeline goes Running, the stage goes Pending with a fresh
    /// `started_at`, and the context is snapshotted into the returned job.
    async fn claim_next_stage(&self) -> Result<Option<StageJob>, PipelineError>;

    /// Applies a worker-reported result.
    ///
    /// Returns `None` without touching anything when the stage is no longer
    /// Pending/Running (duplicate delivery). Otherwise transitions the stage
    /// per the retry decision, appends logs, upserts context items by key,
    /// recomputes the pipeline status, and marks the pipeline complete when
    /// the last stage succeeded or the failure was terminal.
    async fn apply_stage_result(&self, result: StageResultMessage) -> Result<Option<PipelineSnapshot>, PipelineError>;

    /// Out-of-band status override with the same pipeline recompute.
    async fn set_stage_status(
        &self,
        stage_id: StageId,
        status: StageStatus,
    ) -> Result<PipelineSnapshot, PipelineError>;

    /// Resets a stage (and optionally all later stages) to NotStarted,
    /// clearing timing, skip, retry, and output fields, and reopens the
    /// pipeline. Appends a status-change log per affected stage.
    async fn rerun_stage(&self, stage_id: StageId, include_following: bool) -> Result<(), PipelineError>;

    /// Marks a stage Skipped and recomputes the pipeline status.
    async fn skip_stage(&self, stage_id: StageId) -> Result<PipelineSnapshot, PipelineError>;

    /// Fails every stage that has been Pending for at least `older_than`,
    /// failing the owning pipelines too. One transaction per stage; partial
    /// progress is safe.
    async fn mark_pending_too_long(&self, older_than: Duration) -> Result<Vec<StalledStage>, PipelineError>;

    // ---- dashboard reads ------------------------------------------------

    /// Paged pipeline listing with filters.
    async fn list_pipelines(&self, filter: PipelineFilter) -> Result<PipelinePage, PipelineError>;

    /// Full pipeline detail (stages, logs, keywords, context).
    async fn get_pipeline(&self, id: PipelineId) -> Result<PipelineDetail, PipelineError>;

    /// Stages of one pipeline in ordinal order.
    async fn get_stages(&self, pipeline_id: PipelineId) -> Result<Vec<Stage>, PipelineError>;

    /// Context items of one pipeline.
    async fn get_context(&self, pipeline_id: PipelineId) -> Result<Vec<ContextItem>, PipelineError>;

    /// Stage logs of one pipeline, optionally narrowed to one stage.
    async fn get_stage_logs(
        &self,
        pipeline_id: PipelineId,
        stage_id: Option<StageId>,
    ) -> Result<Vec<StageLog>, PipelineError>;

    /// Appends one application log line with its keywords.
    async fn append_app_log(&self, application_id: ApplicationId, entry: AppLogEntry) -> Result<(), PipelineError>;

    // ---- worker registry ------------------------------------------------

    /// Upserts a worker client keyed by `(application_id, instance_id)`:
    /// creates it in `starting` with the issued session, or refreshes the
    /// existing row, resetting counters and clearing stop/error state.
    /// Appends a `worker.bootstrap` event.
    async fn bootstrap_worker(
        &self,
        application_id: ApplicationId,
        registration: WorkerRegistration,
        session: SessionIssue,
    ) -> Result<WorkerClient, PipelineError>;

    /// Resolves a session token to its worker, rejecting unknown and
    /// expired tokens with `AuthError`.
    async fn find_worker_by_session(&self, token: &str) -> Result<WorkerClient, PipelineError>;

    /// Persists one heartbeat: state (when supplied), counters,
    /// `last_seen_at = updated_at = now`; appends a `worker.state_changed`
    /// event on transition and a heartbeat time-series row always.
    async fn heartbeat_worker(&self, worker_id: WorkerId, update: HeartbeatUpdate) -> Result<(), PipelineError>;

    /// Appends worker-submitted events with normalized levels.
    async fn append_worker_events(
        &self,
        worker_id: WorkerId,
        events: Vec<WorkerEventDraft>,
    ) -> Result<(), PipelineError>;

    /// Transitions a worker to `stopped`, stamps `stopped_at`, and appends
    /// a `worker.stopped` event.
    async fn shutdown_worker(&self, worker_id: WorkerId, reason: Option<String>) -> Result<(), PipelineError>;

    /// Lists all worker clients (persisted state; liveness derivation is
    /// the caller's concern).
    async fn list_workers(&self) -> Result<Vec<WorkerClient>, PipelineError>;

    /// Recent worker events, newest first, optionally for one worker.
    async fn get_worker_events(
        &self,
        worker_id: Option<WorkerId>,
        limit: u32,
    ) -> Result<Vec<WorkerEvent>, PipelineError>;

    // ---- notification seam ----------------------------------------------

    /// Installs the optional alert sink. Emissions are fire-and-forget;
    /// with no sink installed they are dropped.
    fn set_alert_sink(&self, sink: Arc<dyn AlertSink>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_request_validation() {
        let mut req = CreatePipelineRequest {
            name: "nightly".to_string(),
            stages: vec![StageDraft {
                name: "extract".to_string(),
                stage_handler: "extractor".to_string(),
                input: serde_json::Value::Null,
                description: None,
                is_event: false,
                options: None,
            }],
            pipeline_keywords: vec![],
            pipeline_context: vec![],
            trace_id: None,
        };
        assert!(req.validate().is_ok());

        req.stages[0].stage_handler = " ".to_string();
        assert!(req.validate().is_err());

        req.stages.clear();
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_filter_paging_defaults() {
        let filter = PipelineFilter::default();
        assert_eq!(filter.page(), 1);
        assert_eq!(filter.page_size(), 50);
        assert_eq!(filter.offset(), 0);

        let filter = PipelineFilter {
            page: Some(3),
            page_size: Some(1000),
            ..PipelineFilter::default()
        };
        assert_eq!(filter.page_size(), PipelineFilter::MAX_PAGE_SIZE);
        assert_eq!(filter.offset(), 2 * PipelineFilter::MAX_PAGE_SIZE);
    }

    #[test]
    fn test_registration_validation() {
        let reg = WorkerRegistration {
            worker_name: "img".to_string(),
            instance_id: "".to_string(),
            capabilities: vec![],
            handlers: vec![],
        };
        assert!(reg.validate().is_err());
    }
}
