// /////////////////////////////////////////////////////////////////////////////
// Pipelogiq
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Pipeline Entity
//!
//! A pipeline is an ordered sequence of stages owned by an application.
//! Pipelines are immutable after creation except for their status fields and
//! attached context.
//!
//! ## Status Invariants
//!
//! - **Completed** iff every non-skipped stage is Completed or Skipped.
//! - **Failed** iff at least one stage failed terminally and no stage is
//!   Pending, Running, or RetryScheduled.
//! - **Running** whenever any stage is in flight or awaiting retry, or when
//!   execution is between stages.
//! - **NotStarted** until the first stage is claimed.
//!
//! [`derive_pipeline_status`] is the single pure implementation of these
//! rules; both state store backends call it after every mutation instead of
//! maintaining their own arithmetic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::stage::StageStatus;
use crate::value_objects::{ApplicationId, PipelineId, TraceId};
use crate::PipelineError;

/// Lifecycle status of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineStatus {
    NotStarted,
    Running,
    Completed,
    Failed,
}

impl PipelineStatus {
    /// Returns the canonical storage string for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::NotStarted => "NotStarted",
            PipelineStatus::Running => "Running",
            PipelineStatus::Completed => "Completed",
            PipelineStatus::Failed => "Failed",
        }
    }

    /// Checks whether the status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineStatus::Completed | PipelineStatus::Failed)
    }
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PipelineStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NotStarted" => Ok(PipelineStatus::NotStarted),
            "Running" => Ok(PipelineStatus::Running),
            "Completed" => Ok(PipelineStatus::Completed),
            "Failed" => Ok(PipelineStatus::Failed),
            _ => Err(PipelineError::validation(format!("unknown pipeline status: {:?}", s))),
        }
    }
}

/// Derives the pipeline status from its stages' `(status, is_skipped)` pairs.
///
/// Evaluation order matters:
/// 1. any in-flight or retry-scheduled stage → `Running`
/// 2. otherwise any failed stage → `Failed`
/// 3. otherwise every non-skipped stage done → `Completed`
/// 4. otherwise nothing begun → `NotStarted`
/// 5. otherwise (between stages) → `Running`
pub fn derive_pipeline_status<I>(stages: I) -> PipelineStatus
where
    I: IntoIterator<Item = (StageStatus, bool)>,
{
    let mut any_in_flight = false;
    let mut any_retry = false;
    let mut any_failed = false;
    let mut any_begun = false;
    let mut all_done = true;

    for (status, is_skipped) in stages {
        if status.is_in_flight() {
            any_in_flight = true;
        }
        if status == StageStatus::RetryScheduled {
            any_retry = true;
        }
        if status == StageStatus::Failed {
            any_failed = true;
        }
        if status != StageStatus::NotStarted {
            any_begun = true;
        }
        if !(status.counts_complete() || is_skipped) {
            all_done = false;
        }
    }

    if any_in_flight || any_retry {
        PipelineStatus::Running
    } else if any_failed {
        PipelineStatus::Failed
    } else if all_done {
        PipelineStatus::Completed
    } else if !any_begun {
        PipelineStatus::NotStarted
    } else {
        PipelineStatus::Running
    }
}

/// One key/value context item attached to a pipeline.
///
/// Keys are unique within a pipeline; the reconciler upserts by key when
/// workers report updates, and the scheduler snapshots the full set into
/// every job message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextItem {
    pub key: String,
    pub value: serde_json::Value,
    #[serde(default)]
    pub value_type: Option<String>,
}

/// One key/value keyword attached to a pipeline for filtering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineKeyword {
    pub key: String,
    pub value: String,
}

/// Core pipeline entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pipeline {
    id: PipelineId,
    application_id: ApplicationId,
    name: String,
    status: PipelineStatus,
    trace_id: TraceId,
    is_completed: bool,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl Pipeline {
    /// Rehydrates a pipeline from its persisted row.
    pub fn from_parts(
        id: PipelineId,
        application_id: ApplicationId,
        name: String,
        status: PipelineStatus,
        trace_id: TraceId,
        is_completed: bool,
        created_at: DateTime<Utc>,
        finished_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id,
            application_id,
            name,
            status,
            trace_id,
            is_completed,
            created_at,
            finished_at,
        }
    }

    /// Gets the pipeline identifier.
    pub fn id(&self) -> PipelineId {
        self.id
    }

    /// Gets the owning application identifier.
    pub fn application_id(&self) -> ApplicationId {
        self.application_id
    }

    /// Gets the pipeline name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Gets the current status.
    pub fn status(&self) -> PipelineStatus {
        self.status
    }

    /// Gets the trace id assigned at creation.
    pub fn trace_id(&self) -> &TraceId {
        &self.trace_id
    }

    /// Checks whether the pipeline has reached a terminal state and will not
    /// be scheduled again.
    pub fn is_completed(&self) -> bool {
        self.is_completed
    }

    /// Gets the creation timestamp.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Gets the completion timestamp, if terminal.
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use StageStatus::*;

    fn derive(stages: &[(StageStatus, bool)]) -> PipelineStatus {
        derive_pipeline_status(stages.iter().copied())
    }

    #[test]
    fn test_all_not_started() {
        assert_eq!(derive(&[(NotStarted, false), (NotStarted, false)]), PipelineStatus::NotStarted);
    }

    #[test]
    fn test_in_flight_is_running() {
        assert_eq!(derive(&[(Pending, false), (NotStarted, false)]), PipelineStatus::Running);
        assert_eq!(derive(&[(Running, false), (NotStarted, false)]), PipelineStatus::Running);
    }

    #[test]
    fn test_retry_scheduled_keeps_running() {
        // A failed stage awaiting retry does not fail the pipeline.
        assert_eq!(derive(&[(RetryScheduled, false), (NotStarted, false)]), PipelineStatus::Running);
        assert_eq!(derive(&[(Failed, false), (RetryScheduled, false)]), PipelineStatus::Running);
    }

    #[test]
    fn test_between_stages_is_running() {
        assert_eq!(derive(&[(Completed, false), (NotStarted, false)]), PipelineStatus::Running);
    }

    #[test]
    fn test_completed_requires_every_non_skipped_stage_done() {
        assert_eq!(derive(&[(Completed, false), (Completed, false)]), PipelineStatus::Completed);
        assert_eq!(derive(&[(Completed, false), (Skipped, false)]), PipelineStatus::Completed);
        assert_eq!(derive(&[(Completed, false), (NotStarted, true)]), PipelineStatus::Completed);
    }

    #[test]
    fn test_terminal_failure() {
        assert_eq!(derive(&[(Completed, false), (Failed, false)]), PipelineStatus::Failed);
        // But never while anything is still in flight.
        assert_eq!(derive(&[(Failed, false), (Pending, false)]), PipelineStatus::Running);
    }

    #[test]
    fn test_pipeline_status_roundtrip() {
        for status in [
            PipelineStatus::NotStarted,
            PipelineStatus::Running,
            PipelineStatus::Completed,
            PipelineStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<PipelineStatus>().unwrap(), status);
        }
        assert!("Done".parse::<PipelineStatus>().is_err());
    }
}
