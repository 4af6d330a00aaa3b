// /////////////////////////////////////////////////////////////////////////////
// Pipelogiq
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Stage Entity
//!
//! A stage is one ordered unit of work within a pipeline. Its row order (the
//! ordinal) defines the execution sequence; its handler name selects the
//! worker queue that receives the job.
//!
//! ## Status Machine
//!
//! ```text
//! NotStarted --claim--> Pending --result(ok)----------> Completed
//!                         |  \--result(err, budget)---> RetryScheduled --timer--> (claimable again)
//!                         |  \--result(err, spent)----> Failed
//!                         \---watchdog timeout--------> Failed
//! NotStarted/any --skip--> Skipped
//! terminal --rerun--> NotStarted
//! ```
//!
//! `Running` is representable and treated as in-flight everywhere the
//! invariants care ("at most one stage per pipeline in Pending or Running"),
//! but the scheduler does not currently drive it: stages go Pending straight
//! to a terminal state.
//!
//! Event stages (`is_event = true`) bypass the sequential scheduler entirely
//! and are published when their pipeline is created.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::value_objects::{PipelineId, SpanId, StageId};
use crate::PipelineError;

/// Execution status of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageStatus {
    NotStarted,
    Pending,
    Running,
    RetryScheduled,
    Completed,
    Failed,
    Skipped,
}

impl StageStatus {
    /// Returns the canonical storage string for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::NotStarted => "NotStarted",
            StageStatus::Pending => "Pending",
            StageStatus::Running => "Running",
            StageStatus::RetryScheduled => "RetryScheduled",
            StageStatus::Completed => "Completed",
            StageStatus::Failed => "Failed",
            StageStatus::Skipped => "Skipped",
        }
    }

    /// Checks whether the stage currently occupies the pipeline's single
    /// in-flight slot. Pending and Running are interchangeable here.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, StageStatus::Pending | StageStatus::Running)
    }

    /// Checks whether the status is terminal (no further scheduler action).
    pub fn is_terminal(&self) -> bool {
        matches!(self, StageStatus::Completed | StageStatus::Failed | StageStatus::Skipped)
    }

    /// Checks whether the stage counts as done for pipeline completion.
    pub fn counts_complete(&self) -> bool {
        matches!(self, StageStatus::Completed | StageStatus::Skipped)
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for StageStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NotStarted" => Ok(StageStatus::NotStarted),
            "Pending" => Ok(StageStatus::Pending),
            "Running" => Ok(StageStatus::Running),
            "RetryScheduled" => Ok(StageStatus::RetryScheduled),
            "Completed" => Ok(StageStatus::Completed),
            "Failed" => Ok(StageStatus::Failed),
            "Skipped" => Ok(StageStatus::Skipped),
            _ => Err(PipelineError::validation(format!("unknown stage status: {:?}", s))),
        }
    }
}

/// Log severity attached to stage log lines and worker events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Returns the canonical uppercase string for this level.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }

    /// Normalizes an arbitrary caller-supplied level string.
    ///
    /// Unknown or missing levels fall back to `Info`; `WARNING` and
    /// lowercase spellings are accepted.
    pub fn normalize(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "TRACE" => LogLevel::Trace,
            "DEBUG" => LogLevel::Debug,
            "WARN" | "WARNING" => LogLevel::Warn,
            "ERROR" | "ERR" | "FATAL" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-stage retry and notification options.
///
/// `retry_only_policy` is persisted for compatibility with stored pipeline
/// definitions but is not consulted by the retry decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageOptions {
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub retry_interval_sec: u32,
    #[serde(default)]
    pub timeout_sec: Option<u32>,
    #[serde(default)]
    pub notify_on_failure: bool,
    #[serde(default)]
    pub retry_only_policy: Option<String>,
}

impl Default for StageOptions {
    fn default() -> Self {
        Self {
            max_retries: 0,
            retry_interval_sec: 0,
            timeout_sec: None,
            notify_on_failure: false,
            retry_only_policy: None,
        }
    }
}

/// Input and output payloads attached to a stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageIO {
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
}

/// One append-only log line attached to a stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageLog {
    pub stage_id: StageId,
    pub created_at: DateTime<Utc>,
    pub log_level: LogLevel,
    pub message: String,
}

/// Core stage entity.
///
/// Identity and ordering (`pipeline_id`, `ordinal`) are stable for a
/// pipeline's lifetime; a rerun resets status fields but never the ordinal
/// or span id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    id: StageId,
    pipeline_id: PipelineId,
    ordinal: i32,
    handler: String,
    name: String,
    description: Option<String>,
    span_id: SpanId,
    status: StageStatus,
    is_skipped: bool,
    is_event: bool,
    retry_attempt: u32,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    next_retry_at: Option<DateTime<Utc>>,
    io: StageIO,
    options: StageOptions,
}

impl Stage {
    /// Rehydrates a stage from its persisted rows.
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        id: StageId,
        pipeline_id: PipelineId,
        ordinal: i32,
        handler: String,
        name: String,
        description: Option<String>,
        span_id: SpanId,
        status: StageStatus,
        is_skipped: bool,
        is_event: bool,
        retry_attempt: u32,
        created_at: DateTime<Utc>,
        started_at: Option<DateTime<Utc>>,
        finished_at: Option<DateTime<Utc>>,
        next_retry_at: Option<DateTime<Utc>>,
        io: StageIO,
        options: StageOptions,
    ) -> Self {
        Self {
            id,
            pipeline_id,
            ordinal,
            handler,
            name,
            description,
            span_id,
            status,
            is_skipped,
            is_event,
            retry_attempt,
            created_at,
            started_at,
            finished_at,
            next_retry_at,
            io,
            options,
        }
    }

    /// Gets the stage identifier.
    pub fn id(&self) -> StageId {
        self.id
    }

    /// Gets the owning pipeline identifier.
    pub fn pipeline_id(&self) -> PipelineId {
        self.pipeline_id
    }

    /// Gets the execution ordinal (lower runs first).
    pub fn ordinal(&self) -> i32 {
        self.ordinal
    }

    /// Gets the handler name that selects the worker queue.
    pub fn handler(&self) -> &str {
        &self.handler
    }

    /// Gets the descriptive stage name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Gets the optional description.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Gets the span id assigned at pipeline creation.
    pub fn span_id(&self) -> &SpanId {
        &self.span_id
    }

    /// Gets the current status.
    pub fn status(&self) -> StageStatus {
        self.status
    }

    /// Checks the skip flag.
    pub fn is_skipped(&self) -> bool {
        self.is_skipped
    }

    /// Checks whether this is an event stage (published at creation,
    /// bypassing the sequential scheduler).
    pub fn is_event(&self) -> bool {
        self.is_event
    }

    /// Gets the number of retry attempts consumed so far.
    pub fn retry_attempt(&self) -> u32 {
        self.retry_attempt
    }

    /// Gets the creation timestamp.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Gets the time the stage last entered Pending, if any.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Gets the time the stage last reached a terminal or retry state.
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// Gets the earliest instant a RetryScheduled stage may be claimed.
    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        self.next_retry_at
    }

    /// Gets the input/output payloads.
    pub fn io(&self) -> &StageIO {
        &self.io
    }

    /// Gets the retry/notification options.
    pub fn options(&self) -> &StageOptions {
        &self.options
    }

    /// Elapsed time the stage has spent in Pending, measured from
    /// `started_at` when set, else `created_at`.
    pub fn pending_elapsed(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.started_at.unwrap_or(self.created_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            StageStatus::NotStarted,
            StageStatus::Pending,
            StageStatus::Running,
            StageStatus::RetryScheduled,
            StageStatus::Completed,
            StageStatus::Failed,
            StageStatus::Skipped,
        ] {
            assert_eq!(status.as_str().parse::<StageStatus>().unwrap(), status);
        }
        assert!("Paused".parse::<StageStatus>().is_err());
    }

    #[test]
    fn test_status_classification() {
        assert!(StageStatus::Pending.is_in_flight());
        assert!(StageStatus::Running.is_in_flight());
        assert!(!StageStatus::RetryScheduled.is_in_flight());

        assert!(StageStatus::Completed.is_terminal());
        assert!(StageStatus::Failed.is_terminal());
        assert!(StageStatus::Skipped.is_terminal());
        assert!(!StageStatus::RetryScheduled.is_terminal());

        assert!(StageStatus::Skipped.counts_complete());
        assert!(!StageStatus::Failed.counts_complete());
    }

    #[test]
    fn test_log_level_normalize() {
        assert_eq!(LogLevel::normalize("warn"), LogLevel::Warn);
        assert_eq!(LogLevel::normalize("WARNING"), LogLevel::Warn);
        assert_eq!(LogLevel::normalize("fatal"), LogLevel::Error);
        assert_eq!(LogLevel::normalize("??"), LogLevel::Info);
        assert_eq!(LogLevel::normalize(""), LogLevel::Info);
    }

    #[test]
    fn test_pending_elapsed_prefers_started_at() {
        let created = Utc::now();
        let started = created + chrono::Duration::seconds(10);
        let now = started + chrono::Duration::seconds(30);

        let mut stage = sample_stage(created);
        assert_eq!(stage.pending_elapsed(now).num_seconds(), 40);

        stage.started_at = Some(started);
        assert_eq!(stage.pending_elapsed(now).num_seconds(), 30);
    }

    fn sample_stage(created_at: DateTime<Utc>) -> Stage {
        Stage::from_parts(
            StageId::new(1),
            PipelineId::new(1),
            0,
            "resize".to_string(),
            "resize images".to_string(),
            None,
            SpanId::new(),
            StageStatus::Pending,
            false,
            false,
            0,
            created_at,
            None,
            None,
            None,
            StageIO::default(),
            StageOptions::default(),
        )
    }
}
