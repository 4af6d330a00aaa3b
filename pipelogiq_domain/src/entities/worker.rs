// /////////////////////////////////////////////////////////////////////////////
// Pipelogiq
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Worker Client Entity
//!
//! A worker client is one registered worker process: the pair
//! `(application_id, instance_id)` is unique, so re-bootstrapping the same
//! process refreshes its row instead of multiplying it.
//!
//! Persisted state is what the worker last reported; the state consumers see
//! is *derived* (see `services::liveness`): a stopped worker stays stopped,
//! a silent one becomes offline once `last_seen_at` falls behind the
//! configured threshold.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::stage::LogLevel;
use crate::value_objects::{ApplicationId, WorkerId};
use crate::PipelineError;

/// Event type appended when a worker bootstraps.
pub const EVENT_WORKER_BOOTSTRAP: &str = "worker.bootstrap";
/// Event type appended when a heartbeat changes the persisted state.
pub const EVENT_WORKER_STATE_CHANGED: &str = "worker.state_changed";
/// Event type appended when a worker announces shutdown.
pub const EVENT_WORKER_STOPPED: &str = "worker.stopped";
/// Default event type for worker-submitted events.
pub const EVENT_WORKER_EVENT: &str = "worker.event";

/// Lifecycle state of a worker client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Starting,
    Ready,
    Degraded,
    Draining,
    Stopped,
    Error,
    Offline,
}

impl WorkerState {
    /// Returns the canonical lowercase storage string.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Starting => "starting",
            WorkerState::Ready => "ready",
            WorkerState::Degraded => "degraded",
            WorkerState::Draining => "draining",
            WorkerState::Stopped => "stopped",
            WorkerState::Error => "error",
            WorkerState::Offline => "offline",
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for WorkerState {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "starting" => Ok(WorkerState::Starting),
            "ready" => Ok(WorkerState::Ready),
            "degraded" => Ok(WorkerState::Degraded),
            "draining" => Ok(WorkerState::Draining),
            "stopped" => Ok(WorkerState::Stopped),
            "error" => Ok(WorkerState::Error),
            "offline" => Ok(WorkerState::Offline),
            _ => Err(PipelineError::validation(format!("unknown worker state: {:?}", s))),
        }
    }
}

/// Saturated runtime counters reported by worker heartbeats.
///
/// Heartbeat payloads arrive as signed JSON integers; construction clamps
/// every counter at zero so a misbehaving worker can never drive a counter
/// negative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerMetrics {
    pub in_flight: u32,
    pub jobs_processed: u64,
    pub jobs_failed: u64,
    pub queue_lag: u64,
    pub cpu_percent: f64,
    pub memory_mb: f64,
}

impl WorkerMetrics {
    /// Builds metrics from raw signed values, saturating each at zero.
    pub fn from_raw(
        in_flight: i64,
        jobs_processed: i64,
        jobs_failed: i64,
        queue_lag: i64,
        cpu_percent: f64,
        memory_mb: f64,
    ) -> Self {
        Self {
            in_flight: in_flight.max(0).min(u32::MAX as i64) as u32,
            jobs_processed: jobs_processed.max(0) as u64,
            jobs_failed: jobs_failed.max(0) as u64,
            queue_lag: queue_lag.max(0) as u64,
            cpu_percent: cpu_percent.max(0.0),
            memory_mb: memory_mb.max(0.0),
        }
    }
}

/// One registered worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerClient {
    id: WorkerId,
    application_id: ApplicationId,
    worker_name: String,
    instance_id: String,
    state: WorkerState,
    metrics: WorkerMetrics,
    last_error: Option<String>,
    capabilities: Vec<String>,
    handlers: Vec<String>,
    #[serde(skip_serializing, default)]
    session_token: Option<String>,
    session_expires_at: Option<DateTime<Utc>>,
    last_seen_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    stopped_at: Option<DateTime<Utc>>,
}

impl WorkerClient {
    /// Rehydrates a worker client from its persisted row.
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        id: WorkerId,
        application_id: ApplicationId,
        worker_name: String,
        instance_id: String,
        state: WorkerState,
        metrics: WorkerMetrics,
        last_error: Option<String>,
        capabilities: Vec<String>,
        handlers: Vec<String>,
        session_token: Option<String>,
        session_expires_at: Option<DateTime<Utc>>,
        last_seen_at: DateTime<Utc>,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        stopped_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id,
            application_id,
            worker_name,
            instance_id,
            state,
            metrics,
            last_error,
            capabilities,
            handlers,
            session_token,
            session_expires_at,
            last_seen_at,
            created_at,
            updated_at,
            stopped_at,
        }
    }

    /// Gets the worker identifier.
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Gets the owning application identifier.
    pub fn application_id(&self) -> ApplicationId {
        self.application_id
    }

    /// Gets the logical worker name (shared by all instances of a binary).
    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    /// Gets the per-process instance id, unique within the application.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Gets the persisted (reported) state.
    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Gets the saturated runtime counters.
    pub fn metrics(&self) -> &WorkerMetrics {
        &self.metrics
    }

    /// Gets the last error string the worker reported.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Gets the advertised capability set.
    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    /// Gets the handler names this worker consumes.
    pub fn handlers(&self) -> &[String] {
        &self.handlers
    }

    /// Gets the current session token, if one is issued.
    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_deref()
    }

    /// Gets the session expiry.
    pub fn session_expires_at(&self) -> Option<DateTime<Utc>> {
        self.session_expires_at
    }

    /// Gets the instant of the last heartbeat or bootstrap.
    pub fn last_seen_at(&self) -> DateTime<Utc> {
        self.last_seen_at
    }

    /// Gets the row creation timestamp.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Gets the last mutation timestamp.
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Gets the announced shutdown timestamp, if any.
    pub fn stopped_at(&self) -> Option<DateTime<Utc>> {
        self.stopped_at
    }

    /// Checks whether the session token matches and has not expired.
    pub fn session_is_valid(&self, token: &str, now: DateTime<Utc>) -> bool {
        match (&self.session_token, self.session_expires_at) {
            (Some(current), Some(expires_at)) => current == token && now < expires_at,
            _ => false,
        }
    }
}

/// One append-only worker event row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerEvent {
    pub worker_id: WorkerId,
    pub ts: DateTime<Utc>,
    pub level: LogLevel,
    pub event_type: String,
    pub message: String,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_worker_state_roundtrip() {
        for state in [
            WorkerState::Starting,
            WorkerState::Ready,
            WorkerState::Degraded,
            WorkerState::Draining,
            WorkerState::Stopped,
            WorkerState::Error,
            WorkerState::Offline,
        ] {
            assert_eq!(state.as_str().parse::<WorkerState>().unwrap(), state);
        }
        assert!("hibernating".parse::<WorkerState>().is_err());
        assert_eq!("READY".parse::<WorkerState>().unwrap(), WorkerState::Ready);
    }

    #[test]
    fn test_metrics_saturate_at_zero() {
        let metrics = WorkerMetrics::from_raw(-3, -1, 5, -100, -2.5, 128.0);
        assert_eq!(metrics.in_flight, 0);
        assert_eq!(metrics.jobs_processed, 0);
        assert_eq!(metrics.jobs_failed, 5);
        assert_eq!(metrics.queue_lag, 0);
        assert_eq!(metrics.cpu_percent, 0.0);
        assert_eq!(metrics.memory_mb, 128.0);
    }

    #[test]
    fn test_session_validation() {
        let now = Utc::now();
        let worker = WorkerClient::from_parts(
            WorkerId::new(),
            ApplicationId::new(1),
            "img-worker".to_string(),
            "host-1:1234".to_string(),
            WorkerState::Ready,
            WorkerMetrics::default(),
            None,
            vec![],
            vec!["resize".to_string()],
            Some("tok-1".to_string()),
            Some(now + Duration::minutes(30)),
            now,
            now,
            now,
            None,
        );

        assert!(worker.session_is_valid("tok-1", now));
        assert!(!worker.session_is_valid("tok-2", now));
        assert!(!worker.session_is_valid("tok-1", now + Duration::hours(1)));
    }
}
