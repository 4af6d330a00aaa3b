// /////////////////////////////////////////////////////////////////////////////
// Pipelogiq
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Worker Session Registry
//!
//! Lifecycle orchestration for worker identities: bootstrap issues a
//! session token and returns the broker/queue/heartbeat contract; each
//! heartbeat persists counters and derives the next state; shutdown stamps
//! the stop. Listing derives the *effective* state (stopped, offline past
//! the silence threshold, else as reported) without mutating rows.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use pipelogiq_domain::entities::{WorkerClient, WorkerEvent, WorkerMetrics, WorkerState};
use pipelogiq_domain::repositories::{
    HeartbeatUpdate, SessionIssue, StateStore, WorkerEventDraft, WorkerRegistration,
};
use pipelogiq_domain::services::{effective_state, opaque_token};
use pipelogiq_domain::value_objects::{ApplicationId, QueueTopology, WorkerId};
use pipelogiq_domain::PipelineError;

use crate::infrastructure::config::WorkerConfig;

/// Heartbeat request body. Counters arrive signed and are saturated at
/// zero before persistence.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatRequest {
    pub state: Option<String>,
    pub in_flight: i64,
    pub jobs_processed: i64,
    pub jobs_failed: i64,
    pub queue_lag: i64,
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub last_error: Option<String>,
}

/// Broker connection details returned at bootstrap.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerInfo {
    pub url: String,
}

/// Queue topology returned at bootstrap.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueInfo {
    pub stage_result: String,
    pub stage_set_status: String,
    pub stage_updated_exchange: String,
    pub stage_next_pattern: String,
}

/// Heartbeat cadence contract returned at bootstrap.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatContract {
    pub interval_sec: u64,
    pub offline_after_sec: u64,
}

/// Observability link templates returned at bootstrap.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservabilityLinks {
    pub trace_link_template: Option<String>,
}

/// Full bootstrap response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapResponse {
    pub worker_id: WorkerId,
    pub session_token: String,
    pub session_expires_at: chrono::DateTime<Utc>,
    pub broker: BrokerInfo,
    pub queues: QueueInfo,
    pub heartbeat: HeartbeatContract,
    pub observability: ObservabilityLinks,
}

/// One worker in the dashboard listing, with its derived state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerView {
    #[serde(flatten)]
    pub worker: WorkerClient,
    pub effective_state: WorkerState,
}

/// Aggregate liveness counts for the dashboard listing.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerCounts {
    pub online: usize,
    pub degraded: usize,
    pub offline: usize,
}

/// The dashboard worker listing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerListResponse {
    pub workers: Vec<WorkerView>,
    pub counts: WorkerCounts,
}

/// Worker lifecycle orchestration.
pub struct WorkerRegistry {
    store: Arc<dyn StateStore>,
    topology: QueueTopology,
    broker_url: String,
    config: WorkerConfig,
}

impl WorkerRegistry {
    pub fn new(store: Arc<dyn StateStore>, topology: QueueTopology, broker_url: String, config: WorkerConfig) -> Self {
        Self {
            store,
            topology,
            broker_url,
            config,
        }
    }

    /// Registers (or refreshes) a worker and issues a fresh session.
    pub async fn bootstrap(
        &self,
        application_id: ApplicationId,
        registration: WorkerRegistration,
    ) -> Result<BootstrapResponse, PipelineError> {
        let session = SessionIssue {
            token: opaque_token(),
            expires_at: Utc::now() + self.config.session_ttl(),
        };
        let token = session.token.clone();
        let expires_at = session.expires_at;

        let worker = self.store.bootstrap_worker(application_id, registration, session).await?;
        info!(worker_id = %worker.id(), worker_name = %worker.worker_name(), "worker bootstrapped");

        Ok(BootstrapResponse {
            worker_id: worker.id(),
            session_token: token,
            session_expires_at: expires_at,
            broker: BrokerInfo {
                url: self.broker_url.clone(),
            },
            queues: QueueInfo {
                stage_result: self.topology.stage_result_queue().to_string(),
                stage_set_status: self.topology.stage_set_status_queue().to_string(),
                stage_updated_exchange: self.topology.stage_updated_exchange().to_string(),
                stage_next_pattern: self.topology.stage_next_pattern(),
            },
            heartbeat: HeartbeatContract {
                interval_sec: self.config.heartbeat_interval_secs,
                offline_after_sec: self.config.offline_after_secs,
            },
            observability: ObservabilityLinks {
                trace_link_template: self.config.trace_link_template.clone(),
            },
        })
    }

    /// Persists one heartbeat for a session-resolved worker.
    ///
    /// A state string outside the known set keeps the previous state
    /// rather than failing the heartbeat.
    pub async fn heartbeat(&self, worker: &WorkerClient, req: HeartbeatRequest) -> Result<(), PipelineError> {
        let state = req.state.as_deref().and_then(|s| s.parse::<WorkerState>().ok());
        let metrics = WorkerMetrics::from_raw(
            req.in_flight,
            req.jobs_processed,
            req.jobs_failed,
            req.queue_lag,
            req.cpu_percent,
            req.memory_mb,
        );

        self.store
            .heartbeat_worker(
                worker.id(),
                HeartbeatUpdate {
                    state,
                    metrics,
                    last_error: req.last_error,
                },
            )
            .await
    }

    /// Appends worker-submitted events.
    pub async fn events(&self, worker: &WorkerClient, events: Vec<WorkerEventDraft>) -> Result<(), PipelineError> {
        self.store.append_worker_events(worker.id(), events).await
    }

    /// Records a worker's announced shutdown.
    pub async fn shutdown(&self, worker: &WorkerClient, reason: Option<String>) -> Result<(), PipelineError> {
        self.store.shutdown_worker(worker.id(), reason).await
    }

    /// Lists workers with derived effective states and aggregate counts.
    pub async fn list_workers(&self) -> Result<WorkerListResponse, PipelineError> {
        let now = Utc::now();
        let offline_after = self.config.offline_after();
        let workers = self.store.list_workers().await?;

        let mut counts = WorkerCounts::default();
        let views = workers
            .into_iter()
            .map(|worker| {
                let derived = effective_state(worker.state(), worker.last_seen_at(), now, offline_after);
                match derived {
                    WorkerState::Starting | WorkerState::Ready | WorkerState::Draining => counts.online += 1,
                    WorkerState::Degraded | WorkerState::Error => counts.degraded += 1,
                    WorkerState::Offline | WorkerState::Stopped => counts.offline += 1,
                }
                WorkerView {
                    worker,
                    effective_state: derived,
                }
            })
            .collect();

        Ok(WorkerListResponse {
            workers: views,
            counts,
        })
    }

    /// Recent worker events, optionally narrowed to one worker.
    pub async fn worker_events(&self, worker_id: Option<WorkerId>) -> Result<Vec<WorkerEvent>, PipelineError> {
        self.store.get_worker_events(worker_id, 200).await
    }
}
