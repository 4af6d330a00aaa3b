// /////////////////////////////////////////////////////////////////////////////
// Pipelogiq
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Scheduler / Publisher
//!
//! The cooperative loop that drives pipelines forward. Each tick claims
//! the next runnable stage (the state store's row locking is the only
//! mutual exclusion — any number of scheduler instances may run), then
//! publishes the job descriptor to the stage's per-handler queue with the
//! pipeline's trace context in the message headers.
//!
//! On publish failure the tick is abandoned: the stage stays Pending with
//! its fresh `started_at`, and the pending watchdog provides eventual
//! terminality if publication stays broken. The loop never retries beyond
//! the broker client's own budget.
//!
//! A second loop, the pending watchdog, periodically fails stages that
//! have sat in Pending past the configured threshold.

use std::sync::Arc;
use tracing::{debug, info, warn};

use pipelogiq_bootstrap::CancellationToken;
use pipelogiq_domain::repositories::StateStore;
use pipelogiq_domain::PipelineError;

use crate::infrastructure::broker::BrokerClient;
use crate::infrastructure::config::SchedulerConfig;
use crate::infrastructure::metrics::MetricsService;

/// Claims runnable stages and publishes their jobs.
pub struct Scheduler {
    store: Arc<dyn StateStore>,
    broker: Arc<BrokerClient>,
    metrics: MetricsService,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn StateStore>,
        broker: Arc<BrokerClient>,
        metrics: MetricsService,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            broker,
            metrics,
            config,
        }
    }

    /// One claim-and-publish attempt. Returns whether a stage was claimed
    /// (claimed-but-unpublished counts as claimed: the tick is spent).
    async fn tick(&self) -> Result<bool, PipelineError> {
        let Some(job) = self.store.claim_next_stage().await? else {
            return Ok(false);
        };

        let queue = self.broker.topology().stage_next_queue(&job.handler);
        let payload = serde_json::to_vec(&job)?;

        match self.broker.publish_job(&queue, &payload, &job.trace_id, &job.span_id).await {
            Ok(()) => {
                self.metrics.record_stage_published();
                info!(
                    stage_id = %job.stage_id,
                    pipeline_id = %job.pipeline_id,
                    queue = %queue,
                    "stage job published"
                );
            }
            Err(e) => {
                // The stage remains Pending; the watchdog will fail it if
                // publication stays broken past the pending threshold.
                warn!(
                    stage_id = %job.stage_id,
                    pipeline_id = %job.pipeline_id,
                    queue = %queue,
                    error = %e,
                    "publish failed, abandoning tick"
                );
            }
        }
        Ok(true)
    }

    /// Runs the scheduler loop until cancellation.
    pub async fn run(&self, token: CancellationToken) -> Result<(), PipelineError> {
        info!(tick = ?self.config.tick_interval(), "scheduler started");
        loop {
            if token.is_cancelled() {
                info!("scheduler stopping");
                return Ok(());
            }

            let claimed = match self.tick().await {
                Ok(claimed) => claimed,
                Err(e) => {
                    warn!(error = %e, "scheduler tick failed");
                    false
                }
            };

            if claimed {
                // More work may be immediately runnable; go again.
                continue;
            }

            tokio::select! {
                _ = token.cancelled() => {
                    info!("scheduler stopping");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.config.tick_interval()) => {}
            }
        }
    }

    /// Runs the pending watchdog until cancellation.
    pub async fn run_watchdog(&self, token: CancellationToken) -> Result<(), PipelineError> {
        info!(
            interval = ?self.config.watchdog_interval(),
            threshold = ?self.config.pending_timeout(),
            "pending watchdog started"
        );
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("pending watchdog stopping");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.config.watchdog_interval()) => {}
            }

            match self.store.mark_pending_too_long(self.config.pending_timeout()).await {
                Ok(stalled) => {
                    for stage in &stalled {
                        warn!(
                            stage_id = %stage.stage_id,
                            pipeline_id = %stage.pipeline_id,
                            pending_secs = stage.pending_secs,
                            "stage pending too long, failed by watchdog"
                        );
                    }
                    if !stalled.is_empty() {
                        self.metrics.record_pending_marked_failed(stalled.len() as u64);
                    } else {
                        debug!("watchdog sweep found no stalled stages");
                    }
                }
                Err(e) => warn!(error = %e, "watchdog sweep failed"),
            }
        }
    }
}
