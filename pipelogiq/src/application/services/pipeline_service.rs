// /////////////////////////////////////////////////////////////////////////////
// Pipelogiq
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Pipeline Application Service
//!
//! Orchestrates pipeline creation and the dashboard's mutating actions.
//! Creation is where event stages leave the sequential world: after the
//! creating transaction commits, every `is_event` stage's job is published
//! straight to its handler queue, bypassing the scheduler.

use std::sync::Arc;
use tracing::{info, warn};

use pipelogiq_domain::repositories::{CreatePipelineRequest, CreatedPipeline, PipelineSnapshot, StateStore};
use pipelogiq_domain::value_objects::{ApplicationId, StageId};
use pipelogiq_domain::PipelineError;

use crate::infrastructure::broker::BrokerClient;
use crate::infrastructure::metrics::MetricsService;

/// Pipeline lifecycle orchestration for the HTTP surfaces.
pub struct PipelineService {
    store: Arc<dyn StateStore>,
    broker: Arc<BrokerClient>,
    metrics: MetricsService,
}

impl PipelineService {
    pub fn new(store: Arc<dyn StateStore>, broker: Arc<BrokerClient>, metrics: MetricsService) -> Self {
        Self {
            store,
            broker,
            metrics,
        }
    }

    /// Creates a pipeline and immediately publishes its event stages.
    ///
    /// A failed event publish does not fail the creation: the stage is
    /// already Pending, so the pending watchdog provides terminality if
    /// the publish never lands.
    pub async fn create_pipeline(
        &self,
        req: CreatePipelineRequest,
        application_id: ApplicationId,
    ) -> Result<CreatedPipeline, PipelineError> {
        let created = self.store.create_pipeline(req, application_id).await?;

        for job in &created.event_jobs {
            let queue = self.broker.topology().stage_next_queue(&job.handler);
            let publish = serde_json::to_vec(job)
                .map_err(PipelineError::from)
                .map(|payload| (queue.clone(), payload));

            match publish {
                Ok((queue, payload)) => {
                    match self.broker.publish_job(&queue, &payload, &job.trace_id, &job.span_id).await {
                        Ok(()) => {
                            self.metrics.record_stage_published();
                            info!(stage_id = %job.stage_id, queue = %queue, "event stage published");
                        }
                        Err(e) => {
                            warn!(stage_id = %job.stage_id, queue = %queue, error = %e, "event stage publish failed");
                        }
                    }
                }
                Err(e) => warn!(stage_id = %job.stage_id, error = %e, "event stage serialization failed"),
            }
        }

        Ok(created)
    }

    /// Resets a stage (optionally with all later stages) for rerun.
    pub async fn rerun_stage(&self, stage_id: StageId, include_following: bool) -> Result<(), PipelineError> {
        self.store.rerun_stage(stage_id, include_following).await
    }

    /// Skips a stage.
    pub async fn skip_stage(&self, stage_id: StageId) -> Result<PipelineSnapshot, PipelineError> {
        self.store.skip_stage(stage_id).await
    }
}
