// /////////////////////////////////////////////////////////////////////////////
// Pipelogiq
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Result Reconciler
//!
//! Consumes the `StageResult` and `StageSetStatus` queues and folds their
//! messages into the state store. The handler outcome maps mechanically to
//! the broker decision:
//!
//! - applied (or recognized duplicate) → **ack**
//! - transient backend error (database unavailable) → **nack with requeue**
//! - permanent error (malformed payload, unknown stage) → **nack without
//!   requeue**, routing to the DLQ when one is wired
//!
//! No per-pipeline ordering is assumed from the broker; the store's
//! per-stage locking is the correctness boundary, and duplicate deliveries
//! are no-ops because `apply_stage_result` quietly declines stages no
//! longer in flight.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use pipelogiq_domain::events::{StageResultMessage, StageSetStatusMessage};
use pipelogiq_domain::repositories::StateStore;

use crate::infrastructure::broker::{ConsumeDecision, MessageHandler};
use crate::infrastructure::metrics::MetricsService;

/// Applies result and status messages to the state store.
pub struct Reconciler {
    store: Arc<dyn StateStore>,
    metrics: MetricsService,
}

impl Reconciler {
    pub fn new(store: Arc<dyn StateStore>, metrics: MetricsService) -> Self {
        Self { store, metrics }
    }

    /// Handles one `StageResult` message body.
    pub async fn handle_result(&self, payload: &[u8]) -> ConsumeDecision {
        let message: StageResultMessage = match serde_json::from_slice(payload) {
            Ok(message) => message,
            Err(e) => {
                error!(error = %e, "malformed stage result payload");
                return ConsumeDecision::DeadLetter;
            }
        };

        let stage_id = message.stage_id;
        let success = message.success;

        match self.store.apply_stage_result(message).await {
            Ok(Some(snapshot)) => {
                self.metrics.record_stage_result(success);
                info!(
                    stage_id = %stage_id,
                    pipeline_id = %snapshot.pipeline_id,
                    stage_status = %snapshot.stage_status,
                    pipeline_status = %snapshot.pipeline_status,
                    "stage result reconciled"
                );
                ConsumeDecision::Ack
            }
            Ok(None) => {
                debug!(stage_id = %stage_id, "duplicate stage result ignored");
                ConsumeDecision::Ack
            }
            Err(e) if e.is_transient() => {
                warn!(stage_id = %stage_id, error = %e, "transient failure applying result, requeueing");
                ConsumeDecision::Requeue
            }
            Err(e) => {
                error!(stage_id = %stage_id, error = %e, "permanent failure applying result, dead-lettering");
                ConsumeDecision::DeadLetter
            }
        }
    }

    /// Handles one `StageSetStatus` message body.
    pub async fn handle_set_status(&self, payload: &[u8]) -> ConsumeDecision {
        let message: StageSetStatusMessage = match serde_json::from_slice(payload) {
            Ok(message) => message,
            Err(e) => {
                error!(error = %e, "malformed set-status payload");
                return ConsumeDecision::DeadLetter;
            }
        };

        match self.store.set_stage_status(message.stage_id, message.status).await {
            Ok(snapshot) => {
                info!(
                    stage_id = %message.stage_id,
                    stage_status = %message.status,
                    pipeline_status = %snapshot.pipeline_status,
                    "stage status override applied"
                );
                ConsumeDecision::Ack
            }
            Err(e) if e.is_transient() => {
                warn!(stage_id = %message.stage_id, error = %e, "transient failure setting status, requeueing");
                ConsumeDecision::Requeue
            }
            Err(e) => {
                error!(stage_id = %message.stage_id, error = %e, "permanent failure setting status, dead-lettering");
                ConsumeDecision::DeadLetter
            }
        }
    }
}

/// `MessageHandler` adapter for the `StageResult` queue.
pub struct StageResultHandler(pub Arc<Reconciler>);

#[async_trait]
impl MessageHandler for StageResultHandler {
    async fn handle(&self, payload: &[u8]) -> ConsumeDecision {
        self.0.handle_result(payload).await
    }
}

/// `MessageHandler` adapter for the `StageSetStatus` queue.
pub struct StageSetStatusHandler(pub Arc<Reconciler>);

#[async_trait]
impl MessageHandler for StageSetStatusHandler {
    async fn handle(&self, payload: &[u8]) -> ConsumeDecision {
        self.0.handle_set_status(payload).await
    }
}
