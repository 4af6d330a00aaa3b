// /////////////////////////////////////////////////////////////////////////////
// Pipelogiq
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Fanout Alert Sink
//!
//! The production [`AlertSink`] wiring: state-change notifications from the
//! state store are broadcast on the `StageUpdated.fanout` exchange for UI
//! subscribers living outside the core.
//!
//! Emission is strictly best-effort. The store dispatches notifications in
//! a detached task after commit, and a failed publish is logged and
//! dropped; a mutation must never block or fail on notification.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use pipelogiq_domain::entities::WorkerEvent;
use pipelogiq_domain::events::StageUpdatedEvent;
use pipelogiq_domain::repositories::AlertSink;

use crate::infrastructure::broker::BrokerClient;

/// Header value distinguishing stage updates on the shared exchange.
const KIND_STAGE_UPDATED: &str = "stage-updated";
/// Header value distinguishing worker events on the shared exchange.
const KIND_WORKER_EVENT: &str = "worker-event";

/// Publishes state-change notifications to the fanout exchange.
pub struct FanoutAlertSink {
    broker: Arc<BrokerClient>,
}

impl FanoutAlertSink {
    pub fn new(broker: Arc<BrokerClient>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl AlertSink for FanoutAlertSink {
    async fn notify_stage_change(&self, event: StageUpdatedEvent) {
        let payload = match serde_json::to_vec(&event) {
            Ok(payload) => payload,
            Err(e) => {
                debug!(error = %e, "failed to serialize stage update event");
                return;
            }
        };
        if let Err(e) = self.broker.publish_fanout(KIND_STAGE_UPDATED, &payload).await {
            debug!(error = %e, pipeline_id = %event.pipeline_id, "dropped stage update broadcast");
        }
    }

    async fn notify_worker_event(&self, event: WorkerEvent) {
        let payload = match serde_json::to_vec(&event) {
            Ok(payload) => payload,
            Err(e) => {
                debug!(error = %e, "failed to serialize worker event");
                return;
            }
        };
        if let Err(e) = self.broker.publish_fanout(KIND_WORKER_EVENT, &payload).await {
            debug!(error = %e, worker_id = %event.worker_id, "dropped worker event broadcast");
        }
    }
}
