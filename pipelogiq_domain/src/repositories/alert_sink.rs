// /////////////////////////////////////////////////////////////////////////////
// Pipelogiq
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Alert Sink Capability
//!
//! Optional notification seam the state store calls after a successful
//! mutation. The production wiring publishes to the `StageUpdated.fanout`
//! exchange; tests install recording fakes; with no sink installed,
//! emissions are dropped.
//!
//! A sink must never be able to fail or stall a mutation: stores dispatch
//! notifications in a detached task with its own timeout, after commit.

use async_trait::async_trait;

use crate::entities::WorkerEvent;
use crate::events::StageUpdatedEvent;

/// Receives state-change notifications from the state store.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Called after a stage (and possibly its pipeline) changed state.
    async fn notify_stage_change(&self, event: StageUpdatedEvent);

    /// Called after a worker event row was appended.
    async fn notify_worker_event(&self, event: WorkerEvent);
}
