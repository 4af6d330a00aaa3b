// /////////////////////////////////////////////////////////////////////////////
// Pipelogiq
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Detached Alert Dispatch
//!
//! Shared by both store backends: after a committed mutation, the optional
//! alert sink is invoked in a detached task with its own timeout. A
//! mutation never blocks on notification, and with no sink installed the
//! emission is dropped.

use chrono::Utc;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

use pipelogiq_domain::entities::WorkerEvent;
use pipelogiq_domain::repositories::{AlertSink, PipelineSnapshot};

/// Upper bound on one notification dispatch.
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Slot holding the optionally installed sink.
pub type SinkSlot = Arc<RwLock<Option<Arc<dyn AlertSink>>>>;

/// Creates an empty sink slot.
pub fn empty_slot() -> SinkSlot {
    Arc::new(RwLock::new(None))
}

/// Broadcasts a stage state change, if a sink is installed.
pub fn stage_changed(slot: &SinkSlot, snapshot: &PipelineSnapshot) {
    let sink = slot.read().clone();
    if let Some(sink) = sink {
        let event = snapshot.clone().into_event(Utc::now());
        tokio::spawn(async move {
            let _ = tokio::time::timeout(NOTIFY_TIMEOUT, sink.notify_stage_change(event)).await;
        });
    }
}

/// Broadcasts a worker event, if a sink is installed.
pub fn worker_event(slot: &SinkSlot, event: &WorkerEvent) {
    let sink = slot.read().clone();
    if let Some(sink) = sink {
        let event = event.clone();
        tokio::spawn(async move {
            let _ = tokio::time::timeout(NOTIFY_TIMEOUT, sink.notify_worker_event(event)).await;
        });
    }
}
