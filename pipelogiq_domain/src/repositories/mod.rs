// /////////////////////////////////////////////////////////////////////////////
// Pipelogiq
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Infrastructure ports: the state store contract and the alert sink
//! capability.

pub mod alert_sink;
pub mod state_store;

pub use alert_sink::AlertSink;
pub use state_store::{
    AppLogEntry, CreatePipelineRequest, CreatedPipeline, HeartbeatUpdate, PipelineDetail, PipelineFilter,
    PipelinePage, PipelineSnapshot, PipelineSummary, SessionIssue, StageDraft, StalledStage, StateStore,
    WorkerEventDraft, WorkerRegistration,
};
