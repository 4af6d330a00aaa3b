// /////////////////////////////////////////////////////////////////////////////
// Pipelogiq
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Stage Wire Messages
//!
//! The JSON message bodies that cross the broker:
//!
//! - [`StageJob`] — scheduler → per-handler work queue. Carries everything a
//!   worker needs to run one stage, including a snapshot of the pipeline
//!   context taken inside the claiming transaction.
//! - [`StageResultMessage`] — worker → `StageResult` queue. The reconciler
//!   feeds it to `apply_stage_result`.
//! - [`StageSetStatusMessage`] — out-of-band override → `StageSetStatus`.
//! - [`StageUpdatedEvent`] — control plane → `StageUpdated.fanout` exchange,
//!   consumed by UI subscribers outside the core.
//!
//! All bodies are camelCase JSON. Trace context travels in broker headers,
//! not in these bodies; the trace/span ids here identify the pipeline's
//! spans for the worker's own instrumentation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::entities::{PipelineStatus, StageStatus};
use crate::value_objects::{ApplicationId, PipelineId, SpanId, StageId, TraceId};

/// A claimed stage, serialized to the handler's work queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageJob {
    pub application_id: ApplicationId,
    pub pipeline_id: PipelineId,
    pub stage_id: StageId,
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub handler: String,
    pub name: String,
    #[serde(default)]
    pub input: serde_json::Value,
    /// Context snapshot taken in the claiming transaction. A sorted map so
    /// serialization is deterministic.
    #[serde(default)]
    pub context: BTreeMap<String, serde_json::Value>,
}

/// One log line reported with a stage result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageLogDraft {
    #[serde(default)]
    pub level: Option<String>,
    pub message: String,
}

/// One context mutation reported with a stage result; upserted by key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextUpdate {
    pub key: String,
    pub value: serde_json::Value,
    #[serde(default)]
    pub value_type: Option<String>,
}

/// A worker's verdict on one stage execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageResultMessage {
    pub stage_id: StageId,
    pub success: bool,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub logs: Vec<StageLogDraft>,
    #[serde(default)]
    pub context_updates: Vec<ContextUpdate>,
}

/// An out-of-band stage status override.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageSetStatusMessage {
    pub stage_id: StageId,
    pub status: StageStatus,
}

/// Broadcast notification of a stage state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageUpdatedEvent {
    pub pipeline_id: PipelineId,
    pub stage_id: StageId,
    pub pipeline_status: PipelineStatus,
    pub stage_status: StageStatus,
    pub is_completed: bool,
    pub ts: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_job_serializes_camel_case() {
        let job = StageJob {
            application_id: ApplicationId::new(1),
            pipeline_id: PipelineId::new(2),
            stage_id: StageId::new(3),
            trace_id: TraceId::new(),
            span_id: SpanId::new(),
            handler: "resize".to_string(),
            name: "resize images".to_string(),
            input: serde_json::json!({"width": 800}),
            context: BTreeMap::new(),
        };

        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["applicationId"], 1);
        assert_eq!(json["pipelineId"], 2);
        assert_eq!(json["stageId"], 3);
        assert_eq!(json["input"]["width"], 800);
    }

    #[test]
    fn test_result_message_defaults() {
        // Workers may omit output, logs, and context updates entirely.
        let msg: StageResultMessage = serde_json::from_str(r#"{"stageId": 7, "success": true}"#).unwrap();
        assert_eq!(msg.stage_id, StageId::new(7));
        assert!(msg.success);
        assert!(msg.output.is_none());
        assert!(msg.logs.is_empty());
        assert!(msg.context_updates.is_empty());
    }

    #[test]
    fn test_set_status_message_roundtrip() {
        let msg = StageSetStatusMessage {
            stage_id: StageId::new(9),
            status: StageStatus::Skipped,
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: StageSetStatusMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.stage_id, msg.stage_id);
        assert_eq!(back.status, StageStatus::Skipped);
    }
}
