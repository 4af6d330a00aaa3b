// /////////////////////////////////////////////////////////////////////////////
// Pipelogiq
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Queue Topology
//!
//! Canonical broker queue and exchange names. Work flows through one durable
//! queue per handler, `{app_runtime_id}_{handler}_StageNext`; results and
//! out-of-band status changes flow back through fixed durable queues; UI
//! subscribers listen on a fanout exchange.
//!
//! The topology is a value object so every component (scheduler, gateway,
//! worker bootstrap response) derives names from one place instead of
//! string-formatting its own.

use serde::{Deserialize, Serialize};

/// Fixed durable queue carrying worker-published stage outcomes.
pub const STAGE_RESULT_QUEUE: &str = "StageResult";

/// Fixed durable queue carrying out-of-band status overrides.
pub const STAGE_SET_STATUS_QUEUE: &str = "StageSetStatus";

/// Fanout exchange broadcasting stage state changes to UI subscribers.
pub const STAGE_UPDATED_EXCHANGE: &str = "StageUpdated.fanout";

/// Suffix of every per-handler work queue.
const STAGE_NEXT_SUFFIX: &str = "StageNext";

/// Derives broker queue names for one application runtime.
///
/// The `app_runtime_id` is the deployment-chosen prefix that isolates one
/// control plane installation's work queues from another sharing the same
/// broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueTopology {
    app_runtime_id: String,
}

impl QueueTopology {
    /// Creates a topology for the given application runtime id.
    pub fn new(app_runtime_id: impl Into<String>) -> Self {
        Self {
            app_runtime_id: app_runtime_id.into(),
        }
    }

    /// Returns the runtime id this topology derives names from.
    pub fn app_runtime_id(&self) -> &str {
        &self.app_runtime_id
    }

    /// Returns the durable work queue for a handler:
    /// `{app_runtime_id}_{handler}_StageNext`.
    pub fn stage_next_queue(&self, handler: &str) -> String {
        format!("{}_{}_{}", self.app_runtime_id, handler, STAGE_NEXT_SUFFIX)
    }

    /// Returns the pattern workers substitute their handler names into,
    /// with `{handler}` as the placeholder.
    pub fn stage_next_pattern(&self) -> String {
        format!("{}_{{handler}}_{}", self.app_runtime_id, STAGE_NEXT_SUFFIX)
    }

    /// Returns the fixed result queue name.
    pub fn stage_result_queue(&self) -> &'static str {
        STAGE_RESULT_QUEUE
    }

    /// Returns the fixed set-status queue name.
    pub fn stage_set_status_queue(&self) -> &'static str {
        STAGE_SET_STATUS_QUEUE
    }

    /// Returns the fanout exchange name for stage updates.
    pub fn stage_updated_exchange(&self) -> &'static str {
        STAGE_UPDATED_EXCHANGE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_next_queue_name() {
        let topology = QueueTopology::new("acme");
        assert_eq!(topology.stage_next_queue("resize"), "acme_resize_StageNext");
    }

    #[test]
    fn test_stage_next_pattern() {
        let topology = QueueTopology::new("acme");
        assert_eq!(topology.stage_next_pattern(), "acme_{handler}_StageNext");
    }

    #[test]
    fn test_fixed_names() {
        let topology = QueueTopology::new("acme");
        assert_eq!(topology.stage_result_queue(), "StageResult");
        assert_eq!(topology.stage_set_status_queue(), "StageSetStatus");
        assert_eq!(topology.stage_updated_exchange(), "StageUpdated.fanout");
    }
}
