// /////////////////////////////////////////////////////////////////////////////
// Pipelogiq
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Shared state for the HTTP surfaces.

use std::sync::Arc;

use pipelogiq_domain::repositories::StateStore;

use crate::application::services::{PipelineService, WorkerRegistry};
use crate::application::JobGateway;
use crate::infrastructure::config::{AuthConfig, VersionInfo};
use crate::infrastructure::metrics::MetricsService;

/// Everything a handler can reach.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn StateStore>,
    pub pipeline_service: Arc<PipelineService>,
    pub registry: Arc<WorkerRegistry>,
    pub gateway: Arc<JobGateway>,
    pub metrics: MetricsService,
    pub version: VersionInfo,
    pub auth: AuthConfig,
    /// Broker connection string served to workers that consume directly.
    pub broker_url: String,
}
