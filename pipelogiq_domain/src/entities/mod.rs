// /////////////////////////////////////////////////////////////////////////////
// Pipelogiq
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Identity-bearing domain entities.

pub mod application;
pub mod pipeline;
pub mod stage;
pub mod worker;

pub use application::{ApiKey, Application};
pub use pipeline::{derive_pipeline_status, ContextItem, Pipeline, PipelineKeyword, PipelineStatus};
pub use stage::{LogLevel, Stage, StageIO, StageLog, StageOptions, StageStatus};
pub use worker::{WorkerClient, WorkerEvent, WorkerMetrics, WorkerState};
