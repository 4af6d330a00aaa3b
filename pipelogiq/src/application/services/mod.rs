// /////////////////////////////////////////////////////////////////////////////
// Pipelogiq
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Application services orchestrating the state store and the broker for
//! the HTTP surfaces.

pub mod pipeline_service;
pub mod worker_registry;

pub use pipeline_service::PipelineService;
pub use worker_registry::WorkerRegistry;
