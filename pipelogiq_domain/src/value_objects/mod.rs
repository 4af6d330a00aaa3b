// /////////////////////////////////////////////////////////////////////////////
// Pipelogiq
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Immutable, self-validating value objects.

pub mod ids;
pub mod queue_topology;
pub mod trace;

pub use ids::{ApplicationId, PipelineId, StageId, WorkerId};
pub use queue_topology::QueueTopology;
pub use trace::{HeaderCarrier, SpanId, TraceId};
