// /////////////////////////////////////////////////////////////////////////////
// Pipelogiq
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Wire messages exchanged over the broker.

pub mod stage_messages;

pub use stage_messages::{
    ContextUpdate, StageJob, StageLogDraft, StageResultMessage, StageSetStatusMessage, StageUpdatedEvent,
};
