// /////////////////////////////////////////////////////////////////////////////
// Pipelogiq
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Worker Liveness Derivation
//!
//! Computes the *effective* state shown to consumers from the persisted
//! state and the last heartbeat instant. The derivation is a pure function
//! of `(persisted state, last_seen_at, now, offline_after)` and never
//! mutates rows — a listing must not write.

use chrono::{DateTime, Duration, Utc};

use crate::entities::WorkerState;

/// Default silence threshold after which a worker is considered offline.
pub const DEFAULT_OFFLINE_AFTER_SECS: u64 = 45;

/// Derives the effective state of a worker.
///
/// Rules, in order:
/// 1. a stopped worker is stopped, no matter how recent its heartbeat;
/// 2. a worker silent for longer than `offline_after` is offline;
/// 3. otherwise the persisted state stands.
pub fn effective_state(
    persisted: WorkerState,
    last_seen_at: DateTime<Utc>,
    now: DateTime<Utc>,
    offline_after: Duration,
) -> WorkerState {
    if persisted == WorkerState::Stopped {
        return WorkerState::Stopped;
    }
    if now - last_seen_at > offline_after {
        return WorkerState::Offline;
    }
    persisted
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_after() -> Duration {
        Duration::seconds(DEFAULT_OFFLINE_AFTER_SECS as i64)
    }

    #[test]
    fn test_stopped_wins_over_recent_heartbeat() {
        let now = Utc::now();
        assert_eq!(
            effective_state(WorkerState::Stopped, now, now, offline_after()),
            WorkerState::Stopped
        );
    }

    #[test]
    fn test_silent_worker_goes_offline() {
        let now = Utc::now();
        let last_seen = now - Duration::seconds(46);
        assert_eq!(
            effective_state(WorkerState::Ready, last_seen, now, offline_after()),
            WorkerState::Offline
        );
    }

    #[test]
    fn test_fresh_worker_keeps_persisted_state() {
        let now = Utc::now();
        let last_seen = now - Duration::seconds(5);
        for state in [WorkerState::Starting, WorkerState::Ready, WorkerState::Degraded, WorkerState::Draining] {
            assert_eq!(effective_state(state, last_seen, now, offline_after()), state);
        }
    }

    #[test]
    fn test_boundary_is_not_offline() {
        // Exactly offline_after seconds of silence is still live; the
        // derivation flips to offline strictly beyond the threshold.
        let now = Utc::now();
        let last_seen = now - offline_after();
        assert_eq!(
            effective_state(WorkerState::Ready, last_seen, now, offline_after()),
            WorkerState::Ready
        );
    }
}
