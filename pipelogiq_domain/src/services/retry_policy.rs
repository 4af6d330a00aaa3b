// /////////////////////////////////////////////////////////////////////////////
// Pipelogiq
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Retry Decision
//!
//! The single place that decides what a stage result does to the stage.
//! Both state store backends call this pure function inside their
//! `apply_stage_result` transaction, so SQLite and Postgres can never drift
//! on retry semantics.
//!
//! A failure is retried only while the attempt budget lasts AND a positive
//! retry interval is configured; `retry_attempt` therefore never exceeds
//! `max_retries`. The retry interval is whole seconds, and `next_retry_at`
//! is computed in UTC.

use chrono::{DateTime, Duration, Utc};

use crate::entities::StageOptions;

/// Outcome of applying one stage result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultOutcome {
    /// The stage completed successfully.
    Completed,
    /// The stage failed but has retry budget; it re-enters the schedulable
    /// pool once `next_retry_at` passes.
    RetryScheduled {
        retry_attempt: u32,
        next_retry_at: DateTime<Utc>,
    },
    /// The stage failed terminally.
    Failed,
}

/// Decides the stage outcome for a reported result.
pub fn decide_result_outcome(
    success: bool,
    retry_attempt: u32,
    options: &StageOptions,
    now: DateTime<Utc>,
) -> ResultOutcome {
    if success {
        return ResultOutcome::Completed;
    }

    if retry_attempt < options.max_retries && options.retry_interval_sec > 0 {
        ResultOutcome::RetryScheduled {
            retry_attempt: retry_attempt + 1,
            next_retry_at: now + Duration::seconds(i64::from(options.retry_interval_sec)),
        }
    } else {
        ResultOutcome::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(max_retries: u32, retry_interval_sec: u32) -> StageOptions {
        StageOptions {
            max_retries,
            retry_interval_sec,
            ..StageOptions::default()
        }
    }

    #[test]
    fn test_success_always_completes() {
        let now = Utc::now();
        assert_eq!(decide_result_outcome(true, 0, &options(3, 10), now), ResultOutcome::Completed);
        assert_eq!(decide_result_outcome(true, 3, &options(3, 10), now), ResultOutcome::Completed);
    }

    #[test]
    fn test_failure_within_budget_schedules_retry() {
        let now = Utc::now();
        let outcome = decide_result_outcome(false, 0, &options(1, 2), now);
        assert_eq!(
            outcome,
            ResultOutcome::RetryScheduled {
                retry_attempt: 1,
                next_retry_at: now + Duration::seconds(2),
            }
        );
    }

    #[test]
    fn test_failure_with_spent_budget_fails() {
        let now = Utc::now();
        assert_eq!(decide_result_outcome(false, 1, &options(1, 2), now), ResultOutcome::Failed);
    }

    #[test]
    fn test_failure_without_interval_fails() {
        // A retry budget with no interval is a terminal failure: there is no
        // instant at which the stage would become claimable again.
        let now = Utc::now();
        assert_eq!(decide_result_outcome(false, 0, &options(3, 0), now), ResultOutcome::Failed);
    }

    #[test]
    fn test_attempt_never_exceeds_max_retries() {
        let now = Utc::now();
        let opts = options(2, 5);
        let mut attempt = 0;
        loop {
            match decide_result_outcome(false, attempt, &opts, now) {
                ResultOutcome::RetryScheduled { retry_attempt, .. } => {
                    assert!(retry_attempt <= opts.max_retries);
                    attempt = retry_attempt;
                }
                ResultOutcome::Failed => break,
                ResultOutcome::Completed => unreachable!(),
            }
        }
        assert_eq!(attempt, opts.max_retries);
    }
}
