// /////////////////////////////////////////////////////////////////////////////
// Pipelogiq
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Shutdown Coordination
//!
//! Cancellation and drain tracking for the control plane's long-running
//! tasks: the scheduler tick loop, the pending watchdog, the two broker
//! consumers, the gateway sweeper, and the HTTP accept loops.
//!
//! Shutdown is a two-phase protocol:
//!
//! 1. **Cancel** — every task holds a clone of the [`CancellationToken`]
//!    (a `tokio::sync::watch` pair) and selects on `token.cancelled()`.
//!    [`ShutdownCoordinator::initiate_shutdown`] flips the watch value
//!    once; all clones observe it.
//! 2. **Drain** — each task also holds a named [`DrainGuard`] taken from
//!    [`ShutdownCoordinator::register`]. When the task returns, the guard
//!    drops and the task leaves the drain registry.
//!    [`ShutdownCoordinator::wait_for_drain`] waits for the registry to
//!    empty within the grace period and names the tasks still running
//!    when it does not, so a wedged consumer is identified in the logs
//!    instead of guessed at.
//!
//! In-flight database transactions are not interrupted; they run to
//! completion or are rolled back by the database on disconnect.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};

/// Default grace period for graceful shutdown (in seconds)
pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 5;

/// Cancellation token backed by a `watch` channel.
///
/// Clone-able and cheap to pass into any task. Waiting on an
/// already-cancelled token returns immediately.
#[derive(Clone)]
pub struct CancellationToken {
    /// Observed side of the cancellation flag
    state: watch::Receiver<bool>,
    /// Shared trigger; kept alive by every clone so waiters never see a
    /// closed channel
    trigger: Arc<watch::Sender<bool>>,
}

impl CancellationToken {
    fn new() -> Self {
        let (trigger, state) = watch::channel(false);
        Self {
            state,
            trigger: Arc::new(trigger),
        }
    }

    /// Cancel this token and every clone of it.
    pub fn cancel(&self) {
        self.trigger.send_replace(true);
    }

    /// Check if cancelled (non-blocking).
    pub fn is_cancelled(&self) -> bool {
        *self.state.borrow()
    }

    /// Wait for cancellation.
    pub async fn cancelled(&self) {
        let mut state = self.state.clone();
        // The sender lives in this token, so the channel cannot close
        // before cancellation; a closed channel is treated as cancelled.
        let _ = state.wait_for(|cancelled| *cancelled).await;
    }
}

/// Names of tasks that have not yet finished draining.
struct DrainRegistry {
    tasks: Mutex<BTreeSet<&'static str>>,
    drained: Notify,
}

impl DrainRegistry {
    fn pending(&self) -> Vec<&'static str> {
        self.lock().iter().copied().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<&'static str>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Membership card in the drain registry.
///
/// Held by a supervised task for its whole lifetime and dropped when the
/// task returns; the drop is what marks the task as drained.
pub struct DrainGuard {
    name: &'static str,
    registry: Arc<DrainRegistry>,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        let remaining = {
            let mut tasks = self.registry.lock();
            tasks.remove(self.name);
            tasks.len()
        };
        tracing::debug!(task = self.name, remaining, "task drained");
        self.registry.drained.notify_waiters();
    }
}

/// Shutdown coordinator for the control plane's supervised tasks.
///
/// One coordinator per process: tasks take tokens via [`Self::token`] and
/// guards via [`Self::register`]; the signal handler calls
/// [`Self::initiate_shutdown`]; `main` bounds the wind-down with
/// [`Self::wait_for_drain`].
#[derive(Clone)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    grace_period: Duration,
    registry: Arc<DrainRegistry>,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator with the given grace period.
    pub fn new(grace_period: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            grace_period,
            registry: Arc::new(DrainRegistry {
                tasks: Mutex::new(BTreeSet::new()),
                drained: Notify::new(),
            }),
        }
    }

    /// Get a cancellation token to pass into an async task.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Enroll a named task in drain tracking.
    ///
    /// The returned guard must live as long as the task does; re-using a
    /// name replaces the previous entry.
    pub fn register(&self, name: &'static str) -> DrainGuard {
        self.registry.lock().insert(name);
        tracing::debug!(task = name, "task enrolled in drain tracking");
        DrainGuard {
            name,
            registry: self.registry.clone(),
        }
    }

    /// Names of tasks that have not drained yet.
    pub fn pending_tasks(&self) -> Vec<&'static str> {
        self.registry.pending()
    }

    /// Check if shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Initiate shutdown: cancel every token, once.
    pub fn initiate_shutdown(&self) {
        if self.token.is_cancelled() {
            return;
        }
        tracing::info!(
            grace = ?self.grace_period,
            draining = ?self.pending_tasks(),
            "shutdown initiated, cancelling supervised tasks"
        );
        self.token.cancel();
    }

    /// Wait for every registered task to drain, bounded by the grace
    /// period.
    ///
    /// Returns `true` when the registry emptied in time; `false` on
    /// timeout, after logging which tasks are still running.
    pub async fn wait_for_drain(&self) -> bool {
        let deadline = tokio::time::Instant::now() + self.grace_period;

        loop {
            let notified = self.registry.drained.notified();
            tokio::pin!(notified);
            // Arm the waiter before checking, so a guard dropped between
            // the check and the await is not missed.
            notified.as_mut().enable();

            if self.registry.lock().is_empty() {
                tracing::info!("all supervised tasks drained");
                return true;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::warn!(
                        still_running = ?self.pending_tasks(),
                        "drain grace period elapsed with tasks still running"
                    );
                    return false;
                }
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_GRACE_PERIOD_SECS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_starts_uncancelled() {
        let coordinator = ShutdownCoordinator::default();
        assert!(!coordinator.token().is_cancelled());
        assert!(!coordinator.is_shutting_down());
    }

    #[test]
    fn test_cancel_reaches_every_clone() {
        let coordinator = ShutdownCoordinator::default();
        let token_a = coordinator.token();
        let token_b = token_a.clone();

        coordinator.initiate_shutdown();
        assert!(token_a.is_cancelled());
        assert!(token_b.is_cancelled());
    }

    #[test]
    fn test_initiate_twice_is_idempotent() {
        let coordinator = ShutdownCoordinator::default();
        coordinator.initiate_shutdown();
        coordinator.initiate_shutdown();
        assert!(coordinator.is_shutting_down());
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_already_cancelled() {
        let coordinator = ShutdownCoordinator::default();
        coordinator.initiate_shutdown();
        coordinator.token().cancelled().await;
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let coordinator = ShutdownCoordinator::default();
        let token = coordinator.token();

        let waiter = coordinator.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            waiter.initiate_shutdown();
        });

        token.cancelled().await;
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_guard_drop_leaves_registry() {
        let coordinator = ShutdownCoordinator::default();
        let guard = coordinator.register("scheduler");
        assert_eq!(coordinator.pending_tasks(), vec!["scheduler"]);

        drop(guard);
        assert!(coordinator.pending_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_drain_with_no_tasks_returns_immediately() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        coordinator.initiate_shutdown();
        assert!(coordinator.wait_for_drain().await);
    }

    #[tokio::test]
    async fn test_drain_waits_for_running_task() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let guard = coordinator.register("stage-result-consumer");

        let token = coordinator.token();
        tokio::spawn(async move {
            let _drain = guard;
            token.cancelled().await;
            tokio::time::sleep(Duration::from_millis(50)).await;
        });

        coordinator.initiate_shutdown();
        assert!(coordinator.wait_for_drain().await);
        assert!(coordinator.pending_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_drain_timeout_names_stragglers() {
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(50));
        let _held = coordinator.register("gateway-sweeper");

        coordinator.initiate_shutdown();
        assert!(!coordinator.wait_for_drain().await);
        assert_eq!(coordinator.pending_tasks(), vec!["gateway-sweeper"]);
    }
}
