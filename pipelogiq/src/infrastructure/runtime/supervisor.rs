// /////////////////////////////////////////////////////////////////////////////
// Pipelogiq
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Task Supervision
//!
//! Named, logged spawning for the control plane's long-running tasks
//! (scheduler, watchdog, consumers, sweeper, HTTP servers). Prevents the
//! spawn-and-forget anti-pattern: every handle must be awaited, and every
//! task outcome is visible in logs.

use tokio::task::JoinHandle;
use tracing::{debug, error};

use pipelogiq_domain::PipelineError;

/// Result type carried by supervised tasks.
pub type TaskResult<T> = Result<T, PipelineError>;

/// Spawns a named task whose outcome is logged.
///
/// Returns a `JoinHandle` the caller must await with [`join_supervised`].
pub fn spawn_supervised<F, T>(name: &'static str, fut: F) -> JoinHandle<TaskResult<T>>
where
    F: std::future::Future<Output = TaskResult<T>> + Send + 'static,
    T: Send + 'static,
{
    debug!(task = name, "task starting");

    tokio::spawn(async move {
        let result = fut.await;

        match &result {
            Ok(_) => debug!(task = name, "task completed"),
            Err(e) => error!(task = name, error = %e, "task failed"),
        }

        result
    })
}

/// Awaits a supervised task handle, converting panics and cancellations
/// into typed errors so no failure is lost.
pub async fn join_supervised<T>(handle: JoinHandle<TaskResult<T>>) -> TaskResult<T> {
    match handle.await {
        Ok(task_result) => task_result,
        Err(e) => {
            if e.is_panic() {
                Err(PipelineError::internal(format!("task panicked: {}", e)))
            } else if e.is_cancelled() {
                Err(PipelineError::cancelled())
            } else {
                Err(PipelineError::internal(format!("task join failed: {}", e)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_supervised_success() {
        let handle = spawn_supervised("test-success", async { Ok::<i32, PipelineError>(42) });
        let result = join_supervised(handle).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_spawn_supervised_error() {
        let handle = spawn_supervised("test-error", async {
            Err::<(), _>(PipelineError::validation("test error"))
        });
        assert!(join_supervised(handle).await.is_err());
    }

    #[tokio::test]
    async fn test_join_supervised_panic() {
        let handle = tokio::spawn(async {
            panic!("test panic");
            #[allow(unreachable_code)]
            Ok::<(), PipelineError>(())
        });

        let result = join_supervised(handle).await;
        assert!(result.unwrap_err().to_string().contains("panicked"));
    }
}
