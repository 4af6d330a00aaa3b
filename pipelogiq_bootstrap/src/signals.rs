// /////////////////////////////////////////////////////////////////////////////
// Pipelogiq
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # System Signal Handling
//!
//! Waits for a shutdown signal and triggers the shutdown coordinator.
//!
//! ## Supported Signals
//!
//! - **SIGTERM** (15) - orchestrator-initiated graceful shutdown
//! - **SIGINT** (2) - user interrupt (Ctrl+C)
//! - **SIGHUP** (1) - hangup, Unix only
//!
//! On non-Unix platforms only Ctrl+C is handled.

use crate::shutdown::ShutdownCoordinator;

/// Waits for a shutdown signal, then initiates shutdown on the coordinator.
///
/// Returns once a signal was received and shutdown has been initiated.
/// Signal registration failures are treated as fatal configuration errors
/// and initiate shutdown immediately rather than leaving the process
/// unkillable-gracefully.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal(coordinator: &ShutdownCoordinator) {
    use tokio::signal::unix::{signal, SignalKind};

    let sigterm = signal(SignalKind::terminate());
    let sigint = signal(SignalKind::interrupt());
    let sighup = signal(SignalKind::hangup());

    let (mut sigterm, mut sigint, mut sighup) = match (sigterm, sigint, sighup) {
        (Ok(t), Ok(i), Ok(h)) => (t, i, h),
        _ => {
            tracing::error!("Failed to register signal handlers, shutting down");
            coordinator.initiate_shutdown();
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        }
        _ = sighup.recv() => {
            tracing::info!("Received SIGHUP, initiating graceful shutdown");
        }
    }

    coordinator.initiate_shutdown();
}

/// Waits for Ctrl+C, then initiates shutdown on the coordinator.
#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal(coordinator: &ShutdownCoordinator) {
    if tokio::signal::ctrl_c().await.is_err() {
        tracing::error!("Failed to register Ctrl+C handler, shutting down");
    } else {
        tracing::info!("Received Ctrl+C, initiating graceful shutdown");
    }
    coordinator.initiate_shutdown();
}
