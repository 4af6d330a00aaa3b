// /////////////////////////////////////////////////////////////////////////////
// Pipelogiq
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Bootstrap Module
//!
//! The bootstrap module sits **outside** the enterprise application layers
//! (domain, application, infrastructure) and provides the process-level
//! plumbing the control plane binary needs:
//!
//! - **Shutdown coordination** — a clone-able cancellation token plus a
//!   named drain registry with a bounded grace period, driving the
//!   scheduler, watchdog, consumer, sweeper, and HTTP accept loops to a
//!   clean stop and naming any task that fails to wind down
//! - **Signal handling** — SIGTERM / SIGINT / SIGHUP wired into the
//!   coordinator
//! - **Logging init** — `tracing` subscriber setup with env-driven filters
//! - **Exit codes** — Unix `sysexits.h` style exit status mapping
//!
//! Bootstrap can see every layer; no enterprise layer may depend on
//! bootstrap.

pub mod exit_code;
pub mod logger;
pub mod shutdown;
pub mod signals;

pub use exit_code::ExitCode;
pub use shutdown::{CancellationToken, DrainGuard, ShutdownCoordinator};
