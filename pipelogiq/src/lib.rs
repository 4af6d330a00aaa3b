// /////////////////////////////////////////////////////////////////////////////
// Pipelogiq
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Pipelogiq Control Plane
//!
//! Executes multi-stage workflows by dispatching stage jobs to a fleet of
//! external workers over an AMQP broker and reconciling their results
//! against a durable pipeline state store.
//!
//! ## Architecture
//!
//! The crate follows the domain / application / infrastructure /
//! presentation layering:
//!
//! - **Infrastructure** — sqlx state stores (SQLite for development,
//!   Postgres for production), the lapin broker client with trace-context
//!   propagation, prometheus metrics, configuration, and supervised task
//!   spawning
//! - **Application** — the long-running loops: scheduler/publisher, pending
//!   watchdog, result/status reconciler, job gateway with visibility
//!   leases, and the worker session registry
//! - **Presentation** — the two axum HTTP surfaces: the JWT-authenticated
//!   dashboard API and the API-key-authenticated worker/SDK API
//!
//! ## Data Flow
//!
//! ```text
//! scheduler --claim--> state store --job--> per-handler queue
//!    worker pulls (gateway or broker) --result--> StageResult queue
//! reconciler --apply--> state store --notify--> StageUpdated.fanout
//! ```

pub mod application;
pub mod infrastructure;
pub mod presentation;
