// /////////////////////////////////////////////////////////////////////////////
// Pipelogiq
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # HTTP Surfaces
//!
//! Two axum routers on separate binds:
//!
//! - **internal** (dashboard) — JWT cookie auth; pipeline/worker reads,
//!   rerun/skip actions, health, version, metrics
//! - **external** (workers/SDKs) — API-key auth; pipeline creation, the
//!   pull/ack job gateway, worker bootstrap and session routes, log intake
//!
//! Both surfaces run under a per-request timeout and shut down gracefully
//! on the process cancellation token.

pub mod auth;
pub mod error;
pub mod external;
pub mod internal;
pub mod state;

use axum::Router;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use pipelogiq_bootstrap::CancellationToken;
use pipelogiq_domain::PipelineError;

pub use state::AppState;

/// Binds and serves a router until cancellation.
async fn serve(
    name: &'static str,
    bind: &str,
    router: Router,
    token: CancellationToken,
) -> Result<(), PipelineError> {
    let listener = TcpListener::bind(bind)
        .await
        .map_err(|e| PipelineError::io(format!("failed to bind {} surface on {}: {}", name, bind, e)))?;

    info!(surface = name, bind, "http surface listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
        .map_err(|e| PipelineError::internal(format!("{} http server failed: {}", name, e)))
}

/// Serves the internal (dashboard) surface.
pub async fn serve_internal(
    state: AppState,
    bind: String,
    request_timeout: Duration,
    token: CancellationToken,
) -> Result<(), PipelineError> {
    let router = internal::router(state)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http());
    serve("internal", &bind, router, token).await
}

/// Serves the external (workers/SDKs) surface.
pub async fn serve_external(
    state: AppState,
    bind: String,
    request_timeout: Duration,
    token: CancellationToken,
) -> Result<(), PipelineError> {
    let router = external::router(state)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http());
    serve("external", &bind, router, token).await
}
