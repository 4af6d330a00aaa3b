// /////////////////////////////////////////////////////////////////////////////
// Pipelogiq
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # External (Workers & SDKs) Surface
//!
//! API-key-authenticated JSON API for the worker fleet: pipeline creation,
//! the pull/ack job gateway, application log intake, worker bootstrap, and
//! the session-token worker routes (heartbeat, events, shutdown).

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use pipelogiq_domain::entities::{Pipeline, Stage};
use pipelogiq_domain::repositories::{AppLogEntry, CreatePipelineRequest, WorkerEventDraft, WorkerRegistration};

use crate::application::services::worker_registry::HeartbeatRequest;
use crate::presentation::http::auth::{ApiKeyAuth, WorkerSession};
use crate::presentation::http::error::ApiError;
use crate::presentation::http::state::AppState;

/// Builds the external router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/pipelines", post(create_pipeline))
        .route("/jobs/pull", post(pull_job))
        .route("/jobs/ack", post(ack_job))
        .route("/logs", post(append_log))
        .route("/workers/bootstrap", post(bootstrap_worker))
        .route("/workers/heartbeat", post(worker_heartbeat))
        .route("/workers/events", post(worker_events))
        .route("/workers/shutdown", post(worker_shutdown))
        .route("/rabbitmq/connection", get(broker_connection))
        .with_state(state)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreatePipelineResponse {
    pipeline: Pipeline,
    stages: Vec<Stage>,
}

async fn create_pipeline(
    auth: ApiKeyAuth,
    State(state): State<AppState>,
    Json(req): Json<CreatePipelineRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let created = state.pipeline_service.create_pipeline(req, auth.application_id).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreatePipelineResponse {
            pipeline: created.pipeline,
            stages: created.stages,
        }),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullRequest {
    queue: String,
}

async fn pull_job(
    _auth: ApiKeyAuth,
    State(state): State<AppState>,
    Json(req): Json<PullRequest>,
) -> Result<Response, ApiError> {
    match state.gateway.pull(&req.queue).await? {
        Some(job) => Ok(Json(job).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AckRequest {
    token: String,
    #[serde(default)]
    requeue: bool,
}

async fn ack_job(
    _auth: ApiKeyAuth,
    State(state): State<AppState>,
    Json(req): Json<AckRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.gateway.ack(&req.token, req.requeue).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn append_log(
    auth: ApiKeyAuth,
    State(state): State<AppState>,
    Json(entry): Json<AppLogEntry>,
) -> Result<impl IntoResponse, ApiError> {
    state.store.append_app_log(auth.application_id, entry).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn bootstrap_worker(
    auth: ApiKeyAuth,
    State(state): State<AppState>,
    Json(registration): Json<WorkerRegistration>,
) -> Result<impl IntoResponse, ApiError> {
    let response = state.registry.bootstrap(auth.application_id, registration).await?;
    Ok(Json(response))
}

async fn worker_heartbeat(
    session: WorkerSession,
    State(state): State<AppState>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.registry.heartbeat(&session.worker, req).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn worker_events(
    session: WorkerSession,
    State(state): State<AppState>,
    Json(events): Json<Vec<WorkerEventDraft>>,
) -> Result<impl IntoResponse, ApiError> {
    state.registry.events(&session.worker, events).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ShutdownRequest {
    reason: Option<String>,
}

async fn worker_shutdown(
    session: WorkerSession,
    State(state): State<AppState>,
    Json(req): Json<ShutdownRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.registry.shutdown(&session.worker, req.reason).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn broker_connection(
    _auth: ApiKeyAuth,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(serde_json::json!({ "connectionString": state.broker_url })))
}
