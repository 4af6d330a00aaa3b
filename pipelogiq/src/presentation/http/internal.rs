// /////////////////////////////////////////////////////////////////////////////
// Pipelogiq
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Internal (Dashboard) Surface
//!
//! JWT-authenticated JSON API for the web dashboard: pipeline listings and
//! detail, rerun/skip actions, worker liveness, health probes, version,
//! and prometheus metrics. The dashboard UI itself lives outside the core.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use pipelogiq_domain::entities::{PipelineKeyword, PipelineStatus};
use pipelogiq_domain::repositories::PipelineFilter;
use pipelogiq_domain::value_objects::{ApplicationId, PipelineId, StageId, WorkerId};
use pipelogiq_domain::PipelineError;

use crate::presentation::http::auth::DashboardUser;
use crate::presentation::http::error::ApiError;
use crate::presentation::http::state::AppState;

/// Builds the internal router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/pipelines", get(list_pipelines))
        .route("/pipelines/{id}", get(get_pipeline))
        .route("/pipelines/{id}/stages", get(get_stages))
        .route("/pipelines/{id}/context", get(get_context))
        .route("/pipelines/rerunStage", post(rerun_stage))
        .route("/pipelines/skipStage", post(skip_stage))
        .route("/pipelines/logs/{pipelineId}", get(get_pipeline_logs))
        .route("/pipelines/logs/{pipelineId}/{stageId}", get(get_stage_logs))
        .route("/workers", get(list_workers))
        .route("/workers/events", get(all_worker_events))
        .route("/workers/events/{workerId}", get(worker_events))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/version", get(version))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Query parameters of the pipeline listing. Multi-valued filters arrive
/// comma-separated (`status=Running,Failed`, `keyword=env:prod,team:data`).
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct PipelineListQuery {
    application_id: Option<i64>,
    status: Option<String>,
    keyword: Option<String>,
    search: Option<String>,
    created_from: Option<DateTime<Utc>>,
    created_to: Option<DateTime<Utc>>,
    finished_from: Option<DateTime<Utc>>,
    finished_to: Option<DateTime<Utc>>,
    page: Option<u32>,
    page_size: Option<u32>,
}

impl PipelineListQuery {
    fn into_filter(self) -> Result<PipelineFilter, PipelineError> {
        let statuses = match &self.status {
            None => Vec::new(),
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| s.parse::<PipelineStatus>())
                .collect::<Result<Vec<_>, _>>()?,
        };

        let keywords = match &self.keyword {
            None => Vec::new(),
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|pair| {
                    let (key, value) = pair
                        .split_once(':')
                        .ok_or_else(|| PipelineError::validation(format!("keyword filter {:?} is not key:value", pair)))?;
                    Ok(PipelineKeyword {
                        key: key.trim().to_string(),
                        value: value.trim().to_string(),
                    })
                })
                .collect::<Result<Vec<_>, PipelineError>>()?,
        };

        Ok(PipelineFilter {
            application_id: self.application_id.map(ApplicationId::new),
            statuses,
            keywords,
            search: self.search,
            created_from: self.created_from,
            created_to: self.created_to,
            finished_from: self.finished_from,
            finished_to: self.finished_to,
            page: self.page,
            page_size: self.page_size,
        })
    }
}

async fn list_pipelines(
    _user: DashboardUser,
    State(state): State<AppState>,
    Query(query): Query<PipelineListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let page = state.store.list_pipelines(query.into_filter()?).await?;
    Ok(Json(page))
}

async fn get_pipeline(
    _user: DashboardUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let detail = state.store.get_pipeline(PipelineId::new(id)).await?;
    Ok(Json(detail))
}

async fn get_stages(
    _user: DashboardUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let stages = state.store.get_stages(PipelineId::new(id)).await?;
    Ok(Json(stages))
}

async fn get_context(
    _user: DashboardUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let context = state.store.get_context(PipelineId::new(id)).await?;
    Ok(Json(context))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RerunStageRequest {
    stage_id: i64,
    #[serde(default)]
    include_next: bool,
}

async fn rerun_stage(
    _user: DashboardUser,
    State(state): State<AppState>,
    Json(req): Json<RerunStageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .pipeline_service
        .rerun_stage(StageId::new(req.stage_id), req.include_next)
        .await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SkipStageRequest {
    stage_id: i64,
}

async fn skip_stage(
    _user: DashboardUser,
    State(state): State<AppState>,
    Json(req): Json<SkipStageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state.pipeline_service.skip_stage(StageId::new(req.stage_id)).await?;
    Ok(Json(snapshot))
}

async fn get_pipeline_logs(
    _user: DashboardUser,
    State(state): State<AppState>,
    Path(pipeline_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let logs = state.store.get_stage_logs(PipelineId::new(pipeline_id), None).await?;
    Ok(Json(logs))
}

async fn get_stage_logs(
    _user: DashboardUser,
    State(state): State<AppState>,
    Path((pipeline_id, stage_id)): Path<(i64, i64)>,
) -> Result<impl IntoResponse, ApiError> {
    let logs = state
        .store
        .get_stage_logs(PipelineId::new(pipeline_id), Some(StageId::new(stage_id)))
        .await?;
    Ok(Json(logs))
}

async fn list_workers(
    _user: DashboardUser,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let listing = state.registry.list_workers().await?;
    Ok(Json(listing))
}

async fn all_worker_events(
    _user: DashboardUser,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let events = state.registry.worker_events(None).await?;
    Ok(Json(events))
}

async fn worker_events(
    _user: DashboardUser,
    State(state): State<AppState>,
    Path(worker_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let worker_id = worker_id.parse::<WorkerId>().map_err(ApiError)?;
    let events = state.registry.worker_events(Some(worker_id)).await?;
    Ok(Json(events))
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<AppState>) -> Result<&'static str, ApiError> {
    state.store.ping().await?;
    Ok("ready")
}

async fn version(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.version.clone())
}

async fn metrics(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let text = state.metrics.gather()?;
    Ok((StatusCode::OK, text))
}
