// /////////////////////////////////////////////////////////////////////////////
// Pipelogiq
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Request Authentication
//!
//! Three extractors, one per credential kind:
//!
//! - [`ApiKeyAuth`] — external surface; `X-API-Key` or
//!   `Authorization: Bearer <key>`, resolved to the owning application.
//! - [`WorkerSession`] — worker session routes; `X-Worker-Session` with
//!   `X-Worker-Token` and bearer fallbacks, resolved to the worker row.
//! - [`DashboardUser`] — internal surface; HS256 JWT from the `session`
//!   cookie or a bearer token. Login and token issuance live outside the
//!   core; only validation happens here, against the signing secret
//!   injected through configuration at startup.

use axum::extract::FromRequestParts;
use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::http::request::Parts;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use pipelogiq_domain::entities::WorkerClient;
use pipelogiq_domain::value_objects::ApplicationId;
use pipelogiq_domain::PipelineError;

use crate::presentation::http::error::ApiError;
use crate::presentation::http::state::AppState;

/// Name of the dashboard session cookie.
const SESSION_COOKIE: &str = "session";

fn header_value<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts.headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    header_value(parts, AUTHORIZATION.as_str())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .map(str::trim)
}

fn cookie_value<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    let cookies = parts.headers.get(COOKIE)?.to_str().ok()?;
    cookies
        .split(';')
        .map(str::trim)
        .find_map(|pair| pair.strip_prefix(name)?.strip_prefix('='))
}

/// An authenticated external caller.
pub struct ApiKeyAuth {
    pub application_id: ApplicationId,
}

impl FromRequestParts<AppState> for ApiKeyAuth {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let key = header_value(parts, "X-API-Key")
            .or_else(|| bearer_token(parts))
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ApiError(PipelineError::auth("missing API key")))?;

        let application_id = state.store.validate_api_key(key).await?;
        Ok(Self { application_id })
    }
}

/// An authenticated worker session.
pub struct WorkerSession {
    pub worker: WorkerClient,
}

impl FromRequestParts<AppState> for WorkerSession {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = header_value(parts, "X-Worker-Session")
            .or_else(|| header_value(parts, "X-Worker-Token"))
            .or_else(|| bearer_token(parts))
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError(PipelineError::auth("missing worker session token")))?;

        let worker = state.store.find_worker_by_session(token).await?;
        Ok(Self { worker })
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[allow(dead_code)]
    exp: usize,
}

/// An authenticated dashboard user.
pub struct DashboardUser {
    pub subject: String,
}

impl FromRequestParts<AppState> for DashboardUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        if state.auth.jwt_secret.is_empty() {
            return Err(ApiError(PipelineError::auth("dashboard authentication is not configured")));
        }

        let token = cookie_value(parts, SESSION_COOKIE)
            .or_else(|| bearer_token(parts))
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError(PipelineError::auth("missing session token")))?;

        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(state.auth.jwt_secret.as_bytes()),
            &Validation::new(Algorithm::HS256),
        )
        .map_err(|e| ApiError(PipelineError::auth(format!("invalid session token: {}", e))))?;

        Ok(Self {
            subject: data.claims.sub,
        })
    }
}
