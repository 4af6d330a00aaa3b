// /////////////////////////////////////////////////////////////////////////////
// Pipelogiq
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # HTTP Error Translation
//!
//! The single place the domain error taxonomy maps to HTTP status codes.
//! Every handler returns `Result<_, ApiError>`; error bodies are always
//! `{"error": "..."}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use pipelogiq_domain::PipelineError;

/// Wrapper translating `PipelineError` to an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub PipelineError);

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            PipelineError::ValidationError(_) => StatusCode::BAD_REQUEST,
            PipelineError::AuthError(_) => StatusCode::UNAUTHORIZED,
            PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::Backpressure(_) => StatusCode::TOO_MANY_REQUESTS,
            PipelineError::DatabaseError(_)
            | PipelineError::BrokerError(_)
            | PipelineError::PublishError(_)
            | PipelineError::TimeoutError(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApiError(PipelineError::validation("x")).status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError(PipelineError::auth("x")).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError(PipelineError::not_found("x")).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError(PipelineError::backpressure("x")).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError(PipelineError::database("x")).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError(PipelineError::internal("x")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
