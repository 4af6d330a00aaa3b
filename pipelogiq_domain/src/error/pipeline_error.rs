// /////////////////////////////////////////////////////////////////////////////
// Pipelogiq
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Domain Error System
//!
//! A single, hierarchical error enum for the Pipelogiq control plane. Every
//! failure mode that crosses a component boundary is a variant here, so the
//! HTTP layer can translate errors to status codes and the broker consumers
//! can translate them to ack/nack decisions without string matching.
//!
//! ## Error Categories
//!
//! - **Caller errors**: `ValidationError`, `AuthError`, `NotFound`,
//!   `Backpressure` — translated to 400/401/404/429 by the API layer.
//! - **Transient backend errors**: `DatabaseError`, `BrokerError`,
//!   `TimeoutError` — safe to retry; consumers nack with requeue.
//! - **Permanent backend errors**: `PermanentError`, `SerializationError` —
//!   retrying cannot help; consumers nack without requeue (dead-letter).
//! - **Publish failures**: `PublishError` — the scheduler leaves the stage
//!   Pending and relies on the watchdog for eventual terminality.
//! - **Process-fatal**: `InvalidConfiguration` and `IoError` (a socket
//!   that cannot bind) — surface at startup only; the process refuses to
//!   run and exits with the matching `sysexits` code.

use thiserror::Error;

/// Domain-specific errors for the pipeline control plane.
///
/// Each variant carries a descriptive message. Variants are grouped by how
/// callers are expected to react, and the [`is_transient`](Self::is_transient)
/// / [`is_permanent`](Self::is_permanent) helpers encode those reactions so
/// consumers never have to guess.
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Authentication error: {0}")]
    AuthError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Backpressure: {0}")]
    Backpressure(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Broker error: {0}")]
    BrokerError(String),

    #[error("Publish failed: {0}")]
    PublishError(String),

    #[error("Permanent error: {0}")]
    PermanentError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Timeout: {0}")]
    TimeoutError(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Metrics error: {0}")]
    MetricsError(String),
}

impl PipelineError {
    /// Creates a new validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }

    /// Creates a new authentication error
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::AuthError(msg.into())
    }

    /// Creates a new not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Creates a new backpressure error
    pub fn backpressure(msg: impl Into<String>) -> Self {
        Self::Backpressure(msg.into())
    }

    /// Creates a new database error
    pub fn database(msg: impl Into<String>) -> Self {
        Self::DatabaseError(msg.into())
    }

    /// Creates a new broker error
    pub fn broker(msg: impl Into<String>) -> Self {
        Self::BrokerError(msg.into())
    }

    /// Creates a new publish error
    pub fn publish(msg: impl Into<String>) -> Self {
        Self::PublishError(msg.into())
    }

    /// Creates a new permanent (non-retryable) error
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::PermanentError(msg.into())
    }

    /// Creates a new serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::SerializationError(msg.into())
    }

    /// Creates a new IO error
    pub fn io(msg: impl Into<String>) -> Self {
        Self::IoError(msg.into())
    }

    /// Creates a new configuration error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Creates a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::InternalError(msg.into())
    }

    /// Creates a cancellation error
    pub fn cancelled() -> Self {
        Self::Cancelled("operation cancelled".to_string())
    }

    /// Checks whether the error indicates a temporarily unavailable backend.
    ///
    /// Broker consumers nack-with-requeue on transient errors so the message
    /// is redelivered once the backend recovers.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::DatabaseError(_) | PipelineError::BrokerError(_) | PipelineError::TimeoutError(_)
        )
    }

    /// Checks whether retrying can never succeed (malformed input, broken
    /// payload). Consumers nack-without-requeue, routing to the DLQ when one
    /// is wired.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            PipelineError::PermanentError(_) | PipelineError::SerializationError(_) | PipelineError::ValidationError(_)
        )
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::SerializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PipelineError::validation("missing field 'name'");
        assert_eq!(err.to_string(), "Validation error: missing field 'name'");

        let err = PipelineError::not_found("pipeline 42");
        assert_eq!(err.to_string(), "Not found: pipeline 42");
    }

    #[test]
    fn test_transient_classification() {
        assert!(PipelineError::database("connection refused").is_transient());
        assert!(PipelineError::broker("channel closed").is_transient());
        assert!(!PipelineError::permanent("bad payload").is_transient());
        assert!(!PipelineError::validation("bad body").is_transient());
    }

    #[test]
    fn test_permanent_classification() {
        assert!(PipelineError::permanent("unknown stage ref").is_permanent());
        assert!(PipelineError::serialization("invalid JSON").is_permanent());
        assert!(!PipelineError::database("deadlock").is_permanent());
    }

    #[test]
    fn test_serde_json_conversion() {
        let bad: Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: PipelineError = bad.unwrap_err().into();
        assert!(err.is_permanent());
    }
}
