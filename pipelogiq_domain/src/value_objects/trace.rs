// /////////////////////////////////////////////////////////////////////////////
// Pipelogiq
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Trace Context
//!
//! W3C trace-context primitives carried across process boundaries so a
//! pipeline's trace chains through the scheduler, the broker, and the worker
//! fleet as a single trace.
//!
//! ## Overview
//!
//! - [`TraceId`] — 32 lowercase hex characters, assigned once per pipeline at
//!   creation and never overwritten.
//! - [`SpanId`] — 16 lowercase hex characters, assigned once per stage.
//! - [`HeaderCarrier`] — the adapter seam between a transport's header table
//!   (an AMQP `FieldTable`, an HTTP header map) and the generic
//!   `get`/`set`/`keys` operations trace propagation needs. Header values are
//!   polymorphic on the wire (string or byte array); implementations coerce
//!   on read.
//!
//! The `traceparent` header follows the W3C format:
//! `{version}-{trace_id}-{parent_id}-{flags}`, e.g.
//! `00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01`.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

use crate::PipelineError;

/// Name of the W3C trace-context header carried in broker messages.
pub const TRACEPARENT_HEADER: &str = "traceparent";

/// Name of the W3C vendor-state header carried in broker messages.
pub const TRACESTATE_HEADER: &str = "tracestate";

fn is_lower_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// A 128-bit trace identifier rendered as 32 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceId(String);

impl TraceId {
    /// Generates a fresh random trace id.
    pub fn new() -> Self {
        Self(random_hex(16))
    }

    /// Validates and wraps an externally supplied trace id.
    ///
    /// Callers creating a pipeline may carry in a trace id from their own
    /// instrumentation; it must already be 32 lowercase hex characters and
    /// not all zeroes.
    pub fn parse(s: &str) -> Result<Self, PipelineError> {
        if s.len() != 32 || !is_lower_hex(s) {
            return Err(PipelineError::validation(format!(
                "trace id must be 32 lowercase hex characters, got {:?}",
                s
            )));
        }
        if s.bytes().all(|b| b == b'0') {
            return Err(PipelineError::validation("trace id must not be all zeroes"));
        }
        Ok(Self(s.to_string()))
    }

    /// Returns the hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A 64-bit span identifier rendered as 16 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpanId(String);

impl SpanId {
    /// Generates a fresh random span id.
    pub fn new() -> Self {
        Self(random_hex(8))
    }

    /// Validates and wraps an externally supplied span id.
    pub fn parse(s: &str) -> Result<Self, PipelineError> {
        if s.len() != 16 || !is_lower_hex(s) {
            return Err(PipelineError::validation(format!(
                "span id must be 16 lowercase hex characters, got {:?}",
                s
            )));
        }
        Ok(Self(s.to_string()))
    }

    /// Returns the hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SpanId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generic header-table adapter used for trace propagation.
///
/// Transports expose their native header structures (AMQP `FieldTable`,
/// HTTP header maps) through this trait so injection and extraction code is
/// written once. Values are treated polymorphically: implementations must
/// coerce byte-array header values to UTF-8 strings on read.
pub trait HeaderCarrier {
    /// Reads a header value, coercing byte arrays to strings.
    fn get(&self, key: &str) -> Option<String>;

    /// Writes a header value as a string.
    fn set(&mut self, key: &str, value: String);

    /// Lists the header keys currently present.
    fn keys(&self) -> Vec<String>;
}

/// Composes a W3C `traceparent` header value for the given trace and span.
pub fn format_traceparent(trace_id: &TraceId, span_id: &SpanId) -> String {
    format!("00-{}-{}-01", trace_id.as_str(), span_id.as_str())
}

/// Parses a W3C `traceparent` header value into its trace and parent span.
///
/// Unknown versions are accepted as long as the field widths match, per the
/// W3C forward-compatibility rules.
pub fn parse_traceparent(value: &str) -> Result<(TraceId, SpanId), PipelineError> {
    let mut parts = value.trim().splitn(4, '-');
    let version = parts
        .next()
        .ok_or_else(|| PipelineError::validation("empty traceparent"))?;
    if version.len() != 2 || !is_lower_hex(version) {
        return Err(PipelineError::validation(format!(
            "invalid traceparent version: {:?}",
            value
        )));
    }
    let trace = parts
        .next()
        .ok_or_else(|| PipelineError::validation("traceparent missing trace id"))?;
    let parent = parts
        .next()
        .ok_or_else(|| PipelineError::validation("traceparent missing parent id"))?;
    Ok((TraceId::parse(trace)?, SpanId::parse(parent)?))
}

/// Injects trace context into a header carrier.
pub fn inject_trace_context<C: HeaderCarrier>(carrier: &mut C, trace_id: &TraceId, span_id: &SpanId) {
    carrier.set(TRACEPARENT_HEADER, format_traceparent(trace_id, span_id));
}

/// Extracts trace context from a header carrier, if present and well-formed.
pub fn extract_trace_context<C: HeaderCarrier>(carrier: &C) -> Option<(TraceId, SpanId)> {
    let value = carrier.get(TRACEPARENT_HEADER)?;
    parse_traceparent(&value).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapCarrier(HashMap<String, String>);

    impl HeaderCarrier for MapCarrier {
        fn get(&self, key: &str) -> Option<String> {
            self.0.get(key).cloned()
        }

        fn set(&mut self, key: &str, value: String) {
            self.0.insert(key.to_string(), value);
        }

        fn keys(&self) -> Vec<String> {
            self.0.keys().cloned().collect()
        }
    }

    #[test]
    fn test_trace_id_shape() {
        let id = TraceId::new();
        assert_eq!(id.as_str().len(), 32);
        assert!(is_lower_hex(id.as_str()));
    }

    #[test]
    fn test_span_id_shape() {
        let id = SpanId::new();
        assert_eq!(id.as_str().len(), 16);
        assert!(is_lower_hex(id.as_str()));
    }

    #[test]
    fn test_trace_id_parse_rejects_bad_input() {
        assert!(TraceId::parse("short").is_err());
        assert!(TraceId::parse("ZZf92f3577b34da6a3ce929d0e0e4736").is_err());
        assert!(TraceId::parse("00000000000000000000000000000000").is_err());
        assert!(TraceId::parse("4bf92f3577b34da6a3ce929d0e0e4736").is_ok());
    }

    #[test]
    fn test_traceparent_roundtrip() {
        let trace = TraceId::new();
        let span = SpanId::new();
        let header = format_traceparent(&trace, &span);
        let (t, s) = parse_traceparent(&header).unwrap();
        assert_eq!(t, trace);
        assert_eq!(s, span);
    }

    #[test]
    fn test_traceparent_w3c_example() {
        let (t, s) = parse_traceparent("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01").unwrap();
        assert_eq!(t.as_str(), "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(s.as_str(), "00f067aa0ba902b7");
    }

    #[test]
    fn test_traceparent_rejects_garbage() {
        assert!(parse_traceparent("").is_err());
        assert!(parse_traceparent("zz-xx-yy-01").is_err());
        assert!(parse_traceparent("00-4bf92f35-00f067aa0ba902b7-01").is_err());
    }

    #[test]
    fn test_carrier_inject_extract() {
        let mut carrier = MapCarrier(HashMap::new());
        let trace = TraceId::new();
        let span = SpanId::new();
        inject_trace_context(&mut carrier, &trace, &span);

        let (t, s) = extract_trace_context(&carrier).unwrap();
        assert_eq!(t, trace);
        assert_eq!(s, span);
        assert!(carrier.keys().contains(&TRACEPARENT_HEADER.to_string()));
    }
}
