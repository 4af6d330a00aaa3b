// /////////////////////////////////////////////////////////////////////////////
// Pipelogiq
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # AMQP Header Carrier
//!
//! Adapts a lapin `FieldTable` to the domain's generic
//! [`HeaderCarrier`](pipelogiq_domain::value_objects::HeaderCarrier) so
//! trace-context injection and extraction are written once against
//! `get`/`set`/`keys`.
//!
//! AMQP header values are polymorphic on the wire: peers may ship the
//! `traceparent` value as a long string or a raw byte array. Reads coerce
//! both to UTF-8 strings; writes always produce long strings.

use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use std::collections::BTreeMap;

use pipelogiq_domain::value_objects::HeaderCarrier;

/// Mutable view over an AMQP `FieldTable` as a string header map.
pub struct AmqpHeaderCarrier<'a> {
    table: &'a mut FieldTable,
}

impl<'a> AmqpHeaderCarrier<'a> {
    /// Wraps a field table for header access.
    pub fn new(table: &'a mut FieldTable) -> Self {
        Self { table }
    }
}

fn coerce_to_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        AMQPValue::ByteArray(bytes) => Some(String::from_utf8_lossy(bytes.as_slice()).into_owned()),
        _ => None,
    }
}

impl HeaderCarrier for AmqpHeaderCarrier<'_> {
    fn get(&self, key: &str) -> Option<String> {
        self.table
            .inner()
            .iter()
            .find(|(k, _)| k.as_str() == key)
            .and_then(|(_, v)| coerce_to_string(v))
    }

    fn set(&mut self, key: &str, value: String) {
        self.table.insert(
            ShortString::from(key.to_string()),
            AMQPValue::LongString(LongString::from(value)),
        );
    }

    fn keys(&self) -> Vec<String> {
        self.table.inner().keys().map(|k| k.as_str().to_string()).collect()
    }
}

/// Flattens a field table into a plain string map for HTTP responses
/// (the pull gateway returns message headers to workers as JSON).
pub fn headers_to_map(table: &FieldTable) -> BTreeMap<String, String> {
    table
        .inner()
        .iter()
        .filter_map(|(k, v)| coerce_to_string(v).map(|v| (k.as_str().to_string(), v)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipelogiq_domain::value_objects::trace::{
        extract_trace_context, inject_trace_context, TRACEPARENT_HEADER,
    };
    use pipelogiq_domain::value_objects::{SpanId, TraceId};

    #[test]
    fn test_set_then_get() {
        let mut table = FieldTable::default();
        let mut carrier = AmqpHeaderCarrier::new(&mut table);
        carrier.set("x-test", "value".to_string());
        assert_eq!(carrier.get("x-test").as_deref(), Some("value"));
        assert!(carrier.get("absent").is_none());
    }

    #[test]
    fn test_byte_array_values_coerce_on_read() {
        let mut table = FieldTable::default();
        table.insert(
            ShortString::from(TRACEPARENT_HEADER),
            AMQPValue::ByteArray("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01".as_bytes().to_vec().into()),
        );

        let mut carrier = AmqpHeaderCarrier::new(&mut table);
        let (trace, span) = extract_trace_context(&carrier).unwrap();
        assert_eq!(trace.as_str(), "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(span.as_str(), "00f067aa0ba902b7");
        // Writes still work after a byte-array read.
        carrier.set("x-other", "1".to_string());
    }

    #[test]
    fn test_trace_roundtrip_through_table() {
        let trace = TraceId::new();
        let span = SpanId::new();

        let mut table = FieldTable::default();
        let mut carrier = AmqpHeaderCarrier::new(&mut table);
        inject_trace_context(&mut carrier, &trace, &span);

        let carrier = AmqpHeaderCarrier::new(&mut table);
        let (t, s) = extract_trace_context(&carrier).unwrap();
        assert_eq!(t, trace);
        assert_eq!(s, span);
    }

    #[test]
    fn test_headers_to_map_skips_non_string_values() {
        let mut table = FieldTable::default();
        table.insert(ShortString::from("a"), AMQPValue::LongString(LongString::from("1")));
        table.insert(ShortString::from("n"), AMQPValue::LongLongInt(7));

        let map = headers_to_map(&table);
        assert_eq!(map.get("a").map(String::as_str), Some("1"));
        assert!(!map.contains_key("n"));
    }
}
