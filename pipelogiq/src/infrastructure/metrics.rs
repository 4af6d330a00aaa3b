// /////////////////////////////////////////////////////////////////////////////
// Pipelogiq
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Metrics Service
//!
//! Prometheus-based metrics for control plane observability: scheduler
//! publishes, reconciler applies, watchdog kills, and job gateway lease
//! traffic. Thread-safe with low overhead; exposed as text on the internal
//! surface at `GET /metrics`.

use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

use pipelogiq_domain::PipelineError;

const NAMESPACE: &str = "pipelogiq";

fn counter(name: &str, help: &str) -> Result<IntCounter, PipelineError> {
    IntCounter::with_opts(Opts::new(name, help).namespace(NAMESPACE))
        .map_err(|e| PipelineError::MetricsError(format!("Failed to create {} metric: {}", name, e)))
}

/// Prometheus metrics service for the control plane.
///
/// All counters live in one registry created at startup; components receive
/// the service behind an `Arc` and increment through the typed methods so
/// metric names exist in exactly one place.
#[derive(Clone)]
pub struct MetricsService {
    registry: Arc<Registry>,

    // Scheduler / reconciler metrics
    stage_published_total: IntCounter,
    stage_result_processed_total: IntCounter,
    stage_result_failed_total: IntCounter,
    pending_marked_failed_total: IntCounter,

    // Job gateway metrics
    ext_stage_jobs_pulled_total: IntCounter,
    ext_stage_jobs_acked_total: IntCounter,
    ext_stage_jobs_nacked_total: IntCounter,
    gateway_in_flight: IntGauge,
}

impl MetricsService {
    /// Create a new MetricsService with its own Prometheus registry.
    pub fn new() -> Result<Self, PipelineError> {
        let registry = Registry::new();

        let stage_published_total = counter(
            "stage_published_total",
            "Total stage jobs published to per-handler queues",
        )?;
        let stage_result_processed_total = counter(
            "stage_result_processed_total",
            "Total stage result messages applied to the state store",
        )?;
        let stage_result_failed_total = counter(
            "stage_result_failed_total",
            "Total applied stage results that reported failure",
        )?;
        let pending_marked_failed_total = counter(
            "pending_marked_failed_total",
            "Total stages failed by the pending watchdog",
        )?;
        let ext_stage_jobs_pulled_total = counter(
            "ext_stage_jobs_pulled_total",
            "Total jobs leased to workers through the pull gateway",
        )?;
        let ext_stage_jobs_acked_total = counter(
            "ext_stage_jobs_acked_total",
            "Total gateway leases acknowledged by workers",
        )?;
        let ext_stage_jobs_nacked_total = counter(
            "ext_stage_jobs_nacked_total",
            "Total gateway leases returned to the queue (requeue or expiry)",
        )?;

        let gateway_in_flight = IntGauge::with_opts(
            Opts::new("gateway_in_flight", "Current unacked gateway leases").namespace(NAMESPACE),
        )
        .map_err(|e| PipelineError::MetricsError(format!("Failed to create gateway_in_flight metric: {}", e)))?;

        for metric in [
            &stage_published_total,
            &stage_result_processed_total,
            &stage_result_failed_total,
            &pending_marked_failed_total,
            &ext_stage_jobs_pulled_total,
            &ext_stage_jobs_acked_total,
            &ext_stage_jobs_nacked_total,
        ] {
            registry
                .register(Box::new(metric.clone()))
                .map_err(|e| PipelineError::MetricsError(format!("Failed to register metric: {}", e)))?;
        }
        registry
            .register(Box::new(gateway_in_flight.clone()))
            .map_err(|e| PipelineError::MetricsError(format!("Failed to register gateway_in_flight: {}", e)))?;

        Ok(Self {
            registry: Arc::new(registry),
            stage_published_total,
            stage_result_processed_total,
            stage_result_failed_total,
            pending_marked_failed_total,
            ext_stage_jobs_pulled_total,
            ext_stage_jobs_acked_total,
            ext_stage_jobs_nacked_total,
            gateway_in_flight,
        })
    }

    /// Records one published stage job.
    pub fn record_stage_published(&self) {
        self.stage_published_total.inc();
    }

    /// Records one applied stage result; `success` is the worker's verdict.
    pub fn record_stage_result(&self, success: bool) {
        self.stage_result_processed_total.inc();
        if !success {
            self.stage_result_failed_total.inc();
        }
    }

    /// Records stages failed by one watchdog sweep.
    pub fn record_pending_marked_failed(&self, count: u64) {
        self.pending_marked_failed_total.inc_by(count);
    }

    /// Records one gateway pull lease.
    pub fn record_job_pulled(&self) {
        self.ext_stage_jobs_pulled_total.inc();
        self.gateway_in_flight.inc();
    }

    /// Records one gateway ack.
    pub fn record_job_acked(&self) {
        self.ext_stage_jobs_acked_total.inc();
        self.gateway_in_flight.dec();
    }

    /// Records one gateway nack (explicit requeue or lease expiry).
    pub fn record_job_nacked(&self) {
        self.ext_stage_jobs_nacked_total.inc();
        self.gateway_in_flight.dec();
    }

    /// Renders the registry in Prometheus text exposition format.
    pub fn gather(&self) -> Result<String, PipelineError> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|e| PipelineError::MetricsError(format!("Failed to encode metrics: {}", e)))?;
        String::from_utf8(buffer).map_err(|e| PipelineError::MetricsError(format!("Metrics were not UTF-8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_increment() {
        let metrics = MetricsService::new().unwrap();
        metrics.record_stage_published();
        metrics.record_stage_result(true);
        metrics.record_stage_result(false);
        metrics.record_pending_marked_failed(2);

        let text = metrics.gather().unwrap();
        assert!(text.contains("pipelogiq_stage_published_total 1"));
        assert!(text.contains("pipelogiq_stage_result_processed_total 2"));
        assert!(text.contains("pipelogiq_stage_result_failed_total 1"));
        assert!(text.contains("pipelogiq_pending_marked_failed_total 2"));
    }

    #[test]
    fn test_gateway_gauge_tracks_leases() {
        let metrics = MetricsService::new().unwrap();
        metrics.record_job_pulled();
        metrics.record_job_pulled();
        metrics.record_job_acked();
        metrics.record_job_nacked();

        let text = metrics.gather().unwrap();
        assert!(text.contains("pipelogiq_ext_stage_jobs_pulled_total 2"));
        assert!(text.contains("pipelogiq_ext_stage_jobs_acked_total 1"));
        assert!(text.contains("pipelogiq_ext_stage_jobs_nacked_total 1"));
        assert!(text.contains("pipelogiq_gateway_in_flight 0"));
    }
}
