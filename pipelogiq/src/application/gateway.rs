// /////////////////////////////////////////////////////////////////////////////
// Pipelogiq
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Job Gateway
//!
//! The pull/ack bridge for workers that cannot hold a broker connection.
//! A pull fetches one message, mints an opaque token, and records a lease
//! `{delivery tag, queue, expiry}` in an in-memory map. An ack resolves the
//! token to an ack or a nack-with-requeue; a background sweeper
//! nack-requeues any lease whose visibility window passed. This gives
//! at-least-once delivery with a visibility timeout: workers must tolerate
//! seeing the same message again after the window.
//!
//! ## Lease State Machine
//!
//! ```text
//! [in broker] --pull--> [leased, token t, expires T]
//!   --ack(requeue=false)--> [removed, message acked]
//!   --ack(requeue=true)---> [nacked back to queue]
//!   --timer expiry-------->  [nacked back to queue]
//! ```
//!
//! The lease map is process-local and not durable; when the process dies,
//! the broker re-queues every unacked delivery as its channel closes.
//!
//! The map's mutex is held only for lookup/insert/delete, never across an
//! await: eviction collects the expired leases under the lock and nacks
//! after releasing it.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use pipelogiq_bootstrap::CancellationToken;
use pipelogiq_domain::services::opaque_token;
use pipelogiq_domain::PipelineError;

use crate::infrastructure::broker::{BrokerClient, FetchedMessage};
use crate::infrastructure::config::GatewayConfig;
use crate::infrastructure::metrics::MetricsService;

/// The narrow broker seam the gateway pulls from.
///
/// `BrokerClient` implements it for production; tests install an in-memory
/// fake so the lease machinery is exercised without a broker.
#[async_trait]
pub trait JobSource: Send + Sync {
    async fn fetch(&self, queue: &str) -> Result<Option<FetchedMessage>, PipelineError>;
    async fn ack(&self, delivery_tag: u64) -> Result<(), PipelineError>;
    async fn nack_requeue(&self, delivery_tag: u64) -> Result<(), PipelineError>;
}

#[async_trait]
impl JobSource for BrokerClient {
    async fn fetch(&self, queue: &str) -> Result<Option<FetchedMessage>, PipelineError> {
        BrokerClient::fetch(self, queue).await
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), PipelineError> {
        BrokerClient::ack(self, delivery_tag).await
    }

    async fn nack_requeue(&self, delivery_tag: u64) -> Result<(), PipelineError> {
        BrokerClient::nack_requeue(self, delivery_tag).await
    }
}

/// One leased, unacked delivery.
struct Lease {
    delivery_tag: u64,
    queue: String,
    expires_at: Instant,
}

/// The response body of a successful pull.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PulledJob {
    pub token: String,
    pub queue: String,
    pub message_id: Option<String>,
    pub payload: serde_json::Value,
    pub headers: BTreeMap<String, String>,
}

/// Pull/ack gateway with visibility leases.
pub struct JobGateway {
    source: Arc<dyn JobSource>,
    leases: Mutex<HashMap<String, Lease>>,
    config: GatewayConfig,
    metrics: MetricsService,
}

impl JobGateway {
    pub fn new(source: Arc<dyn JobSource>, config: GatewayConfig, metrics: MetricsService) -> Self {
        Self {
            source,
            leases: Mutex::new(HashMap::new()),
            config,
            metrics,
        }
    }

    /// Current number of unacked leases.
    pub fn in_flight(&self) -> usize {
        self.leases.lock().len()
    }

    /// Pulls one message from `queue` and leases it to the caller.
    ///
    /// Returns `Ok(None)` when the queue is empty. Returns `Backpressure`
    /// when the lease map is at capacity; a message fetched in the losing
    /// side of that race is nacked back to the queue first.
    pub async fn pull(&self, queue: &str) -> Result<Option<PulledJob>, PipelineError> {
        if self.leases.lock().len() >= self.config.max_in_flight {
            return Err(PipelineError::backpressure("too many in-flight jobs"));
        }

        let Some(message) = self.source.fetch(queue).await? else {
            return Ok(None);
        };

        let token = opaque_token();
        let expires_at = Instant::now() + self.config.visibility_ttl();

        let at_capacity = {
            let mut leases = self.leases.lock();
            if leases.len() >= self.config.max_in_flight {
                true
            } else {
                leases.insert(
                    token.clone(),
                    Lease {
                        delivery_tag: message.delivery_tag,
                        queue: queue.to_string(),
                        expires_at,
                    },
                );
                false
            }
        };

        if at_capacity {
            // Lost the capacity race after fetching; put the message back.
            if let Err(e) = self.source.nack_requeue(message.delivery_tag).await {
                warn!(queue, error = %e, "failed to requeue over-capacity fetch");
            }
            return Err(PipelineError::backpressure("too many in-flight jobs"));
        }

        self.metrics.record_job_pulled();

        let payload = serde_json::from_slice(&message.payload)
            .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(&message.payload).into_owned()));

        debug!(queue, token = %token, "job leased");
        Ok(Some(PulledJob {
            token,
            queue: queue.to_string(),
            message_id: message.message_id,
            payload,
            headers: message.headers,
        }))
    }

    /// Resolves a lease: ack (`requeue = false`) or nack-with-requeue.
    ///
    /// An unknown token — never issued, already resolved, or already swept
    /// — is `NotFound`.
    pub async fn ack(&self, token: &str, requeue: bool) -> Result<(), PipelineError> {
        let lease = self
            .leases
            .lock()
            .remove(token)
            .ok_or_else(|| PipelineError::not_found("unknown or expired job token"))?;

        if requeue {
            self.source.nack_requeue(lease.delivery_tag).await?;
            self.metrics.record_job_nacked();
            debug!(queue = %lease.queue, token, "job requeued by worker");
        } else {
            self.source.ack(lease.delivery_tag).await?;
            self.metrics.record_job_acked();
            debug!(queue = %lease.queue, token, "job acked");
        }
        Ok(())
    }

    /// Evicts every expired lease, nack-requeueing its delivery.
    ///
    /// Returns the number of leases evicted.
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(String, Lease)> = {
            let mut leases = self.leases.lock();
            let tokens: Vec<String> = leases
                .iter()
                .filter(|(_, lease)| lease.expires_at <= now)
                .map(|(token, _)| token.clone())
                .collect();
            tokens
                .into_iter()
                .filter_map(|token| leases.remove(&token).map(|lease| (token, lease)))
                .collect()
        };

        let count = expired.len();
        for (token, lease) in expired {
            if let Err(e) = self.source.nack_requeue(lease.delivery_tag).await {
                warn!(queue = %lease.queue, token = %token, error = %e, "failed to requeue expired lease");
            }
            self.metrics.record_job_nacked();
            debug!(queue = %lease.queue, token = %token, "lease expired, job requeued");
        }
        count
    }

    /// Runs the sweeper until cancellation.
    pub async fn run_sweeper(&self, token: CancellationToken) -> Result<(), PipelineError> {
        info!(interval = ?self.config.sweep_interval(), "gateway sweeper started");
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("gateway sweeper stopping");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.config.sweep_interval()) => {
                    let evicted = self.sweep_expired().await;
                    if evicted > 0 {
                        info!(evicted, "expired gateway leases returned to queue");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PMutex;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct FakeSource {
        queue: PMutex<VecDeque<FetchedMessage>>,
        acked: PMutex<Vec<u64>>,
        requeued: PMutex<Vec<u64>>,
    }

    impl FakeSource {
        fn push(&self, delivery_tag: u64, payload: &str) {
            self.queue.lock().push_back(FetchedMessage {
                delivery_tag,
                message_id: Some(format!("m{}", delivery_tag)),
                payload: payload.as_bytes().to_vec(),
                headers: BTreeMap::new(),
            });
        }
    }

    #[async_trait]
    impl JobSource for FakeSource {
        async fn fetch(&self, _queue: &str) -> Result<Option<FetchedMessage>, PipelineError> {
            Ok(self.queue.lock().pop_front())
        }

        async fn ack(&self, delivery_tag: u64) -> Result<(), PipelineError> {
            self.acked.lock().push(delivery_tag);
            Ok(())
        }

        async fn nack_requeue(&self, delivery_tag: u64) -> Result<(), PipelineError> {
            self.requeued.lock().push(delivery_tag);
            Ok(())
        }
    }

    fn gateway(source: Arc<FakeSource>, visibility_ttl_secs: u64, max_in_flight: usize) -> JobGateway {
        JobGateway::new(
            source,
            GatewayConfig {
                visibility_ttl_secs,
                max_in_flight,
                sweep_interval_secs: 1,
            },
            MetricsService::new().unwrap(),
        )
    }

    #[tokio::test]
    async fn test_pull_then_ack_removes_lease() {
        let source = Arc::new(FakeSource::default());
        source.push(1, r#"{"stageId": 1}"#);
        let gateway = gateway(source.clone(), 30, 8);

        let job = gateway.pull("acme_resize_StageNext").await.unwrap().unwrap();
        assert_eq!(gateway.in_flight(), 1);
        assert_eq!(job.payload["stageId"], 1);

        gateway.ack(&job.token, false).await.unwrap();
        assert_eq!(gateway.in_flight(), 0);
        assert_eq!(source.acked.lock().as_slice(), &[1]);
    }

    #[tokio::test]
    async fn test_ack_with_requeue_nacks() {
        let source = Arc::new(FakeSource::default());
        source.push(7, "{}");
        let gateway = gateway(source.clone(), 30, 8);

        let job = gateway.pull("q").await.unwrap().unwrap();
        gateway.ack(&job.token, true).await.unwrap();
        assert_eq!(source.requeued.lock().as_slice(), &[7]);
        assert!(source.acked.lock().is_empty());
    }

    #[tokio::test]
    async fn test_empty_queue_returns_none() {
        let source = Arc::new(FakeSource::default());
        let gateway = gateway(source, 30, 8);
        assert!(gateway.pull("q").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_token_is_not_found() {
        let source = Arc::new(FakeSource::default());
        let gateway = gateway(source, 30, 8);
        let err = gateway.ack("t1", false).await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_capacity_rejects_with_backpressure() {
        let source = Arc::new(FakeSource::default());
        source.push(1, "{}");
        source.push(2, "{}");
        let gateway = gateway(source.clone(), 30, 1);

        let _held = gateway.pull("q").await.unwrap().unwrap();
        let err = gateway.pull("q").await.unwrap_err();
        assert!(matches!(err, PipelineError::Backpressure(_)));
        // The second message was never fetched, so nothing to requeue.
        assert!(source.requeued.lock().is_empty());
    }

    #[tokio::test]
    async fn test_expired_lease_is_swept_and_token_dies() {
        let source = Arc::new(FakeSource::default());
        source.push(3, "{}");
        // Zero TTL: the lease expires the moment it is minted.
        let gateway = gateway(source.clone(), 0, 8);

        let job = gateway.pull("q").await.unwrap().unwrap();
        let evicted = gateway.sweep_expired().await;
        assert_eq!(evicted, 1);
        assert_eq!(source.requeued.lock().as_slice(), &[3]);
        assert_eq!(gateway.in_flight(), 0);

        // Scenario: a worker acking after expiry sees NotFound.
        let err = gateway.ack(&job.token, false).await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_redelivery_after_expiry_gets_fresh_token() {
        let source = Arc::new(FakeSource::default());
        source.push(4, r#"{"stageId": 9}"#);
        let gateway = gateway(source.clone(), 0, 8);

        let first = gateway.pull("q").await.unwrap().unwrap();
        gateway.sweep_expired().await;

        // The broker would redeliver; the fake simulates it by re-pushing.
        source.push(5, r#"{"stageId": 9}"#);
        let second = gateway.pull("q").await.unwrap().unwrap();

        assert_ne!(first.token, second.token);
        assert_eq!(second.payload["stageId"], 9);
    }
}
