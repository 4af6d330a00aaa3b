// /////////////////////////////////////////////////////////////////////////////
// Pipelogiq
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Broker Client
//!
//! Wraps a lapin connection/channel with the operations the control plane
//! needs: durable queue declaration with optional dead-letter wiring,
//! publish with a bounded retry budget and publisher confirms, synchronous
//! single-message fetch for the pull gateway, push consumption with
//! ack/nack decisions, and fanout publication for UI subscribers.
//!
//! Every publish injects the W3C trace context into message headers; every
//! consume extracts it and runs the handler inside a span carrying the
//! trace id, so worker spans chain onto the pipeline's trace.
//!
//! A publish that exhausts its retry budget surfaces
//! `PipelineError::PublishError`. The scheduler reacts by leaving the stage
//! Pending; the pending watchdog provides eventual terminality while
//! publication stays broken.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use pipelogiq_bootstrap::CancellationToken;
use pipelogiq_domain::value_objects::trace::{extract_trace_context, inject_trace_context};
use pipelogiq_domain::value_objects::{QueueTopology, SpanId, TraceId};
use pipelogiq_domain::PipelineError;

use crate::infrastructure::broker::headers::{headers_to_map, AmqpHeaderCarrier};
use crate::infrastructure::config::BrokerConfig;

/// What a consumer handler decided about one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeDecision {
    /// Processing succeeded; remove the message.
    Ack,
    /// Transient failure; return the message to the queue.
    Requeue,
    /// Permanent failure; reject without requeue (dead-letters when wired).
    DeadLetter,
}

/// One message taken off a queue with `basic_get`, identified by its
/// delivery tag for later ack/nack.
#[derive(Debug, Clone)]
pub struct FetchedMessage {
    pub delivery_tag: u64,
    pub message_id: Option<String>,
    pub payload: Vec<u8>,
    pub headers: BTreeMap<String, String>,
}

/// Handles one push-delivered message body.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, payload: &[u8]) -> ConsumeDecision;
}

fn broker_err(context: &str, e: lapin::Error) -> PipelineError {
    PipelineError::broker(format!("{}: {}", context, e))
}

/// The control plane's AMQP client.
///
/// Publishes and subscriptions share one channel; lapin handles its own
/// thread-safety discipline, so the client is freely cloneable behind an
/// `Arc`.
pub struct BrokerClient {
    /// Keeps the AMQP connection alive for the channel's lifetime.
    _connection: Connection,
    channel: Channel,
    config: BrokerConfig,
    topology: QueueTopology,
}

impl BrokerClient {
    /// Connects, opens a confirming channel, and declares the fixed
    /// topology (result/status queues and the fanout exchange).
    pub async fn connect(config: BrokerConfig, topology: QueueTopology) -> Result<Self, PipelineError> {
        let connection = Connection::connect(&config.url, ConnectionProperties::default())
            .await
            .map_err(|e| broker_err("failed to connect to broker", e))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| broker_err("failed to open channel", e))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| broker_err("failed to enable publisher confirms", e))?;

        channel
            .basic_qos(config.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| broker_err("failed to set prefetch", e))?;

        let client = Self {
            _connection: connection,
            channel,
            config,
            topology,
        };

        client.declare_queue(client.topology.stage_result_queue()).await?;
        client.declare_queue(client.topology.stage_set_status_queue()).await?;

        client
            .channel
            .exchange_declare(
                client.topology.stage_updated_exchange(),
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| broker_err("failed to declare fanout exchange", e))?;

        info!(url = %client.config.url, "broker client connected");
        Ok(client)
    }

    /// The broker connection string, served to workers that consume
    /// directly.
    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// The queue topology this client declares and publishes into.
    pub fn topology(&self) -> &QueueTopology {
        &self.topology
    }

    /// Declares a durable queue, wiring its dead-letter queue when enabled.
    ///
    /// Idempotent; per-handler work queues are declared on first publish.
    pub async fn declare_queue(&self, queue: &str) -> Result<(), PipelineError> {
        let mut args = FieldTable::default();

        if self.config.dlq.enabled {
            let dlq = format!("{}.dlq", queue);
            let mut dlq_args = FieldTable::default();
            dlq_args.insert(
                ShortString::from("x-message-ttl"),
                AMQPValue::LongLongInt(self.config.dlq.message_ttl_ms as i64),
            );
            self.channel
                .queue_declare(
                    &dlq,
                    QueueDeclareOptions {
                        durable: true,
                        ..QueueDeclareOptions::default()
                    },
                    dlq_args,
                )
                .await
                .map_err(|e| broker_err("failed to declare dead-letter queue", e))?;

            args.insert(
                ShortString::from("x-dead-letter-exchange"),
                AMQPValue::LongString(LongString::from("")),
            );
            args.insert(
                ShortString::from("x-dead-letter-routing-key"),
                AMQPValue::LongString(LongString::from(dlq)),
            );
        }

        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                args,
            )
            .await
            .map_err(|e| broker_err("failed to declare queue", e))?;

        Ok(())
    }

    fn build_properties(&self, headers: FieldTable) -> BasicProperties {
        BasicProperties::default()
            .with_content_type(ShortString::from("application/json"))
            .with_delivery_mode(2) // persistent
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(headers)
    }

    async fn publish_with_retry(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        headers: FieldTable,
    ) -> Result<(), PipelineError> {
        let attempts = self.config.publish_retries.max(1);
        let mut last_err = None;

        for attempt in 1..=attempts {
            let publish = self
                .channel
                .basic_publish(
                    exchange,
                    routing_key,
                    BasicPublishOptions::default(),
                    payload,
                    self.build_properties(headers.clone()),
                )
                .await;

            match publish {
                Ok(confirm) => match confirm.await {
                    Ok(_) => return Ok(()),
                    Err(e) => {
                        warn!(exchange, routing_key, attempt, error = %e, "publish not confirmed");
                        last_err = Some(e);
                    }
                },
                Err(e) => {
                    warn!(exchange, routing_key, attempt, error = %e, "publish failed");
                    last_err = Some(e);
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.config.publish_retry_delay()).await;
            }
        }

        Err(PipelineError::publish(format!(
            "exhausted {} publish attempts to {}/{}: {}",
            attempts,
            exchange,
            routing_key,
            last_err.map(|e| e.to_string()).unwrap_or_else(|| "unknown".to_string())
        )))
    }

    /// Publishes a stage job to a per-handler work queue with the
    /// pipeline's trace context in the headers.
    pub async fn publish_job(
        &self,
        queue: &str,
        payload: &[u8],
        trace_id: &TraceId,
        span_id: &SpanId,
    ) -> Result<(), PipelineError> {
        self.declare_queue(queue).await?;

        let mut headers = FieldTable::default();
        let mut carrier = AmqpHeaderCarrier::new(&mut headers);
        inject_trace_context(&mut carrier, trace_id, span_id);

        self.publish_with_retry("", queue, payload, headers).await
    }

    /// Broadcasts an event on the `StageUpdated.fanout` exchange. The
    /// `kind` header distinguishes stage updates from worker events for
    /// subscribers sharing the exchange.
    pub async fn publish_fanout(&self, kind: &str, payload: &[u8]) -> Result<(), PipelineError> {
        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from("event-kind"),
            AMQPValue::LongString(LongString::from(kind.to_string())),
        );

        self.publish_with_retry(self.topology.stage_updated_exchange(), "", payload, headers)
            .await
    }

    /// Synchronous single-message get for the pull gateway.
    ///
    /// Returns `None` when the queue is empty. The message stays unacked
    /// until [`Self::ack`] / [`Self::nack_requeue`] resolves its delivery
    /// tag.
    pub async fn fetch(&self, queue: &str) -> Result<Option<FetchedMessage>, PipelineError> {
        self.declare_queue(queue).await?;

        let message = self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
            .map_err(|e| broker_err("basic_get failed", e))?;

        Ok(message.map(|m| {
            let delivery = m.delivery;
            let headers = delivery
                .properties
                .headers()
                .as_ref()
                .map(headers_to_map)
                .unwrap_or_default();
            let message_id = delivery.properties.message_id().as_ref().map(|id| id.as_str().to_string());
            FetchedMessage {
                delivery_tag: delivery.delivery_tag,
                message_id,
                payload: delivery.data,
                headers,
            }
        }))
    }

    /// Acknowledges a fetched delivery.
    pub async fn ack(&self, delivery_tag: u64) -> Result<(), PipelineError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| broker_err("basic_ack failed", e))
    }

    /// Returns a fetched delivery to its queue.
    pub async fn nack_requeue(&self, delivery_tag: u64) -> Result<(), PipelineError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue: true,
                    ..BasicNackOptions::default()
                },
            )
            .await
            .map_err(|e| broker_err("basic_nack failed", e))
    }

    /// Push-consumes a queue until cancellation, delegating each delivery
    /// to the handler and translating its decision into ack/nack.
    ///
    /// The trace context is extracted from message headers before the
    /// handler runs so its spans attach to the originating trace.
    pub async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        handler: Arc<dyn MessageHandler>,
        token: CancellationToken,
    ) -> Result<(), PipelineError> {
        let mut consumer = self
            .channel
            .basic_consume(queue, consumer_tag, BasicConsumeOptions::default(), FieldTable::default())
            .await
            .map_err(|e| broker_err("basic_consume failed", e))?;

        info!(queue, consumer_tag, "consumer started");

        loop {
            let delivery = tokio::select! {
                _ = token.cancelled() => {
                    info!(queue, consumer_tag, "consumer stopping");
                    return Ok(());
                }
                next = consumer.next() => next,
            };

            let delivery = match delivery {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    error!(queue, error = %e, "consumer stream error");
                    return Err(broker_err("consumer stream failed", e));
                }
                None => {
                    warn!(queue, "consumer stream closed by broker");
                    return Err(PipelineError::broker(format!("consumer stream for {} closed", queue)));
                }
            };

            let trace = delivery.properties.headers().as_ref().and_then(|table| {
                let mut table = table.clone();
                let carrier = AmqpHeaderCarrier::new(&mut table);
                extract_trace_context(&carrier)
            });

            let span = match &trace {
                Some((trace_id, span_id)) => tracing::info_span!(
                    "broker_consume",
                    queue,
                    trace_id = %trace_id,
                    parent_span_id = %span_id,
                ),
                None => tracing::info_span!("broker_consume", queue),
            };

            let decision = handler.handle(&delivery.data).instrument(span).await;

            let ack_result = match decision {
                ConsumeDecision::Ack => delivery.ack(BasicAckOptions::default()).await,
                ConsumeDecision::Requeue => {
                    delivery
                        .nack(BasicNackOptions {
                            requeue: true,
                            ..BasicNackOptions::default()
                        })
                        .await
                }
                ConsumeDecision::DeadLetter => {
                    delivery
                        .nack(BasicNackOptions {
                            requeue: false,
                            ..BasicNackOptions::default()
                        })
                        .await
                }
            };

            if let Err(e) = ack_result {
                // The broker re-queues unacked deliveries when the channel
                // drops, so failing here is transient rather than fatal.
                warn!(queue, error = %e, "failed to settle delivery");
            } else {
                debug!(queue, ?decision, "delivery settled");
            }
        }
    }
}
