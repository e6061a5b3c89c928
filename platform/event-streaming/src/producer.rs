//! Event producer
//!
//! Serializes envelopes and publishes them to topics through the event bus.
//! Sends never raise: a failure is logged, counted and reported as `false`
//! so the caller decides whether to retry.

use chrono::{DateTime, Utc};
use event_bus::retry::{retry_with_backoff, RetryConfig};
use event_bus::{EventBus, EventEnvelope, EVENT_TYPE_HEADER, PARTITION_KEY_HEADER};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

use crate::error::{StreamingError, StreamingResult};
use crate::metrics::StreamingMetrics;

/// Derives a partition key from an envelope
pub type PartitionKeyFn = dyn Fn(&EventEnvelope) -> Option<String> + Send + Sync;

/// Partition by the plain-string value of a payload field
pub fn key_by_field(
    field: impl Into<String>,
) -> impl Fn(&EventEnvelope) -> Option<String> + Send + Sync {
    let field = field.into();
    move |event| event.payload_field_string(&field)
}

/// Point-in-time view of producer counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProducerMetrics {
    pub events_sent: u64,
    pub bytes_sent: u64,
    pub errors: u64,
    pub last_send_time: Option<DateTime<Utc>>,
}

pub struct EventProducer {
    bus: Arc<dyn EventBus>,
    retry: RetryConfig,
    running: AtomicBool,
    metrics: Mutex<ProducerMetrics>,
    instruments: Option<StreamingMetrics>,
}

impl EventProducer {
    pub fn new(bus: Arc<dyn EventBus>, retry: RetryConfig) -> Self {
        Self {
            bus,
            retry,
            running: AtomicBool::new(false),
            metrics: Mutex::new(ProducerMetrics::default()),
            instruments: None,
        }
    }

    pub fn with_metrics(mut self, instruments: StreamingMetrics) -> Self {
        self.instruments = Some(instruments);
        self
    }

    /// Verify the broker is reachable and accept sends
    ///
    /// Calling `start` on a running producer is a no-op.
    pub async fn start(&self) -> StreamingResult<()> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.bus
            .health_check()
            .await
            .map_err(|e| StreamingError::Connection(e.to_string()))?;

        self.running.store(true, Ordering::SeqCst);
        info!("Event producer started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Publish one envelope
    ///
    /// Returns `true` once the broker accepted the message.
    pub async fn send(
        &self,
        topic: &str,
        event: &EventEnvelope,
        partition_key: Option<&str>,
    ) -> bool {
        if !self.is_running() {
            warn!(topic = %topic, event_id = %event.id, "Send attempted on stopped producer");
            self.record_failure(topic);
            return false;
        }

        let bytes = match event.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(
                    topic = %topic,
                    event_id = %event.id,
                    error = %e,
                    "Failed to serialize event"
                );
                self.record_failure(topic);
                return false;
            }
        };

        let mut headers = HashMap::new();
        headers.insert(EVENT_TYPE_HEADER.to_string(), event.event_type.to_string());
        if let Some(key) = partition_key {
            headers.insert(PARTITION_KEY_HEADER.to_string(), key.to_string());
        }

        let size = bytes.len() as u64;
        let bus = self.bus.as_ref();
        let result = retry_with_backoff(
            || {
                let headers = headers.clone();
                let bytes = bytes.clone();
                async move { bus.publish_with_headers(topic, headers, bytes).await }
            },
            &self.retry,
            topic,
        )
        .await;

        match result {
            Ok(()) => {
                {
                    let mut metrics = self.lock_metrics();
                    metrics.events_sent += 1;
                    metrics.bytes_sent += size;
                    metrics.last_send_time = Some(Utc::now());
                }
                if let Some(instruments) = &self.instruments {
                    instruments.events_sent_total.with_label_values(&[topic]).inc();
                }
                debug!(
                    topic = %topic,
                    event_id = %event.id,
                    event_type = %event.event_type,
                    bytes = size,
                    "Event sent"
                );
                true
            }
            Err(e) => {
                error!(
                    topic = %topic,
                    event_id = %event.id,
                    error = %e,
                    "Failed to send event"
                );
                self.record_failure(topic);
                false
            }
        }
    }

    /// Publish many envelopes, continuing past individual failures
    ///
    /// Returns the number of envelopes the broker accepted.
    pub async fn send_batch(
        &self,
        topic: &str,
        events: &[EventEnvelope],
        partition_key_fn: Option<&PartitionKeyFn>,
    ) -> usize {
        let mut sent = 0;

        for event in events {
            let key = partition_key_fn.and_then(|key_fn| key_fn(event));
            if self.send(topic, event, key.as_deref()).await {
                sent += 1;
            }
        }

        if sent < events.len() {
            warn!(
                topic = %topic,
                sent = sent,
                failed = events.len() - sent,
                "Batch send completed with failures"
            );
        }

        sent
    }

    /// Flush outstanding messages and stop accepting sends
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Err(e) = self.bus.flush().await {
            warn!(error = %e, "Failed to flush producer on stop");
        }

        let metrics = self.metrics();
        info!(
            events_sent = metrics.events_sent,
            errors = metrics.errors,
            "Event producer stopped"
        );
    }

    pub fn metrics(&self) -> ProducerMetrics {
        self.lock_metrics().clone()
    }

    fn record_failure(&self, topic: &str) {
        self.lock_metrics().errors += 1;
        if let Some(instruments) = &self.instruments {
            instruments.send_errors_total.with_label_values(&[topic]).inc();
        }
    }

    fn lock_metrics(&self) -> MutexGuard<'_, ProducerMetrics> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
