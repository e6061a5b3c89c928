//! Event consumer
//!
//! Subscribes to topics, decodes envelopes and dispatches them to the handlers
//! registered for the envelope's type. Messages are handled one at a time, in
//! arrival order, so per-key state downstream needs no locking beyond the
//! consumer itself. Scale out with more consumers in the same group rather
//! than parallel dispatch inside one consumer.

use chrono::{DateTime, Utc};
use event_bus::{validate_envelope_fields, BusMessage, EventBus, EventEnvelope, EventType};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::StreamingResult;
use crate::metrics::StreamingMetrics;

pub type HandlerFuture = BoxFuture<'static, anyhow::Result<()>>;

/// Callback invoked for every consumed envelope of a registered type
pub type EventHandler = Arc<dyn Fn(EventEnvelope) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure as an [`EventHandler`]
pub fn handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(EventEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |event| f(event).boxed())
}

/// Point-in-time view of consumer counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConsumerMetrics {
    pub events_consumed: u64,
    pub bytes_consumed: u64,
    pub processing_errors: u64,
    pub deserialization_errors: u64,
    pub dead_lettered: u64,
    pub last_consume_time: Option<DateTime<Utc>>,
}

struct ConsumerShared {
    group_id: String,
    bus: Arc<dyn EventBus>,
    handlers: RwLock<HashMap<EventType, Vec<EventHandler>>>,
    metrics: Mutex<ConsumerMetrics>,
    running: AtomicBool,
    dead_letter_topic: Option<String>,
    instruments: Option<StreamingMetrics>,
}

pub struct EventConsumer {
    shared: Arc<ConsumerShared>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    topics: Mutex<Vec<String>>,
}

impl EventConsumer {
    pub fn new(group_id: impl Into<String>, bus: Arc<dyn EventBus>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(ConsumerShared {
                group_id: group_id.into(),
                bus,
                handlers: RwLock::new(HashMap::new()),
                metrics: Mutex::new(ConsumerMetrics::default()),
                running: AtomicBool::new(false),
                dead_letter_topic: None,
                instruments: None,
            }),
            shutdown,
            task: Mutex::new(None),
            topics: Mutex::new(Vec::new()),
        }
    }

    /// Forward undecodable messages to this topic
    ///
    /// Must be called before the consumer is shared.
    pub fn with_dead_letter_topic(mut self, topic: impl Into<String>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.dead_letter_topic = Some(topic.into());
        }
        self
    }

    pub fn with_metrics(mut self, instruments: StreamingMetrics) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.instruments = Some(instruments);
        }
        self
    }

    pub fn group_id(&self) -> &str {
        &self.shared.group_id
    }

    pub fn topics(&self) -> Vec<String> {
        lock(&self.topics).clone()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Register a handler for one event type
    ///
    /// Handlers run in registration order.
    pub fn add_event_handler(&self, event_type: EventType, handler: EventHandler) {
        self.shared
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event_type)
            .or_default()
            .push(handler);
    }

    /// Number of handlers registered for a type
    pub fn handler_count(&self, event_type: EventType) -> usize {
        self.shared
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event_type)
            .map_or(0, Vec::len)
    }

    /// Subscribe to `topics` and spawn the consumption loop
    pub async fn start(&self, topics: &[String]) -> StreamingResult<()> {
        if self.is_running() {
            warn!(group = %self.shared.group_id, "Consumer already running");
            return Ok(());
        }

        let mut streams = Vec::with_capacity(topics.len());
        for topic in topics {
            let stream = self
                .shared
                .bus
                .queue_subscribe(topic, &self.shared.group_id)
                .await?;
            info!(group = %self.shared.group_id, topic = %topic, "Subscribed");
            streams.push(stream);
        }

        *lock(&self.topics) = topics.to_vec();
        self.shared.running.store(true, Ordering::SeqCst);

        let shared = self.shared.clone();
        let mut shutdown = self.shutdown.subscribe();
        let mut messages = futures::stream::select_all(streams);

        let handle = tokio::spawn(async move {
            info!(group = %shared.group_id, "Consumption loop started");

            while shared.running.load(Ordering::SeqCst) {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    next = messages.next() => match next {
                        Some(msg) => shared.dispatch(&msg).await,
                        None => {
                            warn!(group = %shared.group_id, "Subscription streams ended");
                            break;
                        }
                    },
                }
            }

            shared.running.store(false, Ordering::SeqCst);
            info!(group = %shared.group_id, "Consumption loop stopped");
        });

        *lock(&self.task) = Some(handle);
        Ok(())
    }

    /// Stop the loop at its next iteration boundary and wait for it to exit
    ///
    /// A handler that is already running completes first.
    pub async fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown.send(true);

        let handle = lock(&self.task).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(group = %self.shared.group_id, error = %e, "Consumer task failed");
            }
        }
    }

    /// Decode one message and run its handlers
    pub async fn dispatch(&self, msg: &BusMessage) {
        self.shared.dispatch(msg).await
    }

    pub fn metrics(&self) -> ConsumerMetrics {
        lock(&self.shared.metrics).clone()
    }
}

impl ConsumerShared {
    async fn dispatch(&self, msg: &BusMessage) {
        let event = match decode(&msg.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    group = %self.group_id,
                    subject = %msg.subject,
                    error = %e,
                    "Failed to decode event envelope"
                );
                lock(&self.metrics).deserialization_errors += 1;
                if let Some(instruments) = &self.instruments {
                    instruments
                        .deserialization_errors_total
                        .with_label_values(&[&self.group_id])
                        .inc();
                }
                self.dead_letter(msg).await;
                return;
            }
        };

        {
            let mut metrics = lock(&self.metrics);
            metrics.events_consumed += 1;
            metrics.bytes_consumed += msg.payload.len() as u64;
            metrics.last_consume_time = Some(Utc::now());
        }
        if let Some(instruments) = &self.instruments {
            instruments
                .events_consumed_total
                .with_label_values(&[&self.group_id, event.event_type.as_str()])
                .inc();
        }

        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event.event_type)
            .cloned()
            .unwrap_or_default();

        if handlers.is_empty() {
            debug!(
                group = %self.group_id,
                event_type = %event.event_type,
                "No handlers registered for event type"
            );
            return;
        }

        for (index, handler) in handlers.iter().enumerate() {
            let outcome = AssertUnwindSafe(async { handler(event.clone()).await })
                .catch_unwind()
                .await;

            let failure = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{:#}", e),
                Err(panic) => format!("handler panicked: {}", panic_message(panic.as_ref())),
            };

            lock(&self.metrics).processing_errors += 1;
            if let Some(instruments) = &self.instruments {
                instruments
                    .processing_errors_total
                    .with_label_values(&[&self.group_id])
                    .inc();
            }
            error!(
                group = %self.group_id,
                subject = %msg.subject,
                event_id = %event.id,
                event_type = %event.event_type,
                handler = index,
                error = %failure,
                "Event handler failed"
            );
        }
    }

    async fn dead_letter(&self, msg: &BusMessage) {
        let Some(topic) = &self.dead_letter_topic else {
            return;
        };

        let mut headers = msg.headers.clone().unwrap_or_default();
        headers.insert("original-subject".to_string(), msg.subject.clone());

        match self
            .bus
            .publish_with_headers(topic, headers, msg.payload.clone())
            .await
        {
            Ok(()) => lock(&self.metrics).dead_lettered += 1,
            Err(e) => error!(
                group = %self.group_id,
                subject = %msg.subject,
                dead_letter_topic = %topic,
                error = %e,
                "Failed to dead-letter undecodable message"
            ),
        }
    }
}

/// Parse, check the required envelope fields, then build the envelope
fn decode(payload: &[u8]) -> Result<EventEnvelope, String> {
    let raw: Value = serde_json::from_slice(payload).map_err(|e| e.to_string())?;
    validate_envelope_fields(&raw)?;
    serde_json::from_value(raw).map_err(|e| e.to_string())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_bus::InMemoryBus;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn message(event: &EventEnvelope) -> BusMessage {
        BusMessage::new("streaming.business_events".to_string(), event.to_bytes().unwrap())
    }

    fn business_event() -> EventEnvelope {
        EventEnvelope::new(EventType::BusinessEvent, "orders", json!({"order_id": "o-1"}))
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_block_the_next() {
        let consumer = EventConsumer::new("analytics", Arc::new(InMemoryBus::new()));
        let second_calls = Arc::new(AtomicUsize::new(0));

        consumer.add_event_handler(
            EventType::BusinessEvent,
            handler(|_event| async { Err(anyhow::anyhow!("downstream unavailable")) }),
        );
        let calls = second_calls.clone();
        consumer.add_event_handler(
            EventType::BusinessEvent,
            handler(move |_event| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        consumer.dispatch(&message(&business_event())).await;

        assert_eq!(second_calls.load(Ordering::SeqCst), 1);
        let metrics = consumer.metrics();
        assert_eq!(metrics.processing_errors, 1);
        assert_eq!(metrics.events_consumed, 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_contained() {
        let consumer = EventConsumer::new("analytics", Arc::new(InMemoryBus::new()));
        let reached = Arc::new(AtomicUsize::new(0));

        consumer.add_event_handler(
            EventType::BusinessEvent,
            handler(|event| async move {
                if event.event_type == EventType::BusinessEvent {
                    panic!("handler bug");
                }
                Ok(())
            }),
        );
        let flag = reached.clone();
        consumer.add_event_handler(
            EventType::BusinessEvent,
            handler(move |_event| {
                let flag = flag.clone();
                async move {
                    flag.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        consumer.dispatch(&message(&business_event())).await;
        consumer.dispatch(&message(&business_event())).await;

        assert_eq!(reached.load(Ordering::SeqCst), 2);
        assert_eq!(consumer.metrics().processing_errors, 2);
    }

    #[tokio::test]
    async fn test_dispatch_only_reaches_matching_type() {
        let consumer = EventConsumer::new("cep", Arc::new(InMemoryBus::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        consumer.add_event_handler(
            EventType::Transaction,
            handler(move |_event| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        consumer.dispatch(&message(&business_event())).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(consumer.handler_count(EventType::Transaction), 1);
        assert_eq!(consumer.handler_count(EventType::BusinessEvent), 0);
    }

    #[tokio::test]
    async fn test_undecodable_message_is_dead_lettered() {
        let bus = Arc::new(InMemoryBus::new());
        let mut dlq = bus.subscribe("streaming.dead_letter").await.unwrap();
        let consumer =
            EventConsumer::new("cep", bus.clone()).with_dead_letter_topic("streaming.dead_letter");

        let garbage = BusMessage::new("streaming.transactions".to_string(), b"{not json".to_vec());
        consumer.dispatch(&garbage).await;

        let metrics = consumer.metrics();
        assert_eq!(metrics.deserialization_errors, 1);
        assert_eq!(metrics.events_consumed, 0);
        assert_eq!(metrics.dead_lettered, 1);

        let msg = tokio::time::timeout(Duration::from_secs(1), dlq.next())
            .await
            .expect("timeout")
            .expect("stream ended");
        assert_eq!(msg.header("original-subject"), Some("streaming.transactions"));
        assert_eq!(msg.payload, b"{not json");
    }

    #[tokio::test]
    async fn test_envelope_failing_field_checks_is_dead_lettered() {
        let bus = Arc::new(InMemoryBus::new());
        let mut dlq = bus.subscribe("streaming.dead_letter").await.unwrap();
        let consumer =
            EventConsumer::new("cep", bus.clone()).with_dead_letter_topic("streaming.dead_letter");
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        consumer.add_event_handler(
            EventType::BusinessEvent,
            handler(move |_event| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        // Well-formed JSON with an empty source
        let mut event = business_event();
        event.source = String::new();
        consumer.dispatch(&message(&event)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let metrics = consumer.metrics();
        assert_eq!(metrics.deserialization_errors, 1);
        assert_eq!(metrics.dead_lettered, 1);

        let msg = tokio::time::timeout(Duration::from_secs(1), dlq.next())
            .await
            .expect("timeout")
            .expect("stream ended");
        assert_eq!(EventEnvelope::from_bytes(&msg.payload).unwrap().id, event.id);
    }

    #[tokio::test]
    async fn test_loop_consumes_until_stopped() {
        let bus = Arc::new(InMemoryBus::new());
        let consumer = EventConsumer::new("loop-test", bus.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        consumer.add_event_handler(
            EventType::UserAction,
            handler(move |event| {
                let tx = tx.clone();
                async move {
                    tx.send(event.id)?;
                    Ok(())
                }
            }),
        );

        consumer
            .start(&["streaming.user_actions".to_string()])
            .await
            .unwrap();
        assert!(consumer.is_running());
        assert_eq!(consumer.topics(), vec!["streaming.user_actions".to_string()]);

        let event = EventEnvelope::new(EventType::UserAction, "web", json!({"action": "login"}));
        bus.publish("streaming.user_actions", event.to_bytes().unwrap())
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timeout")
            .expect("channel closed");
        assert_eq!(received, event.id);

        consumer.stop().await;
        assert!(!consumer.is_running());
        assert_eq!(consumer.metrics().events_consumed, 1);
    }
}
