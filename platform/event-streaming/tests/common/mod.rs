#![allow(dead_code)]

use async_trait::async_trait;
use event_bus::{BusError, BusMessage, BusResult, EventBus, EventEnvelope, EventType, InMemoryBus};
use event_streaming::{RealtimeStreamingSystem, StreamingConfig};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Default configuration with a fast window timer
pub fn test_config() -> StreamingConfig {
    StreamingConfig {
        window_tick: Duration::from_millis(10),
        ..StreamingConfig::default()
    }
}

/// Start a system over a fresh in-memory bus.
pub async fn start_system(config: StreamingConfig) -> (Arc<InMemoryBus>, RealtimeStreamingSystem) {
    let bus = Arc::new(InMemoryBus::new());
    let system = RealtimeStreamingSystem::new(bus.clone(), config).expect("system should build");
    system.start_streaming().await.expect("system should start");
    (bus, system)
}

/// Generate a unique user id so scenarios never share CEP partitions.
pub fn unique_user() -> String {
    format!("user-{}", Uuid::new_v4())
}

pub fn failed_login(user_id: &str) -> EventEnvelope {
    EventEnvelope::new(
        EventType::UserAction,
        "auth-service",
        json!({"user_id": user_id, "action": "login", "status": "failed"}),
    )
}

pub fn transaction(user_id: &str, amount: f64) -> EventEnvelope {
    EventEnvelope::new(
        EventType::Transaction,
        "payments",
        json!({"user_id": user_id, "amount": amount, "currency": "USD"}),
    )
}

pub fn account_change(user_id: &str) -> EventEnvelope {
    EventEnvelope::new(
        EventType::UserAction,
        "profile-service",
        json!({"user_id": user_id, "action": "account_change", "field": "email"}),
    )
}

/// Poll `condition` every 10ms for up to two seconds.
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Next envelope from a subscription, or None after a timeout.
pub async fn next_envelope(stream: &mut BoxStream<'static, BusMessage>) -> Option<EventEnvelope> {
    let msg = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .ok()??;
    EventEnvelope::from_bytes(&msg.payload).ok()
}

/// Bus that rejects selected publish calls (1-based call numbers).
pub struct FailingBus {
    inner: InMemoryBus,
    fail_on_calls: Vec<usize>,
    calls: AtomicUsize,
}

impl FailingBus {
    pub fn failing_on(fail_on_calls: Vec<usize>) -> Self {
        Self {
            inner: InMemoryBus::new(),
            fail_on_calls,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl EventBus for FailingBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_calls.contains(&call) {
            return Err(BusError::PublishError(format!("injected failure on call {call}")));
        }
        self.inner.publish(subject, payload).await
    }

    async fn publish_with_headers(
        &self,
        subject: &str,
        _headers: HashMap<String, String>,
        payload: Vec<u8>,
    ) -> BusResult<()> {
        self.publish(subject, payload).await
    }

    async fn subscribe(&self, subject: &str) -> BusResult<BoxStream<'static, BusMessage>> {
        self.inner.subscribe(subject).await
    }
}
