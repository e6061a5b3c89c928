mod common;

use event_bus::{EventBus, EventEnvelope, EventType, InMemoryBus};
use event_streaming::{handler, key_by_field, EventConsumer, EventProducer, PartitionKeyFn};
use event_bus::retry::RetryConfig;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// TEST 1: Three failed logins for one user produce exactly one match and one alert
#[tokio::test]
async fn test_failed_login_scenario() {
    let (bus, system) = common::start_system(common::test_config()).await;
    let mut alerts = bus.subscribe("streaming.alerts").await.unwrap();

    let user = common::unique_user();
    let logins: Vec<EventEnvelope> = (0..3).map(|_| common::failed_login(&user)).collect();
    for login in &logins {
        assert!(system.publish_event("streaming.user_actions", login, Some(&user)).await);
    }

    let alert = common::next_envelope(&mut alerts).await.expect("alert published");
    assert_eq!(alert.event_type, EventType::Alert);
    assert_eq!(alert.payload["pattern_id"], "failed_login_sequence");
    assert_eq!(alert.payload["partition"], user.as_str());
    let expected_ids: Vec<&str> = logins.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(alert.payload["matched_event_ids"], json!(expected_ids));

    assert!(common::eventually(|| system.get_system_status().analytics.total_events == 3).await);
    let matches = system.recent_matches(10);
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].pattern_name, "Multiple Failed Login Attempts");
    assert_eq!(matches[0].events.len(), 3);

    system.stop_streaming().await;
}

/// TEST 2: A large transaction followed by an account change is flagged
#[tokio::test]
async fn test_suspicious_transaction_scenario() {
    let (bus, system) = common::start_system(common::test_config()).await;
    let mut alerts = bus.subscribe("streaming.alerts").await.unwrap();

    let user = common::unique_user();
    let transaction = common::transaction(&user, 15_000.0);
    assert!(
        system
            .publish_event("streaming.transactions", &transaction, Some(&user))
            .await
    );
    // Separate topics carry no ordering guarantee between them
    assert!(common::eventually(|| system.get_system_status().analytics.total_events == 1).await);
    assert!(
        system
            .publish_event("streaming.user_actions", &common::account_change(&user), Some(&user))
            .await
    );

    let alert = common::next_envelope(&mut alerts).await.expect("alert published");
    assert_eq!(alert.payload["pattern_id"], "suspicious_transaction_pattern");
    assert_eq!(alert.payload["event_count"], 2);

    system.stop_streaming().await;
}

/// TEST 3: Small transactions and other users' account changes do not match
#[tokio::test]
async fn test_suspicious_transaction_requires_same_user_and_amount() {
    let (_bus, system) = common::start_system(common::test_config()).await;

    let user = common::unique_user();
    let other = common::unique_user();
    system.route_event(&common::transaction(&user, 500.0)).await;
    system.route_event(&common::account_change(&user)).await;
    system.route_event(&common::transaction(&user, 20_000.0)).await;
    system.route_event(&common::account_change(&other)).await;

    assert_eq!(system.get_system_status().cep_matches, 0);
    system.stop_streaming().await;
}

/// TEST 4: A failing handler does not stop the next one
#[tokio::test]
async fn test_handler_isolation() {
    let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new());
    let consumer = EventConsumer::new("isolation", bus.clone());
    let second_ran = Arc::new(AtomicUsize::new(0));

    consumer.add_event_handler(
        EventType::BusinessEvent,
        handler(|_event| async { Err(anyhow::anyhow!("first handler fails")) }),
    );
    let counter = second_ran.clone();
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
    consumer
        .start(&["streaming.business_events".to_string()])
        .await
        .unwrap();

    let producer = EventProducer::new(bus, RetryConfig::no_retry());
    producer.start().await.unwrap();
    let order = EventEnvelope::new(EventType::BusinessEvent, "orders", json!({"order_id": "o-1"}));
    assert!(producer.send("streaming.business_events", &order, None).await);

    assert!(common::eventually(|| second_ran.load(Ordering::SeqCst) == 1).await);
    let metrics = consumer.metrics();
    assert_eq!(metrics.processing_errors, 1);
    assert_eq!(metrics.events_consumed, 1);

    consumer.stop().await;
}

/// TEST 5: Batch send of five events where the third publish fails
#[tokio::test]
async fn test_batch_partial_failure() {
    let bus = Arc::new(common::FailingBus::failing_on(vec![3]));
    let producer = EventProducer::new(bus, RetryConfig::no_retry());
    producer.start().await.unwrap();

    let user = common::unique_user();
    let events: Vec<EventEnvelope> = (0..5).map(|_| common::failed_login(&user)).collect();
    let key_fn = key_by_field("user_id");
    let sent = producer
        .send_batch("streaming.user_actions", &events, Some(&key_fn as &PartitionKeyFn))
        .await;

    assert_eq!(sent, 4);
    let metrics = producer.metrics();
    assert_eq!(metrics.events_sent, 4);
    assert_eq!(metrics.errors, 1);
}

/// TEST 6: Batch publishing through the system reaches the pipeline
#[tokio::test]
async fn test_publish_events_batch_through_system() {
    let (_bus, system) = common::start_system(common::test_config()).await;

    let events: Vec<EventEnvelope> = (0..4)
        .map(|i| {
            EventEnvelope::new(
                EventType::SensorData,
                "thermostat",
                json!({"device": "t-1", "temperature": 20.0 + i as f64}),
            )
        })
        .collect();
    assert_eq!(system.publish_events_batch("streaming.sensor_data", &events, None).await, 4);

    assert!(common::eventually(|| system.get_system_status().analytics.total_events == 4).await);
    let status = system.get_system_status();
    assert_eq!(status.analytics.events_by_type.get("sensor_data"), Some(&4));
    assert_eq!(status.producer.events_sent, 4);

    system.stop_streaming().await;
}

/// TEST 7: Redelivered envelopes are neither matched nor counted twice
#[tokio::test]
async fn test_redelivered_events_are_ignored() {
    let (_bus, system) = common::start_system(common::test_config()).await;

    let user = common::unique_user();
    let first = common::failed_login(&user);
    let second = common::failed_login(&user);
    for event in [&first, &second, &second] {
        assert!(system.publish_event("streaming.user_actions", event, Some(&user)).await);
    }

    assert!(
        common::eventually(|| system.get_system_status().analytics.duplicates_ignored == 1).await
    );
    let status = system.get_system_status();
    assert_eq!(status.analytics.total_events, 2);
    assert_eq!(status.cep.duplicate_events, 1);
    assert_eq!(status.cep_matches, 0);

    system.stop_streaming().await;
}
