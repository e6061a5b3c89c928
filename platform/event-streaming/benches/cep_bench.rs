use chrono::{Duration, Utc};
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use event_bus::{EventEnvelope, EventType};
use event_streaming::{CepConfig, ComplexEventProcessor, StreamingConfig};
use serde_json::json;

fn engine() -> ComplexEventProcessor {
    let mut cep = ComplexEventProcessor::new(CepConfig::default());
    for pattern in StreamingConfig::default().patterns {
        cep.add_pattern(pattern).unwrap();
    }
    cep
}

/// Mixed traffic across `users` partitions, one second apart
fn traffic(count: usize, users: usize) -> Vec<EventEnvelope> {
    let start = Utc::now() - Duration::seconds(count as i64);
    (0..count)
        .map(|i| {
            let user = format!("user-{}", i % users);
            let payload = match i % 4 {
                0 => json!({"user_id": user, "action": "login", "status": "failed"}),
                1 => json!({"user_id": user, "action": "login", "status": "success"}),
                2 => json!({"user_id": user, "amount": (i * 37 % 20_000) as f64}),
                _ => json!({"user_id": user, "action": "account_change"}),
            };
            let event_type = if i % 4 == 2 {
                EventType::Transaction
            } else {
                EventType::UserAction
            };
            EventEnvelope::new(event_type, "bench", payload)
                .with_timestamp(start + Duration::seconds(i as i64))
        })
        .collect()
}

fn bench_process_event(c: &mut Criterion) {
    let events = traffic(2_000, 50);
    c.bench_function("cep_process_2000_events_50_users", |b| {
        b.iter_batched(
            engine,
            |mut cep| {
                for event in &events {
                    black_box(cep.process_event(event));
                }
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_hot_partition(c: &mut Criterion) {
    let events = traffic(1_000, 1);
    c.bench_function("cep_process_1000_events_single_user", |b| {
        b.iter_batched(
            engine,
            |mut cep| {
                for event in &events {
                    black_box(cep.process_event(event));
                }
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_process_event, bench_hot_partition);
criterion_main!(benches);
