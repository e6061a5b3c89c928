//! Streaming analytics and anomaly detection
//!
//! Keeps rolling counters, per-minute throughput and multi-window aggregates
//! over the live stream. Two detectors run synchronously on every event:
//!
//! - `high_throughput`: the event's minute holds more than
//!   `throughput_multiplier` times the average of the other recorded
//!   minutes. Until `min_history_minutes` of history exist the fixed
//!   `throughput_floor` applies instead. One alert per minute.
//! - `large_payload`: the event's serialized payload exceeds
//!   `payload_multiplier` times the running average of earlier events, once
//!   `min_payload_samples` sizes have been seen.
//!
//! Minutes and window buckets are keyed by event time. Alerts come back as
//! `alert` envelopes; delivering them is the caller's job. Envelope ids of
//! recent events are remembered so redelivered events are counted once.

use chrono::{DateTime, Utc};
use event_bus::{EventEnvelope, EventType};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;
use tracing::{debug, warn};

use crate::metrics::StreamingMetrics;

#[derive(Debug, Clone, PartialEq)]
pub struct AnalyticsConfig {
    pub window_sizes: Vec<Duration>,
    pub throughput_multiplier: f64,
    /// Per-minute threshold used before enough history exists
    pub throughput_floor: u64,
    pub min_history_minutes: usize,
    pub payload_multiplier: f64,
    pub min_payload_samples: u64,
    /// Per-minute counts kept
    pub minute_retention: usize,
    /// Buckets kept per window size
    pub window_retention: usize,
    /// Recent envelope ids remembered for duplicate detection
    pub dedup_capacity: usize,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            window_sizes: [60, 300, 900, 3600].map(Duration::from_secs).to_vec(),
            throughput_multiplier: 3.0,
            throughput_floor: 1000,
            min_history_minutes: 3,
            payload_multiplier: 10.0,
            min_payload_samples: 10,
            minute_retention: 1440,
            window_retention: 100,
            dedup_capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    HighThroughput,
    LargePayload,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::HighThroughput => "high_throughput",
            AnomalyKind::LargePayload => "large_payload",
        }
    }
}

/// Running statistics of one numeric payload field
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldStats {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

impl FieldStats {
    fn new(value: f64) -> Self {
        Self {
            count: 1,
            sum: value,
            min: value,
            max: value,
            avg: value,
        }
    }

    fn record(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.avg = self.sum / self.count as f64;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowAggregate {
    pub window_size_secs: u64,
    pub window_start: DateTime<Utc>,
    pub event_count: u64,
    pub by_type: BTreeMap<String, u64>,
    pub by_source: BTreeMap<String, u64>,
    pub fields: BTreeMap<String, FieldStats>,
}

impl WindowAggregate {
    fn new(window_size_secs: u64, window_start: DateTime<Utc>) -> Self {
        Self {
            window_size_secs,
            window_start,
            event_count: 0,
            by_type: BTreeMap::new(),
            by_source: BTreeMap::new(),
            fields: BTreeMap::new(),
        }
    }

    fn record(&mut self, event: &EventEnvelope) {
        self.event_count += 1;
        *self.by_type.entry(event.event_type.to_string()).or_default() += 1;
        *self.by_source.entry(event.source.clone()).or_default() += 1;

        for (field, value) in &event.payload {
            let Some(number) = value.as_f64() else {
                continue;
            };
            match self.fields.get_mut(field) {
                Some(stats) => stats.record(number),
                None => {
                    self.fields.insert(field.clone(), FieldStats::new(number));
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyticsSummary {
    pub total_events: u64,
    pub events_by_type: BTreeMap<String, u64>,
    pub events_by_source: BTreeMap<String, u64>,
    pub average_payload_size: f64,
    pub minutes_tracked: usize,
    pub peak_minute_events: u64,
    pub anomalies_detected: u64,
    pub duplicates_ignored: u64,
}

pub struct StreamAnalyticsEngine {
    config: AnalyticsConfig,
    total_events: u64,
    by_type: HashMap<EventType, u64>,
    by_source: HashMap<String, u64>,
    per_minute: BTreeMap<i64, u64>,
    payload_bytes: u64,
    payload_samples: u64,
    windows: BTreeMap<u64, BTreeMap<DateTime<Utc>, WindowAggregate>>,
    last_throughput_alert: Option<i64>,
    anomalies_detected: u64,
    seen_ids: HashSet<String>,
    seen_order: VecDeque<String>,
    duplicates_ignored: u64,
    instruments: Option<StreamingMetrics>,
}

impl StreamAnalyticsEngine {
    pub fn new(config: AnalyticsConfig) -> Self {
        Self {
            config,
            total_events: 0,
            by_type: HashMap::new(),
            by_source: HashMap::new(),
            per_minute: BTreeMap::new(),
            payload_bytes: 0,
            payload_samples: 0,
            windows: BTreeMap::new(),
            last_throughput_alert: None,
            anomalies_detected: 0,
            seen_ids: HashSet::new(),
            seen_order: VecDeque::new(),
            duplicates_ignored: 0,
            instruments: None,
        }
    }

    pub fn with_metrics(mut self, instruments: StreamingMetrics) -> Self {
        self.instruments = Some(instruments);
        self
    }

    /// Record an event and return any anomaly alerts it raised
    pub fn process_event(&mut self, event: &EventEnvelope) -> Vec<EventEnvelope> {
        if !self.first_sighting(&event.id) {
            self.duplicates_ignored += 1;
            debug!(event_id = %event.id, "Duplicate event ignored");
            return Vec::new();
        }

        let mut alerts = Vec::new();

        let payload_size = event.payload_size();
        if let Some(alert) = self.check_payload(event, payload_size) {
            alerts.push(alert);
        }

        self.total_events += 1;
        *self.by_type.entry(event.event_type).or_default() += 1;
        *self.by_source.entry(event.source.clone()).or_default() += 1;
        self.payload_bytes += payload_size as u64;
        self.payload_samples += 1;

        let minute = event.timestamp.timestamp().div_euclid(60);
        *self.per_minute.entry(minute).or_default() += 1;
        while self.per_minute.len() > self.config.minute_retention {
            self.per_minute.pop_first();
        }

        self.record_windows(event);

        if let Some(alert) = self.check_throughput(event, minute) {
            alerts.push(alert);
        }
        alerts
    }

    fn first_sighting(&mut self, id: &str) -> bool {
        if !self.seen_ids.insert(id.to_string()) {
            return false;
        }
        self.seen_order.push_back(id.to_string());
        while self.seen_order.len() > self.config.dedup_capacity {
            if let Some(oldest) = self.seen_order.pop_front() {
                self.seen_ids.remove(&oldest);
            }
        }
        true
    }

    fn record_windows(&mut self, event: &EventEnvelope) {
        let retention = self.config.window_retention;
        for size in &self.config.window_sizes {
            let size_secs = size.as_secs().max(1);
            let step = i64::try_from(size_secs).unwrap_or(i64::MAX);
            let start_secs = event.timestamp.timestamp().div_euclid(step) * step;
            let Some(start) = DateTime::from_timestamp(start_secs, 0) else {
                continue;
            };

            let buckets = self.windows.entry(size_secs).or_default();
            buckets
                .entry(start)
                .or_insert_with(|| WindowAggregate::new(size_secs, start))
                .record(event);
            while buckets.len() > retention {
                buckets.pop_first();
            }
        }
    }

    fn check_payload(
        &mut self,
        event: &EventEnvelope,
        payload_size: usize,
    ) -> Option<EventEnvelope> {
        if self.payload_samples < self.config.min_payload_samples {
            return None;
        }
        let average = self.average_payload_size();
        let threshold = average * self.config.payload_multiplier;
        if (payload_size as f64) <= threshold {
            return None;
        }

        warn!(
            event_id = %event.id,
            payload_size,
            average_payload_size = average,
            "Large payload detected"
        );
        Some(self.raise(
            AnomalyKind::LargePayload,
            event,
            json!({
                "event_id": event.id,
                "payload_size": payload_size,
                "average_payload_size": average,
                "threshold": threshold,
            }),
        ))
    }

    fn check_throughput(&mut self, event: &EventEnvelope, minute: i64) -> Option<EventEnvelope> {
        if self.last_throughput_alert == Some(minute) {
            return None;
        }

        let current = self.per_minute.get(&minute).copied().unwrap_or(0);
        let (history_total, history_minutes) = self
            .per_minute
            .iter()
            .filter(|(m, _)| **m != minute)
            .fold((0u64, 0usize), |(total, n), (_, count)| (total + count, n + 1));

        let historical_average = if history_minutes > 0 {
            history_total as f64 / history_minutes as f64
        } else {
            0.0
        };
        let threshold = if history_minutes >= self.config.min_history_minutes {
            historical_average * self.config.throughput_multiplier
        } else {
            self.config.throughput_floor as f64
        };
        if (current as f64) <= threshold {
            return None;
        }

        self.last_throughput_alert = Some(minute);
        let minute_start = DateTime::from_timestamp(minute * 60, 0).unwrap_or(event.timestamp);
        warn!(
            minute = %minute_start,
            events = current,
            threshold,
            "High throughput detected"
        );
        Some(self.raise(
            AnomalyKind::HighThroughput,
            event,
            json!({
                "minute": minute_start,
                "event_count": current,
                "historical_average": historical_average,
                "threshold": threshold,
            }),
        ))
    }

    fn raise(&mut self, kind: AnomalyKind, event: &EventEnvelope, details: Value) -> EventEnvelope {
        self.anomalies_detected += 1;
        if let Some(instruments) = &self.instruments {
            instruments.anomalies_total.with_label_values(&[kind.as_str()]).inc();
        }

        let mut payload = json!({"alert_type": kind.as_str()});
        if let (Some(target), Value::Object(extra)) = (payload.as_object_mut(), details) {
            target.extend(extra);
        }
        event.derive(EventType::Alert, "analytics", payload)
    }

    pub fn average_payload_size(&self) -> f64 {
        if self.payload_samples == 0 {
            0.0
        } else {
            self.payload_bytes as f64 / self.payload_samples as f64
        }
    }

    pub fn events_in_minute(&self, at: DateTime<Utc>) -> u64 {
        self.per_minute
            .get(&at.timestamp().div_euclid(60))
            .copied()
            .unwrap_or(0)
    }

    /// Aggregates for one configured window size, oldest first
    pub fn window_aggregates(&self, window_size: Duration) -> Vec<WindowAggregate> {
        self.windows
            .get(&window_size.as_secs().max(1))
            .map(|buckets| buckets.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn summary(&self) -> AnalyticsSummary {
        AnalyticsSummary {
            total_events: self.total_events,
            events_by_type: self
                .by_type
                .iter()
                .map(|(t, n)| (t.to_string(), *n))
                .collect(),
            events_by_source: self
                .by_source
                .iter()
                .map(|(s, n)| (s.clone(), *n))
                .collect(),
            average_payload_size: self.average_payload_size(),
            minutes_tracked: self.per_minute.len(),
            peak_minute_events: self.per_minute.values().copied().max().unwrap_or(0),
            anomalies_detected: self.anomalies_detected,
            duplicates_ignored: self.duplicates_ignored,
        }
    }
}
