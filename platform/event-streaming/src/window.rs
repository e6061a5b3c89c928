//! Windowed stream processing
//!
//! Events are buffered per window key, a pair of partition (a payload field
//! value, or the global partition) and window start. A window is finalized once
//! processing time passes the latest event time seen in that window plus the
//! grace period; the buffered batch is handed to the processing function and
//! any result goes to the output sink.
//!
//! Window start per discipline:
//!
//! | Kind     | Window start                                                   |
//! |----------|----------------------------------------------------------------|
//! | Tumbling | `floor(event_time / size) * size`                              |
//! | Hopping  | `floor(event_time / slide) * slide`                            |
//! | Sliding  | `floor(arrival_time / slide) * slide` (slide defaults to size) |
//! | Session  | start of the partition's open session, or the event time when  |
//! |          | the event arrives more than `size` after the session's latest  |
//!
//! Finalization runs on a timer task (see [`spawn_finalizer`]) rather than on
//! the ingest path.
//!
//! Because finalization follows the latest event rather than the window end,
//! a grace period shorter than the window closes a quiet window before its end;
//! with [`LateEventPolicy::Drop`] the rest of that window is then discarded.
//! The builders therefore default the grace period to the window size.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use event_bus::{EventEnvelope, EventType};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{StreamingError, StreamingResult};
use crate::metrics::StreamingMetrics;
use crate::producer::EventProducer;

/// Partition used when no partition field is configured or present
pub const GLOBAL_PARTITION: &str = "global";

/// Finalized window keys remembered for late-event detection
const FINALIZED_HISTORY: usize = 10_000;

/// Longest accepted window, slide, grace period or pattern window
pub const MAX_WINDOW_SPAN: Duration = Duration::from_secs(366 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    Tumbling,
    Hopping,
    Sliding,
    Session,
}

/// What happens to an event whose window was already finalized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LateEventPolicy {
    /// Count and discard the event
    #[default]
    Drop,
    /// Start a fresh buffer under the same key; its result is emitted separately
    Reaggregate,
}

/// Window configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingWindow {
    pub kind: WindowKind,
    /// Window length, or the inactivity gap for session windows
    pub size: Duration,
    pub slide: Option<Duration>,
    pub grace_period: Duration,
    /// Payload field whose value segments the buffers
    pub partition_key: Option<String>,
    #[serde(default)]
    pub late_event_policy: LateEventPolicy,
    /// Per-window buffer bound; the oldest event is evicted beyond it
    pub max_events_per_window: usize,
}

impl ProcessingWindow {
    fn base(kind: WindowKind, size: Duration) -> Self {
        Self {
            kind,
            size,
            slide: None,
            grace_period: size,
            partition_key: None,
            late_event_policy: LateEventPolicy::default(),
            max_events_per_window: 10_000,
        }
    }

    pub fn tumbling(size: Duration) -> Self {
        Self::base(WindowKind::Tumbling, size)
    }

    pub fn hopping(size: Duration, slide: Duration) -> Self {
        Self {
            slide: Some(slide),
            ..Self::base(WindowKind::Hopping, size)
        }
    }

    pub fn sliding(size: Duration, slide: Option<Duration>) -> Self {
        Self {
            slide,
            ..Self::base(WindowKind::Sliding, size)
        }
    }

    pub fn session(gap: Duration) -> Self {
        Self::base(WindowKind::Session, gap)
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_partition_key(mut self, field: impl Into<String>) -> Self {
        self.partition_key = Some(field.into());
        self
    }

    pub fn with_late_event_policy(mut self, policy: LateEventPolicy) -> Self {
        self.late_event_policy = policy;
        self
    }

    pub fn with_max_events(mut self, max_events: usize) -> Self {
        self.max_events_per_window = max_events;
        self
    }

    pub fn validate(&self) -> StreamingResult<()> {
        if self.size.is_zero() {
            return Err(StreamingError::InvalidWindow("size must be positive".to_string()));
        }
        let spans = [
            ("size", Some(self.size)),
            ("slide interval", self.slide),
            ("grace period", Some(self.grace_period)),
        ];
        for (what, span) in spans {
            if span.is_some_and(|span| span > MAX_WINDOW_SPAN) {
                return Err(StreamingError::InvalidWindow(format!(
                    "{what} exceeds {} seconds",
                    MAX_WINDOW_SPAN.as_secs()
                )));
            }
        }
        if self.max_events_per_window == 0 {
            return Err(StreamingError::InvalidWindow(
                "max_events_per_window must be positive".to_string(),
            ));
        }
        match (self.kind, self.slide) {
            (WindowKind::Hopping, None) => Err(StreamingError::InvalidWindow(
                "hopping windows require a slide interval".to_string(),
            )),
            (_, Some(slide)) if slide.is_zero() => Err(StreamingError::InvalidWindow(
                "slide interval must be positive".to_string(),
            )),
            (WindowKind::Hopping, Some(slide)) if slide > self.size => {
                Err(StreamingError::InvalidWindow(
                    "slide interval cannot exceed the window size".to_string(),
                ))
            }
            (WindowKind::Tumbling | WindowKind::Session, Some(_)) => {
                Err(StreamingError::InvalidWindow(format!(
                    "{:?} windows take no slide interval",
                    self.kind
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Identity of one window buffer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct WindowKey {
    pub window_start: DateTime<Utc>,
    pub partition: String,
}

/// Events of one finalized window, in arrival order
#[derive(Debug, Clone)]
pub struct WindowBatch {
    pub key: WindowKey,
    /// Latest event time in the window
    pub watermark: DateTime<Utc>,
    pub events: Vec<EventEnvelope>,
}

/// Output of the processing function for one window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowResult {
    pub processor: String,
    pub key: WindowKey,
    pub watermark: DateTime<Utc>,
    pub event_count: usize,
    pub output: Value,
}

pub type WindowFunction = Arc<dyn Fn(&WindowBatch) -> Option<Value> + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WindowStats {
    pub events_processed: u64,
    pub windows_finalized: u64,
    pub results_emitted: u64,
    pub late_events_dropped: u64,
    pub windows_reopened: u64,
    pub duplicate_events: u64,
    pub events_evicted: u64,
    pub open_windows: usize,
}

struct WindowBuffer {
    events: VecDeque<EventEnvelope>,
    latest_event: DateTime<Utc>,
}

pub struct WindowedStreamProcessor {
    name: String,
    window: ProcessingWindow,
    function: WindowFunction,
    buffers: HashMap<WindowKey, WindowBuffer>,
    watermarks: HashMap<String, DateTime<Utc>>,
    sessions: HashMap<String, WindowKey>,
    finalized: HashSet<WindowKey>,
    finalized_order: VecDeque<WindowKey>,
    stats: WindowStats,
    instruments: Option<StreamingMetrics>,
}

impl WindowedStreamProcessor {
    pub fn new(
        name: impl Into<String>,
        window: ProcessingWindow,
        function: WindowFunction,
    ) -> StreamingResult<Self> {
        window.validate()?;
        Ok(Self {
            name: name.into(),
            window,
            function,
            buffers: HashMap::new(),
            watermarks: HashMap::new(),
            sessions: HashMap::new(),
            finalized: HashSet::new(),
            finalized_order: VecDeque::new(),
            stats: WindowStats::default(),
            instruments: None,
        })
    }

    pub fn with_metrics(mut self, instruments: StreamingMetrics) -> Self {
        self.instruments = Some(instruments);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn window(&self) -> &ProcessingWindow {
        &self.window
    }

    /// Buffer an event, using the current instant as its arrival time
    pub fn process(&mut self, event: &EventEnvelope) -> bool {
        self.process_at(event, Utc::now())
    }

    /// Buffer an event that arrived at `arrival`
    ///
    /// Returns `false` when the event was dropped as late or as a duplicate.
    pub fn process_at(&mut self, event: &EventEnvelope, arrival: DateTime<Utc>) -> bool {
        let partition = self.partition_of(event);
        let key = WindowKey {
            window_start: self.window_start(&partition, event, arrival),
            partition: partition.clone(),
        };

        if self.finalized.contains(&key) {
            match self.window.late_event_policy {
                LateEventPolicy::Drop => {
                    self.stats.late_events_dropped += 1;
                    warn!(
                        processor = %self.name,
                        partition = %key.partition,
                        window_start = %key.window_start,
                        event_id = %event.id,
                        "Late event for finalized window dropped"
                    );
                    return false;
                }
                LateEventPolicy::Reaggregate => {
                    self.finalized.remove(&key);
                    self.stats.windows_reopened += 1;
                    debug!(
                        processor = %self.name,
                        partition = %key.partition,
                        window_start = %key.window_start,
                        "Finalized window reopened by late event"
                    );
                }
            }
        }

        // Redelivered envelope
        if self
            .buffers
            .get(&key)
            .is_some_and(|buffer| buffer.events.iter().any(|e| e.id == event.id))
        {
            self.stats.duplicate_events += 1;
            debug!(
                processor = %self.name,
                partition = %key.partition,
                event_id = %event.id,
                "Duplicate event ignored"
            );
            return false;
        }

        if self.window.kind == WindowKind::Session {
            self.sessions.insert(partition.clone(), key.clone());
        }

        let max_events = self.window.max_events_per_window;
        let buffer = self.buffers.entry(key).or_insert_with(|| WindowBuffer {
            events: VecDeque::new(),
            latest_event: event.timestamp,
        });
        buffer.events.push_back(event.clone());
        if buffer.events.len() > max_events {
            buffer.events.pop_front();
            self.stats.events_evicted += 1;
        }
        buffer.latest_event = buffer.latest_event.max(event.timestamp);

        let watermark = self.watermarks.entry(partition).or_insert(event.timestamp);
        *watermark = (*watermark).max(event.timestamp);

        self.stats.events_processed += 1;
        true
    }

    /// Highest event time seen for a partition
    pub fn watermark(&self, partition: &str) -> Option<DateTime<Utc>> {
        self.watermarks.get(partition).copied()
    }

    pub fn open_windows(&self) -> Vec<WindowKey> {
        let mut keys: Vec<WindowKey> = self.buffers.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Finalize every window whose latest event plus grace lies before `now`
    pub fn finalize_ready(&mut self, now: DateTime<Utc>) -> Vec<WindowResult> {
        let grace = signed(self.window.grace_period);

        let mut ready: Vec<WindowKey> = self
            .buffers
            .iter()
            .filter(|(_, buffer)| {
                buffer
                    .latest_event
                    .checked_add_signed(grace)
                    .is_some_and(|deadline| now > deadline)
            })
            .map(|(key, _)| key.clone())
            .collect();
        ready.sort();

        ready
            .into_iter()
            .filter_map(|key| self.finalize(key))
            .collect()
    }

    /// Finalize every open window regardless of time
    pub fn flush_all(&mut self) -> Vec<WindowResult> {
        let mut keys = self.open_windows();
        keys.sort();
        keys.into_iter().filter_map(|key| self.finalize(key)).collect()
    }

    pub fn stats(&self) -> WindowStats {
        WindowStats {
            open_windows: self.buffers.len(),
            ..self.stats.clone()
        }
    }

    fn finalize(&mut self, key: WindowKey) -> Option<WindowResult> {
        let buffer = self.buffers.remove(&key)?;

        if self.sessions.get(&key.partition) == Some(&key) {
            self.sessions.remove(&key.partition);
        }
        self.remember_finalized(key.clone());

        self.stats.windows_finalized += 1;
        if let Some(instruments) = &self.instruments {
            instruments
                .windows_finalized_total
                .with_label_values(&[&self.name])
                .inc();
        }

        let batch = WindowBatch {
            key,
            watermark: buffer.latest_event,
            events: buffer.events.into(),
        };
        let output = (self.function)(&batch)?;

        self.stats.results_emitted += 1;
        debug!(
            processor = %self.name,
            partition = %batch.key.partition,
            window_start = %batch.key.window_start,
            events = batch.events.len(),
            "Window finalized"
        );

        Some(WindowResult {
            processor: self.name.clone(),
            event_count: batch.events.len(),
            key: batch.key,
            watermark: batch.watermark,
            output,
        })
    }

    fn remember_finalized(&mut self, key: WindowKey) {
        if self.finalized.insert(key.clone()) {
            self.finalized_order.push_back(key);
        }
        while self.finalized_order.len() > FINALIZED_HISTORY {
            if let Some(oldest) = self.finalized_order.pop_front() {
                self.finalized.remove(&oldest);
            }
        }
    }

    fn partition_of(&self, event: &EventEnvelope) -> String {
        self.window
            .partition_key
            .as_deref()
            .and_then(|field| event.payload_field_string(field))
            .unwrap_or_else(|| GLOBAL_PARTITION.to_string())
    }

    fn window_start(
        &self,
        partition: &str,
        event: &EventEnvelope,
        arrival: DateTime<Utc>,
    ) -> DateTime<Utc> {
        match self.window.kind {
            WindowKind::Tumbling => floor_to(event.timestamp, self.window.size),
            WindowKind::Hopping => {
                floor_to(event.timestamp, self.window.slide.unwrap_or(self.window.size))
            }
            WindowKind::Sliding => {
                floor_to(arrival, self.window.slide.unwrap_or(self.window.size))
            }
            WindowKind::Session => {
                let gap = signed(self.window.size);
                self.sessions
                    .get(partition)
                    .and_then(|key| self.buffers.get(key).map(|buffer| (key, buffer)))
                    .filter(|(_, buffer)| {
                        buffer
                            .latest_event
                            .checked_add_signed(gap)
                            .map_or(true, |end| event.timestamp <= end)
                    })
                    .map(|(key, _)| key.window_start)
                    .unwrap_or(event.timestamp)
            }
        }
    }
}

fn signed(span: Duration) -> chrono::Duration {
    chrono::Duration::from_std(span).unwrap_or(chrono::Duration::MAX)
}

fn floor_to(timestamp: DateTime<Utc>, step: Duration) -> DateTime<Utc> {
    let step_ms = i64::try_from(step.as_millis()).unwrap_or(i64::MAX).max(1);
    let start = timestamp.timestamp_millis().div_euclid(step_ms) * step_ms;
    DateTime::from_timestamp_millis(start).unwrap_or(timestamp)
}

/// Destination for window results
#[async_trait]
pub trait WindowSink: Send + Sync {
    async fn emit(&self, result: &WindowResult) -> bool;
}

/// Publishes window results as `metric` envelopes
pub struct TopicSink {
    producer: Arc<EventProducer>,
    topic: String,
}

impl TopicSink {
    pub fn new(producer: Arc<EventProducer>, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl WindowSink for TopicSink {
    async fn emit(&self, result: &WindowResult) -> bool {
        let event = EventEnvelope::new(
            EventType::Metric,
            format!("window:{}", result.processor),
            json!({
                "processor": result.processor,
                "partition": result.key.partition,
                "window_start": result.key.window_start,
                "watermark": result.watermark,
                "event_count": result.event_count,
                "result": result.output,
            }),
        );
        self.producer
            .send(&self.topic, &event, Some(&result.key.partition))
            .await
    }
}

#[async_trait]
impl WindowSink for mpsc::UnboundedSender<WindowResult> {
    async fn emit(&self, result: &WindowResult) -> bool {
        self.send(result.clone()).is_ok()
    }
}

/// Handle to a running finalizer task
pub struct FinalizerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl FinalizerHandle {
    /// Stop the timer, flushing every open window to the sink first
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Window finalizer task failed");
        }
    }
}

/// Run periodic finalization for a shared processor
pub fn spawn_finalizer(
    processor: Arc<Mutex<WindowedStreamProcessor>>,
    sink: Arc<dyn WindowSink>,
    tick: Duration,
) -> FinalizerHandle {
    let (shutdown, mut shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        let name = lock(&processor).name().to_string();
        info!(processor = %name, tick_ms = tick.as_millis(), "Window finalizer started");

        let mut interval = tokio::time::interval(tick);
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break,
                _ = interval.tick() => {
                    let results = lock(&processor).finalize_ready(Utc::now());
                    emit_all(sink.as_ref(), &name, results).await;
                }
            }
        }

        let remaining = lock(&processor).flush_all();
        emit_all(sink.as_ref(), &name, remaining).await;
        info!(processor = %name, "Window finalizer stopped");
    });

    FinalizerHandle { shutdown, task }
}

async fn emit_all(sink: &dyn WindowSink, processor: &str, results: Vec<WindowResult>) {
    for result in results {
        if !sink.emit(&result).await {
            warn!(
                processor = %processor,
                partition = %result.key.partition,
                window_start = %result.key.window_start,
                "Failed to emit window result"
            );
        }
    }
}

fn lock(processor: &Mutex<WindowedStreamProcessor>) -> MutexGuard<'_, WindowedStreamProcessor> {
    processor.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Processing function that counts events and sums one numeric payload field
pub fn count_and_sum(field: impl Into<String>) -> WindowFunction {
    let field = field.into();
    Arc::new(move |batch: &WindowBatch| {
        let sum: f64 = batch
            .events
            .iter()
            .filter_map(|event| event.payload_field(&field).and_then(Value::as_f64))
            .sum();
        Some(json!({"count": batch.events.len(), "sum": sum}))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn reading(secs: i64, device: &str, value: f64) -> EventEnvelope {
        EventEnvelope::new(
            EventType::SensorData,
            "sensors",
            json!({"device": device, "value": value}),
        )
        .with_timestamp(at(secs))
    }

    fn processor(window: ProcessingWindow) -> WindowedStreamProcessor {
        WindowedStreamProcessor::new("test", window, count_and_sum("value")).unwrap()
    }

    #[test]
    fn test_tumbling_boundary_splits_windows() {
        let mut p = processor(ProcessingWindow::tumbling(Duration::from_secs(60)));
        p.process_at(&reading(59, "d", 1.0), at(59));
        p.process_at(&reading(61, "d", 1.0), at(61));

        let keys = p.open_windows();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].window_start, at(0));
        assert_eq!(keys[1].window_start, at(60));
    }

    #[test]
    fn test_finalization_waits_for_grace_period() {
        let mut p = processor(
            ProcessingWindow::tumbling(Duration::from_secs(60))
                .with_grace_period(Duration::from_secs(5)),
        );
        p.process_at(&reading(10, "d", 2.0), at(10));
        p.process_at(&reading(59, "d", 3.0), at(59));

        // Latest event is t=59, so the window closes only after t=64
        assert!(p.finalize_ready(at(64)).is_empty());

        let results = p.finalize_ready(at(65));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].event_count, 2);
        assert_eq!(results[0].output, json!({"count": 2, "sum": 5.0}));
        assert_eq!(results[0].watermark, at(59));
        assert!(p.open_windows().is_empty());
    }

    #[test]
    fn test_partition_key_segments_buffers() {
        let mut p = processor(
            ProcessingWindow::tumbling(Duration::from_secs(60)).with_partition_key("device"),
        );
        p.process_at(&reading(1, "a", 1.0), at(1));
        p.process_at(&reading(2, "b", 1.0), at(2));
        p.process_at(&reading(3, "a", 1.0), at(3));

        let partitions: Vec<String> = p.open_windows().into_iter().map(|k| k.partition).collect();
        assert_eq!(partitions, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(p.watermark("a"), Some(at(3)));
        assert_eq!(p.watermark("b"), Some(at(2)));
    }

    #[test]
    fn test_missing_partition_field_uses_global() {
        let mut p = processor(
            ProcessingWindow::tumbling(Duration::from_secs(60)).with_partition_key("zone"),
        );
        p.process_at(&reading(1, "a", 1.0), at(1));
        assert_eq!(p.open_windows()[0].partition, GLOBAL_PARTITION);
    }

    #[test]
    fn test_late_event_dropped_by_default() {
        let mut p = processor(ProcessingWindow::tumbling(Duration::from_secs(60)));
        p.process_at(&reading(30, "d", 1.0), at(30));
        // Grace defaults to the window size
        assert!(p.finalize_ready(at(90)).is_empty());
        assert_eq!(p.finalize_ready(at(91)).len(), 1);

        assert!(!p.process_at(&reading(45, "d", 1.0), at(92)));
        let stats = p.stats();
        assert_eq!(stats.late_events_dropped, 1);
        assert_eq!(stats.open_windows, 0);
    }

    #[test]
    fn test_default_grace_keeps_quiet_window_open() {
        let mut p = processor(ProcessingWindow::tumbling(Duration::from_secs(60)));
        p.process_at(&reading(0, "d", 1.0), at(0));

        // A pause inside the window does not close it
        assert!(p.finalize_ready(at(45)).is_empty());
        assert!(p.process_at(&reading(59, "d", 2.0), at(59)));

        let results = p.finalize_ready(at(120));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].output, json!({"count": 2, "sum": 3.0}));
        assert_eq!(p.stats().late_events_dropped, 0);
    }

    #[test]
    fn test_late_event_for_hopping_window_dropped() {
        let mut p = processor(
            ProcessingWindow::hopping(Duration::from_secs(60), Duration::from_secs(20))
                .with_grace_period(Duration::ZERO),
        );
        p.process_at(&reading(25, "d", 1.0), at(25));
        assert_eq!(p.finalize_ready(at(26)).len(), 1);

        // Same slide bucket as the finalized window
        assert!(!p.process_at(&reading(30, "d", 1.0), at(31)));
        // Next bucket is still open for business
        assert!(p.process_at(&reading(41, "d", 1.0), at(41)));
        assert_eq!(p.stats().late_events_dropped, 1);
    }

    #[test]
    fn test_late_event_for_closed_session() {
        let mut p = processor(
            ProcessingWindow::session(Duration::from_secs(30))
                .with_partition_key("device")
                .with_grace_period(Duration::ZERO),
        );
        p.process_at(&reading(0, "d", 1.0), at(0));
        p.process_at(&reading(10, "d", 1.0), at(10));
        assert_eq!(p.finalize_ready(at(11)).len(), 1);

        // Same start as the closed session
        assert!(!p.process_at(&reading(0, "d", 1.0), at(12)));
        assert_eq!(p.stats().late_events_dropped, 1);

        // Inside the closed session's span, but it cannot rejoin it
        assert!(p.process_at(&reading(5, "d", 1.0), at(13)));
        assert_eq!(p.open_windows()[0].window_start, at(5));
    }

    #[test]
    fn test_redelivered_event_is_ignored() {
        let mut p = processor(
            ProcessingWindow::session(Duration::from_secs(30)).with_partition_key("device"),
        );
        let event = reading(5, "d", 2.0);
        assert!(p.process_at(&event, at(5)));
        assert!(!p.process_at(&event, at(6)));
        p.process_at(&reading(8, "d", 3.0), at(8));

        let results = p.flush_all();
        assert_eq!(results[0].output, json!({"count": 2, "sum": 5.0}));
        assert_eq!(p.stats().duplicate_events, 1);
    }

    #[test]
    fn test_longest_spans_do_not_overflow() {
        let mut p = processor(
            ProcessingWindow::session(MAX_WINDOW_SPAN).with_grace_period(MAX_WINDOW_SPAN),
        );
        let far = DateTime::<Utc>::MAX_UTC - chrono::Duration::days(1);
        p.process_at(&reading(far.timestamp(), "d", 1.0), far);
        p.process_at(&reading(far.timestamp() + 60, "d", 1.0), far);

        assert!(p.finalize_ready(DateTime::<Utc>::MAX_UTC).is_empty());
        assert_eq!(p.open_windows().len(), 1);
    }

    #[test]
    fn test_late_event_reaggregates_when_configured() {
        let mut p = processor(
            ProcessingWindow::tumbling(Duration::from_secs(60))
                .with_late_event_policy(LateEventPolicy::Reaggregate),
        );
        p.process_at(&reading(30, "d", 1.0), at(30));
        p.finalize_ready(at(91));

        assert!(p.process_at(&reading(45, "d", 4.0), at(92)));
        let results = p.finalize_ready(at(106));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].output, json!({"count": 1, "sum": 4.0}));
        assert_eq!(p.stats().windows_reopened, 1);
    }

    #[test]
    fn test_hopping_keys_by_slide() {
        let mut p = processor(ProcessingWindow::hopping(
            Duration::from_secs(60),
            Duration::from_secs(20),
        ));
        p.process_at(&reading(25, "d", 1.0), at(25));
        p.process_at(&reading(39, "d", 1.0), at(39));
        p.process_at(&reading(41, "d", 1.0), at(41));

        let starts: Vec<DateTime<Utc>> =
            p.open_windows().into_iter().map(|k| k.window_start).collect();
        assert_eq!(starts, vec![at(20), at(40)]);
    }

    #[test]
    fn test_sliding_keys_by_arrival() {
        let mut p = processor(ProcessingWindow::sliding(
            Duration::from_secs(60),
            Some(Duration::from_secs(10)),
        ));
        // Event time is irrelevant, arrival decides
        p.process_at(&reading(500, "d", 1.0), at(12));
        p.process_at(&reading(1, "d", 1.0), at(18));
        p.process_at(&reading(2, "d", 1.0), at(21));

        let starts: Vec<DateTime<Utc>> =
            p.open_windows().into_iter().map(|k| k.window_start).collect();
        assert_eq!(starts, vec![at(10), at(20)]);
    }

    #[test]
    fn test_session_splits_on_gap() {
        let mut p = processor(
            ProcessingWindow::session(Duration::from_secs(30)).with_partition_key("device"),
        );
        p.process_at(&reading(0, "d", 1.0), at(0));
        p.process_at(&reading(20, "d", 1.0), at(20));
        p.process_at(&reading(45, "d", 1.0), at(45));
        p.process_at(&reading(100, "d", 1.0), at(100));

        let starts: Vec<DateTime<Utc>> =
            p.open_windows().into_iter().map(|k| k.window_start).collect();
        assert_eq!(starts, vec![at(0), at(100)]);
    }

    #[test]
    fn test_buffer_bound_evicts_oldest() {
        let mut p = processor(
            ProcessingWindow::tumbling(Duration::from_secs(60)).with_max_events(2),
        );
        for (secs, value) in [(1, 1.0), (2, 2.0), (3, 3.0)] {
            p.process_at(&reading(secs, "d", value), at(secs));
        }

        let results = p.flush_all();
        assert_eq!(results[0].output, json!({"count": 2, "sum": 5.0}));
        assert_eq!(p.stats().events_evicted, 1);
    }

    #[test]
    fn test_function_without_result_emits_nothing() {
        let mut p = WindowedStreamProcessor::new(
            "silent",
            ProcessingWindow::tumbling(Duration::from_secs(60)),
            Arc::new(|_batch: &WindowBatch| None),
        )
        .unwrap();
        p.process_at(&reading(1, "d", 1.0), at(1));

        assert!(p.finalize_ready(at(62)).is_empty());
        let stats = p.stats();
        assert_eq!(stats.windows_finalized, 1);
        assert_eq!(stats.results_emitted, 0);
    }

    #[test]
    fn test_invalid_windows_rejected() {
        assert!(ProcessingWindow::tumbling(Duration::ZERO).validate().is_err());
        assert!(
            ProcessingWindow::hopping(Duration::from_secs(10), Duration::from_secs(20))
                .validate()
                .is_err()
        );
        assert!(
            ProcessingWindow::hopping(Duration::from_secs(10), Duration::ZERO)
                .validate()
                .is_err()
        );

        let mut no_slide =
            ProcessingWindow::hopping(Duration::from_secs(10), Duration::from_secs(5));
        no_slide.slide = None;
        assert!(matches!(
            no_slide.validate(),
            Err(StreamingError::InvalidWindow(_))
        ));
        assert!(ProcessingWindow::tumbling(Duration::from_secs(1))
            .with_max_events(0)
            .validate()
            .is_err());

        let huge = Duration::from_secs(9_000_000_000_000);
        for window in [
            ProcessingWindow::tumbling(huge),
            ProcessingWindow::session(Duration::from_secs(60)).with_grace_period(huge),
            ProcessingWindow::sliding(Duration::from_secs(60), Some(huge)),
        ] {
            assert!(matches!(
                window.validate(),
                Err(StreamingError::InvalidWindow(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_finalizer_flushes_on_stop() {
        let shared = Arc::new(Mutex::new(processor(ProcessingWindow::tumbling(
            Duration::from_secs(3600),
        ))));
        // Far-future event keeps the window open until shutdown
        let future = Utc::now() + chrono::Duration::hours(1);
        lock(&shared).process(&reading(future.timestamp(), "d", 7.0));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn_finalizer(shared.clone(), Arc::new(tx), Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(rx.try_recv().is_err());

        handle.stop().await;
        let result = rx.try_recv().expect("flushed result");
        assert_eq!(result.output, json!({"count": 1, "sum": 7.0}));
    }

    #[tokio::test]
    async fn test_finalizer_emits_ready_windows() {
        let shared = Arc::new(Mutex::new(processor(ProcessingWindow::tumbling(
            Duration::from_secs(60),
        ))));
        lock(&shared).process(&reading(Utc::now().timestamp() - 120, "d", 2.0));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn_finalizer(shared.clone(), Arc::new(tx), Duration::from_millis(10));

        let result = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timeout")
            .expect("channel closed");
        assert_eq!(result.event_count, 1);

        handle.stop().await;
        assert_eq!(lock(&shared).stats().windows_finalized, 1);
    }
}
