//! Streaming system orchestrator
//!
//! Owns the producer, named consumers, the CEP engine, the analytics engine,
//! windowed processors and the topic registry. Every consumed event is
//! routed to CEP, then analytics, then each window processor. Alerts raised
//! along the way are published to the alerts topic; alert events themselves
//! are never routed back into the pipeline.
//!
//! CEP, analytics and window state sit behind `std::sync::Mutex` and are only
//! locked for synchronous sections, never across an await. Match handlers run
//! after the CEP lock is released, so they may call back into the system.

use event_bus::{EventBus, EventEnvelope, EventType};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{info, warn};

use crate::analytics::{AnalyticsSummary, StreamAnalyticsEngine, WindowAggregate};
use crate::cep::{CepStats, ComplexEventProcessor, EventPattern, MatchHandler, PatternMatch};
use crate::config::StreamingConfig;
use crate::consumer::{handler, ConsumerMetrics, EventConsumer};
use crate::error::{StreamingError, StreamingResult};
use crate::metrics::StreamingMetrics;
use crate::producer::{EventProducer, PartitionKeyFn, ProducerMetrics};
use crate::topic::StreamTopic;
use crate::window::{
    spawn_finalizer, FinalizerHandle, TopicSink, WindowStats, WindowedStreamProcessor,
};

type SharedWindow = Arc<Mutex<WindowedStreamProcessor>>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsumerStatus {
    pub topics: Vec<String>,
    pub running: bool,
    pub metrics: ConsumerMetrics,
}

/// Aggregated report of every component
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStatus {
    pub running: bool,
    pub producer: ProducerMetrics,
    pub consumers: BTreeMap<String, ConsumerStatus>,
    pub cep_matches: u64,
    pub cep: CepStats,
    pub analytics: AnalyticsSummary,
    pub windows: BTreeMap<String, WindowStats>,
    pub topics: Vec<String>,
}

/// State shared between the system and its routing handlers
struct Pipeline {
    producer: Arc<EventProducer>,
    cep: Mutex<ComplexEventProcessor>,
    analytics: Mutex<StreamAnalyticsEngine>,
    windows: RwLock<Vec<SharedWindow>>,
    match_handlers: RwLock<Vec<MatchHandler>>,
    alerts_topic: String,
}

impl Pipeline {
    /// Run one event through CEP, analytics and windows; publish the alerts
    async fn route(&self, event: &EventEnvelope) -> Vec<EventEnvelope> {
        if event.event_type == EventType::Alert {
            return Vec::new();
        }

        let matches = lock(&self.cep).process_event(event);
        if !matches.is_empty() {
            let handlers = self
                .match_handlers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            for pattern_match in &matches {
                for handler in &handlers {
                    handler(pattern_match);
                }
            }
        }

        let mut alerts: Vec<EventEnvelope> = matches.iter().map(PatternMatch::to_alert).collect();
        alerts.extend(lock(&self.analytics).process_event(event));

        let windows = self
            .windows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for window in windows {
            lock(&window).process(event);
        }

        for alert in &alerts {
            let partition = alert.correlation_id.as_deref();
            if !self.producer.send(&self.alerts_topic, alert, partition).await {
                warn!(
                    alerts_topic = %self.alerts_topic,
                    alert_id = %alert.id,
                    "Failed to publish alert"
                );
            }
        }
        alerts
    }
}

pub struct RealtimeStreamingSystem {
    config: StreamingConfig,
    bus: Arc<dyn EventBus>,
    instruments: StreamingMetrics,
    pipeline: Arc<Pipeline>,
    consumers: Mutex<HashMap<String, Arc<EventConsumer>>>,
    finalizers: Mutex<Vec<FinalizerHandle>>,
    topics: Mutex<BTreeMap<String, StreamTopic>>,
    running: AtomicBool,
}

impl RealtimeStreamingSystem {
    /// Build the system and register the configured topics and patterns
    pub fn new(bus: Arc<dyn EventBus>, config: StreamingConfig) -> StreamingResult<Self> {
        let instruments = StreamingMetrics::new()
            .map_err(|e| StreamingError::Config(format!("metrics registry: {e}")))?;

        let producer = Arc::new(
            EventProducer::new(bus.clone(), config.producer_retry.clone())
                .with_metrics(instruments.clone()),
        );

        let mut cep =
            ComplexEventProcessor::new(config.cep.clone()).with_metrics(instruments.clone());
        for pattern in &config.patterns {
            cep.add_pattern(pattern.clone())?;
        }
        let analytics =
            StreamAnalyticsEngine::new(config.analytics.clone()).with_metrics(instruments.clone());

        let system = Self {
            pipeline: Arc::new(Pipeline {
                producer,
                cep: Mutex::new(cep),
                analytics: Mutex::new(analytics),
                windows: RwLock::new(Vec::new()),
                match_handlers: RwLock::new(Vec::new()),
                alerts_topic: config.alerts_topic.clone(),
            }),
            bus,
            instruments,
            consumers: Mutex::new(HashMap::new()),
            finalizers: Mutex::new(Vec::new()),
            topics: Mutex::new(BTreeMap::new()),
            running: AtomicBool::new(false),
            config,
        };

        for topic in system.config.topics.clone() {
            system.register_topic(topic)?;
        }
        Ok(system)
    }

    /// Start the producer, the routing consumer and the window finalizers
    pub async fn start_streaming(&self) -> StreamingResult<()> {
        if self.running.load(Ordering::SeqCst) {
            warn!("Streaming system already running");
            return Ok(());
        }

        self.pipeline.producer.start().await?;

        let group = self.config.consumer_group.clone();
        let has_group = lock(&self.consumers).contains_key(&group);
        if !has_group {
            self.create_consumer(&group, &self.config.ingest_topics()).await?;
        }

        let windows = self
            .pipeline
            .windows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for window in windows {
            self.spawn_window_finalizer(window);
        }

        self.running.store(true, Ordering::SeqCst);
        info!(
            group = %group,
            topics = self.config.ingest_topics().len(),
            patterns = lock(&self.pipeline.cep).patterns().len(),
            "Streaming system started"
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Route one event through the pipeline as if it had been consumed
    ///
    /// Returns the alerts it raised, which have also been published.
    pub async fn route_event(&self, event: &EventEnvelope) -> Vec<EventEnvelope> {
        self.pipeline.route(event).await
    }

    pub async fn publish_event(
        &self,
        topic: &str,
        event: &EventEnvelope,
        partition_key: Option<&str>,
    ) -> bool {
        self.pipeline.producer.send(topic, event, partition_key).await
    }

    pub async fn publish_events_batch(
        &self,
        topic: &str,
        events: &[EventEnvelope],
        partition_key_fn: Option<&PartitionKeyFn>,
    ) -> usize {
        self.pipeline
            .producer
            .send_batch(topic, events, partition_key_fn)
            .await
    }

    /// Subscribe a new consumer group whose events feed the pipeline
    ///
    /// The returned consumer accepts additional handlers.
    pub async fn create_consumer(
        &self,
        group_id: &str,
        topics: &[String],
    ) -> StreamingResult<Arc<EventConsumer>> {
        let mut consumer =
            EventConsumer::new(group_id, self.bus.clone()).with_metrics(self.instruments.clone());
        if let Some(dlq) = &self.config.dead_letter_topic {
            consumer = consumer.with_dead_letter_topic(dlq.clone());
        }
        let consumer = Arc::new(consumer);

        {
            let mut consumers = lock(&self.consumers);
            if consumers.contains_key(group_id) {
                return Err(StreamingError::ConsumerExists(group_id.to_string()));
            }
            consumers.insert(group_id.to_string(), consumer.clone());
        }

        for event_type in EventType::ALL {
            if event_type == EventType::Alert {
                continue;
            }
            let pipeline = self.pipeline.clone();
            consumer.add_event_handler(
                event_type,
                handler(move |event| {
                    let pipeline = pipeline.clone();
                    async move {
                        pipeline.route(&event).await;
                        Ok(())
                    }
                }),
            );
        }

        if let Err(e) = consumer.start(topics).await {
            lock(&self.consumers).remove(group_id);
            return Err(e);
        }

        info!(group = %group_id, topics = ?topics, "Consumer created");
        Ok(consumer)
    }

    pub fn consumer(&self, group_id: &str) -> Option<Arc<EventConsumer>> {
        lock(&self.consumers).get(group_id).cloned()
    }

    pub fn register_topic(&self, topic: StreamTopic) -> StreamingResult<()> {
        let mut topics = lock(&self.topics);
        if topics.contains_key(&topic.name) {
            return Err(StreamingError::TopicExists(topic.name));
        }
        info!(
            topic = %topic.name,
            partitions = topic.partitions,
            retention_hours = topic.retention_hours,
            "Topic registered"
        );
        topics.insert(topic.name.clone(), topic);
        Ok(())
    }

    pub fn topics(&self) -> Vec<StreamTopic> {
        lock(&self.topics).values().cloned().collect()
    }

    pub fn add_pattern(&self, pattern: EventPattern) -> StreamingResult<()> {
        lock(&self.pipeline.cep).add_pattern(pattern)
    }

    pub fn remove_pattern(&self, pattern_id: &str) -> StreamingResult<EventPattern> {
        lock(&self.pipeline.cep).remove_pattern(pattern_id)
    }

    pub fn enable_pattern(&self, pattern_id: &str) -> StreamingResult<()> {
        lock(&self.pipeline.cep).enable_pattern(pattern_id)
    }

    pub fn disable_pattern(&self, pattern_id: &str) -> StreamingResult<()> {
        lock(&self.pipeline.cep).disable_pattern(pattern_id)
    }

    /// Called for every match, outside the CEP lock
    pub fn add_match_handler(&self, handler: MatchHandler) {
        self.pipeline
            .match_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    pub fn recent_matches(&self, limit: usize) -> Vec<PatternMatch> {
        lock(&self.pipeline.cep).recent_matches(limit)
    }

    /// Attach a window processor; its results go to the window results topic
    pub fn add_window_processor(
        &self,
        processor: WindowedStreamProcessor,
    ) -> StreamingResult<()> {
        let window = {
            let mut windows = self
                .pipeline
                .windows
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if windows.iter().any(|w| lock(w).name() == processor.name()) {
                return Err(StreamingError::InvalidWindow(format!(
                    "processor '{}' already registered",
                    processor.name()
                )));
            }
            let window = Arc::new(Mutex::new(processor.with_metrics(self.instruments.clone())));
            windows.push(window.clone());
            window
        };

        if self.is_running() {
            self.spawn_window_finalizer(window);
        }
        Ok(())
    }

    pub fn window_aggregates(&self, window_size: std::time::Duration) -> Vec<WindowAggregate> {
        lock(&self.pipeline.analytics).window_aggregates(window_size)
    }

    fn spawn_window_finalizer(&self, window: SharedWindow) {
        let sink = Arc::new(TopicSink::new(
            self.pipeline.producer.clone(),
            self.config.window_results_topic.clone(),
        ));
        let handle = spawn_finalizer(window, sink, self.config.window_tick);
        lock(&self.finalizers).push(handle);
    }

    pub fn get_system_status(&self) -> SystemStatus {
        let consumers = lock(&self.consumers)
            .iter()
            .map(|(group, consumer)| {
                (
                    group.clone(),
                    ConsumerStatus {
                        topics: consumer.topics(),
                        running: consumer.is_running(),
                        metrics: consumer.metrics(),
                    },
                )
            })
            .collect();

        let (cep_matches, cep) = {
            let cep = lock(&self.pipeline.cep);
            (cep.total_matches(), cep.stats())
        };

        let windows = self
            .pipeline
            .windows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|w| {
                let w = lock(w);
                (w.name().to_string(), w.stats())
            })
            .collect();

        SystemStatus {
            running: self.is_running(),
            producer: self.pipeline.producer.metrics(),
            consumers,
            cep_matches,
            cep,
            analytics: lock(&self.pipeline.analytics).summary(),
            windows,
            topics: lock(&self.topics).keys().cloned().collect(),
        }
    }

    /// Prometheus text exposition of the system's instruments
    pub fn render_metrics(&self) -> Result<String, String> {
        self.instruments.render()
    }

    /// Stop consumers, then window finalizers (flushing open windows), then the producer
    pub async fn stop_streaming(&self) {
        let consumers: Vec<Arc<EventConsumer>> =
            lock(&self.consumers).drain().map(|(_, c)| c).collect();
        for consumer in consumers {
            consumer.stop().await;
        }

        let finalizers: Vec<FinalizerHandle> = lock(&self.finalizers).drain(..).collect();
        for finalizer in finalizers {
            finalizer.stop().await;
        }

        self.pipeline.producer.stop().await;
        self.running.store(false, Ordering::SeqCst);
        info!("Streaming system stopped");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
