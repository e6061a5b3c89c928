use event_bus::retry::RetryConfig;
use std::env;
use std::fs;
use std::time::Duration;

use crate::analytics::AnalyticsConfig;
use crate::cep::{CepConfig, EventPattern, MatchDedup};
use crate::error::{StreamingError, StreamingResult};
use crate::topic::StreamTopic;

const DEFAULT_TOPICS: &str = include_str!("../config/default_topics.json");
const DEFAULT_PATTERNS: &str = include_str!("../config/default_patterns.json");

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusType {
    Nats,
    InMemory,
}

impl BusType {
    fn parse(value: Option<String>) -> Self {
        match value
            .unwrap_or_else(|| "inmemory".to_string())
            .to_lowercase()
            .as_str()
        {
            "nats" => BusType::Nats,
            "inmemory" => BusType::InMemory,
            other => {
                tracing::warn!(bus_type = %other, "Unknown BUS_TYPE, defaulting to inmemory");
                BusType::InMemory
            }
        }
    }
}

/// Streaming engine configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    pub bus_type: BusType,
    pub nats_url: String,
    /// Group of the system's own routing consumer
    pub consumer_group: String,
    pub alerts_topic: String,
    /// Destination of window results
    pub window_results_topic: String,
    pub dead_letter_topic: Option<String>,
    pub window_tick: Duration,
    pub producer_retry: RetryConfig,
    pub cep: CepConfig,
    pub analytics: AnalyticsConfig,
    pub topics: Vec<StreamTopic>,
    pub patterns: Vec<EventPattern>,
}

impl StreamingConfig {
    pub fn from_env() -> StreamingResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> StreamingResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bus_type = BusType::parse(lookup("BUS_TYPE"));
        let nats_url = lookup("NATS_URL").unwrap_or_else(|| "nats://localhost:4222".to_string());
        let consumer_group =
            lookup("STREAMING_CONSUMER_GROUP").unwrap_or_else(|| "streaming-engine".to_string());
        let alerts_topic =
            lookup("STREAMING_ALERTS_TOPIC").unwrap_or_else(|| "streaming.alerts".to_string());
        let window_results_topic = lookup("STREAMING_WINDOW_RESULTS_TOPIC")
            .unwrap_or_else(|| "streaming.window_results".to_string());
        let dead_letter_topic = lookup("STREAMING_DEAD_LETTER_TOPIC").filter(|t| !t.is_empty());

        let window_tick = Duration::from_millis(parse_or(&lookup, "WINDOW_TICK_MS", 1000u64)?);
        if window_tick.is_zero() {
            return Err(StreamingError::Config(
                "WINDOW_TICK_MS must be positive".to_string(),
            ));
        }

        let producer_retry =
            RetryConfig::with_attempts(parse_or(&lookup, "PRODUCER_MAX_ATTEMPTS", 1u32)?);

        let cep = CepConfig {
            buffer_capacity: parse_or(
                &lookup,
                "CEP_BUFFER_CAPACITY",
                CepConfig::default().buffer_capacity,
            )?,
            dedup: match lookup("CEP_MATCH_DEDUP") {
                Some(value) => value.parse::<MatchDedup>().map_err(StreamingError::Config)?,
                None => MatchDedup::default(),
            },
            ..CepConfig::default()
        };
        if cep.buffer_capacity == 0 {
            return Err(StreamingError::Config(
                "CEP_BUFFER_CAPACITY must be positive".to_string(),
            ));
        }

        let mut analytics = AnalyticsConfig::default();
        if let Some(raw) = lookup("ANALYTICS_WINDOWS_SECS") {
            analytics.window_sizes = parse_window_sizes(&raw)?;
        }

        let topics = match lookup("STREAMING_TOPICS_FILE") {
            Some(path) => StreamTopic::list_from_json(&read_file(&path)?)?,
            None => StreamTopic::list_from_json(DEFAULT_TOPICS)?,
        };
        let patterns = match lookup("STREAMING_PATTERNS_FILE") {
            Some(path) => EventPattern::list_from_json(&read_file(&path)?)?,
            None => EventPattern::list_from_json(DEFAULT_PATTERNS)?,
        };

        Ok(Self {
            bus_type,
            nats_url,
            consumer_group,
            alerts_topic,
            window_results_topic,
            dead_letter_topic,
            window_tick,
            producer_retry,
            cep,
            analytics,
            topics,
            patterns,
        })
    }

    /// Configured topics the routing consumer reads
    ///
    /// The alerts and window results topics carry the pipeline's own output
    /// and are never read back into it.
    pub fn ingest_topics(&self) -> Vec<String> {
        self.topics
            .iter()
            .map(|t| t.name.clone())
            .filter(|name| *name != self.alerts_topic && *name != self.window_results_topic)
            .collect()
    }
}

impl Default for StreamingConfig {
    /// In-memory configuration with the embedded topics and patterns
    fn default() -> Self {
        Self {
            bus_type: BusType::InMemory,
            nats_url: "nats://localhost:4222".to_string(),
            consumer_group: "streaming-engine".to_string(),
            alerts_topic: "streaming.alerts".to_string(),
            window_results_topic: "streaming.window_results".to_string(),
            dead_letter_topic: None,
            window_tick: Duration::from_secs(1),
            producer_retry: RetryConfig::no_retry(),
            cep: CepConfig::default(),
            analytics: AnalyticsConfig::default(),
            topics: StreamTopic::list_from_json(DEFAULT_TOPICS).unwrap_or_default(),
            patterns: EventPattern::list_from_json(DEFAULT_PATTERNS).unwrap_or_default(),
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> StreamingResult<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| {
                StreamingError::Config(format!("{key} must be a valid number, got '{raw}'"))
            }),
        None => Ok(default),
    }
}

fn parse_window_sizes(raw: &str) -> StreamingResult<Vec<Duration>> {
    let sizes = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| match s.parse::<u64>() {
            Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
            _ => Err(StreamingError::Config(format!(
                "ANALYTICS_WINDOWS_SECS entries must be positive integers, got '{s}'"
            ))),
        })
        .collect::<StreamingResult<Vec<_>>>()?;

    if sizes.is_empty() {
        return Err(StreamingError::Config(
            "ANALYTICS_WINDOWS_SECS must list at least one window".to_string(),
        ));
    }
    Ok(sizes)
}

fn read_file(path: &str) -> StreamingResult<String> {
    fs::read_to_string(path).map_err(|e| StreamingError::Config(format!("cannot read {path}: {e}")))
}
