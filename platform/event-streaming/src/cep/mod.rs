//! Complex event processing
//!
//! Patterns are registered by id and compiled once. For every incoming event
//! each enabled pattern that the event is relevant to appends it to the
//! buffer of its partition, then re-runs the pattern's match algorithm over
//! the buffered events inside the pattern's time window. The window is
//! measured back from the incoming event's own timestamp.
//!
//! Matches are recorded in a bounded log, counted, passed to registered
//! handlers and returned to the caller. Re-evaluation can rediscover the same
//! event set on later events; [`MatchDedup::ByEventSet`] suppresses those.

mod matcher;
mod pattern;

pub use pattern::{
    Condition, ConditionOperator, EventPattern, EventRule, PatternDefinition, MAX_PATTERN_RULES,
};

use chrono::{DateTime, Utc};
use event_bus::{EventEnvelope, EventType};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{StreamingError, StreamingResult};
use crate::metrics::StreamingMetrics;
use pattern::CompiledPattern;

/// Events kept per (pattern, partition) buffer
pub const DEFAULT_BUFFER_CAPACITY: usize = 10_000;

/// Partition used when a pattern has no partition field or the event lacks it
pub const GLOBAL_PARTITION: &str = "global";

const DEFAULT_MATCH_LOG_CAPACITY: usize = 1_000;
const SEEN_SETS_PER_PATTERN: usize = 10_000;

/// Treatment of a match whose event set was already reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchDedup {
    /// Report every evaluation result
    None,
    /// Report each distinct set of matched event ids once per pattern
    #[default]
    ByEventSet,
}

impl FromStr for MatchDedup {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "off" => Ok(MatchDedup::None),
            "by_event_set" | "event_set" => Ok(MatchDedup::ByEventSet),
            other => Err(format!("unknown match dedup policy '{other}'")),
        }
    }
}

impl fmt::Display for MatchDedup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchDedup::None => f.write_str("none"),
            MatchDedup::ByEventSet => f.write_str("by_event_set"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CepConfig {
    pub buffer_capacity: usize,
    pub dedup: MatchDedup,
    pub match_log_capacity: usize,
}

impl Default for CepConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            dedup: MatchDedup::default(),
            match_log_capacity: DEFAULT_MATCH_LOG_CAPACITY,
        }
    }
}

/// A detected pattern occurrence
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatternMatch {
    pub pattern_id: String,
    pub pattern_name: String,
    pub partition: String,
    /// Matched envelopes in buffer order
    pub events: Vec<EventEnvelope>,
    pub matched_at: DateTime<Utc>,
}

impl PatternMatch {
    pub fn event_ids(&self) -> Vec<&str> {
        self.events.iter().map(|e| e.id.as_str()).collect()
    }

    /// Alert envelope describing this match
    ///
    /// Derived from the last matched event so the alert carries its
    /// correlation id and names it as the cause.
    pub fn to_alert(&self) -> EventEnvelope {
        let payload = json!({
            "alert_type": "pattern_match",
            "pattern_id": self.pattern_id,
            "pattern_name": self.pattern_name,
            "partition": self.partition,
            "matched_event_ids": self.event_ids(),
            "event_count": self.events.len(),
            "matched_at": self.matched_at,
        });

        let alert = match self.events.last() {
            Some(trigger) => trigger.derive(EventType::Alert, "cep", payload),
            None => EventEnvelope::new(EventType::Alert, "cep", payload),
        };
        alert.with_metadata("pattern_id", self.pattern_id.clone().into())
    }
}

pub type MatchHandler = Arc<dyn Fn(&PatternMatch) + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CepStats {
    pub patterns: usize,
    pub enabled_patterns: usize,
    pub events_processed: u64,
    pub events_buffered: usize,
    pub events_evicted: u64,
    pub duplicate_events: u64,
    pub total_matches: u64,
    pub duplicates_suppressed: u64,
}

struct PatternState {
    compiled: CompiledPattern,
    buffers: HashMap<String, VecDeque<Arc<EventEnvelope>>>,
    seen: HashSet<Vec<String>>,
    seen_order: VecDeque<Vec<String>>,
}

impl PatternState {
    fn new(compiled: CompiledPattern) -> Self {
        Self {
            compiled,
            buffers: HashMap::new(),
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
        }
    }

    /// Returns false when this event set was already reported
    fn first_sighting(&mut self, ids: Vec<String>) -> bool {
        if !self.seen.insert(ids.clone()) {
            return false;
        }
        self.seen_order.push_back(ids);
        while self.seen_order.len() > SEEN_SETS_PER_PATTERN {
            if let Some(oldest) = self.seen_order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    fn clear(&mut self) {
        self.buffers.clear();
        self.seen.clear();
        self.seen_order.clear();
    }
}

pub struct ComplexEventProcessor {
    config: CepConfig,
    patterns: HashMap<String, PatternState>,
    /// Registration order, for deterministic evaluation
    order: Vec<String>,
    match_log: VecDeque<PatternMatch>,
    handlers: Vec<MatchHandler>,
    stats: CepStats,
    instruments: Option<StreamingMetrics>,
}

impl ComplexEventProcessor {
    pub fn new(config: CepConfig) -> Self {
        Self {
            config,
            patterns: HashMap::new(),
            order: Vec::new(),
            match_log: VecDeque::new(),
            handlers: Vec::new(),
            stats: CepStats::default(),
            instruments: None,
        }
    }

    pub fn with_metrics(mut self, instruments: StreamingMetrics) -> Self {
        self.instruments = Some(instruments);
        self
    }

    /// Register or replace a pattern
    pub fn add_pattern(&mut self, pattern: EventPattern) -> StreamingResult<()> {
        let compiled = CompiledPattern::compile(pattern)?;
        let id = compiled.pattern.id.clone();

        info!(
            pattern_id = %id,
            name = %compiled.pattern.name,
            kind = compiled.pattern.definition.kind(),
            window_secs = compiled.pattern.time_window_secs,
            "CEP pattern registered"
        );

        if self.patterns.insert(id.clone(), PatternState::new(compiled)).is_none() {
            self.order.push(id);
        }
        self.update_gauge();
        Ok(())
    }

    pub fn remove_pattern(&mut self, id: &str) -> StreamingResult<EventPattern> {
        let state = self
            .patterns
            .remove(id)
            .ok_or_else(|| StreamingError::PatternNotFound(id.to_string()))?;
        self.order.retain(|existing| existing != id);
        self.update_gauge();

        info!(pattern_id = %id, "CEP pattern removed");
        Ok(state.compiled.pattern)
    }

    pub fn enable_pattern(&mut self, id: &str) -> StreamingResult<()> {
        self.set_enabled(id, true)
    }

    /// Disabling also drops the pattern's buffered events
    pub fn disable_pattern(&mut self, id: &str) -> StreamingResult<()> {
        self.set_enabled(id, false)
    }

    fn set_enabled(&mut self, id: &str, enabled: bool) -> StreamingResult<()> {
        let state = self
            .patterns
            .get_mut(id)
            .ok_or_else(|| StreamingError::PatternNotFound(id.to_string()))?;
        state.compiled.pattern.enabled = enabled;
        if !enabled {
            state.clear();
        }
        info!(pattern_id = %id, enabled, "CEP pattern toggled");
        Ok(())
    }

    pub fn pattern(&self, id: &str) -> Option<&EventPattern> {
        self.patterns.get(id).map(|state| &state.compiled.pattern)
    }

    pub fn patterns(&self) -> Vec<&EventPattern> {
        self.order
            .iter()
            .filter_map(|id| self.pattern(id))
            .collect()
    }

    pub fn add_match_handler(&mut self, handler: MatchHandler) {
        self.handlers.push(handler);
    }

    /// Feed one event through every enabled pattern
    pub fn process_event(&mut self, event: &EventEnvelope) -> Vec<PatternMatch> {
        self.stats.events_processed += 1;

        let event = Arc::new(event.clone());
        let mut found = Vec::new();

        for id in &self.order {
            let Some(state) = self.patterns.get_mut(id) else {
                continue;
            };
            let pattern = &state.compiled.pattern;
            if !pattern.enabled || !state.compiled.definition.is_relevant(&event) {
                continue;
            }

            let partition = pattern
                .partition_key
                .as_deref()
                .and_then(|field| event.payload_field_string(field))
                .unwrap_or_else(|| GLOBAL_PARTITION.to_string());
            let cutoff = event
                .timestamp
                .checked_sub_signed(state.compiled.window)
                .unwrap_or(DateTime::<Utc>::MIN_UTC);

            let buffer = state.buffers.entry(partition.clone()).or_default();
            // Redelivered envelope
            if buffer.iter().any(|buffered| buffered.id == event.id) {
                self.stats.duplicate_events += 1;
                debug!(
                    pattern_id = %id,
                    partition = %partition,
                    event_id = %event.id,
                    "Duplicate event ignored"
                );
                continue;
            }
            buffer.push_back(event.clone());
            while buffer.len() > self.config.buffer_capacity {
                buffer.pop_front();
                self.stats.events_evicted += 1;
            }
            while buffer.front().is_some_and(|e| e.timestamp < cutoff) {
                buffer.pop_front();
            }

            let candidates: Vec<Arc<EventEnvelope>> = buffer
                .iter()
                .filter(|e| e.timestamp >= cutoff)
                .cloned()
                .collect();

            for matched in matcher::evaluate(&state.compiled.definition, &candidates) {
                if self.config.dedup == MatchDedup::ByEventSet {
                    let ids = matched.iter().map(|e| e.id.clone()).collect();
                    if !state.first_sighting(ids) {
                        self.stats.duplicates_suppressed += 1;
                        continue;
                    }
                }

                let pattern = &state.compiled.pattern;
                let pattern_match = PatternMatch {
                    pattern_id: pattern.id.clone(),
                    pattern_name: pattern.name.clone(),
                    partition: partition.clone(),
                    events: matched.iter().map(|e| e.as_ref().clone()).collect(),
                    matched_at: Utc::now(),
                };

                info!(
                    pattern_id = %pattern_match.pattern_id,
                    partition = %pattern_match.partition,
                    events = pattern_match.events.len(),
                    "CEP pattern matched"
                );
                if let Some(instruments) = &self.instruments {
                    instruments
                        .pattern_matches_total
                        .with_label_values(&[&pattern_match.pattern_id])
                        .inc();
                }
                for handler in &self.handlers {
                    handler(&pattern_match);
                }

                self.stats.total_matches += 1;
                self.match_log.push_back(pattern_match.clone());
                while self.match_log.len() > self.config.match_log_capacity {
                    self.match_log.pop_front();
                }
                found.push(pattern_match);
            }
        }

        if found.is_empty() {
            debug!(event_id = %event.id, "No CEP match");
        }
        found
    }

    /// Most recent matches, newest last
    pub fn recent_matches(&self, limit: usize) -> Vec<PatternMatch> {
        let skip = self.match_log.len().saturating_sub(limit);
        self.match_log.iter().skip(skip).cloned().collect()
    }

    pub fn total_matches(&self) -> u64 {
        self.stats.total_matches
    }

    pub fn stats(&self) -> CepStats {
        CepStats {
            patterns: self.patterns.len(),
            enabled_patterns: self
                .patterns
                .values()
                .filter(|s| s.compiled.pattern.enabled)
                .count(),
            events_buffered: self
                .patterns
                .values()
                .flat_map(|s| s.buffers.values())
                .map(VecDeque::len)
                .sum(),
            ..self.stats.clone()
        }
    }

    fn update_gauge(&self) {
        if let Some(instruments) = &self.instruments {
            instruments.active_patterns.set(self.patterns.len() as i64);
        }
    }
}
