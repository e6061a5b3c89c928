//! # Event Streaming
//!
//! Real-time event streaming on top of the [`event_bus`] transport:
//!
//! - **EventProducer / EventConsumer**: publish envelopes and dispatch consumed
//!   envelopes to typed handlers, with failures isolated per handler
//! - **WindowedStreamProcessor**: tumbling, hopping, sliding and session
//!   windows with grace-period finalization
//! - **ComplexEventProcessor**: sequence, conjunction, disjunction and negation
//!   patterns over partitioned, time-bounded buffers
//! - **StreamAnalyticsEngine**: rolling counters, multi-window aggregates and
//!   throughput / payload-size anomaly detection
//! - **RealtimeStreamingSystem**: wires the pieces together and routes every
//!   consumed event through CEP, analytics and windows
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_bus::{EventEnvelope, EventType, InMemoryBus};
//! use event_streaming::{RealtimeStreamingSystem, StreamingConfig};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = Arc::new(InMemoryBus::new());
//! let system = RealtimeStreamingSystem::new(bus, StreamingConfig::default())?;
//! system.start_streaming().await?;
//!
//! let event = EventEnvelope::new(
//!     EventType::UserAction,
//!     "auth",
//!     serde_json::json!({"user_id": "42", "action": "login", "status": "failed"}),
//! );
//! system.publish_event("streaming.user_actions", &event, Some("42")).await;
//!
//! println!("{}", serde_json::to_string_pretty(&system.get_system_status())?);
//! system.stop_streaming().await;
//! # Ok(())
//! # }
//! ```

pub mod analytics;
pub mod cep;
pub mod config;
pub mod consumer;
pub mod error;
pub mod metrics;
pub mod producer;
pub mod system;
pub mod topic;
pub mod window;

pub use analytics::{
    AnalyticsConfig, AnalyticsSummary, AnomalyKind, StreamAnalyticsEngine, WindowAggregate,
};
pub use cep::{
    CepConfig, ComplexEventProcessor, Condition, ConditionOperator, EventPattern, EventRule,
    MatchDedup, PatternDefinition, PatternMatch,
};
pub use config::{BusType, StreamingConfig};
pub use consumer::{handler, ConsumerMetrics, EventConsumer, EventHandler};
pub use error::{StreamingError, StreamingResult};
pub use metrics::StreamingMetrics;
pub use producer::{key_by_field, EventProducer, PartitionKeyFn, ProducerMetrics};
pub use system::{RealtimeStreamingSystem, SystemStatus};
pub use topic::StreamTopic;
pub use window::{
    LateEventPolicy, ProcessingWindow, WindowKind, WindowResult, WindowedStreamProcessor,
};
