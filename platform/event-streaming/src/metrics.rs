use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Prometheus instruments for the streaming engine
///
/// Cloning is cheap: every instrument is reference counted, so producers,
/// consumers and the pipeline share one registry.
#[derive(Clone)]
pub struct StreamingMetrics {
    registry: Registry,

    // Producer
    pub events_sent_total: IntCounterVec,
    pub send_errors_total: IntCounterVec,

    // Consumer
    pub events_consumed_total: IntCounterVec,
    pub processing_errors_total: IntCounterVec,
    pub deserialization_errors_total: IntCounterVec,

    // Pipeline
    pub pattern_matches_total: IntCounterVec,
    pub anomalies_total: IntCounterVec,
    pub windows_finalized_total: IntCounterVec,
    pub active_patterns: IntGauge,
}

impl StreamingMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let events_sent_total = IntCounterVec::new(
            Opts::new("streaming_events_sent_total", "Envelopes published"),
            &["topic"],
        )?;
        let send_errors_total = IntCounterVec::new(
            Opts::new("streaming_send_errors_total", "Failed publishes"),
            &["topic"],
        )?;
        let events_consumed_total = IntCounterVec::new(
            Opts::new("streaming_events_consumed_total", "Envelopes consumed"),
            &["group", "event_type"],
        )?;
        let processing_errors_total = IntCounterVec::new(
            Opts::new("streaming_processing_errors_total", "Handler failures"),
            &["group"],
        )?;
        let deserialization_errors_total = IntCounterVec::new(
            Opts::new(
                "streaming_deserialization_errors_total",
                "Messages that could not be decoded",
            ),
            &["group"],
        )?;
        let pattern_matches_total = IntCounterVec::new(
            Opts::new("streaming_pattern_matches_total", "CEP pattern matches"),
            &["pattern"],
        )?;
        let anomalies_total = IntCounterVec::new(
            Opts::new("streaming_anomalies_total", "Analytics anomaly alerts"),
            &["kind"], // high_throughput|large_payload
        )?;
        let windows_finalized_total = IntCounterVec::new(
            Opts::new("streaming_windows_finalized_total", "Finalized windows"),
            &["processor"],
        )?;
        let active_patterns =
            IntGauge::new("streaming_active_patterns", "Registered CEP patterns")?;

        registry.register(Box::new(events_sent_total.clone()))?;
        registry.register(Box::new(send_errors_total.clone()))?;
        registry.register(Box::new(events_consumed_total.clone()))?;
        registry.register(Box::new(processing_errors_total.clone()))?;
        registry.register(Box::new(deserialization_errors_total.clone()))?;
        registry.register(Box::new(pattern_matches_total.clone()))?;
        registry.register(Box::new(anomalies_total.clone()))?;
        registry.register(Box::new(windows_finalized_total.clone()))?;
        registry.register(Box::new(active_patterns.clone()))?;

        Ok(Self {
            registry,
            events_sent_total,
            send_errors_total,
            events_consumed_total,
            processing_errors_total,
            deserialization_errors_total,
            pattern_matches_total,
            anomalies_total,
            windows_finalized_total,
            active_patterns,
        })
    }

    /// Text exposition of every registered instrument
    pub fn render(&self) -> Result<String, String> {
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&mf, &mut buf).map_err(|e| e.to_string())?;
        String::from_utf8(buf).map_err(|e| e.to_string())
    }
}
