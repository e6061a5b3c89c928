use event_bus::BusError;

/// Errors raised by the streaming engine
///
/// Transport failures on the hot path are absorbed into metrics; these errors
/// surface at setup time (bad configuration) or from explicit lifecycle calls.
#[derive(Debug, thiserror::Error)]
pub enum StreamingError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid pattern '{id}': {reason}")]
    InvalidPattern { id: String, reason: String },

    #[error("invalid window configuration: {0}")]
    InvalidWindow(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("topic already registered: {0}")]
    TopicExists(String),

    #[error("consumer group already exists: {0}")]
    ConsumerExists(String),

    #[error("pattern not found: {0}")]
    PatternNotFound(String),

    #[error(transparent)]
    Bus(#[from] BusError),
}

impl StreamingError {
    pub fn invalid_pattern(id: impl Into<String>, reason: impl Into<String>) -> Self {
        StreamingError::InvalidPattern {
            id: id.into(),
            reason: reason.into(),
        }
    }
}

pub type StreamingResult<T> = Result<T, StreamingError>;
