#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus unavailable: {0}")]
    Unavailable(String),
    #[error("unknown topic: {0}")]
    UnknownTopic(String),
    #[error("invalid payload on {topic}: {reason}")]
    InvalidPayload { topic: String, reason: String },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
