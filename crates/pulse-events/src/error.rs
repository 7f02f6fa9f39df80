//! Error types for envelopes and the broker client

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    #[error("Envelope serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Missing record header: {0}")]
    MissingHeader(&'static str),
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Broker unreachable: {0}")]
    Unreachable(String),

    #[error("Broker client is not initialized")]
    NotInitialized,

    #[error("Broker client has been shut down")]
    ShutDown,

    #[error("Consumer group {group} is already subscribed to {topic}")]
    DuplicateConsumer { topic: String, group: String },

    #[error("Topic does not exist: {0}")]
    TopicNotFound(String),

    #[error("Partition {partition} out of range for topic {topic}")]
    InvalidPartition { topic: String, partition: u32 },

    /// Retriable failure (leader change, timeout); the producer retries these
    #[error("Transient broker failure: {0}")]
    Transient(String),

    #[error("Publish to {topic} failed after {attempts} attempts: {reason}")]
    RetriesExhausted {
        topic: String,
        attempts: u32,
        reason: String,
    },

    #[error(transparent)]
    Event(#[from] EventError),
}

impl BrokerError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, BrokerError::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
