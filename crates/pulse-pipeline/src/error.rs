//! Pipeline error types

use thiserror::Error;

use pulse_events::BrokerError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store query failed: {0}")]
    Query(String),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Malformed {event_type} webhook: {reason}")]
    MalformedWebhook { event_type: String, reason: String },
}

pub type Result<T> = std::result::Result<T, PipelineError>;
