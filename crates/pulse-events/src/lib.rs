//! # pulse-events
//!
//! Shared vocabulary and transport for the supportpulse pipeline:
//!
//! - [`topic`]: the fixed topic registry
//! - [`envelope`]: typed event envelopes and their JSON wire format
//! - [`broker`]: the partitioned-log seam, an in-process log, and the
//!   producer/consumer [`BrokerClient`]
//! - [`live`]: processed events handed to the subscription fan-out

pub mod broker;
pub mod envelope;
pub mod error;
pub mod live;
pub mod topic;

pub use broker::{
    BrokerClient, BrokerConfig, BrokerHealth, EnvelopeHandler, InMemoryBroker, LogBroker,
    RecordContext, RetryPolicy, SubscribeOptions,
};
pub use envelope::{DomainEvent, Envelope, EventHeaders};
pub use error::{BrokerError, EventError, Result};
pub use live::{LiveEvent, LiveEventKind, LiveEventSink};
pub use topic::Topic;
