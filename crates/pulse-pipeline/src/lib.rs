//! # pulse-pipeline
//!
//! Application-level processing on top of the event log:
//!
//! - [`normalizer`]: provider webhooks into internal envelopes
//! - [`escalation`]: the negative-sentiment alert rule and its de-duplication ledger
//! - [`processors`]: one handler per topic
//! - [`processor`]: the [`EventProcessor`] that owns their lifecycle
//! - [`store`]: the persistence collaborator the processors read and write

pub mod error;
pub mod escalation;
pub mod normalizer;
pub mod processor;
pub mod processors;
pub mod publisher;
pub mod store;

pub use error::{PipelineError, Result, StoreError};
pub use escalation::{AlertDecision, AlertLedger, EscalationPolicy};
pub use normalizer::WebhookNormalizer;
pub use processor::{EventProcessor, ProcessorHealth};
pub use processors::{Outcome, ProcessorConfig, ProcessorContext, ProcessorStatus, TopicHandler, TopicProcessor};
pub use publisher::EnvelopePublisher;
pub use store::{ConversationRecord, InMemoryStore, PerformanceSummary, SupportStore};
