//! Topic processors
//!
//! One processor per topic. Each implements [`TopicHandler`] and is wrapped in a
//! [`TopicProcessor`], which is what the broker client drives: it attaches a log
//! span, keeps counters for health reporting and turns the handler's result into
//! the commit/redeliver decision.

mod agent;
mod analytics;
mod conversation;
mod message;
mod sentiment;
mod webhook;

pub use agent::AgentProcessor;
pub use analytics::AnalyticsProcessor;
pub use conversation::ConversationProcessor;
pub use message::MessageProcessor;
pub use sentiment::SentimentProcessor;
pub use webhook::WebhookProcessor;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, Instrument};

use pulse_common::LogContext;
use pulse_events::{Envelope, EnvelopeHandler, LiveEventSink, RecordContext, Topic};

use crate::escalation::{AlertLedger, EscalationPolicy};
use crate::normalizer::WebhookNormalizer;
use crate::publisher::EnvelopePublisher;
use crate::store::SupportStore;

/// Processor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Consumer groups are named `<group_prefix>-<topic name>`
    pub group_prefix: String,
    /// Start new groups at the earliest offset instead of the log end
    pub from_beginning: bool,
    /// Sentiment results above this escalation risk get the assigned agent attached
    pub high_risk_threshold: f64,
    /// Keep the store's conversation rows current from conversation events
    pub materialize_conversations: bool,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            group_prefix: "supportpulse".to_string(),
            from_beginning: false,
            high_risk_threshold: 0.7,
            materialize_conversations: true,
        }
    }
}

impl ProcessorConfig {
    pub fn group_id(&self, topic: Topic) -> String {
        format!("{}-{}", self.group_prefix, topic.name())
    }
}

/// Collaborators shared by every processor
pub struct ProcessorContext {
    pub store: Arc<dyn SupportStore>,
    pub sink: Arc<dyn LiveEventSink>,
    pub publisher: Arc<dyn EnvelopePublisher>,
    pub config: ProcessorConfig,
    pub escalation: EscalationPolicy,
    pub ledger: AlertLedger,
    pub normalizer: WebhookNormalizer,
}

impl ProcessorContext {
    pub fn new(
        store: Arc<dyn SupportStore>,
        sink: Arc<dyn LiveEventSink>,
        publisher: Arc<dyn EnvelopePublisher>,
        config: ProcessorConfig,
        escalation: EscalationPolicy,
    ) -> Self {
        Self {
            ledger: AlertLedger::from_policy(&escalation),
            normalizer: WebhookNormalizer::new(publisher.clone()),
            store,
            sink,
            publisher,
            config,
            escalation,
        }
    }
}

/// What happened to a record that was handled without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Forwarded to live subscribers; carries how many received it
    Delivered(usize),
    /// Persisted, aggregated or re-published, never forwarded
    Recorded,
    /// Expected steady-state skip (lookup miss, unsupported type)
    Dropped(&'static str),
}

/// Per-topic business logic
#[async_trait]
pub trait TopicHandler: Send + Sync {
    fn topic(&self) -> Topic;

    /// Errors propagate to the broker client, which redelivers the record
    async fn process(&self, envelope: Envelope, record: &RecordContext) -> anyhow::Result<Outcome>;
}

#[derive(Debug, Default)]
pub struct ProcessorStats {
    handled: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

/// Health snapshot of one processor
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessorStatus {
    pub topic: String,
    pub group_id: String,
    pub handled: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub failed: u64,
}

/// Broker-facing wrapper around a [`TopicHandler`]
pub struct TopicProcessor {
    handler: Box<dyn TopicHandler>,
    group_id: String,
    stats: ProcessorStats,
}

impl TopicProcessor {
    pub fn new(handler: Box<dyn TopicHandler>, group_id: String) -> Self {
        Self {
            handler,
            group_id,
            stats: ProcessorStats::default(),
        }
    }

    pub fn topic(&self) -> Topic {
        self.handler.topic()
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn status(&self) -> ProcessorStatus {
        ProcessorStatus {
            topic: self.topic().name().to_string(),
            group_id: self.group_id.clone(),
            handled: self.stats.handled.load(Ordering::Relaxed),
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl EnvelopeHandler for TopicProcessor {
    async fn handle(&self, envelope: Envelope, ctx: &RecordContext) -> anyhow::Result<()> {
        let span = LogContext::with_operation(self.topic().name(), envelope.event_type())
            .with_field("partition", ctx.partition.to_string())
            .with_field("offset", ctx.offset.to_string())
            .with_field("event_id", envelope.headers.event_id.clone())
            .span();

        let result = self.handler.process(envelope, ctx).instrument(span).await;

        match result {
            Ok(outcome) => {
                self.stats.handled.fetch_add(1, Ordering::Relaxed);
                match outcome {
                    Outcome::Delivered(receivers) => {
                        self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                        debug!(topic = %self.topic(), receivers, "Forwarded to subscribers");
                    }
                    Outcome::Recorded => {}
                    Outcome::Dropped(reason) => {
                        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                        debug!(topic = %self.topic(), offset = ctx.offset, reason, "Dropped record");
                    }
                }
                Ok(())
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    topic = %self.topic(),
                    partition = ctx.partition,
                    offset = ctx.offset,
                    attempt = ctx.delivery_attempt,
                    "Processor failed: {:#}",
                    e
                );
                Err(e)
            }
        }
    }
}

/// Build the processor for `topic`
pub fn build_processor(topic: Topic, ctx: Arc<ProcessorContext>) -> TopicProcessor {
    let group_id = ctx.config.group_id(topic);
    let handler: Box<dyn TopicHandler> = match topic {
        Topic::Conversation => Box::new(ConversationProcessor::new(ctx)),
        Topic::Message => Box::new(MessageProcessor::new(ctx)),
        Topic::Sentiment => Box::new(SentimentProcessor::new(ctx)),
        Topic::Agent => Box::new(AgentProcessor::new(ctx)),
        Topic::Webhook => Box::new(WebhookProcessor::new(ctx)),
        Topic::Analytics => Box::new(AnalyticsProcessor::new(ctx)),
    };
    TopicProcessor::new(handler, group_id)
}
