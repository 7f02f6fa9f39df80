//! Typed event envelopes
//!
//! Every event published to the log is an [`Envelope`]: a [`DomainEvent`]
//! (one variant per `type` discriminator) plus a producer-assigned timestamp.
//! On the wire the envelope is a flat JSON object, `{ "type": ..., <fields>, "timestamp": ... }`.
//! The routing key and the tracing headers travel on the broker record, not in the body.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::EventError;

/// Default `source` header for events produced by this service
pub const DEFAULT_SOURCE: &str = "supportpulse";

pub const HEADER_EVENT_TYPE: &str = "event-type";
pub const HEADER_EVENT_ID: &str = "event-id";
pub const HEADER_SOURCE: &str = "source";

/// Who wrote a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Sender {
    Agent,
    Customer,
    System,
}

/// Coarse sentiment classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SentimentLabel {
    Positive,
    Neutral,
    Negative,
}

/// Agent availability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Online,
    Away,
    Busy,
    Offline,
}

/// Conversation status as an upper-case token (`OPEN`, `PENDING`, `SOLVED`, ...).
///
/// Provider vocabularies are open-ended, so this stays a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationStatus(String);

impl ConversationStatus {
    pub fn open() -> Self {
        Self("OPEN".to_string())
    }

    /// Normalize a provider status token by upper-casing it
    pub fn from_provider(status: &str) -> Self {
        Self(status.trim().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationEvent {
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ConversationStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEvent {
    pub message_id: String,
    pub conversation_id: String,
    #[serde(default)]
    pub content: String,
    pub sender: Sender,
    /// Sentiment score in `-1.0..=1.0`, when already computed upstream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentiment_score: Option<f64>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentimentEvent {
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub sentiment: SentimentLabel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_risk: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionEvent {
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatusEvent {
    pub agent_id: String,
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_status: Option<AgentStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentPerformanceEvent {
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Named numeric samples, e.g. `responseTimeSecs`, `csat`
    pub metrics: HashMap<String, f64>,
}

/// Raw provider webhook as received by the HTTP ingress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    pub source: String,
    pub event_type: String,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricEvent {
    pub metric: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub dimensions: HashMap<String, String>,
}

/// One variant per envelope `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DomainEvent {
    ConversationCreated(ConversationEvent),
    ConversationUpdated(ConversationEvent),
    MessageCreated(MessageEvent),
    ResponseSuggested(SuggestionEvent),
    SentimentAnalyzed(SentimentEvent),
    SentimentAlert(SentimentEvent),
    AgentStatusChanged(AgentStatusEvent),
    AgentPerformanceUpdate(AgentPerformanceEvent),
    ZendeskWebhook(WebhookEvent),
    MetricRecorded(MetricEvent),
}

impl DomainEvent {
    /// The wire discriminator, also used for the `event-type` header
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::ConversationCreated(_) => "CONVERSATION_CREATED",
            DomainEvent::ConversationUpdated(_) => "CONVERSATION_UPDATED",
            DomainEvent::MessageCreated(_) => "MESSAGE_CREATED",
            DomainEvent::ResponseSuggested(_) => "RESPONSE_SUGGESTED",
            DomainEvent::SentimentAnalyzed(_) => "SENTIMENT_ANALYZED",
            DomainEvent::SentimentAlert(_) => "SENTIMENT_ALERT",
            DomainEvent::AgentStatusChanged(_) => "AGENT_STATUS_CHANGED",
            DomainEvent::AgentPerformanceUpdate(_) => "AGENT_PERFORMANCE_UPDATE",
            DomainEvent::ZendeskWebhook(_) => "ZENDESK_WEBHOOK",
            DomainEvent::MetricRecorded(_) => "METRIC_RECORDED",
        }
    }

    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            DomainEvent::ConversationCreated(e) | DomainEvent::ConversationUpdated(e) => {
                Some(&e.conversation_id)
            }
            DomainEvent::MessageCreated(e) => Some(&e.conversation_id),
            DomainEvent::ResponseSuggested(e) => Some(&e.conversation_id),
            DomainEvent::SentimentAnalyzed(e) | DomainEvent::SentimentAlert(e) => {
                Some(&e.conversation_id)
            }
            DomainEvent::AgentPerformanceUpdate(e) => e.conversation_id.as_deref(),
            DomainEvent::AgentStatusChanged(_)
            | DomainEvent::ZendeskWebhook(_)
            | DomainEvent::MetricRecorded(_) => None,
        }
    }

    pub fn message_id(&self) -> Option<&str> {
        match self {
            DomainEvent::MessageCreated(e) => Some(&e.message_id),
            DomainEvent::ResponseSuggested(e) => e.message_id.as_deref(),
            DomainEvent::SentimentAnalyzed(e) | DomainEvent::SentimentAlert(e) => {
                e.message_id.as_deref()
            }
            _ => None,
        }
    }

    pub fn agent_id(&self) -> Option<&str> {
        match self {
            DomainEvent::ConversationCreated(e) | DomainEvent::ConversationUpdated(e) => {
                e.agent_id.as_deref()
            }
            DomainEvent::AgentStatusChanged(e) => Some(&e.agent_id),
            DomainEvent::AgentPerformanceUpdate(e) => Some(&e.agent_id),
            _ => None,
        }
    }
}

/// Tracing headers carried alongside the record value
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventHeaders {
    pub event_type: String,
    pub event_id: String,
    pub source: String,
}

impl EventHeaders {
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        vec![
            (HEADER_EVENT_TYPE.to_string(), self.event_type.clone()),
            (HEADER_EVENT_ID.to_string(), self.event_id.clone()),
            (HEADER_SOURCE.to_string(), self.source.clone()),
        ]
    }

    pub fn from_pairs(pairs: &[(String, String)]) -> Result<Self, EventError> {
        let find = |name: &'static str| {
            pairs
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
                .ok_or(EventError::MissingHeader(name))
        };

        Ok(Self {
            event_type: find(HEADER_EVENT_TYPE)?,
            event_id: find(HEADER_EVENT_ID)?,
            source: find(HEADER_SOURCE).unwrap_or_default(),
        })
    }
}

/// The unit of transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub event: DomainEvent,
    /// Producer-assigned creation time, distinct from the broker offset
    pub timestamp: DateTime<Utc>,
    /// Partition/routing key; set from the record on consume
    #[serde(skip)]
    pub key: Option<String>,
    #[serde(skip)]
    pub headers: EventHeaders,
}

impl Envelope {
    pub fn new(event: DomainEvent) -> Self {
        let headers = EventHeaders {
            event_type: event.event_type().to_string(),
            event_id: Uuid::new_v4().to_string(),
            source: DEFAULT_SOURCE.to_string(),
        };
        Self {
            event,
            timestamp: Utc::now(),
            key: None,
            headers,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.headers.source = source.into();
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn event_type(&self) -> &'static str {
        self.event.event_type()
    }

    /// Key derived from the payload: the conversation id, else the message id
    pub fn routing_key(&self) -> Option<&str> {
        self.event
            .conversation_id()
            .or_else(|| self.event.message_id())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EventError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a record value, restoring key and headers from the record
    pub fn from_record(
        value: &[u8],
        key: Option<String>,
        headers: &[(String, String)],
    ) -> Result<Self, EventError> {
        let mut envelope: Envelope = serde_json::from_slice(value)?;
        envelope.key = key;
        envelope.headers = match EventHeaders::from_pairs(headers) {
            Ok(h) => h,
            // Records written by foreign producers may lack headers; rebuild from the body
            Err(_) => EventHeaders {
                event_type: envelope.event.event_type().to_string(),
                event_id: Uuid::new_v4().to_string(),
                source: String::new(),
            },
        };
        Ok(envelope)
    }
}
