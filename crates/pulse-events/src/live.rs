//! Live delivery vocabulary
//!
//! Topic processors turn consumed envelopes into [`LiveEvent`]s and hand them to a
//! [`LiveEventSink`]; the subscription layer implements the sink and fans each event
//! out to matching client subscriptions.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::{AgentStatus, Sender, SentimentLabel};

/// Subscription kinds a client can open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LiveEventKind {
    MessageAdded,
    ConversationUpdated,
    SentimentAnalyzed,
    ResponseSuggested,
    AgentStatusChanged,
    ConversationAssigned,
}

impl LiveEventKind {
    pub const ALL: [LiveEventKind; 6] = [
        LiveEventKind::MessageAdded,
        LiveEventKind::ConversationUpdated,
        LiveEventKind::SentimentAnalyzed,
        LiveEventKind::ResponseSuggested,
        LiveEventKind::AgentStatusChanged,
        LiveEventKind::ConversationAssigned,
    ];

    /// Operation field name used by subscription clients
    pub fn field_name(&self) -> &'static str {
        match self {
            LiveEventKind::MessageAdded => "messageAdded",
            LiveEventKind::ConversationUpdated => "conversationUpdated",
            LiveEventKind::SentimentAnalyzed => "sentimentAnalyzed",
            LiveEventKind::ResponseSuggested => "responseSuggested",
            LiveEventKind::AgentStatusChanged => "agentStatusChanged",
            LiveEventKind::ConversationAssigned => "conversationAssigned",
        }
    }
}

impl fmt::Display for LiveEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.field_name())
    }
}

impl FromStr for LiveEventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LiveEventKind::ALL
            .iter()
            .copied()
            .find(|k| k.field_name() == s)
            .ok_or_else(|| format!("unknown subscription field: {}", s))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub id: String,
    pub conversation_id: String,
    pub content: String,
    pub sender: Sender,
    pub sentiment_score: Option<f64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationPayload {
    pub id: String,
    pub customer_id: Option<String>,
    pub agent_id: Option<String>,
    pub status: String,
    pub subject: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentimentPayload {
    pub conversation_id: String,
    pub message_id: Option<String>,
    pub sentiment: SentimentLabel,
    pub score: Option<f64>,
    pub confidence: f64,
    pub escalation_risk: Option<f64>,
    /// Assigned agent, attached for high-risk results
    pub agent_id: Option<String>,
    pub analyzed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionPayload {
    pub conversation_id: String,
    pub message_id: Option<String>,
    pub suggestions: Vec<String>,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatusPayload {
    pub agent_id: String,
    pub status: AgentStatus,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentPayload {
    pub conversation_id: String,
    pub agent_id: String,
    pub assigned_at: DateTime<Utc>,
}

/// A processed event ready for fan-out.
///
/// Serializes as `{ "<fieldName>": { ... } }`, which is the `data` object a
/// subscription client receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LiveEvent {
    MessageAdded(MessagePayload),
    ConversationUpdated(ConversationPayload),
    SentimentAnalyzed(SentimentPayload),
    ResponseSuggested(SuggestionPayload),
    AgentStatusChanged(AgentStatusPayload),
    ConversationAssigned(AssignmentPayload),
}

impl LiveEvent {
    pub fn kind(&self) -> LiveEventKind {
        match self {
            LiveEvent::MessageAdded(_) => LiveEventKind::MessageAdded,
            LiveEvent::ConversationUpdated(_) => LiveEventKind::ConversationUpdated,
            LiveEvent::SentimentAnalyzed(_) => LiveEventKind::SentimentAnalyzed,
            LiveEvent::ResponseSuggested(_) => LiveEventKind::ResponseSuggested,
            LiveEvent::AgentStatusChanged(_) => LiveEventKind::AgentStatusChanged,
            LiveEvent::ConversationAssigned(_) => LiveEventKind::ConversationAssigned,
        }
    }

    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            LiveEvent::MessageAdded(p) => Some(&p.conversation_id),
            LiveEvent::ConversationUpdated(p) => Some(&p.id),
            LiveEvent::SentimentAnalyzed(p) => Some(&p.conversation_id),
            LiveEvent::ResponseSuggested(p) => Some(&p.conversation_id),
            LiveEvent::AgentStatusChanged(_) => None,
            LiveEvent::ConversationAssigned(p) => Some(&p.conversation_id),
        }
    }

    pub fn agent_id(&self) -> Option<&str> {
        match self {
            LiveEvent::ConversationUpdated(p) => p.agent_id.as_deref(),
            LiveEvent::SentimentAnalyzed(p) => p.agent_id.as_deref(),
            LiveEvent::AgentStatusChanged(p) => Some(&p.agent_id),
            LiveEvent::ConversationAssigned(p) => Some(&p.agent_id),
            LiveEvent::MessageAdded(_) | LiveEvent::ResponseSuggested(_) => None,
        }
    }

    /// The `data` object for a subscription `next` frame
    pub fn to_data(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Destination for processed events
pub trait LiveEventSink: Send + Sync {
    /// Deliver to every matching subscriber; returns how many received it
    fn publish(&self, event: LiveEvent) -> usize;
}
