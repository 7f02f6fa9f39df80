//! Fixed topic registry

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EventError;

/// The fixed set of topics the pipeline provisions at startup.
///
/// Topics are created idempotently and never deleted at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    Conversation,
    Message,
    Sentiment,
    Agent,
    Webhook,
    Analytics,
}

impl Topic {
    pub const ALL: [Topic; 6] = [
        Topic::Conversation,
        Topic::Message,
        Topic::Sentiment,
        Topic::Agent,
        Topic::Webhook,
        Topic::Analytics,
    ];

    /// Broker-side topic name
    pub fn name(&self) -> &'static str {
        match self {
            Topic::Conversation => "conversation-events",
            Topic::Message => "message-events",
            Topic::Sentiment => "sentiment-events",
            Topic::Agent => "agent-events",
            Topic::Webhook => "webhook-events",
            Topic::Analytics => "analytics-events",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Topic {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::ALL
            .iter()
            .copied()
            .find(|t| t.name() == s)
            .ok_or_else(|| EventError::UnknownTopic(s.to_string()))
    }
}
