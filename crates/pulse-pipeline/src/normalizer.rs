//! Webhook normalizer
//!
//! Maps provider ticket/comment webhooks onto internal envelopes. Supported
//! `eventType`s are `ticket.created`, `ticket.updated` and `comment.created`;
//! anything else is skipped.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use pulse_events::envelope::{
    ConversationEvent, ConversationStatus, MessageEvent, Sender, WebhookEvent,
};
use pulse_events::{DomainEvent, Envelope, Topic};

use crate::error::{PipelineError, Result};
use crate::publisher::EnvelopePublisher;

pub const TICKET_CREATED: &str = "ticket.created";
pub const TICKET_UPDATED: &str = "ticket.updated";
pub const COMMENT_CREATED: &str = "comment.created";

/// Stateless apart from the publisher it hands results to
pub struct WebhookNormalizer {
    publisher: Arc<dyn EnvelopePublisher>,
}

impl WebhookNormalizer {
    pub fn new(publisher: Arc<dyn EnvelopePublisher>) -> Self {
        Self { publisher }
    }

    /// Translate a webhook into its target topic and envelope.
    ///
    /// `Ok(None)` for event types this service does not handle.
    pub fn normalize(webhook: &WebhookEvent) -> Result<Option<(Topic, Envelope)>> {
        let source = webhook.source.trim().to_lowercase();
        let payload = &webhook.payload;

        let (topic, event) = match webhook.event_type.as_str() {
            TICKET_CREATED => {
                let ticket_id = required_id(webhook, payload, "id")?;
                let event = ConversationEvent {
                    conversation_id: conversation_id(&source, &ticket_id),
                    customer_id: optional_id(payload, "requester_id"),
                    agent_id: None,
                    status: Some(ConversationStatus::open()),
                    subject: optional_str(payload, "subject"),
                    metadata: provider_metadata(&source, &ticket_id),
                };
                (Topic::Conversation, DomainEvent::ConversationCreated(event))
            }
            TICKET_UPDATED => {
                let ticket_id = required_id(webhook, payload, "id")?;
                let event = ConversationEvent {
                    conversation_id: conversation_id(&source, &ticket_id),
                    customer_id: optional_id(payload, "requester_id"),
                    agent_id: optional_id(payload, "assignee_id"),
                    status: optional_str(payload, "status")
                        .map(|s| ConversationStatus::from_provider(&s)),
                    subject: optional_str(payload, "subject"),
                    metadata: provider_metadata(&source, &ticket_id),
                };
                (Topic::Conversation, DomainEvent::ConversationUpdated(event))
            }
            COMMENT_CREATED => {
                let comment_id = required_id(webhook, payload, "id")?;
                let ticket_id = required_id(webhook, payload, "ticket_id")?;
                let public = payload
                    .get("public")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);

                let mut metadata = provider_metadata(&source, &ticket_id);
                if let Some(author) = optional_id(payload, "author_id") {
                    metadata.insert("authorId".to_string(), Value::String(author));
                }

                let event = MessageEvent {
                    message_id: format!("{}-comment-{}", source, comment_id),
                    conversation_id: conversation_id(&source, &ticket_id),
                    content: optional_str(payload, "body").unwrap_or_default(),
                    sender: if public { Sender::Agent } else { Sender::Customer },
                    sentiment_score: None,
                    metadata,
                };
                (Topic::Message, DomainEvent::MessageCreated(event))
            }
            other => {
                info!(source = %source, event_type = other, "Ignoring unsupported webhook event type");
                return Ok(None);
            }
        };

        let envelope = Envelope::new(event).with_source(source);
        Ok(Some((topic, envelope)))
    }

    /// Normalize and publish. Returns whether anything was published.
    pub async fn process(&self, webhook: &WebhookEvent) -> Result<bool> {
        let Some((topic, envelope)) = Self::normalize(webhook)? else {
            return Ok(false);
        };

        let metadata = self.publisher.publish(topic, &envelope, None).await?;
        debug!(
            topic = %topic,
            event_type = envelope.event_type(),
            partition = metadata.partition,
            offset = metadata.offset,
            "Published normalized webhook"
        );
        Ok(true)
    }
}

fn conversation_id(source: &str, ticket_id: &str) -> String {
    format!("{}-{}", source, ticket_id)
}

fn provider_metadata(source: &str, ticket_id: &str) -> HashMap<String, Value> {
    HashMap::from([
        ("provider".to_string(), Value::String(source.to_string())),
        ("ticketId".to_string(), Value::String(ticket_id.to_string())),
    ])
}

/// Provider ids arrive as numbers or strings
fn id_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn optional_id(payload: &Value, field: &str) -> Option<String> {
    payload.get(field).and_then(id_value)
}

fn required_id(webhook: &WebhookEvent, payload: &Value, field: &str) -> Result<String> {
    optional_id(payload, field).ok_or_else(|| PipelineError::MalformedWebhook {
        event_type: webhook.event_type.clone(),
        reason: format!("missing `{}`", field),
    })
}

fn optional_str(payload: &Value, field: &str) -> Option<String> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn webhook(event_type: &str, payload: Value) -> WebhookEvent {
        WebhookEvent {
            source: "zendesk".to_string(),
            event_type: event_type.to_string(),
            payload,
        }
    }

    #[test]
    fn test_ticket_created() {
        let hook = webhook(
            TICKET_CREATED,
            json!({ "id": 12345, "requester_id": 67890, "subject": "Broken login" }),
        );
        let (topic, envelope) = WebhookNormalizer::normalize(&hook).unwrap().unwrap();

        assert_eq!(topic, Topic::Conversation);
        assert_eq!(envelope.headers.source, "zendesk");
        match envelope.event {
            DomainEvent::ConversationCreated(e) => {
                assert_eq!(e.conversation_id, "zendesk-12345");
                assert_eq!(e.customer_id.as_deref(), Some("67890"));
                assert_eq!(e.status, Some(ConversationStatus::open()));
                assert_eq!(e.subject.as_deref(), Some("Broken login"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_ticket_updated_carries_assignee_and_status() {
        let hook = webhook(
            TICKET_UPDATED,
            json!({ "id": "12345", "assignee_id": 42, "status": "pending" }),
        );
        let (_, envelope) = WebhookNormalizer::normalize(&hook).unwrap().unwrap();

        match envelope.event {
            DomainEvent::ConversationUpdated(e) => {
                assert_eq!(e.conversation_id, "zendesk-12345");
                assert_eq!(e.agent_id.as_deref(), Some("42"));
                assert_eq!(e.status.unwrap().as_str(), "PENDING");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_comment_sender_follows_visibility() {
        for (public, expected) in [(true, Sender::Agent), (false, Sender::Customer)] {
            let hook = webhook(
                COMMENT_CREATED,
                json!({ "id": 9, "ticket_id": 12345, "body": "On it", "public": public }),
            );
            let (topic, envelope) = WebhookNormalizer::normalize(&hook).unwrap().unwrap();

            assert_eq!(topic, Topic::Message);
            match envelope.event {
                DomainEvent::MessageCreated(e) => {
                    assert_eq!(e.sender, expected);
                    assert_eq!(e.conversation_id, "zendesk-12345");
                    assert_eq!(e.message_id, "zendesk-comment-9");
                    assert_eq!(e.content, "On it");
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[test]
    fn test_unknown_type_is_skipped() {
        let hook = webhook("user.deleted", json!({ "id": 1 }));
        assert!(WebhookNormalizer::normalize(&hook).unwrap().is_none());
    }

    #[test]
    fn test_missing_id_is_malformed() {
        let hook = webhook(TICKET_CREATED, json!({ "requester_id": 1 }));
        let err = WebhookNormalizer::normalize(&hook).unwrap_err();
        assert!(matches!(err, PipelineError::MalformedWebhook { .. }));
    }
}
