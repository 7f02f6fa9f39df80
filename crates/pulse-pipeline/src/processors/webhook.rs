use std::sync::Arc;

use async_trait::async_trait;

use pulse_events::{DomainEvent, Envelope, RecordContext, Topic};

use super::{Outcome, ProcessorContext, TopicHandler};

/// Hands raw provider webhooks to the normalizer
pub struct WebhookProcessor {
    ctx: Arc<ProcessorContext>,
}

impl WebhookProcessor {
    pub fn new(ctx: Arc<ProcessorContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl TopicHandler for WebhookProcessor {
    fn topic(&self) -> Topic {
        Topic::Webhook
    }

    async fn process(&self, envelope: Envelope, _record: &RecordContext) -> anyhow::Result<Outcome> {
        let DomainEvent::ZendeskWebhook(webhook) = envelope.event else {
            return Ok(Outcome::Dropped("not a webhook event"));
        };

        if self.ctx.normalizer.process(&webhook).await? {
            Ok(Outcome::Recorded)
        } else {
            Ok(Outcome::Dropped("unsupported webhook event type"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use pulse_events::envelope::WebhookEvent;
    use serde_json::json;

    #[tokio::test]
    async fn test_ticket_is_normalized_and_published() {
        let h = harness();
        let processor = WebhookProcessor::new(h.ctx.clone());

        let hook = Envelope::new(DomainEvent::ZendeskWebhook(WebhookEvent {
            source: "zendesk".to_string(),
            event_type: "ticket.created".to_string(),
            payload: json!({ "id": 12345, "requester_id": 67890 }),
        }));
        let outcome = processor.process(hook, &record(Topic::Webhook)).await.unwrap();

        assert_eq!(outcome, Outcome::Recorded);
        let published = h.publisher.published.lock();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, Topic::Conversation);
        assert_eq!(published[0].1.routing_key(), Some("zendesk-12345"));
    }

    #[tokio::test]
    async fn test_unknown_event_type_publishes_nothing() {
        let h = harness();
        let processor = WebhookProcessor::new(h.ctx.clone());

        let hook = Envelope::new(DomainEvent::ZendeskWebhook(WebhookEvent {
            source: "zendesk".to_string(),
            event_type: "satisfaction_rating.created".to_string(),
            payload: json!({ "id": 1 }),
        }));
        let outcome = processor.process(hook, &record(Topic::Webhook)).await.unwrap();

        assert!(matches!(outcome, Outcome::Dropped(_)));
        assert!(h.publisher.published.lock().is_empty());
    }
}
