use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use pulse_events::envelope::MessageEvent;
use pulse_events::live::{MessagePayload, SuggestionPayload};
use pulse_events::{DomainEvent, Envelope, LiveEvent, RecordContext, Topic};

use super::{Outcome, ProcessorContext, TopicHandler};

/// Forwards new messages and suggestions, and runs the escalation rule on every message.
///
/// The message is forwarded before the alert is published. When that publish
/// fails the record is redelivered and forwarded again, so live subscribers can
/// see the same `messageAdded` id twice; the alert itself is raised once.
pub struct MessageProcessor {
    ctx: Arc<ProcessorContext>,
}

impl MessageProcessor {
    pub fn new(ctx: Arc<ProcessorContext>) -> Self {
        Self { ctx }
    }

    async fn escalate(&self, message: &MessageEvent) -> anyhow::Result<()> {
        let Some(alert) = self.ctx.escalation.alert_for(message) else {
            return Ok(());
        };

        if !self.ctx.ledger.claim(&message.message_id) {
            debug!(message = %message.message_id, "Alert already raised for message");
            return Ok(());
        }

        if let Err(e) = self
            .ctx
            .publisher
            .publish(Topic::Sentiment, &alert, Some(&message.conversation_id))
            .await
        {
            // Let the redelivery try again
            self.ctx.ledger.release(&message.message_id);
            return Err(e.into());
        }

        info!(
            conversation = %message.conversation_id,
            message = %message.message_id,
            score = message.sentiment_score,
            "Raised sentiment alert"
        );
        Ok(())
    }
}

#[async_trait]
impl TopicHandler for MessageProcessor {
    fn topic(&self) -> Topic {
        Topic::Message
    }

    async fn process(&self, envelope: Envelope, _record: &RecordContext) -> anyhow::Result<Outcome> {
        match envelope.event {
            DomainEvent::MessageCreated(message) => {
                let receivers = self.ctx.sink.publish(LiveEvent::MessageAdded(MessagePayload {
                    id: message.message_id.clone(),
                    conversation_id: message.conversation_id.clone(),
                    content: message.content.clone(),
                    sender: message.sender,
                    sentiment_score: message.sentiment_score,
                    created_at: envelope.timestamp,
                }));

                self.escalate(&message).await?;
                Ok(Outcome::Delivered(receivers))
            }
            DomainEvent::ResponseSuggested(suggestion) => {
                let receivers = self
                    .ctx
                    .sink
                    .publish(LiveEvent::ResponseSuggested(SuggestionPayload {
                        conversation_id: suggestion.conversation_id,
                        message_id: suggestion.message_id,
                        suggestions: suggestion.suggestions,
                        confidence: suggestion.confidence,
                    }));
                Ok(Outcome::Delivered(receivers))
            }
            _ => Ok(Outcome::Dropped("not a message event")),
        }
    }
}
