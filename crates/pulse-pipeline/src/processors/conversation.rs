use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use pulse_events::envelope::ConversationEvent;
use pulse_events::live::AssignmentPayload;
use pulse_events::{DomainEvent, Envelope, LiveEvent, RecordContext, Topic};

use super::{Outcome, ProcessorContext, TopicHandler};
use crate::store::ConversationRecord;

/// Forwards conversation changes once the authoritative row is visible
pub struct ConversationProcessor {
    ctx: Arc<ProcessorContext>,
}

impl ConversationProcessor {
    pub fn new(ctx: Arc<ProcessorContext>) -> Self {
        Self { ctx }
    }

    async fn materialize(&self, envelope: &Envelope, event: &ConversationEvent) -> anyhow::Result<()> {
        let existing = self.ctx.store.find_conversation(&event.conversation_id).await?;
        let record = match (&envelope.event, existing) {
            (_, Some(mut record)) => {
                record.apply(event, envelope.timestamp);
                record
            }
            (DomainEvent::ConversationCreated(_), None) => {
                ConversationRecord::from_event(event, envelope.timestamp)
            }
            // Updates never create rows
            (_, None) => return Ok(()),
        };
        self.ctx.store.upsert_conversation(record).await?;
        Ok(())
    }
}

#[async_trait]
impl TopicHandler for ConversationProcessor {
    fn topic(&self) -> Topic {
        Topic::Conversation
    }

    async fn process(&self, envelope: Envelope, _record: &RecordContext) -> anyhow::Result<Outcome> {
        let event = match &envelope.event {
            DomainEvent::ConversationCreated(e) | DomainEvent::ConversationUpdated(e) => e,
            _ => return Ok(Outcome::Dropped("not a conversation event")),
        };

        if self.ctx.config.materialize_conversations {
            self.materialize(&envelope, event).await?;
        }

        let Some(record) = self.ctx.store.find_conversation(&event.conversation_id).await? else {
            debug!(conversation = %event.conversation_id, "Conversation not visible yet");
            return Ok(Outcome::Dropped("conversation not found"));
        };

        let mut receivers = self
            .ctx
            .sink
            .publish(LiveEvent::ConversationUpdated(record.to_payload()));

        if let Some(agent_id) = &event.agent_id {
            receivers += self
                .ctx
                .sink
                .publish(LiveEvent::ConversationAssigned(AssignmentPayload {
                    conversation_id: record.id.clone(),
                    agent_id: agent_id.clone(),
                    assigned_at: envelope.timestamp,
                }));
        }

        Ok(Outcome::Delivered(receivers))
    }
}
