use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use pulse_events::live::SentimentPayload;
use pulse_events::{DomainEvent, Envelope, LiveEvent, RecordContext, Topic};

use super::{Outcome, ProcessorContext, TopicHandler};

/// Forwards sentiment results and alerts, attaching the assigned agent on high risk
pub struct SentimentProcessor {
    ctx: Arc<ProcessorContext>,
}

impl SentimentProcessor {
    pub fn new(ctx: Arc<ProcessorContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl TopicHandler for SentimentProcessor {
    fn topic(&self) -> Topic {
        Topic::Sentiment
    }

    async fn process(&self, envelope: Envelope, _record: &RecordContext) -> anyhow::Result<Outcome> {
        let event = match envelope.event {
            DomainEvent::SentimentAnalyzed(e) | DomainEvent::SentimentAlert(e) => e,
            _ => return Ok(Outcome::Dropped("not a sentiment event")),
        };

        let high_risk = event
            .escalation_risk
            .is_some_and(|risk| risk > self.ctx.config.high_risk_threshold);

        let agent_id = if high_risk {
            let agent = self.ctx.store.find_assigned_agent(&event.conversation_id).await?;
            warn!(
                conversation = %event.conversation_id,
                risk = event.escalation_risk,
                agent = agent.as_deref().unwrap_or("unassigned"),
                "High escalation risk"
            );
            agent
        } else {
            None
        };

        let receivers = self
            .ctx
            .sink
            .publish(LiveEvent::SentimentAnalyzed(SentimentPayload {
                conversation_id: event.conversation_id,
                message_id: event.message_id,
                sentiment: event.sentiment,
                score: event.score,
                confidence: event.confidence,
                escalation_risk: event.escalation_risk,
                agent_id,
                analyzed_at: envelope.timestamp,
            }));
        Ok(Outcome::Delivered(receivers))
    }
}
