use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use pulse_events::live::AgentStatusPayload;
use pulse_events::{DomainEvent, Envelope, LiveEvent, RecordContext, Topic};

use super::{Outcome, ProcessorContext, TopicHandler};

/// Forwards status changes; performance samples are only aggregated
pub struct AgentProcessor {
    ctx: Arc<ProcessorContext>,
}

impl AgentProcessor {
    pub fn new(ctx: Arc<ProcessorContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl TopicHandler for AgentProcessor {
    fn topic(&self) -> Topic {
        Topic::Agent
    }

    async fn process(&self, envelope: Envelope, _record: &RecordContext) -> anyhow::Result<Outcome> {
        match envelope.event {
            DomainEvent::AgentStatusChanged(change) => {
                let receivers = self
                    .ctx
                    .sink
                    .publish(LiveEvent::AgentStatusChanged(AgentStatusPayload {
                        agent_id: change.agent_id,
                        status: change.status,
                        changed_at: envelope.timestamp,
                    }));
                Ok(Outcome::Delivered(receivers))
            }
            DomainEvent::AgentPerformanceUpdate(update) => {
                let summary = self
                    .ctx
                    .store
                    .record_agent_performance(&update.agent_id, &update.metrics)
                    .await?;
                debug!(agent = %update.agent_id, samples = summary.samples, "Aggregated performance");
                Ok(Outcome::Recorded)
            }
            _ => Ok(Outcome::Dropped("not an agent event")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use pulse_events::envelope::{AgentPerformanceEvent, AgentStatus, AgentStatusEvent};
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_performance_is_never_forwarded() {
        let h = harness();
        let processor = AgentProcessor::new(h.ctx.clone());

        let update = Envelope::new(DomainEvent::AgentPerformanceUpdate(AgentPerformanceEvent {
            agent_id: "agent-1".to_string(),
            conversation_id: None,
            metrics: HashMap::from([("csat".to_string(), 4.0)]),
        }));
        let outcome = processor.process(update, &record(Topic::Agent)).await.unwrap();

        assert_eq!(outcome, Outcome::Recorded);
        assert!(h.sink.events.lock().is_empty());
        assert_eq!(h.store.performance("agent-1").unwrap().samples, 1);
    }

    #[tokio::test]
    async fn test_status_change_is_forwarded() {
        let h = harness();
        let processor = AgentProcessor::new(h.ctx.clone());

        let change = Envelope::new(DomainEvent::AgentStatusChanged(AgentStatusEvent {
            agent_id: "agent-1".to_string(),
            status: AgentStatus::Away,
            previous_status: Some(AgentStatus::Online),
        }));
        processor.process(change, &record(Topic::Agent)).await.unwrap();

        let events = h.sink.events.lock();
        assert!(matches!(&events[0], LiveEvent::AgentStatusChanged(p) if p.status == AgentStatus::Away));
    }
}
