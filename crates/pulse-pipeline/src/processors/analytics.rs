use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use pulse_events::{DomainEvent, Envelope, RecordContext, Topic};

use super::{Outcome, ProcessorContext, TopicHandler};

/// Metrics recording only
pub struct AnalyticsProcessor {
    ctx: Arc<ProcessorContext>,
}

impl AnalyticsProcessor {
    pub fn new(ctx: Arc<ProcessorContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl TopicHandler for AnalyticsProcessor {
    fn topic(&self) -> Topic {
        Topic::Analytics
    }

    async fn process(&self, envelope: Envelope, _record: &RecordContext) -> anyhow::Result<Outcome> {
        match &envelope.event {
            DomainEvent::MetricRecorded(metric) => {
                self.ctx
                    .store
                    .record_metric(&metric.metric, metric.value, &metric.dimensions)
                    .await?;
            }
            // Anything else published here is counted by type
            other => {
                let dimensions = HashMap::from([("source".to_string(), envelope.headers.source.clone())]);
                self.ctx
                    .store
                    .record_metric(&format!("events.{}", other.event_type().to_lowercase()), 1.0, &dimensions)
                    .await?;
            }
        }
        Ok(Outcome::Recorded)
    }
}
