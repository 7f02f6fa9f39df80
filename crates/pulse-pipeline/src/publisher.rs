//! Publishing seam used by the normalizer and the escalation path

use async_trait::async_trait;

use pulse_events::broker::RecordMetadata;
use pulse_events::{BrokerClient, Envelope, Topic};

#[async_trait]
pub trait EnvelopePublisher: Send + Sync {
    async fn publish(
        &self,
        topic: Topic,
        envelope: &Envelope,
        key: Option<&str>,
    ) -> pulse_events::Result<RecordMetadata>;
}

#[async_trait]
impl EnvelopePublisher for BrokerClient {
    async fn publish(
        &self,
        topic: Topic,
        envelope: &Envelope,
        key: Option<&str>,
    ) -> pulse_events::Result<RecordMetadata> {
        BrokerClient::publish(self, topic, envelope, key).await
    }
}
