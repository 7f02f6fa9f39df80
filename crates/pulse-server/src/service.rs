//! Service wiring
//!
//! [`PulseService`] is built once in `main` and shared with the HTTP layer.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, Instrument};

use pulse_common::{ErrorExt, LogContext};
use pulse_events::broker::RecordMetadata;
use pulse_events::envelope::WebhookEvent;
use pulse_events::{BrokerClient, BrokerError, DomainEvent, Envelope, InMemoryBroker, Topic};
use pulse_pipeline::{
    EventProcessor, InMemoryStore, ProcessorContext, ProcessorHealth, SupportStore,
};
use pulse_realtime::{JwtTokenVerifier, RealtimeHub};

use crate::config::PulseConfig;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Webhook body has no event type")]
    MissingEventType,

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeStats {
    pub connections: usize,
    pub subscriptions: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealth {
    #[serde(flatten)]
    pub pipeline: ProcessorHealth,
    pub realtime: RealtimeStats,
}

pub struct PulseService {
    config: PulseConfig,
    client: Arc<BrokerClient>,
    processor: EventProcessor,
    hub: Arc<RealtimeHub>,
}

impl PulseService {
    /// Wire the bundled log, store and hub from configuration
    pub fn new(config: PulseConfig) -> pulse_common::Result<Self> {
        config.validate()?;
        Self::with_store(config, Arc::new(InMemoryStore::new()))
    }

    pub fn with_store(config: PulseConfig, store: Arc<dyn SupportStore>) -> pulse_common::Result<Self> {
        let verifier = JwtTokenVerifier::new(&config.auth).with_context("auth", "build verifier")?;
        let hub = Arc::new(RealtimeHub::new(Arc::new(verifier), config.realtime.clone()));

        let client = Arc::new(BrokerClient::new(
            Arc::new(InMemoryBroker::new()),
            config.broker.clone(),
        ));

        let ctx = Arc::new(ProcessorContext::new(
            store,
            hub.registry(),
            client.clone(),
            config.processors.clone(),
            config.escalation.clone(),
        ));
        let processor = EventProcessor::new(client.clone(), ctx);

        Ok(Self {
            config,
            client,
            processor,
            hub,
        })
    }

    pub fn config(&self) -> &PulseConfig {
        &self.config
    }

    pub fn hub(&self) -> &Arc<RealtimeHub> {
        &self.hub
    }

    pub async fn start(&self) -> pulse_common::Result<()> {
        self.processor
            .start(self.config.processors.from_beginning)
            .await
            .with_context("pipeline", "start")
    }

    pub async fn stop(&self) -> pulse_common::Result<()> {
        self.processor.stop().await.with_context("pipeline", "stop")
    }

    pub async fn health(&self) -> ServiceHealth {
        let registry = self.hub.registry();
        ServiceHealth {
            pipeline: self.processor.health().await,
            realtime: RealtimeStats {
                connections: self.hub.connection_count(),
                subscriptions: registry.len(),
            },
        }
    }

    /// Wrap a provider webhook body and put it on the webhook topic.
    ///
    /// Accepts `{ "eventType": ..., "payload": {...} }` or a provider-native body
    /// whose `type` names the event, in which case the whole body is the payload.
    pub async fn ingest_webhook(&self, source: &str, body: Value) -> Result<RecordMetadata, IngestError> {
        let event_type = ["eventType", "event_type", "type"]
            .iter()
            .find_map(|key| body.get(*key).and_then(Value::as_str))
            .map(str::to_string)
            .ok_or(IngestError::MissingEventType)?;

        let payload = match body {
            Value::Object(mut map) if map.contains_key("payload") => {
                map.remove("payload").unwrap_or(Value::Null)
            }
            other => other,
        };

        let span = LogContext::with_operation("webhook", "ingest")
            .with_field("source", source)
            .with_field("event_type", event_type.clone())
            .span();

        let source = source.trim().to_lowercase();
        let key = webhook_key(&source, &payload);
        let envelope = Envelope::new(DomainEvent::ZendeskWebhook(WebhookEvent {
            source: source.clone(),
            event_type,
            payload,
        }))
        .with_source(source);

        let metadata = self
            .client
            .publish(Topic::Webhook, &envelope, key.as_deref())
            .instrument(span)
            .await?;
        info!(partition = metadata.partition, offset = metadata.offset, "Accepted webhook");
        Ok(metadata)
    }
}

/// Webhooks about one ticket share a key so they stay in order
fn webhook_key(source: &str, payload: &Value) -> Option<String> {
    let ticket = payload.get("ticket_id").or_else(|| payload.get("id"))?;
    let id = match ticket {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    Some(format!("{}-{}", source, id))
}
