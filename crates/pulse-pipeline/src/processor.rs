//! Event processor lifecycle
//!
//! Owns one [`TopicProcessor`] per topic and runs them on a shared
//! [`BrokerClient`]. Constructed once per process and passed to whatever needs it.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use pulse_events::broker::BrokerHealth;
use pulse_events::{BrokerClient, EnvelopeHandler, SubscribeOptions, Topic};

use crate::error::Result;
use crate::processors::{build_processor, ProcessorContext, ProcessorStatus, TopicProcessor};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessorHealth {
    pub healthy: bool,
    pub running: bool,
    pub broker: BrokerHealth,
    pub processors: Vec<ProcessorStatus>,
}

pub struct EventProcessor {
    client: Arc<BrokerClient>,
    processors: Vec<Arc<TopicProcessor>>,
    running: Mutex<bool>,
    /// Serializes start/stop
    lifecycle: tokio::sync::Mutex<()>,
}

impl EventProcessor {
    pub fn new(client: Arc<BrokerClient>, ctx: Arc<ProcessorContext>) -> Self {
        let processors = Topic::ALL
            .iter()
            .map(|topic| Arc::new(build_processor(*topic, ctx.clone())))
            .collect();

        Self {
            client,
            processors,
            running: Mutex::new(false),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn client(&self) -> &Arc<BrokerClient> {
        &self.client
    }

    pub fn is_running(&self) -> bool {
        *self.running.lock()
    }

    /// Initialize the broker client and join one consumer group per topic.
    /// A second call while running does nothing.
    pub async fn start(&self, from_beginning: bool) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if self.is_running() {
            info!("Event processor already running");
            return Ok(());
        }

        self.client.initialize().await?;

        let options = SubscribeOptions { from_beginning };
        for processor in &self.processors {
            let handler: Arc<dyn EnvelopeHandler> = processor.clone();
            if let Err(e) = self
                .client
                .subscribe(processor.topic(), processor.group_id(), handler, options)
                .await
            {
                warn!(topic = %processor.topic(), "Subscribe failed, rolling back: {}", e);
                self.client.shutdown().await?;
                return Err(e.into());
            }
        }

        *self.running.lock() = true;
        info!(processors = self.processors.len(), "Event processor started");
        Ok(())
    }

    /// Drain in-flight handlers, stop consumers, then the producer.
    /// Does nothing when not running.
    pub async fn stop(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if !self.is_running() {
            return Ok(());
        }

        *self.running.lock() = false;
        self.client.shutdown().await?;
        info!("Event processor stopped");
        Ok(())
    }

    pub async fn health(&self) -> ProcessorHealth {
        let running = self.is_running();
        let broker = self.client.health_check().await;
        ProcessorHealth {
            healthy: running && broker.connected,
            running,
            broker,
            processors: self.processors.iter().map(|p| p.status()).collect(),
        }
    }
}
