//! Producer/consumer client over a [`LogBroker`]
//!
//! One client is shared by every topic processor: a single idempotent producer
//! plus any number of consumer groups, each running one task per partition.
//! Handler failures are not swallowed: the record is redelivered to the same
//! handler after a backoff and its offset is only committed once it succeeds.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{partition_for_key, LogBroker, ProducerRecord, RecordMetadata, StoredRecord, TopicCreation};
use crate::envelope::Envelope;
use crate::error::{BrokerError, Result};
use crate::topic::Topic;

/// Producer retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts for one publish, first try included
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_backoff_ms: 100,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), with up to 10% jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
        let base = (self.initial_backoff_ms as f64 * exp).min(self.max_backoff_ms as f64);
        let jitter = if base >= 10.0 {
            rand::thread_rng().gen_range(0.0..base * 0.1)
        } else {
            0.0
        };
        Duration::from_millis((base + jitter).min(self.max_backoff_ms as f64) as u64)
    }
}

/// Broker client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub client_id: String,
    pub partitions_per_topic: u32,
    /// Concurrent produce requests across all partitions
    pub max_in_flight_requests: usize,
    pub retry: RetryPolicy,
    pub fetch_max_records: usize,
    /// Upper bound on how long an idle consumer waits before polling again
    pub poll_interval_ms: u64,
    /// Redeliveries of a failing record before it is skipped; `None` retries forever
    pub max_redeliveries: Option<u32>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            client_id: "supportpulse".to_string(),
            partitions_per_topic: 3,
            max_in_flight_requests: 5,
            retry: RetryPolicy::default(),
            fetch_max_records: 100,
            poll_interval_ms: 500,
            max_redeliveries: None,
        }
    }
}

/// Where a consumed record came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordContext {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    /// 1 on first delivery, incremented on every redelivery
    pub delivery_attempt: u32,
}

/// Consumer callback. Returning an error triggers redelivery of the record.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    async fn handle(&self, envelope: Envelope, ctx: &RecordContext) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SubscribeOptions {
    /// Start at the earliest offset when the group has no committed position
    pub from_beginning: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerHealth {
    pub connected: bool,
    pub broker_id: Option<String>,
    pub topics: Vec<String>,
    pub consumers: usize,
    pub error: Option<String>,
}

struct ConsumerHandle {
    topic: Topic,
    group_id: String,
    tasks: Vec<JoinHandle<()>>,
}

#[derive(Default)]
struct ClientState {
    initialized: bool,
    /// Shutdown in progress: no new consumers, but the producer stays usable for draining handlers
    closing: bool,
    cancel: CancellationToken,
    consumers: Vec<ConsumerHandle>,
}

/// Shared producer + consumer-group runner
///
/// ```
/// use std::collections::HashMap;
/// use std::sync::Arc;
/// use pulse_events::envelope::MetricEvent;
/// use pulse_events::{BrokerClient, BrokerConfig, DomainEvent, Envelope, InMemoryBroker, Topic};
///
/// # tokio_test::block_on(async {
/// let client = BrokerClient::new(Arc::new(InMemoryBroker::new()), BrokerConfig::default());
/// client.initialize().await.unwrap();
///
/// let envelope = Envelope::new(DomainEvent::MetricRecorded(MetricEvent {
///     metric: "tickets.opened".to_string(),
///     value: 1.0,
///     dimensions: HashMap::new(),
/// }));
/// let first = client.publish(Topic::Analytics, &envelope, Some("daily")).await.unwrap();
/// let second = client.publish(Topic::Analytics, &envelope, Some("daily")).await.unwrap();
/// assert_eq!(first.partition, second.partition);
/// assert_eq!(second.offset, first.offset + 1);
///
/// client.shutdown().await.unwrap();
/// # });
/// ```
pub struct BrokerClient {
    config: BrokerConfig,
    broker: Arc<dyn LogBroker>,
    producer_id: String,
    /// Next sequence per (topic, partition); the lock also serializes sends per partition
    sequences: DashMap<(String, u32), Arc<tokio::sync::Mutex<u64>>>,
    in_flight: Semaphore,
    state: Mutex<ClientState>,
}

impl BrokerClient {
    pub fn new(broker: Arc<dyn LogBroker>, config: BrokerConfig) -> Self {
        let permits = config.max_in_flight_requests.max(1);
        Self {
            producer_id: format!("{}-{}", config.client_id, Uuid::new_v4()),
            config,
            broker,
            sequences: DashMap::new(),
            in_flight: Semaphore::new(permits),
            state: Mutex::new(ClientState::default()),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    /// Connect and provision every topic. Fails fast when the broker is unreachable.
    pub async fn initialize(&self) -> Result<()> {
        if self.is_initialized() {
            debug!("Broker client already initialized");
            return Ok(());
        }

        self.broker.connect().await?;

        for topic in Topic::ALL {
            match self
                .broker
                .create_topic(topic.name(), self.config.partitions_per_topic)
                .await?
            {
                TopicCreation::Created => info!(topic = %topic, "Provisioned topic"),
                TopicCreation::AlreadyExists => debug!(topic = %topic, "Topic already exists"),
            }
        }

        let mut state = self.state.lock();
        state.initialized = true;
        state.cancel = CancellationToken::new();
        info!(producer = %self.producer_id, "Broker client initialized");
        Ok(())
    }

    /// Publish an envelope.
    ///
    /// Key resolution: explicit `key`, then the envelope's own key, then its
    /// conversation or message id, else a generated id.
    pub async fn publish(
        &self,
        topic: Topic,
        envelope: &Envelope,
        key: Option<&str>,
    ) -> Result<RecordMetadata> {
        if !self.is_initialized() {
            return Err(BrokerError::NotInitialized);
        }

        let key = key
            .map(str::to_string)
            .or_else(|| envelope.key.clone())
            .or_else(|| envelope.routing_key().map(str::to_string))
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let partitions = self.broker.partition_count(topic.name()).await?;
        let partition = partition_for_key(&key, partitions);
        let value = envelope.to_bytes()?;

        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| BrokerError::ShutDown)?;

        let sequence_lock = self
            .sequences
            .entry((topic.name().to_string(), partition))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(0)))
            .clone();
        let mut next_sequence = sequence_lock.lock().await;

        let record = ProducerRecord {
            topic: topic.name().to_string(),
            partition,
            key: key.clone(),
            value,
            headers: envelope.headers.to_pairs(),
            producer_id: self.producer_id.clone(),
            sequence: *next_sequence,
        };

        let metadata = self.append_with_retry(record).await?;
        *next_sequence += 1;

        debug!(
            topic = %topic,
            partition = metadata.partition,
            offset = metadata.offset,
            key = %key,
            event_type = envelope.event_type(),
            "Published envelope"
        );
        Ok(metadata)
    }

    async fn append_with_retry(&self, record: ProducerRecord) -> Result<RecordMetadata> {
        let policy = &self.config.retry;
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.broker.append(record.clone()).await {
                Ok(metadata) => return Ok(metadata),
                Err(err) if err.is_retriable() && attempt < max_attempts => {
                    let delay = policy.backoff(attempt);
                    warn!(
                        topic = %record.topic,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Publish failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) if err.is_retriable() => {
                    return Err(BrokerError::RetriesExhausted {
                        topic: record.topic.clone(),
                        attempts: attempt,
                        reason: err.to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Join `group_id` on `topic` and feed every record to `handler`.
    ///
    /// Records of one partition are handled strictly one after another;
    /// partitions run concurrently.
    pub async fn subscribe(
        &self,
        topic: Topic,
        group_id: &str,
        handler: Arc<dyn EnvelopeHandler>,
        options: SubscribeOptions,
    ) -> Result<()> {
        let cancel = {
            let state = self.state.lock();
            if !state.initialized {
                return Err(BrokerError::NotInitialized);
            }
            if state.closing {
                return Err(BrokerError::ShutDown);
            }
            if state
                .consumers
                .iter()
                .any(|c| c.topic == topic && c.group_id == group_id)
            {
                return Err(BrokerError::DuplicateConsumer {
                    topic: topic.name().to_string(),
                    group: group_id.to_string(),
                });
            }
            state.cancel.clone()
        };

        let partitions = self.broker.partition_count(topic.name()).await?;
        let mut tasks = Vec::with_capacity(partitions as usize);

        for partition in 0..partitions {
            let start_offset = match self.broker.committed(group_id, topic.name(), partition).await? {
                Some(offset) => offset,
                None if options.from_beginning => 0,
                None => self.broker.end_offset(topic.name(), partition).await?,
            };

            let consumer = PartitionConsumer {
                broker: self.broker.clone(),
                handler: handler.clone(),
                topic,
                group_id: group_id.to_string(),
                partition,
                offset: start_offset,
                fetch_max_records: self.config.fetch_max_records.max(1),
                poll_interval: Duration::from_millis(self.config.poll_interval_ms.max(1)),
                retry: self.config.retry.clone(),
                max_redeliveries: self.config.max_redeliveries,
                cancel: cancel.child_token(),
            };
            tasks.push(tokio::spawn(consumer.run()));
        }

        info!(topic = %topic, group = group_id, partitions, "Consumer group joined");
        self.state.lock().consumers.push(ConsumerHandle {
            topic,
            group_id: group_id.to_string(),
            tasks,
        });
        Ok(())
    }

    pub async fn health_check(&self) -> BrokerHealth {
        let consumers = self.state.lock().consumers.len();
        if !self.is_initialized() {
            return BrokerHealth {
                connected: false,
                broker_id: None,
                topics: Vec::new(),
                consumers,
                error: Some("not initialized".to_string()),
            };
        }

        match self.broker.metadata().await {
            Ok(metadata) => BrokerHealth {
                connected: true,
                broker_id: Some(metadata.broker_id),
                topics: metadata.topics.into_iter().map(|t| t.name).collect(),
                consumers,
                error: None,
            },
            Err(err) => BrokerHealth {
                connected: false,
                broker_id: None,
                topics: Vec::new(),
                consumers,
                error: Some(err.to_string()),
            },
        }
    }

    /// Stop consumers (letting in-flight handlers finish), then disconnect.
    ///
    /// Handlers still running during the drain can publish; the producer is
    /// only closed once every consumer task has returned. Calling it again,
    /// or before `initialize`, does nothing.
    pub async fn shutdown(&self) -> Result<()> {
        let consumers = {
            let mut state = self.state.lock();
            if !state.initialized || state.closing {
                return Ok(());
            }
            state.closing = true;
            state.cancel.cancel();
            std::mem::take(&mut state.consumers)
        };

        for consumer in consumers {
            for task in consumer.tasks {
                if let Err(e) = task.await {
                    error!(topic = %consumer.topic, group = %consumer.group_id, "Consumer task failed: {}", e);
                }
            }
            debug!(topic = %consumer.topic, group = %consumer.group_id, "Consumer stopped");
        }

        {
            let mut state = self.state.lock();
            state.initialized = false;
            state.closing = false;
        }
        self.broker.disconnect().await?;
        info!(producer = %self.producer_id, "Broker client shut down");
        Ok(())
    }
}

struct PartitionConsumer {
    broker: Arc<dyn LogBroker>,
    handler: Arc<dyn EnvelopeHandler>,
    topic: Topic,
    group_id: String,
    partition: u32,
    offset: u64,
    fetch_max_records: usize,
    poll_interval: Duration,
    retry: RetryPolicy,
    max_redeliveries: Option<u32>,
    cancel: CancellationToken,
}

impl PartitionConsumer {
    async fn run(mut self) {
        debug!(topic = %self.topic, group = %self.group_id, partition = self.partition, offset = self.offset, "Partition consumer started");

        'poll: loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let batch = match self
                .broker
                .fetch(self.topic.name(), self.partition, self.offset, self.fetch_max_records)
                .await
            {
                Ok(batch) => batch,
                Err(err) => {
                    warn!(topic = %self.topic, partition = self.partition, error = %err, "Fetch failed");
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => continue,
                    }
                }
            };

            if batch.is_empty() {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = self.broker.wait_for_append(self.topic.name(), self.partition, self.offset, self.poll_interval) => {}
                }
                continue;
            }

            for record in batch {
                if self.cancel.is_cancelled() {
                    break 'poll;
                }
                if !self.deliver(&record).await {
                    // Cancelled while waiting to redeliver; the offset stays uncommitted
                    break 'poll;
                }

                self.offset = record.offset + 1;
                if let Err(err) = self
                    .broker
                    .commit(&self.group_id, self.topic.name(), self.partition, self.offset)
                    .await
                {
                    warn!(topic = %self.topic, partition = self.partition, error = %err, "Offset commit failed");
                }
            }
        }

        debug!(topic = %self.topic, group = %self.group_id, partition = self.partition, "Partition consumer stopped");
    }

    /// Hand one record to the handler until it succeeds or is given up on.
    /// Records that do not decode are skipped without reaching the handler.
    /// Returns `false` if cancelled between attempts.
    async fn deliver(&self, record: &StoredRecord) -> bool {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let ctx = RecordContext {
                topic: self.topic.name().to_string(),
                partition: self.partition,
                offset: record.offset,
                delivery_attempt: attempt,
            };

            let envelope = match Envelope::from_record(&record.value, record.key.clone(), &record.headers) {
                Ok(envelope) => envelope,
                Err(err) => {
                    // Decoding is deterministic, so redelivery would pin the partition
                    error!(
                        topic = %self.topic,
                        partition = self.partition,
                        offset = record.offset,
                        error = %err,
                        "Skipping undecodable record"
                    );
                    return true;
                }
            };
            let outcome = self.handler.handle(envelope, &ctx).await;

            let err = match outcome {
                Ok(()) => return true,
                Err(err) => err,
            };

            if let Some(max) = self.max_redeliveries {
                if attempt > max {
                    error!(
                        topic = %self.topic,
                        partition = self.partition,
                        offset = record.offset,
                        attempts = attempt,
                        error = %err,
                        "Giving up on record after repeated handler failures"
                    );
                    return true;
                }
            }

            let delay = self.retry.backoff(attempt);
            warn!(
                topic = %self.topic,
                partition = self.partition,
                offset = record.offset,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Handler failed, record will be redelivered"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            multiplier: 2.0,
        };

        let first = policy.backoff(1);
        let third = policy.backoff(3);
        assert!(first >= Duration::from_millis(100) && first < Duration::from_millis(111));
        assert!(third >= Duration::from_millis(400) && third < Duration::from_millis(441));
        assert_eq!(policy.backoff(10), Duration::from_millis(1_000));
    }

    #[test]
    fn test_default_config() {
        let config = BrokerConfig::default();
        assert_eq!(config.partitions_per_topic, 3);
        assert_eq!(config.max_in_flight_requests, 5);
        assert!(config.max_redeliveries.is_none());
    }
}
