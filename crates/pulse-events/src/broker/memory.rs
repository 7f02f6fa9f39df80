//! In-process partitioned log
//!
//! Keeps the broker contract (partitions, offsets, consumer-group commits,
//! idempotent appends) without a network hop. Used by single-node deployments
//! and by the test suites.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    BrokerMetadata, LogBroker, ProducerRecord, RecordMetadata, StoredRecord, TopicCreation,
    TopicMetadata,
};
use crate::error::{BrokerError, Result};

#[derive(Default)]
struct PartitionState {
    records: Vec<StoredRecord>,
    /// producer id -> (last sequence, offset it was stored at)
    producer_sequences: HashMap<String, (u64, u64)>,
}

#[derive(Default)]
struct PartitionLog {
    state: Mutex<PartitionState>,
    appended: Notify,
}

struct TopicLog {
    partitions: Vec<PartitionLog>,
}

impl TopicLog {
    fn new(partitions: u32) -> Self {
        Self {
            partitions: (0..partitions).map(|_| PartitionLog::default()).collect(),
        }
    }
}

/// In-memory [`LogBroker`]
pub struct InMemoryBroker {
    broker_id: String,
    connected: AtomicBool,
    topics: DashMap<String, Arc<TopicLog>>,
    /// (group, topic, partition) -> next offset to consume
    offsets: DashMap<(String, String, u32), u64>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            broker_id: format!("memory-{}", Uuid::new_v4()),
            connected: AtomicBool::new(false),
            topics: DashMap::new(),
            offsets: DashMap::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(BrokerError::Unreachable(format!(
                "{} is not connected",
                self.broker_id
            )))
        }
    }

    fn topic(&self, topic: &str) -> Result<Arc<TopicLog>> {
        self.topics
            .get(topic)
            .map(|t| t.value().clone())
            .ok_or_else(|| BrokerError::TopicNotFound(topic.to_string()))
    }

    fn with_partition<T>(
        &self,
        topic: &str,
        partition: u32,
        f: impl FnOnce(&PartitionLog) -> T,
    ) -> Result<T> {
        let log = self.topic(topic)?;
        let part = log
            .partitions
            .get(partition as usize)
            .ok_or_else(|| BrokerError::InvalidPartition {
                topic: topic.to_string(),
                partition,
            })?;
        Ok(f(part))
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LogBroker for InMemoryBroker {
    async fn connect(&self) -> Result<()> {
        if !self.connected.swap(true, Ordering::SeqCst) {
            info!(broker = %self.broker_id, "In-memory broker connected");
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if self.connected.swap(false, Ordering::SeqCst) {
            info!(broker = %self.broker_id, "In-memory broker disconnected");
        }
        Ok(())
    }

    async fn create_topic(&self, topic: &str, partitions: u32) -> Result<TopicCreation> {
        self.ensure_connected()?;
        let partitions = partitions.max(1);
        let mut created = false;
        self.topics.entry(topic.to_string()).or_insert_with(|| {
            created = true;
            Arc::new(TopicLog::new(partitions))
        });

        if created {
            debug!(topic, partitions, "Created topic");
            Ok(TopicCreation::Created)
        } else {
            Ok(TopicCreation::AlreadyExists)
        }
    }

    async fn partition_count(&self, topic: &str) -> Result<u32> {
        self.ensure_connected()?;
        Ok(self.topic(topic)?.partitions.len() as u32)
    }

    async fn append(&self, record: ProducerRecord) -> Result<RecordMetadata> {
        self.ensure_connected()?;
        let topic = record.topic.clone();
        let partition = record.partition;

        self.with_partition(&topic, partition, |log| {
            let mut state = log.state.lock();

            if let Some(&(last_seq, last_offset)) = state.producer_sequences.get(&record.producer_id) {
                if record.sequence <= last_seq {
                    debug!(
                        topic = %topic,
                        partition,
                        producer = %record.producer_id,
                        sequence = record.sequence,
                        "Dropping duplicate append"
                    );
                    return RecordMetadata {
                        topic: topic.clone(),
                        partition,
                        offset: last_offset,
                        duplicate: true,
                    };
                }
            }

            let offset = state.records.len() as u64;
            state
                .producer_sequences
                .insert(record.producer_id.clone(), (record.sequence, offset));
            state.records.push(StoredRecord {
                topic: topic.clone(),
                partition,
                offset,
                key: Some(record.key),
                value: record.value,
                headers: record.headers,
                appended_at: Utc::now(),
            });
            drop(state);
            log.appended.notify_waiters();

            RecordMetadata {
                topic: topic.clone(),
                partition,
                offset,
                duplicate: false,
            }
        })
    }

    async fn fetch(
        &self,
        topic: &str,
        partition: u32,
        offset: u64,
        max_records: usize,
    ) -> Result<Vec<StoredRecord>> {
        self.ensure_connected()?;
        self.with_partition(topic, partition, |log| {
            let state = log.state.lock();
            state
                .records
                .iter()
                .skip(offset as usize)
                .take(max_records)
                .cloned()
                .collect()
        })
    }

    async fn end_offset(&self, topic: &str, partition: u32) -> Result<u64> {
        self.ensure_connected()?;
        self.with_partition(topic, partition, |log| log.state.lock().records.len() as u64)
    }

    async fn committed(&self, group: &str, topic: &str, partition: u32) -> Result<Option<u64>> {
        self.ensure_connected()?;
        Ok(self
            .offsets
            .get(&(group.to_string(), topic.to_string(), partition))
            .map(|o| *o))
    }

    async fn commit(&self, group: &str, topic: &str, partition: u32, offset: u64) -> Result<()> {
        self.ensure_connected()?;
        self.offsets
            .insert((group.to_string(), topic.to_string(), partition), offset);
        Ok(())
    }

    async fn wait_for_append(&self, topic: &str, partition: u32, offset: u64, timeout: Duration) {
        let Ok(log) = self.topic(topic) else {
            tokio::time::sleep(timeout).await;
            return;
        };
        let Some(part) = log.partitions.get(partition as usize) else {
            tokio::time::sleep(timeout).await;
            return;
        };

        // Register before checking so an append in between is not missed
        let notified = part.appended.notified();
        if part.state.lock().records.len() as u64 > offset {
            return;
        }
        let _ = tokio::time::timeout(timeout, notified).await;
    }

    async fn metadata(&self) -> Result<BrokerMetadata> {
        self.ensure_connected()?;
        let mut topics: Vec<TopicMetadata> = self
            .topics
            .iter()
            .map(|entry| TopicMetadata {
                name: entry.key().clone(),
                partitions: entry.value().partitions.len() as u32,
            })
            .collect();
        topics.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(BrokerMetadata {
            broker_id: self.broker_id.clone(),
            topics,
        })
    }
}
