//! Partitioned append-only log broker
//!
//! [`LogBroker`] is the seam to the managed broker: topics made of partitions,
//! each partition an append-only sequence of records with monotonically
//! increasing offsets, plus committed offsets per consumer group.
//! [`BrokerClient`] builds the producer/consumer behavior on top of it.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;

pub mod client;
pub mod memory;

pub use client::{
    BrokerClient, BrokerConfig, BrokerHealth, EnvelopeHandler, RecordContext, RetryPolicy,
    SubscribeOptions,
};
pub use memory::InMemoryBroker;

/// A record as handed to the broker by the producer
#[derive(Debug, Clone)]
pub struct ProducerRecord {
    pub topic: String,
    pub partition: u32,
    pub key: String,
    pub value: Vec<u8>,
    pub headers: Vec<(String, String)>,
    /// Stable id of the producing client
    pub producer_id: String,
    /// Per `(producer, topic, partition)` sequence number, reused on retry
    pub sequence: u64,
}

/// A record as stored in a partition
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: Option<String>,
    pub value: Vec<u8>,
    pub headers: Vec<(String, String)>,
    pub appended_at: DateTime<Utc>,
}

/// Acknowledgement for an append
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    /// The append was recognized as a retry of an already stored record
    pub duplicate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicCreation {
    Created,
    AlreadyExists,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicMetadata {
    pub name: String,
    pub partitions: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrokerMetadata {
    pub broker_id: String,
    pub topics: Vec<TopicMetadata>,
}

/// Operations the pipeline needs from a partitioned log broker
#[async_trait]
pub trait LogBroker: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    /// Create a topic if absent
    async fn create_topic(&self, topic: &str, partitions: u32) -> Result<TopicCreation>;

    async fn partition_count(&self, topic: &str) -> Result<u32>;

    /// Append a record; a `(producer_id, sequence)` already stored is not written twice
    async fn append(&self, record: ProducerRecord) -> Result<RecordMetadata>;

    /// Read up to `max_records` records starting at `offset`
    async fn fetch(
        &self,
        topic: &str,
        partition: u32,
        offset: u64,
        max_records: usize,
    ) -> Result<Vec<StoredRecord>>;

    /// Offset the next appended record will receive
    async fn end_offset(&self, topic: &str, partition: u32) -> Result<u64>;

    async fn committed(&self, group: &str, topic: &str, partition: u32) -> Result<Option<u64>>;

    async fn commit(&self, group: &str, topic: &str, partition: u32, offset: u64) -> Result<()>;

    /// Resolve once a record at `offset` exists, or after `timeout`
    async fn wait_for_append(&self, topic: &str, partition: u32, offset: u64, timeout: Duration);

    async fn metadata(&self) -> Result<BrokerMetadata>;
}

/// Partition for a routing key; equal keys always map to the same partition
pub fn partition_for_key(key: &str, partitions: u32) -> u32 {
    if partitions <= 1 {
        return 0;
    }
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % partitions as u64) as u32
}
