//! Persistence collaborator
//!
//! The relational layer lives outside the pipeline; processors only need the
//! handful of lookups and writes in [`SupportStore`]. [`InMemoryStore`] backs
//! single-node deployments and tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use pulse_events::envelope::ConversationEvent;
use pulse_events::live::ConversationPayload;

use crate::error::StoreError;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Authoritative conversation row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    pub id: String,
    pub customer_id: Option<String>,
    pub agent_id: Option<String>,
    pub status: String,
    pub subject: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationRecord {
    /// New row from a creation event
    pub fn from_event(event: &ConversationEvent, at: DateTime<Utc>) -> Self {
        Self {
            id: event.conversation_id.clone(),
            customer_id: event.customer_id.clone(),
            agent_id: event.agent_id.clone(),
            status: event
                .status
                .as_ref()
                .map(|s| s.as_str().to_string())
                .unwrap_or_else(|| "OPEN".to_string()),
            subject: event.subject.clone(),
            created_at: at,
            updated_at: at,
        }
    }

    /// Overlay the fields an update event carries
    pub fn apply(&mut self, event: &ConversationEvent, at: DateTime<Utc>) {
        if let Some(customer) = &event.customer_id {
            self.customer_id = Some(customer.clone());
        }
        if let Some(agent) = &event.agent_id {
            self.agent_id = Some(agent.clone());
        }
        if let Some(status) = &event.status {
            self.status = status.as_str().to_string();
        }
        if let Some(subject) = &event.subject {
            self.subject = Some(subject.clone());
        }
        self.updated_at = at;
    }

    pub fn to_payload(&self) -> ConversationPayload {
        ConversationPayload {
            id: self.id.clone(),
            customer_id: self.customer_id.clone(),
            agent_id: self.agent_id.clone(),
            status: self.status.clone(),
            subject: self.subject.clone(),
            updated_at: self.updated_at,
        }
    }
}

/// Running averages of an agent's performance samples
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSummary {
    pub samples: u64,
    pub averages: HashMap<String, f64>,
    /// Samples that carried each metric; metric sets may differ between samples
    pub counts: HashMap<String, u64>,
}

/// Lookups and writes the processors rely on.
///
/// Implementations are called concurrently from several consumer tasks and must
/// not assume a single writer per conversation.
#[async_trait]
pub trait SupportStore: Send + Sync {
    async fn find_conversation(&self, id: &str) -> StoreResult<Option<ConversationRecord>>;

    async fn find_assigned_agent(&self, conversation_id: &str) -> StoreResult<Option<String>>;

    async fn upsert_conversation(&self, record: ConversationRecord) -> StoreResult<()>;

    async fn record_agent_performance(
        &self,
        agent_id: &str,
        metrics: &HashMap<String, f64>,
    ) -> StoreResult<PerformanceSummary>;

    async fn record_metric(
        &self,
        metric: &str,
        value: f64,
        dimensions: &HashMap<String, String>,
    ) -> StoreResult<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricTotals {
    pub count: u64,
    pub sum: f64,
}

/// DashMap-backed [`SupportStore`]
///
/// ```
/// use std::collections::HashMap;
/// use pulse_pipeline::{InMemoryStore, SupportStore};
///
/// # tokio_test::block_on(async {
/// let store = InMemoryStore::new();
/// store.record_metric("events.message_created", 1.0, &HashMap::new()).await.unwrap();
/// store.record_metric("events.message_created", 1.0, &HashMap::new()).await.unwrap();
/// assert_eq!(store.metric("events.message_created").unwrap().count, 2);
/// # });
/// ```
#[derive(Default)]
pub struct InMemoryStore {
    conversations: Arc<DashMap<String, ConversationRecord>>,
    performance: Arc<DashMap<String, PerformanceSummary>>,
    metrics: Arc<DashMap<String, MetricTotals>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn performance(&self, agent_id: &str) -> Option<PerformanceSummary> {
        self.performance.get(agent_id).map(|p| p.clone())
    }

    pub fn metric(&self, metric: &str) -> Option<MetricTotals> {
        self.metrics.get(metric).map(|m| m.clone())
    }

    pub fn conversation_count(&self) -> usize {
        self.conversations.len()
    }
}

#[async_trait]
impl SupportStore for InMemoryStore {
    async fn find_conversation(&self, id: &str) -> StoreResult<Option<ConversationRecord>> {
        Ok(self.conversations.get(id).map(|entry| entry.clone()))
    }

    async fn find_assigned_agent(&self, conversation_id: &str) -> StoreResult<Option<String>> {
        Ok(self
            .conversations
            .get(conversation_id)
            .and_then(|entry| entry.agent_id.clone()))
    }

    async fn upsert_conversation(&self, record: ConversationRecord) -> StoreResult<()> {
        debug!(conversation = %record.id, status = %record.status, "Upserting conversation");
        self.conversations.insert(record.id.clone(), record);
        Ok(())
    }

    async fn record_agent_performance(
        &self,
        agent_id: &str,
        metrics: &HashMap<String, f64>,
    ) -> StoreResult<PerformanceSummary> {
        let mut entry = self.performance.entry(agent_id.to_string()).or_default();
        let summary = entry.value_mut();

        for (name, value) in metrics {
            let count = summary.counts.entry(name.clone()).or_insert(0);
            let avg = summary.averages.entry(name.clone()).or_insert(0.0);
            let n = *count as f64;
            *avg = (*avg * n + value) / (n + 1.0);
            *count += 1;
        }
        summary.samples += 1;

        Ok(summary.clone())
    }

    async fn record_metric(
        &self,
        metric: &str,
        value: f64,
        dimensions: &HashMap<String, String>,
    ) -> StoreResult<()> {
        let mut totals = self.metrics.entry(metric.to_string()).or_default();
        totals.count += 1;
        totals.sum += value;
        debug!(metric, value, dimensions = ?dimensions, "Recorded metric");
        Ok(())
    }
}
