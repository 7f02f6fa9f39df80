//! Subscription registry and fan-out
//!
//! Every live subscription owns a bounded channel. Publishing walks the
//! registrations of the event's kind, evaluates each filter and `try_send`s,
//! so a slow subscriber loses events instead of stalling the processors.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use pulse_events::{LiveEvent, LiveEventKind, LiveEventSink};

use crate::error::SubscribeError;
use crate::filter::{SubscriptionArgs, SubscriptionFilter};
use crate::session::ConnectionSession;

/// Lifecycle of one subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SubscriptionState {
    /// Registered, nothing delivered yet
    Pending,
    Delivering,
    Closed,
}

struct Subscription {
    connection_id: String,
    filter: SubscriptionFilter,
    sender: mpsc::Sender<LiveEvent>,
    delivered: AtomicU64,
}

type SubscriptionMap = DashMap<String, Subscription>;

/// Unregisters its subscription when dropped
pub struct SubscriptionHandle {
    id: String,
    kind: LiveEventKind,
    subscriptions: Arc<SubscriptionMap>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> LiveEventKind {
        self.kind
    }

    pub fn unsubscribe(self) {}
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if self.subscriptions.remove(&self.id).is_some() {
            debug!(subscription = %self.id, kind = %self.kind, "Subscription closed");
        }
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// A registered subscription: drop `handle` or the receiver to end it
#[derive(Debug)]
pub struct Subscriber {
    pub handle: SubscriptionHandle,
    pub receiver: mpsc::Receiver<LiveEvent>,
}

pub struct SubscriptionRegistry {
    subscriptions: Arc<SubscriptionMap>,
    buffer: usize,
}

impl SubscriptionRegistry {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscriptions: Arc::new(DashMap::new()),
            buffer: buffer.max(1),
        }
    }

    /// Register a subscription for `session`. Role-gated kinds are checked here.
    pub fn subscribe(
        &self,
        session: &ConnectionSession,
        kind: LiveEventKind,
        args: SubscriptionArgs,
    ) -> Result<Subscriber, SubscribeError> {
        let filter = SubscriptionFilter::new(kind, session.identity.clone(), args);
        if let Err(e) = filter.authorize() {
            warn!(connection = %session.connection_id, kind = %kind, "Subscription rejected: {}", e);
            return Err(e);
        }

        let (sender, receiver) = mpsc::channel(self.buffer);
        let id = Uuid::new_v4().to_string();
        self.subscriptions.insert(
            id.clone(),
            Subscription {
                connection_id: session.connection_id.clone(),
                filter,
                sender,
                delivered: AtomicU64::new(0),
            },
        );
        debug!(connection = %session.connection_id, subscription = %id, kind = %kind, "Subscription registered");

        Ok(Subscriber {
            handle: SubscriptionHandle {
                id,
                kind,
                subscriptions: self.subscriptions.clone(),
            },
            receiver,
        })
    }

    /// Remove every subscription of a connection; returns how many were removed
    pub fn close_connection(&self, connection_id: &str) -> usize {
        let before = self.subscriptions.len();
        self.subscriptions
            .retain(|_, sub| sub.connection_id != connection_id);
        let removed = before.saturating_sub(self.subscriptions.len());
        if removed > 0 {
            info!(connection = %connection_id, removed, "Closed connection subscriptions");
        }
        removed
    }

    pub fn state(&self, subscription_id: &str) -> SubscriptionState {
        match self.subscriptions.get(subscription_id) {
            Some(sub) if sub.delivered.load(Ordering::Relaxed) > 0 => SubscriptionState::Delivering,
            Some(_) => SubscriptionState::Pending,
            None => SubscriptionState::Closed,
        }
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn count_for(&self, kind: LiveEventKind) -> usize {
        self.subscriptions
            .iter()
            .filter(|entry| entry.filter.kind == kind)
            .count()
    }
}

impl LiveEventSink for SubscriptionRegistry {
    fn publish(&self, event: LiveEvent) -> usize {
        let kind = event.kind();
        let mut delivered = 0;
        let mut closed = Vec::new();

        for entry in self.subscriptions.iter() {
            let sub = entry.value();
            if !sub.filter.accepts(&event) {
                continue;
            }
            match sub.sender.try_send(event.clone()) {
                Ok(()) => {
                    sub.delivered.fetch_add(1, Ordering::Relaxed);
                    delivered += 1;
                }
                Err(TrySendError::Full(_)) => {
                    warn!(subscription = %entry.key(), kind = %kind, "Subscriber buffer full, dropping event");
                }
                Err(TrySendError::Closed(_)) => closed.push(entry.key().clone()),
            }
        }

        // Removal must wait until the iterator's shard locks are released
        for id in closed {
            self.subscriptions.remove(&id);
            debug!(subscription = %id, "Removed subscription with closed receiver");
        }

        debug!(kind = %kind, delivered, "Published live event");
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Identity, Role};
    use chrono::Utc;
    use pulse_events::live::ConversationPayload;

    fn updated(agent: &str) -> LiveEvent {
        LiveEvent::ConversationUpdated(ConversationPayload {
            id: "c-1".to_string(),
            customer_id: None,
            agent_id: Some(agent.to_string()),
            status: "OPEN".to_string(),
            subject: None,
            updated_at: Utc::now(),
        })
    }

    fn session(user: &str, role: Role) -> ConnectionSession {
        ConnectionSession::authenticated(Identity::new(user, role))
    }

    #[tokio::test]
    async fn test_state_machine() {
        let registry = SubscriptionRegistry::new(8);
        let mut sub = registry
            .subscribe(&session("A", Role::Agent), LiveEventKind::ConversationUpdated, SubscriptionArgs::default())
            .unwrap();
        let id = sub.handle.id().to_string();

        assert_eq!(registry.state(&id), SubscriptionState::Pending);
        assert_eq!(registry.publish(updated("A")), 1);
        assert_eq!(registry.state(&id), SubscriptionState::Delivering);
        assert!(sub.receiver.recv().await.is_some());

        sub.handle.unsubscribe();
        assert_eq!(registry.state(&id), SubscriptionState::Closed);
        assert_eq!(registry.publish(updated("A")), 0);
        assert!(sub.receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_close_connection_removes_all() {
        let registry = SubscriptionRegistry::new(8);
        let manager = session("M", Role::Manager);
        let _a = registry
            .subscribe(&manager, LiveEventKind::ConversationUpdated, SubscriptionArgs::default())
            .unwrap();
        let _b = registry
            .subscribe(&manager, LiveEventKind::AgentStatusChanged, SubscriptionArgs::default())
            .unwrap();
        let other = registry
            .subscribe(&session("A", Role::Agent), LiveEventKind::MessageAdded, SubscriptionArgs::default())
            .unwrap();

        assert_eq!(registry.close_connection(&manager.connection_id), 2);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.state(other.handle.id()), SubscriptionState::Pending);
    }

    #[tokio::test]
    async fn test_full_buffer_drops_without_blocking() {
        let registry = SubscriptionRegistry::new(1);
        let mut sub = registry
            .subscribe(&session("M", Role::Admin), LiveEventKind::ConversationUpdated, SubscriptionArgs::default())
            .unwrap();

        assert_eq!(registry.publish(updated("A")), 1);
        assert_eq!(registry.publish(updated("B")), 0);
        assert_eq!(registry.len(), 1);

        match sub.receiver.recv().await {
            Some(LiveEvent::ConversationUpdated(p)) => assert_eq!(p.agent_id.as_deref(), Some("A")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_reaped() {
        let registry = SubscriptionRegistry::new(4);
        let Subscriber { handle, receiver } = registry
            .subscribe(&session("M", Role::Admin), LiveEventKind::ConversationUpdated, SubscriptionArgs::default())
            .unwrap();
        drop(receiver);

        assert_eq!(registry.publish(updated("A")), 0);
        assert_eq!(registry.state(handle.id()), SubscriptionState::Closed);
    }

    #[test]
    fn test_gated_subscribe_rejected() {
        let registry = SubscriptionRegistry::new(4);
        let anonymous = ConnectionSession::anonymous();
        let err = registry
            .subscribe(&anonymous, LiveEventKind::ResponseSuggested, SubscriptionArgs::default())
            .unwrap_err();
        assert_eq!(err, SubscribeError::Unauthenticated);
        assert!(registry.is_empty());
    }
}
