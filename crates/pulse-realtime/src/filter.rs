//! Subscription filter predicates
//!
//! A filter is plain data: the subscriber's identity and the arguments they
//! subscribed with. The fan-out layer evaluates it against every published event.

use serde::{Deserialize, Serialize};

use pulse_events::{LiveEvent, LiveEventKind};

use crate::error::SubscribeError;
use crate::identity::{Identity, Role};

const ANY_STAFF: &[Role] = &[Role::Agent, Role::Manager, Role::Admin];
const ELEVATED: &[Role] = &[Role::Manager, Role::Admin];

/// Roles allowed to open `kind`; `None` when the kind is not role-gated
pub fn required_roles(kind: LiveEventKind) -> Option<&'static [Role]> {
    match kind {
        LiveEventKind::ResponseSuggested => Some(ANY_STAFF),
        LiveEventKind::AgentStatusChanged => Some(ELEVATED),
        LiveEventKind::MessageAdded
        | LiveEventKind::ConversationUpdated
        | LiveEventKind::SentimentAnalyzed
        | LiveEventKind::ConversationAssigned => None,
    }
}

/// Arguments a client may pass with a subscription
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionArgs {
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionFilter {
    pub kind: LiveEventKind,
    pub identity: Option<Identity>,
    pub args: SubscriptionArgs,
}

impl SubscriptionFilter {
    pub fn new(kind: LiveEventKind, identity: Option<Identity>, args: SubscriptionArgs) -> Self {
        Self {
            kind,
            identity,
            args,
        }
    }

    /// Subscribe-time check for role-gated kinds
    pub fn authorize(&self) -> Result<(), SubscribeError> {
        let Some(required) = required_roles(self.kind) else {
            return Ok(());
        };
        let Some(identity) = &self.identity else {
            return Err(SubscribeError::Unauthenticated);
        };
        if required.contains(&identity.role) {
            Ok(())
        } else {
            Err(SubscribeError::Forbidden {
                required: required.to_vec(),
            })
        }
    }

    pub fn accepts(&self, event: &LiveEvent) -> bool {
        if event.kind() != self.kind {
            return false;
        }
        let Some(identity) = &self.identity else {
            return false;
        };
        if let Some(required) = required_roles(self.kind) {
            if !required.contains(&identity.role) {
                return false;
            }
        }
        if !self.matches_conversation(event) {
            return false;
        }

        match event {
            LiveEvent::ConversationUpdated(_) => {
                identity.role.is_elevated() || event.agent_id() == Some(identity.user_id.as_str())
            }
            LiveEvent::ConversationAssigned(assignment) => assignment.agent_id == identity.user_id,
            LiveEvent::MessageAdded(_)
            | LiveEvent::SentimentAnalyzed(_)
            | LiveEvent::ResponseSuggested(_)
            | LiveEvent::AgentStatusChanged(_) => true,
        }
    }

    fn matches_conversation(&self, event: &LiveEvent) -> bool {
        match (&self.args.conversation_id, event.conversation_id()) {
            (None, _) => true,
            (Some(wanted), Some(actual)) => wanted == actual,
            (Some(_), None) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pulse_events::envelope::{AgentStatus, Sender};
    use pulse_events::live::{
        AgentStatusPayload, AssignmentPayload, ConversationPayload, MessagePayload,
    };

    fn conversation(id: &str, agent: Option<&str>) -> LiveEvent {
        LiveEvent::ConversationUpdated(ConversationPayload {
            id: id.to_string(),
            customer_id: None,
            agent_id: agent.map(str::to_string),
            status: "OPEN".to_string(),
            subject: None,
            updated_at: Utc::now(),
        })
    }

    fn message(conversation: &str) -> LiveEvent {
        LiveEvent::MessageAdded(MessagePayload {
            id: "m-1".to_string(),
            conversation_id: conversation.to_string(),
            content: "hi".to_string(),
            sender: Sender::Customer,
            sentiment_score: None,
            created_at: Utc::now(),
        })
    }

    fn filter(kind: LiveEventKind, identity: Option<Identity>, conversation: Option<&str>) -> SubscriptionFilter {
        SubscriptionFilter::new(
            kind,
            identity,
            SubscriptionArgs {
                conversation_id: conversation.map(str::to_string),
            },
        )
    }

    #[test]
    fn test_agent_sees_only_own_conversations() {
        let agent = filter(LiveEventKind::ConversationUpdated, Some(Identity::new("A", Role::Agent)), None);
        assert!(agent.accepts(&conversation("c-1", Some("A"))));
        assert!(!agent.accepts(&conversation("c-2", Some("B"))));
        assert!(!agent.accepts(&conversation("c-3", None)));

        for role in [Role::Manager, Role::Admin] {
            let elevated = filter(LiveEventKind::ConversationUpdated, Some(Identity::new("M", role)), None);
            assert!(elevated.accepts(&conversation("c-2", Some("B"))));
            assert!(elevated.accepts(&conversation("c-3", None)));
        }
    }

    #[test]
    fn test_anonymous_receives_nothing() {
        let anonymous = filter(LiveEventKind::MessageAdded, None, None);
        assert!(anonymous.authorize().is_ok());
        assert!(!anonymous.accepts(&message("c-1")));
    }

    #[test]
    fn test_conversation_argument_narrows() {
        let f = filter(LiveEventKind::MessageAdded, Some(Identity::new("A", Role::Agent)), Some("c-1"));
        assert!(f.accepts(&message("c-1")));
        assert!(!f.accepts(&message("c-2")));
        assert!(!f.accepts(&conversation("c-1", Some("A"))));
    }

    #[test]
    fn test_role_gates() {
        let anonymous = filter(LiveEventKind::ResponseSuggested, None, None);
        assert_eq!(anonymous.authorize(), Err(SubscribeError::Unauthenticated));

        let agent = filter(LiveEventKind::AgentStatusChanged, Some(Identity::new("A", Role::Agent)), None);
        let err = agent.authorize().unwrap_err();
        assert_eq!(
            err,
            SubscribeError::Forbidden {
                required: vec![Role::Manager, Role::Admin]
            }
        );
        assert!(err.to_string().contains("manager, admin"));

        let manager = filter(LiveEventKind::AgentStatusChanged, Some(Identity::new("M", Role::Manager)), None);
        assert!(manager.authorize().is_ok());
        assert!(manager.accepts(&LiveEvent::AgentStatusChanged(AgentStatusPayload {
            agent_id: "A".to_string(),
            status: AgentStatus::Online,
            changed_at: Utc::now(),
        })));
    }

    #[test]
    fn test_assignment_is_identity_scoped() {
        let assigned = |agent: &str| {
            LiveEvent::ConversationAssigned(AssignmentPayload {
                conversation_id: "c-1".to_string(),
                agent_id: agent.to_string(),
                assigned_at: Utc::now(),
            })
        };
        let admin = filter(LiveEventKind::ConversationAssigned, Some(Identity::new("X", Role::Admin)), None);
        assert!(admin.accepts(&assigned("X")));
        assert!(!admin.accepts(&assigned("A")));
    }
}
