//! Connection session manager
//!
//! Binds a transport connection to an optional identity. A credential that fails
//! to verify yields an anonymous session rather than a refused connection;
//! role-gated subscriptions are rejected later, at subscribe time.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::identity::{Identity, TokenVerifier};

/// Connection-time parameter names that may carry the bearer credential
const CREDENTIAL_KEYS: [&str; 4] = ["Authorization", "authorization", "authToken", "token"];

#[derive(Debug, Clone)]
pub struct ConnectionSession {
    pub connection_id: String,
    pub identity: Option<Identity>,
    pub opened_at: DateTime<Utc>,
}

impl ConnectionSession {
    pub fn anonymous() -> Self {
        Self {
            connection_id: Uuid::new_v4().to_string(),
            identity: None,
            opened_at: Utc::now(),
        }
    }

    pub fn authenticated(identity: Identity) -> Self {
        Self {
            identity: Some(identity),
            ..Self::anonymous()
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }
}

pub struct ConnectionSessionManager {
    verifier: Arc<dyn TokenVerifier>,
}

impl ConnectionSessionManager {
    pub fn new(verifier: Arc<dyn TokenVerifier>) -> Self {
        Self { verifier }
    }

    /// Open a session from the connection parameters (the `connection_init` payload)
    pub async fn open(&self, params: &Value) -> ConnectionSession {
        let Some(token) = bearer_token(params) else {
            let session = ConnectionSession::anonymous();
            debug!(connection = %session.connection_id, "Anonymous connection");
            return session;
        };

        match self.verifier.verify(&token).await {
            Ok(identity) => {
                let session = ConnectionSession::authenticated(identity);
                if let Some(identity) = &session.identity {
                    info!(
                        connection = %session.connection_id,
                        user = %identity.user_id,
                        role = %identity.role,
                        "Authenticated connection"
                    );
                }
                session
            }
            Err(e) => {
                let session = ConnectionSession::anonymous();
                warn!(connection = %session.connection_id, "Token rejected, continuing unauthenticated: {}", e);
                session
            }
        }
    }
}

/// Pull a bearer credential out of connection parameters; the `Bearer ` prefix is optional
pub fn bearer_token(params: &Value) -> Option<String> {
    let raw = CREDENTIAL_KEYS
        .iter()
        .find_map(|key| params.get(*key).and_then(Value::as_str))?
        .trim();

    let token = match raw.split_once(char::is_whitespace) {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => rest.trim(),
        // a bare scheme with nothing after it
        None if raw.eq_ignore_ascii_case("bearer") => "",
        _ => raw,
    };

    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AuthError;
    use crate::identity::Role;
    use async_trait::async_trait;
    use serde_json::json;

    struct FixedVerifier;

    #[async_trait]
    impl TokenVerifier for FixedVerifier {
        async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
            match token {
                "good" => Ok(Identity::new("agent-1", Role::Agent)),
                _ => Err(AuthError::InvalidToken("bad signature".to_string())),
            }
        }
    }

    #[test]
    fn test_bearer_extraction() {
        assert_eq!(bearer_token(&json!({ "Authorization": "Bearer abc" })).as_deref(), Some("abc"));
        assert_eq!(bearer_token(&json!({ "authToken": "abc" })).as_deref(), Some("abc"));
        assert_eq!(bearer_token(&json!({ "token": "Bearer " })), None);
        assert_eq!(bearer_token(&json!({ "token": "Bearer" })), None);
        assert_eq!(bearer_token(&json!({ "authorization": "  bearer   xyz  " })).as_deref(), Some("xyz"));
        assert_eq!(bearer_token(&json!({})), None);
        assert_eq!(bearer_token(&Value::Null), None);
    }

    #[tokio::test]
    async fn test_open_sessions() {
        let manager = ConnectionSessionManager::new(Arc::new(FixedVerifier));

        let good = manager.open(&json!({ "authorization": "Bearer good" })).await;
        assert_eq!(good.identity.unwrap().user_id, "agent-1");

        let bad = manager.open(&json!({ "authorization": "Bearer forged" })).await;
        assert!(!bad.is_authenticated());

        let none = manager.open(&Value::Null).await;
        assert!(!none.is_authenticated());
        assert_ne!(bad.connection_id, none.connection_id);
    }
}
