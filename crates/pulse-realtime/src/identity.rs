//! Identities and token verification
//!
//! Token issuance lives elsewhere; this side only resolves a bearer credential
//! into an [`Identity`]. [`JwtTokenVerifier`] handles HS256 tokens carrying
//! `sub`, `role` and an optional `subdomain` claim.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::AuthError;

/// Caller role
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    Agent,
    Manager,
    Admin,
    Other(String),
}

impl Role {
    pub fn as_str(&self) -> &str {
        match self {
            Role::Agent => "agent",
            Role::Manager => "manager",
            Role::Admin => "admin",
            Role::Other(s) => s,
        }
    }

    /// Managers and admins see every agent's events
    pub fn is_elevated(&self) -> bool {
        matches!(self, Role::Manager | Role::Admin)
    }
}

impl From<String> for Role {
    fn from(s: String) -> Self {
        match s.trim().to_lowercase().as_str() {
            "agent" => Role::Agent,
            "manager" => Role::Manager,
            "admin" => Role::Admin,
            _ => Role::Other(s),
        }
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        role.as_str().to_string()
    }
}

impl FromStr for Role {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Role::from(s.to_string()))
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who is on the other end of a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: String,
    pub role: Role,
    /// Tenant the user belongs to
    pub subdomain: Option<String>,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            role,
            subdomain: None,
        }
    }
}

/// Resolves a bearer credential into an identity
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Token verification settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 shared secret
    pub jwt_secret: String,
    /// Expected `iss` claim, when set
    pub issuer: Option<String>,
    pub leeway_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            issuer: None,
            leeway_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    subdomain: Option<String>,
}

pub struct JwtTokenVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtTokenVerifier {
    pub fn new(config: &AuthConfig) -> Result<Self, AuthError> {
        if config.jwt_secret.is_empty() {
            return Err(AuthError::ConfigError("auth.jwt_secret is empty".to_string()));
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.leeway = config.leeway_secs;
        if let Some(issuer) = &config.issuer {
            validation.set_issuer(&[issuer.clone()]);
        }

        Ok(Self {
            decoding_key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            validation,
        })
    }
}

#[async_trait]
impl TokenVerifier for JwtTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken(e.to_string()),
            }
        })?;

        let claims = data.claims;
        debug!(user = %claims.sub, role = ?claims.role, "Verified token");
        Ok(Identity {
            user_id: claims.sub,
            role: Role::from(claims.role.unwrap_or_default()),
            subdomain: claims.subdomain,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    const SECRET: &str = "test-secret";

    fn token(claims: serde_json::Value) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn verifier(issuer: Option<&str>) -> JwtTokenVerifier {
        JwtTokenVerifier::new(&AuthConfig {
            jwt_secret: SECRET.to_string(),
            issuer: issuer.map(str::to_string),
            leeway_secs: 0,
        })
        .unwrap()
    }

    fn exp(offset_secs: i64) -> i64 {
        chrono::Utc::now().timestamp() + offset_secs
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!(Role::from("Manager".to_string()), Role::Manager);
        assert_eq!(Role::from("supervisor".to_string()), Role::Other("supervisor".to_string()));
        assert!(Role::Admin.is_elevated());
        assert!(!Role::Agent.is_elevated());
    }

    #[tokio::test]
    async fn test_valid_token() {
        let t = token(json!({ "sub": "u-1", "role": "agent", "subdomain": "acme", "exp": exp(600) }));
        let identity = verifier(None).verify(&t).await.unwrap();

        assert_eq!(identity.user_id, "u-1");
        assert_eq!(identity.role, Role::Agent);
        assert_eq!(identity.subdomain.as_deref(), Some("acme"));
    }

    #[tokio::test]
    async fn test_expired_token() {
        let t = token(json!({ "sub": "u-1", "role": "agent", "exp": exp(-600) }));
        assert!(matches!(verifier(None).verify(&t).await, Err(AuthError::TokenExpired)));
    }

    #[tokio::test]
    async fn test_wrong_secret_or_issuer() {
        let forged = encode(
            &Header::new(Algorithm::HS256),
            &json!({ "sub": "u-1", "exp": exp(600) }),
            &EncodingKey::from_secret(b"other"),
        )
        .unwrap();
        assert!(matches!(verifier(None).verify(&forged).await, Err(AuthError::InvalidToken(_))));

        let t = token(json!({ "sub": "u-1", "iss": "someone-else", "exp": exp(600) }));
        assert!(verifier(Some("supportpulse")).verify(&t).await.is_err());
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(JwtTokenVerifier::new(&AuthConfig::default()).is_err());
    }
}
