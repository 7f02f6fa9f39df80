//! Error types for authentication and subscriptions

use thiserror::Error;

use crate::identity::Role;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Token expired")]
    TokenExpired,

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Subscribe-time rejection. Fatal to the subscription only, never the connection.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SubscribeError {
    #[error("Not authenticated")]
    Unauthenticated,

    #[error("Forbidden: requires one of [{}]", join_roles(.required))]
    Forbidden { required: Vec<Role> },

    #[error("Unsupported subscription: {0}")]
    UnknownOperation(String),
}

fn join_roles(roles: &[Role]) -> String {
    roles
        .iter()
        .map(|r| r.as_str().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
