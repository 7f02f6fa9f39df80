//! Common error type and error context helpers

use std::fmt;

/// Errors raised by the shared infrastructure
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Logging error: {0}")]
    Logging(String),

    #[error("{0}")]
    Custom(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Where an error happened
#[derive(Debug, Clone)]
pub struct ErrorContext {
    /// Component where the error occurred
    pub component: String,
    /// Operation that was being performed
    pub operation: String,
    /// Additional context information
    pub details: Option<String>,
}

impl ErrorContext {
    pub fn new<S: Into<String>, T: Into<String>>(component: S, operation: T) -> Self {
        ErrorContext {
            component: component.into(),
            operation: operation.into(),
            details: None,
        }
    }

    pub fn with_details<S: Into<String>>(mut self, details: S) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "in component '{}' during operation '{}'", self.component, self.operation)?;
        if let Some(details) = &self.details {
            write!(f, " ({})", details)?;
        }
        Ok(())
    }
}

/// Extension trait for attaching an [`ErrorContext`] to a result
pub trait ErrorExt<T> {
    fn context(self, ctx: ErrorContext) -> Result<T>;

    fn with_context<S: Into<String>, U: Into<String>>(self, component: S, operation: U) -> Result<T>;
}

impl<T, E: fmt::Display> ErrorExt<T> for std::result::Result<T, E> {
    fn context(self, ctx: ErrorContext) -> Result<T> {
        self.map_err(|e| Error::Custom(format!("{} [{}]", e, ctx)))
    }

    fn with_context<S: Into<String>, U: Into<String>>(self, component: S, operation: U) -> Result<T> {
        self.context(ErrorContext::new(component, operation))
    }
}
