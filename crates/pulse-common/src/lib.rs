//! # pulse-common
//!
//! Ambient infrastructure shared by every supportpulse crate:
//!
//! - [`logging`]: `tracing` subscriber setup and span context helpers
//! - [`errors`]: the common error type plus component/operation context
//! - [`config`]: layered configuration loading (TOML file + environment overrides)

pub mod config;
pub mod errors;
pub mod logging;

pub use config::{load_layered, ENV_PREFIX};
pub use errors::{Error, ErrorContext, ErrorExt, Result};
pub use logging::{setup_logging, LogContext, LoggingConfig};
