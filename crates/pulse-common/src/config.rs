//! Layered configuration loading
//!
//! Sources, lowest priority first: serde defaults on the target type, an optional
//! file (format picked from the extension, usually TOML), then environment
//! variables of the form `PULSE__SECTION__KEY`.

use std::path::Path;

use serde::de::DeserializeOwned;

use crate::errors::{Error, Result};

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "PULSE";

/// Load `T` from an optional file plus environment overrides.
///
/// `T` should carry `#[serde(default)]` so that a missing file or a partial
/// file still yields a complete configuration.
pub fn load_layered<T: DeserializeOwned>(path: Option<&Path>) -> Result<T> {
    let mut builder = config::Config::builder();

    if let Some(path) = path {
        if !path.exists() {
            return Err(Error::Config(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }
        builder = builder.add_source(config::File::from(path));
    }

    builder = builder.add_source(
        config::Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true),
    );

    let settings = builder
        .build()
        .map_err(|e| Error::Config(format!("failed to read configuration: {}", e)))?;

    settings
        .try_deserialize()
        .map_err(|e| Error::Config(format!("invalid configuration: {}", e)))
}
