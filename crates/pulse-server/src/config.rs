//! Service configuration
//!
//! Every section has defaults, so an empty environment yields a runnable
//! configuration apart from the token secret.

use std::path::Path;

use serde::{Deserialize, Serialize};

use pulse_common::{load_layered, LoggingConfig};
use pulse_events::BrokerConfig;
use pulse_pipeline::{EscalationPolicy, ProcessorConfig};
use pulse_realtime::{AuthConfig, RealtimeConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Largest accepted webhook body
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:4000".to_string(),
            max_body_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PulseConfig {
    pub broker: BrokerConfig,
    pub escalation: EscalationPolicy,
    pub processors: ProcessorConfig,
    pub realtime: RealtimeConfig,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
    pub server: ServerConfig,
}

impl PulseConfig {
    /// Defaults, then `path` if given, then `PULSE__*` environment variables
    pub fn load(path: Option<&Path>) -> pulse_common::Result<Self> {
        load_layered(path)
    }

    pub fn validate(&self) -> pulse_common::Result<()> {
        if self.auth.jwt_secret.trim().is_empty() {
            return Err(pulse_common::Error::Config(
                "auth.jwt_secret must be set (PULSE__AUTH__JWT_SECRET)".to_string(),
            ));
        }
        if self.broker.partitions_per_topic == 0 {
            return Err(pulse_common::Error::Config(
                "broker.partitions_per_topic must be at least 1".to_string(),
            ));
        }
        if !(-1.0..=1.0).contains(&self.escalation.negative_threshold) {
            return Err(pulse_common::Error::Config(format!(
                "escalation.negative_threshold {} is outside -1..1",
                self.escalation.negative_threshold
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_file_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("supportpulse.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[broker]
partitions_per_topic = 6

[escalation]
negative_threshold = -0.6

[processors]
group_prefix = "pulse-test"

[auth]
jwt_secret = "s3cret"
"#
        )
        .unwrap();

        let config = PulseConfig::load(Some(&path)).unwrap();
        assert_eq!(config.broker.partitions_per_topic, 6);
        assert_eq!(config.broker.max_in_flight_requests, 5);
        assert_eq!(config.escalation.negative_threshold, -0.6);
        assert_eq!(config.escalation.alert_escalation_risk, 0.9);
        assert_eq!(config.processors.group_prefix, "pulse-test");
        assert_eq!(config.realtime.keep_alive_secs, 15);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_secret_fails_validation() {
        let config = PulseConfig::default();
        assert!(config.validate().unwrap_err().to_string().contains("jwt_secret"));
    }
}
