//! Command line flags

use std::path::PathBuf;

use clap::Parser;

use crate::config::PulseConfig;

#[derive(Debug, Parser)]
#[command(name = "supportpulse", version, about = "Real-time support event pipeline")]
pub struct Cli {
    /// TOML configuration file; `PULSE__SECTION__KEY` variables override it
    #[arg(short, long, env = "PULSE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Listen address, e.g. 0.0.0.0:4000
    #[arg(short, long)]
    pub bind: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    pub json_logs: bool,
}

impl Cli {
    /// Flags win over file and environment
    pub fn apply(&self, config: &mut PulseConfig) {
        if let Some(bind) = &self.bind {
            config.server.bind = bind.clone();
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if self.json_logs {
            config.logging.json = true;
        }
    }
}
