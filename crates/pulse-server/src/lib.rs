//! # pulse-server
//!
//! The supportpulse service: one [`PulseService`] wiring the event log, the
//! topic processors and the realtime hub, exposed over HTTP by [`routes::router`].

pub mod cli;
pub mod config;
pub mod routes;
pub mod service;

pub use cli::Cli;
pub use config::{PulseConfig, ServerConfig};
pub use service::{PulseService, ServiceHealth};
