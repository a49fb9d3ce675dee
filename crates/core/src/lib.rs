//! Shared foundation for the ha-barcode-bridge workspace.
//!
//! This crate holds the configuration model loaded from YAML, the minimal
//! [`Service`] lifecycle capability used by the orchestrator, and the opaque
//! [`Publisher`] capability the Home Assistant integration publishes through.

pub mod config;
pub mod service;

pub use config::{
    Config, ConfigError, HomeAssistantConfig, LoggingConfig, MqttConfig, ScannerConfig,
    ScannerIdentification, TerminationChar,
};
pub use service::{PublishError, Publisher, Service};
