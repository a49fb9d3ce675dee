//! Bridge configuration loaded from a YAML file.
//!
//! Scanners are keyed by a stable id; the id is copied from the map key onto
//! each [`ScannerConfig`] after parsing so the rest of the system can pass
//! configs around by value.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const VALID_SCHEMES: [&str; 4] = ["mqtt", "mqtts", "ws", "wss"];
const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const VALID_LOG_FORMATS: [&str; 2] = ["text", "json"];

/// Errors produced while loading or validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("{0}")]
    Invalid(String),
}

/// Top-level bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mqtt: MqttConfig,

    /// Configured scanners keyed by stable id. An empty map is invalid.
    #[serde(default)]
    pub scanners: HashMap<String, ScannerConfig>,

    #[serde(default)]
    pub homeassistant: HomeAssistantConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// MQTT broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_broker_url")]
    pub broker_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default = "default_qos")]
    pub qos: u8,

    /// Keep-alive interval in seconds, at least 10.
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u64,

    #[serde(default)]
    pub insecure_skip_verify: bool,
}

fn default_broker_url() -> String {
    "mqtt://localhost:1883".to_string()
}
fn default_client_id() -> String {
    "ha-barcode-bridge".to_string()
}
fn default_qos() -> u8 {
    1
}
fn default_keep_alive() -> u64 {
    60
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_url: default_broker_url(),
            username: None,
            password: None,
            client_id: default_client_id(),
            qos: default_qos(),
            keep_alive: default_keep_alive(),
            insecure_skip_verify: false,
        }
    }
}

impl MqttConfig {
    /// True when the broker URL uses a TLS scheme (`mqtts` or `wss`).
    pub fn is_secure(&self) -> bool {
        self.broker_url.starts_with("mqtts://") || self.broker_url.starts_with("wss://")
    }
}

/// Hardware identity used to match a configured scanner to a HID device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerIdentification {
    pub vendor_id: u16,
    pub product_id: u16,

    /// Required when multiple devices share the same VID:PID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,

    /// Restrict matching to a specific USB interface. Omitted means any
    /// interface of a matching device is acceptable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<i32>,
}

/// Per-scanner configuration. Constructed once at startup, read-only after.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Stable unique id, copied from the `scanners` map key.
    #[serde(skip)]
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub identification: ScannerIdentification,

    #[serde(default)]
    pub termination_char: TerminationChar,

    #[serde(default = "default_keyboard_layout")]
    pub keyboard_layout: String,
}

fn default_keyboard_layout() -> String {
    "us".to_string()
}

impl ScannerConfig {
    /// Display name, falling back to the id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// The condition that closes a barcode besides the idle timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminationChar {
    #[default]
    Enter,
    Tab,
    None,
}

impl TerminationChar {
    /// Lenient name lookup: `enter`/`return` and `tab` map to their keys,
    /// `none` and the empty string disable the termination key, and any
    /// unrecognized name falls back to enter.
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "tab" => Self::Tab,
            "none" | "" => Self::None,
            _ => Self::Enter,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enter => "enter",
            Self::Tab => "tab",
            Self::None => "none",
        }
    }
}

/// Home Assistant discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HomeAssistantConfig {
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,

    /// Unique identifier for this bridge instance. Falls back to the host
    /// name when omitted.
    #[serde(default)]
    pub instance_id: String,
}

fn default_discovery_prefix() -> String {
    "homeassistant".to_string()
}

impl Default for HomeAssistantConfig {
    fn default() -> Self {
        Self {
            discovery_prefix: default_discovery_prefix(),
            instance_id: String::new(),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&data)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(data: &str) -> Result<Self, ConfigError> {
        let mut config: Config = serde_yaml::from_str(data)?;

        for (id, scanner) in config.scanners.iter_mut() {
            scanner.id = id.clone();
        }
        if config.homeassistant.instance_id.is_empty() {
            config.homeassistant.instance_id = fallback_instance_id();
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.validate_mqtt()?;
        self.validate_scanners()?;
        self.validate_homeassistant()?;
        self.validate_logging()
    }

    fn validate_mqtt(&self) -> Result<(), ConfigError> {
        let parsed = url::Url::parse(&self.mqtt.broker_url).map_err(|e| {
            ConfigError::Invalid(format!(
                "invalid mqtt.broker_url '{}': {e}",
                self.mqtt.broker_url
            ))
        })?;

        if !VALID_SCHEMES.contains(&parsed.scheme()) {
            return Err(ConfigError::Invalid(format!(
                "mqtt.broker_url '{}' must use one of: {}",
                self.mqtt.broker_url,
                VALID_SCHEMES.join(", ")
            )));
        }

        if self.mqtt.qos > 2 {
            return Err(ConfigError::Invalid(format!(
                "mqtt.qos must be 0, 1, or 2 (got {})",
                self.mqtt.qos
            )));
        }
        if self.mqtt.keep_alive < 10 {
            return Err(ConfigError::Invalid(format!(
                "mqtt.keep_alive must be at least 10 seconds (got {})",
                self.mqtt.keep_alive
            )));
        }
        Ok(())
    }

    fn validate_scanners(&self) -> Result<(), ConfigError> {
        if self.scanners.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one scanner must be configured".to_string(),
            ));
        }

        for (id, scanner) in &self.scanners {
            if scanner.identification.vendor_id == 0 {
                return Err(ConfigError::Invalid(format!(
                    "scanners[{id}].identification.vendor_id is required"
                )));
            }
            if scanner.identification.product_id == 0 {
                return Err(ConfigError::Invalid(format!(
                    "scanners[{id}].identification.product_id is required"
                )));
            }
        }
        Ok(())
    }

    fn validate_homeassistant(&self) -> Result<(), ConfigError> {
        if self.homeassistant.discovery_prefix.is_empty() {
            return Err(ConfigError::Invalid(
                "homeassistant.discovery_prefix is required".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_logging(&self) -> Result<(), ConfigError> {
        let level = self.logging.level.to_ascii_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "logging.level '{}' must be one of: {}",
                self.logging.level,
                VALID_LOG_LEVELS.join(", ")
            )));
        }

        let format = self.logging.format.to_ascii_lowercase();
        if !VALID_LOG_FORMATS.contains(&format.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "logging.format '{}' must be one of: {}",
                self.logging.format,
                VALID_LOG_FORMATS.join(", ")
            )));
        }
        Ok(())
    }
}

fn fallback_instance_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_YAML: &str = r#"
mqtt:
  broker_url: mqtt://broker.local:1883
  username: bridge
  password: secret
  client_id: test-bridge
  qos: 1
  keep_alive: 30
scanners:
  warehouse:
    name: Warehouse Scanner
    identification:
      vendor_id: 0x0c2e
      product_id: 0x0b61
      serial: "S12345"
    termination_char: enter
    keyboard_layout: us
  dock:
    identification:
      vendor_id: 0x05e0
      product_id: 0x1200
      interface: 1
    termination_char: tab
homeassistant:
  discovery_prefix: homeassistant
  instance_id: test-host
"#;

    #[test]
    fn parses_valid_config() {
        let config = Config::from_yaml(VALID_YAML).unwrap();

        assert_eq!(config.mqtt.broker_url, "mqtt://broker.local:1883");
        assert_eq!(config.mqtt.keep_alive, 30);
        assert_eq!(config.scanners.len(), 2);

        let warehouse = &config.scanners["warehouse"];
        assert_eq!(warehouse.id, "warehouse");
        assert_eq!(warehouse.display_name(), "Warehouse Scanner");
        assert_eq!(warehouse.identification.vendor_id, 0x0c2e);
        assert_eq!(warehouse.identification.serial.as_deref(), Some("S12345"));
        assert_eq!(warehouse.termination_char, TerminationChar::Enter);

        let dock = &config.scanners["dock"];
        assert_eq!(dock.display_name(), "dock");
        assert_eq!(dock.identification.interface, Some(1));
        assert_eq!(dock.termination_char, TerminationChar::Tab);
        assert_eq!(dock.keyboard_layout, "us");
    }

    #[test]
    fn applies_defaults() {
        let yaml = r#"
scanners:
  s1:
    identification:
      vendor_id: 1
      product_id: 2
"#;
        let config = Config::from_yaml(yaml).unwrap();

        assert_eq!(config.mqtt.broker_url, "mqtt://localhost:1883");
        assert_eq!(config.mqtt.client_id, "ha-barcode-bridge");
        assert_eq!(config.mqtt.qos, 1);
        assert_eq!(config.mqtt.keep_alive, 60);
        assert_eq!(config.homeassistant.discovery_prefix, "homeassistant");
        assert!(!config.homeassistant.instance_id.is_empty());
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, "text");
        assert_eq!(
            config.scanners["s1"].termination_char,
            TerminationChar::Enter
        );
    }

    #[test]
    fn rejects_empty_scanners() {
        let err = Config::from_yaml("mqtt:\n  broker_url: mqtt://localhost:1883\n").unwrap_err();
        assert!(err.to_string().contains("at least one scanner"));
    }

    #[test]
    fn rejects_invalid_scheme() {
        let yaml = r#"
mqtt:
  broker_url: http://localhost:1883
scanners:
  s1:
    identification:
      vendor_id: 1
      product_id: 2
"#;
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("must use one of"));
    }

    #[test]
    fn rejects_invalid_qos() {
        let yaml = r#"
mqtt:
  qos: 3
scanners:
  s1:
    identification:
      vendor_id: 1
      product_id: 2
"#;
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("mqtt.qos"));
    }

    #[test]
    fn rejects_short_keep_alive() {
        let yaml = r#"
mqtt:
  keep_alive: 5
scanners:
  s1:
    identification:
      vendor_id: 1
      product_id: 2
"#;
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("keep_alive"));
    }

    #[test]
    fn rejects_zero_vendor_id() {
        let yaml = r#"
scanners:
  s1:
    identification:
      vendor_id: 0
      product_id: 2
"#;
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("vendor_id"));
    }

    #[test]
    fn rejects_unknown_termination_char() {
        let yaml = r#"
scanners:
  s1:
    identification:
      vendor_id: 1
      product_id: 2
    termination_char: semicolon
"#;
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn rejects_bad_logging() {
        let yaml = r#"
scanners:
  s1:
    identification:
      vendor_id: 1
      product_id: 2
logging:
  level: loud
"#;
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("logging.level"));
    }

    #[test]
    fn is_secure_matches_scheme() {
        let cases = [
            ("mqtt://localhost:1883", false),
            ("mqtts://localhost:8883", true),
            ("ws://localhost:9001", false),
            ("wss://localhost:9002", true),
        ];
        for (input, expected) in cases {
            let mqtt = MqttConfig {
                broker_url: input.to_string(),
                ..MqttConfig::default()
            };
            assert_eq!(mqtt.is_secure(), expected, "{input}");
        }
    }

    #[test]
    fn termination_char_lenient_names() {
        assert_eq!(TerminationChar::from_name("enter"), TerminationChar::Enter);
        assert_eq!(TerminationChar::from_name("Return"), TerminationChar::Enter);
        assert_eq!(TerminationChar::from_name("tab"), TerminationChar::Tab);
        assert_eq!(TerminationChar::from_name("none"), TerminationChar::None);
        assert_eq!(TerminationChar::from_name(""), TerminationChar::None);
        assert_eq!(
            TerminationChar::from_name("semicolon"),
            TerminationChar::Enter
        );
    }
}
