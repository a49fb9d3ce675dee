//! Discovery payload models and topic generation.
//!
//! A retained JSON message on
//! `<prefix>/sensor/<entity_id>/config` makes Home Assistant materialize a
//! sensor entity. Topic layout per entity:
//!
//! ```text
//! <prefix>/sensor/<entity_id>/config        retained discovery JSON
//! <prefix>/sensor/<entity_id>/state         sensor state
//! <prefix>/sensor/<entity_id>/availability  online/offline, retained
//! <prefix>/sensor/<entity_id>/attributes    JSON attributes
//! ```

use serde::{Deserialize, Serialize};

pub const STATUS_ONLINE: &str = "online";
pub const STATUS_OFFLINE: &str = "offline";
pub const STATUS_PARTIAL: &str = "partial";
pub const STATUS_UNKNOWN: &str = "unknown";

/// Device block of a discovery payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub identifiers: Vec<String>,
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sw_version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub via_device: Option<String>,
}

/// One entry of the `availability` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailabilityConfig {
    pub topic: String,
}

/// Discovery config for a sensor entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,

    pub unique_id: String,

    /// Base topic; `~/`-prefixed topics in this payload are relative to it.
    #[serde(rename = "~", skip_serializing_if = "Option::is_none")]
    pub base_topic: Option<String>,

    pub state_topic: String,

    #[serde(rename = "json_attributes_topic", skip_serializing_if = "Option::is_none")]
    pub attributes_topic: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub availability: Vec<AvailabilityConfig>,

    /// `"all"` requires every listed availability topic to report online.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub availability_mode: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceInfo>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub force_update: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_category: Option<String>,
}

/// The topic quadruple of one sensor entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityTopics {
    pub config: String,
    pub state: String,
    pub availability: String,
    pub attributes: String,
}

impl EntityTopics {
    pub fn for_entity(prefix: &str, entity_id: &str) -> Self {
        let base = Self::base_topic(prefix, entity_id);
        Self {
            config: format!("{base}/config"),
            state: format!("{base}/state"),
            availability: format!("{base}/availability"),
            attributes: format!("{base}/attributes"),
        }
    }

    pub fn base_topic(prefix: &str, entity_id: &str) -> String {
        format!("{prefix}/sensor/{entity_id}")
    }
}

/// Bridge device identifier: `ha-barcode-bridge-<instanceID|hostname>`.
pub fn bridge_device_id(instance_id: &str) -> String {
    if instance_id.is_empty() {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| STATUS_UNKNOWN.to_string());
        return format!("ha-barcode-bridge-{host}");
    }
    format!("ha-barcode-bridge-{instance_id}")
}

/// The bridge availability topic, doubling as the client's will topic.
pub fn bridge_availability_topic(discovery_prefix: &str, instance_id: &str) -> String {
    format!(
        "{discovery_prefix}/sensor/{}/availability",
        bridge_device_id(instance_id)
    )
}
