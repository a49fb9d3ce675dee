//! Home Assistant MQTT discovery integration.
//!
//! Binds scanner lifecycle events to broker messages: retained discovery
//! configs and availability per scanner, barcode state publishes, a bridge
//! availability topic backed by the broker's last will, and bridge-level
//! diagnostics under a tiered availability model.

pub mod discovery;
pub mod integration;

pub use discovery::{
    bridge_availability_topic, bridge_device_id, AvailabilityConfig, DeviceInfo, EntityTopics,
    SensorConfig, STATUS_OFFLINE, STATUS_ONLINE, STATUS_PARTIAL, STATUS_UNKNOWN,
};
pub use integration::{Integration, IntegrationError};
