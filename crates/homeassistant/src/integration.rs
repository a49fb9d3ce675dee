//! Glue between scanner lifecycle events and broker messages.
//!
//! Scanner entities are created lazily: `add_scanner` only records the
//! configuration, and the Home Assistant device materializes when hardware
//! first connects and real device metadata is available. Availability is
//! tiered — a scanner sensor is available only while both its own topic and
//! the bridge topic report online (`availability_mode: all`), so a dead
//! bridge hides every scanner regardless of their last retained value.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use habridge_core::{HomeAssistantConfig, PublishError, Publisher, ScannerConfig, Service};
use habridge_scanner::DeviceDescriptor;

use crate::discovery::{
    bridge_availability_topic, bridge_device_id, AvailabilityConfig, DeviceInfo, EntityTopics,
    SensorConfig, STATUS_OFFLINE, STATUS_ONLINE, STATUS_PARTIAL, STATUS_UNKNOWN,
};

const BRIDGE_NAME: &str = "HA Barcode Bridge";
const BRIDGE_MODEL: &str = "https://github.com/habridge/ha-barcode-bridge";
const SCANNER_ICON: &str = "mdi:barcode-scan";
const HEALTH_ICON: &str = "mdi:heart-pulse";
const DIAGNOSTICS_ICON: &str = "mdi:stethoscope";

const STALE_AFTER_MINUTES: i64 = 5;
const DEGRADED_ERROR_COUNT: u32 = 10;
const UNSTABLE_RECONNECT_COUNT: u32 = 5;

#[derive(Debug, Error)]
pub enum IntegrationError {
    #[error("scanner {0} is not registered")]
    ScannerUnknown(String),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Health counters for one scanner, surfaced as a diagnostic sensor.
#[derive(Debug, Clone)]
struct ScannerHealth {
    last_seen: DateTime<Utc>,
    connected_at: Option<DateTime<Utc>>,
    disconnected_at: Option<DateTime<Utc>>,
    reconnect_count: u32,
    error_count: u32,
    total_scans: u64,
    last_scan_time: Option<DateTime<Utc>>,
}

impl ScannerHealth {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            last_seen: now,
            connected_at: None,
            disconnected_at: None,
            reconnect_count: 0,
            error_count: 0,
            total_scans: 0,
            last_scan_time: None,
        }
    }
}

/// A scanner as seen by Home Assistant. Created when hardware first
/// connects, so the device metadata is real.
#[derive(Debug, Clone)]
struct ScannerDevice {
    id: String,
    name: String,
    connected: bool,
    device: DeviceInfo,
    topics: EntityTopics,
    health_topics: EntityTopics,
    health: ScannerHealth,
}

#[derive(Default)]
struct IntegrationState {
    scanners: HashMap<String, ScannerDevice>,
    scanner_configs: HashMap<String, ScannerConfig>,
}

pub struct Integration {
    publisher: Arc<dyn Publisher>,
    config: HomeAssistantConfig,
    bridge_device: DeviceInfo,
    state: RwLock<IntegrationState>,
}

impl Integration {
    pub fn new(
        publisher: Arc<dyn Publisher>,
        config: HomeAssistantConfig,
        version: &str,
    ) -> Self {
        let bridge_id = bridge_device_id(&config.instance_id);
        let bridge_device = DeviceInfo {
            identifiers: vec![bridge_id],
            name: BRIDGE_NAME.to_string(),
            model: Some(BRIDGE_MODEL.to_string()),
            manufacturer: Some("ha-barcode-bridge".to_string()),
            sw_version: Some(version.to_string()),
            via_device: None,
        };

        Self {
            publisher,
            config,
            bridge_device,
            state: RwLock::new(IntegrationState::default()),
        }
    }

    fn bridge_id(&self) -> String {
        bridge_device_id(&self.config.instance_id)
    }

    /// Topic also registered as the broker client's will.
    pub fn bridge_availability_topic(&self) -> String {
        bridge_availability_topic(&self.config.discovery_prefix, &self.config.instance_id)
    }

    /// Register a scanner configuration. No broker entities are created
    /// until its hardware first connects.
    pub async fn add_scanner(&self, id: &str, name: &str, config: &ScannerConfig) {
        debug!(scanner_id = id, name, "registering scanner configuration");
        let mut state = self.state.write().await;
        state.scanner_configs.insert(id.to_string(), config.clone());
    }

    /// Create the Home Assistant device for a scanner from its connected
    /// hardware descriptor, then publish retained `offline` availability
    /// followed by the retained discovery configs. Availability must land
    /// first so the entity never materializes without an availability value.
    pub async fn set_scanner_device_info(&self, id: &str, descriptor: &DeviceDescriptor) {
        let mut state = self.state.write().await;
        if !state.scanner_configs.contains_key(id) {
            error!(scanner_id = id, "scanner config not found, cannot create device");
            return;
        }

        let display_name = display_name(id, descriptor);
        let bridge_id = self.bridge_id();
        let entity_id = format!("{bridge_id}-scanner-{id}");
        let health_entity_id = format!("{entity_id}-health");

        // Health counters survive re-registration across connection epochs.
        let previous_health = state.scanners.get(id).map(|s| s.health.clone());

        let scanner = ScannerDevice {
            id: id.to_string(),
            name: display_name.clone(),
            connected: false,
            topics: EntityTopics::for_entity(&self.config.discovery_prefix, &entity_id),
            health_topics: EntityTopics::for_entity(
                &self.config.discovery_prefix,
                &health_entity_id,
            ),
            device: DeviceInfo {
                identifiers: vec![entity_id],
                name: display_name,
                model: non_empty(&descriptor.product),
                manufacturer: non_empty(&descriptor.manufacturer),
                sw_version: None,
                via_device: Some(bridge_id),
            },
            health: previous_health.unwrap_or_else(|| ScannerHealth::new(Utc::now())),
        };

        info!(
            scanner_id = id,
            manufacturer = %descriptor.manufacturer,
            product = %descriptor.product,
            vendor_id = %format_args!("{:04x}", descriptor.vendor_id),
            product_id = %format_args!("{:04x}", descriptor.product_id),
            "created Home Assistant device for scanner"
        );

        state.scanners.insert(id.to_string(), scanner.clone());

        if self.publisher.is_connected() {
            if let Err(e) = self
                .publish_retained(&scanner.topics.availability, STATUS_OFFLINE)
                .await
            {
                error!(scanner_id = id, error = %e, "failed to publish initial availability");
            }
            if let Err(e) = self.publish_scanner_discovery(&scanner).await {
                error!(scanner_id = id, error = %e, "failed to publish discovery config");
            }
            if let Err(e) = self.publish_health_discovery(&scanner).await {
                error!(scanner_id = id, error = %e, "failed to publish health discovery config");
            }
        }
    }

    /// Flip a scanner's retained availability. On the transition to
    /// connected, a neutral `unknown` state and the attributes are emitted
    /// so stale retained state never surfaces to observers. The bridge
    /// diagnostics summary is refreshed afterwards in every case.
    pub async fn set_scanner_connected(
        &self,
        id: &str,
        connected: bool,
    ) -> Result<(), IntegrationError> {
        let mut state = self.state.write().await;
        let scanner = state
            .scanners
            .get_mut(id)
            .ok_or_else(|| IntegrationError::ScannerUnknown(id.to_string()))?;

        let now = Utc::now();
        let was_connected = scanner.connected;
        scanner.health.last_seen = now;
        if connected && !was_connected {
            scanner.health.connected_at = Some(now);
            if scanner.health.disconnected_at.is_some() {
                scanner.health.reconnect_count += 1;
            }
            scanner.health.disconnected_at = None;
        } else if !connected && was_connected {
            scanner.health.disconnected_at = Some(now);
            scanner.health.connected_at = None;
        }
        scanner.connected = connected;

        let scanner = scanner.clone();
        let scanner_config = state.scanner_configs.get(id).cloned();

        if connected && !was_connected {
            self.publish_state(&scanner.topics.state, STATUS_UNKNOWN)
                .await?;
            self.publish_scanner_attributes(&scanner, scanner_config.as_ref())
                .await?;
        }

        let availability = if connected {
            STATUS_ONLINE
        } else {
            STATUS_OFFLINE
        };
        self.publish_retained(&scanner.topics.availability, availability)
            .await?;

        if let Err(e) = self.publish_health_state(&scanner).await {
            warn!(scanner_id = id, error = %e, "failed to publish health state");
        }

        self.publish_diagnostics_state(&state).await;
        Ok(())
    }

    /// Publish a completed scan as the sensor state, with fresh attributes.
    pub async fn publish_barcode(&self, id: &str, barcode: &str) -> Result<(), IntegrationError> {
        let mut state = self.state.write().await;
        let scanner = state
            .scanners
            .get_mut(id)
            .ok_or_else(|| IntegrationError::ScannerUnknown(id.to_string()))?;

        if !self.publisher.is_connected() {
            return Err(PublishError::NotConnected.into());
        }

        let now = Utc::now();
        scanner.health.last_seen = now;
        scanner.health.last_scan_time = Some(now);
        scanner.health.total_scans += 1;

        let scanner = scanner.clone();
        let scanner_config = state.scanner_configs.get(id).cloned();
        drop(state);

        self.publish_state(&scanner.topics.state, barcode).await?;
        self.publish_scanner_attributes(&scanner, scanner_config.as_ref())
            .await?;

        if let Err(e) = self.publish_health_state(&scanner).await {
            warn!(scanner_id = id, error = %e, "failed to publish health state after scan");
        }
        Ok(())
    }

    /// Broker (re)connect: republish every retained discovery config, then
    /// bridge availability, then refresh the diagnostics summary. State
    /// values are never invented here.
    pub async fn handle_broker_connect(&self) {
        info!("MQTT connected, publishing bridge availability and discovery configs");
        let state = self.state.read().await;

        if let Err(e) = self.publish_diagnostics_discovery().await {
            error!(error = %e, "failed to publish diagnostics discovery config");
        }

        for scanner in state.scanners.values() {
            if let Err(e) = self.publish_scanner_discovery(scanner).await {
                error!(scanner_id = %scanner.id, error = %e, "failed to publish discovery config");
            }
            if let Err(e) = self.publish_health_discovery(scanner).await {
                error!(
                    scanner_id = %scanner.id,
                    error = %e,
                    "failed to publish health discovery config"
                );
            }
        }

        if let Err(e) = self
            .publish_retained(&self.bridge_availability_topic(), STATUS_ONLINE)
            .await
        {
            error!(error = %e, "failed to publish bridge availability");
        }

        self.publish_diagnostics_state(&state).await;
    }

    async fn stop_integration(&self) {
        info!("stopping Home Assistant integration");
        if !self.publisher.is_connected() {
            return;
        }

        let state = self.state.read().await;
        for (id, scanner) in &state.scanners {
            if let Err(e) = self
                .publish_retained(&scanner.topics.availability, STATUS_OFFLINE)
                .await
            {
                error!(scanner_id = id, error = %e, "failed to publish offline status");
            }
            if let Err(e) = self.publish_state(&scanner.topics.state, STATUS_UNKNOWN).await {
                error!(scanner_id = id, error = %e, "failed to publish unknown state");
            }
        }

        if let Err(e) = self
            .publish_retained(&self.bridge_availability_topic(), STATUS_OFFLINE)
            .await
        {
            error!(error = %e, "failed to publish bridge offline status");
        }

        let diagnostics_topics = self.diagnostics_topics();
        if let Err(e) = self
            .publish_state(&diagnostics_topics.state, STATUS_OFFLINE)
            .await
        {
            error!(error = %e, "failed to publish diagnostics shutdown state");
        }
    }

    // Publish helpers --------------------------------------------------

    async fn publish_retained(&self, topic: &str, payload: &str) -> Result<(), IntegrationError> {
        self.publisher.publish(topic, payload, true).await?;
        Ok(())
    }

    async fn publish_state(&self, topic: &str, payload: &str) -> Result<(), IntegrationError> {
        self.publisher.publish(topic, payload, false).await?;
        Ok(())
    }

    async fn publish_scanner_discovery(
        &self,
        scanner: &ScannerDevice,
    ) -> Result<(), IntegrationError> {
        let bridge_id = self.bridge_id();
        let entity_id = format!("{bridge_id}-scanner-{}", scanner.id);
        let sensor_name = if scanner.name.is_empty() {
            scanner.id.clone()
        } else {
            scanner.name.clone()
        };

        let config = SensorConfig {
            name: sensor_name,
            object_id: Some(format!("{}_{}", self.config.instance_id, scanner.id)),
            unique_id: entity_id.clone(),
            base_topic: Some(EntityTopics::base_topic(
                &self.config.discovery_prefix,
                &entity_id,
            )),
            state_topic: "~/state".to_string(),
            attributes_topic: Some("~/attributes".to_string()),
            availability: vec![
                AvailabilityConfig {
                    topic: "~/availability".to_string(),
                },
                AvailabilityConfig {
                    topic: self.bridge_availability_topic(),
                },
            ],
            availability_mode: Some("all".to_string()),
            device: Some(scanner.device.clone()),
            icon: Some(SCANNER_ICON.to_string()),
            force_update: true,
            entity_category: None,
        };

        let payload = serde_json::to_string(&config)?;
        self.publish_retained(&scanner.topics.config, &payload).await
    }

    async fn publish_health_discovery(
        &self,
        scanner: &ScannerDevice,
    ) -> Result<(), IntegrationError> {
        let bridge_id = self.bridge_id();
        let entity_id = format!("{bridge_id}-scanner-{}-health", scanner.id);

        let config = SensorConfig {
            name: format!("{} Health", scanner.name),
            object_id: Some(format!("{}_{}_health", self.config.instance_id, scanner.id)),
            unique_id: entity_id.clone(),
            base_topic: Some(EntityTopics::base_topic(
                &self.config.discovery_prefix,
                &entity_id,
            )),
            state_topic: "~/state".to_string(),
            attributes_topic: Some("~/attributes".to_string()),
            availability: vec![AvailabilityConfig {
                topic: self.bridge_availability_topic(),
            }],
            availability_mode: None,
            device: Some(scanner.device.clone()),
            icon: Some(HEALTH_ICON.to_string()),
            force_update: false,
            entity_category: Some("diagnostic".to_string()),
        };

        let payload = serde_json::to_string(&config)?;
        self.publish_retained(&scanner.health_topics.config, &payload)
            .await
    }

    async fn publish_scanner_attributes(
        &self,
        scanner: &ScannerDevice,
        config: Option<&ScannerConfig>,
    ) -> Result<(), IntegrationError> {
        let mut attributes = json!({ "scanner_id": scanner.id });
        if let Some(config) = config {
            attributes["keyboard_layout"] = json!(config.keyboard_layout);
            attributes["termination_char"] = json!(config.termination_char.as_str());
        }
        self.publish_state(&scanner.topics.attributes, &attributes.to_string())
            .await
    }

    async fn publish_health_state(&self, scanner: &ScannerDevice) -> Result<(), IntegrationError> {
        let status = health_status(scanner);
        self.publish_state(&scanner.health_topics.state, status).await?;

        let attributes = health_attributes(&scanner.health);
        self.publish_state(&scanner.health_topics.attributes, &attributes.to_string())
            .await
    }

    fn diagnostics_topics(&self) -> EntityTopics {
        let entity_id = format!("{}-diagnostics", self.bridge_id());
        EntityTopics::for_entity(&self.config.discovery_prefix, &entity_id)
    }

    async fn publish_diagnostics_discovery(&self) -> Result<(), IntegrationError> {
        let entity_id = format!("{}-diagnostics", self.bridge_id());
        let topics = self.diagnostics_topics();

        let config = SensorConfig {
            name: "Diagnostics".to_string(),
            object_id: None,
            unique_id: entity_id.clone(),
            base_topic: Some(EntityTopics::base_topic(
                &self.config.discovery_prefix,
                &entity_id,
            )),
            state_topic: "~/state".to_string(),
            attributes_topic: Some("~/attributes".to_string()),
            availability: vec![AvailabilityConfig {
                topic: self.bridge_availability_topic(),
            }],
            availability_mode: None,
            device: Some(self.bridge_device.clone()),
            icon: Some(DIAGNOSTICS_ICON.to_string()),
            force_update: false,
            entity_category: Some("diagnostic".to_string()),
        };

        let payload = serde_json::to_string(&config)?;
        self.publish_retained(&topics.config, &payload).await
    }

    /// Summary of scanner connectivity: `offline` when zero scanners are
    /// connected, `online` when all are, `partial` otherwise.
    async fn publish_diagnostics_state(&self, state: &IntegrationState) {
        let connected = state.scanners.values().filter(|s| s.connected).count();
        let total = state.scanners.len();
        let summary = if connected == 0 {
            STATUS_OFFLINE
        } else if connected == total {
            STATUS_ONLINE
        } else {
            STATUS_PARTIAL
        };

        let mut scanner_list: Vec<&str> = state.scanners.keys().map(String::as_str).collect();
        scanner_list.sort_unstable();
        let attributes = json!({
            "connected_scanners": connected,
            "total_scanners": total,
            "scanner_list": scanner_list,
        });

        let topics = self.diagnostics_topics();
        if let Err(e) = self.publish_state(&topics.state, summary).await {
            error!(error = %e, "failed to publish diagnostics state");
            return;
        }
        if let Err(e) = self
            .publish_state(&topics.attributes, &attributes.to_string())
            .await
        {
            error!(error = %e, "failed to publish diagnostics attributes");
        }
    }
}

#[async_trait]
impl Service for Integration {
    fn name(&self) -> &'static str {
        "homeassistant"
    }

    async fn start(&self) -> anyhow::Result<()> {
        info!("starting Home Assistant integration");
        if self.publisher.is_connected() {
            self.handle_broker_connect().await;
        }
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.stop_integration().await;
        Ok(())
    }
}

fn display_name(id: &str, descriptor: &DeviceDescriptor) -> String {
    let manufacturer = descriptor.manufacturer.trim();
    let product = descriptor.product.trim();
    let name = match (manufacturer.is_empty(), product.is_empty()) {
        (false, false) => format!("{manufacturer} {product}"),
        (false, true) => manufacturer.to_string(),
        (true, false) => product.to_string(),
        (true, true) => return format!("Scanner {id}"),
    };
    name
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn health_status(scanner: &ScannerDevice) -> &'static str {
    if !scanner.connected {
        if Utc::now() - scanner.health.last_seen > chrono::Duration::minutes(STALE_AFTER_MINUTES) {
            return "stale";
        }
        return "disconnected";
    }
    if scanner.health.error_count > DEGRADED_ERROR_COUNT {
        return "degraded";
    }
    if scanner.health.reconnect_count > UNSTABLE_RECONNECT_COUNT {
        return "unstable";
    }
    "healthy"
}

fn health_attributes(health: &ScannerHealth) -> serde_json::Value {
    let mut attributes = json!({
        "last_seen": health.last_seen.to_rfc3339(),
        "reconnect_count": health.reconnect_count,
        "error_count": health.error_count,
        "total_scans": health.total_scans,
    });
    if let Some(connected_at) = health.connected_at {
        attributes["connected_at"] = json!(connected_at.to_rfc3339());
    }
    if let Some(disconnected_at) = health.disconnected_at {
        attributes["disconnected_at"] = json!(disconnected_at.to_rfc3339());
    }
    if let Some(last_scan) = health.last_scan_time {
        attributes["last_scan"] = json!(last_scan.to_rfc3339());
    }
    attributes
}
