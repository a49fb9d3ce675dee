//! Integration behavior against an in-memory recording publisher.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use habridge_core::{
    HomeAssistantConfig, PublishError, Publisher, ScannerConfig, ScannerIdentification,
    TerminationChar,
};
use habridge_homeassistant::{Integration, IntegrationError};
use habridge_scanner::DeviceDescriptor;

#[derive(Debug, Clone, PartialEq)]
struct Message {
    topic: String,
    payload: String,
    retained: bool,
}

#[derive(Default)]
struct RecordingPublisher {
    connected: AtomicBool,
    messages: Mutex<Vec<Message>>,
}

impl RecordingPublisher {
    fn new_connected() -> Arc<Self> {
        let publisher = Arc::new(Self::default());
        publisher.connected.store(true, Ordering::SeqCst);
        publisher
    }

    fn messages(&self) -> Vec<Message> {
        self.messages.lock().unwrap().clone()
    }

    fn clear(&self) {
        self.messages.lock().unwrap().clear();
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    fn last_on_topic(&self, topic: &str) -> Option<Message> {
        self.messages()
            .into_iter()
            .filter(|m| m.topic == topic)
            .last()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(
        &self,
        topic: &str,
        payload: &str,
        retained: bool,
    ) -> Result<(), PublishError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(PublishError::NotConnected);
        }
        self.messages.lock().unwrap().push(Message {
            topic: topic.to_string(),
            payload: payload.to_string(),
            retained,
        });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

fn ha_config() -> HomeAssistantConfig {
    HomeAssistantConfig {
        discovery_prefix: "homeassistant".to_string(),
        instance_id: "testhost".to_string(),
    }
}

fn scanner_config(id: &str) -> ScannerConfig {
    ScannerConfig {
        id: id.to_string(),
        name: None,
        identification: ScannerIdentification {
            vendor_id: 0x0c2e,
            product_id: 0x0b61,
            serial: None,
            interface: None,
        },
        termination_char: TerminationChar::Enter,
        keyboard_layout: "us".to_string(),
    }
}

fn descriptor() -> DeviceDescriptor {
    DeviceDescriptor {
        vendor_id: 0x0c2e,
        product_id: 0x0b61,
        manufacturer: " Honeywell ".to_string(),
        product: " Voyager 1200g ".to_string(),
        serial: "S1".to_string(),
        interface: 0,
    }
}

async fn integration_with_scanner(
    publisher: Arc<RecordingPublisher>,
) -> Integration {
    let integration = Integration::new(publisher, ha_config(), "1.0.0");
    integration
        .add_scanner("s1", "s1", &scanner_config("s1"))
        .await;
    integration
        .set_scanner_device_info("s1", &descriptor())
        .await;
    integration
}

const SCANNER_BASE: &str = "homeassistant/sensor/ha-barcode-bridge-testhost-scanner-s1";
const BRIDGE_AVAILABILITY: &str =
    "homeassistant/sensor/ha-barcode-bridge-testhost/availability";
const DIAGNOSTICS_BASE: &str = "homeassistant/sensor/ha-barcode-bridge-testhost-diagnostics";

#[tokio::test]
async fn device_info_publishes_availability_before_discovery() {
    let publisher = RecordingPublisher::new_connected();
    let _integration = integration_with_scanner(publisher.clone()).await;

    let messages = publisher.messages();
    let availability_index = messages
        .iter()
        .position(|m| m.topic == format!("{SCANNER_BASE}/availability"))
        .expect("availability published");
    let config_index = messages
        .iter()
        .position(|m| m.topic == format!("{SCANNER_BASE}/config"))
        .expect("discovery config published");

    assert!(availability_index < config_index);
    assert_eq!(messages[availability_index].payload, "offline");
    assert!(messages[availability_index].retained);
    assert!(messages[config_index].retained);
}

#[tokio::test]
async fn discovery_payload_has_required_shape() {
    let publisher = RecordingPublisher::new_connected();
    let _integration = integration_with_scanner(publisher.clone()).await;

    let config = publisher
        .last_on_topic(&format!("{SCANNER_BASE}/config"))
        .expect("discovery config published");
    let payload: Value = serde_json::from_str(&config.payload).unwrap();

    assert_eq!(payload["name"], "Honeywell Voyager 1200g");
    assert_eq!(payload["object_id"], "testhost_s1");
    assert_eq!(payload["unique_id"], "ha-barcode-bridge-testhost-scanner-s1");
    assert_eq!(payload["~"], SCANNER_BASE);
    assert_eq!(payload["state_topic"], "~/state");
    assert_eq!(payload["json_attributes_topic"], "~/attributes");
    assert_eq!(payload["availability_mode"], "all");
    assert_eq!(payload["force_update"], true);
    assert_eq!(payload["icon"], "mdi:barcode-scan");

    let availability = payload["availability"].as_array().unwrap();
    assert_eq!(availability.len(), 2);
    assert_eq!(availability[0]["topic"], "~/availability");
    assert_eq!(availability[1]["topic"], BRIDGE_AVAILABILITY);

    let device = &payload["device"];
    assert_eq!(
        device["identifiers"][0],
        "ha-barcode-bridge-testhost-scanner-s1"
    );
    assert_eq!(device["via_device"], "ha-barcode-bridge-testhost");
    assert_eq!(device["manufacturer"], "Honeywell");
    assert_eq!(device["model"], "Voyager 1200g");
}

#[tokio::test]
async fn health_discovery_depends_on_bridge_only() {
    let publisher = RecordingPublisher::new_connected();
    let _integration = integration_with_scanner(publisher.clone()).await;

    let config = publisher
        .last_on_topic(&format!("{SCANNER_BASE}-health/config"))
        .expect("health discovery published");
    let payload: Value = serde_json::from_str(&config.payload).unwrap();

    assert_eq!(payload["entity_category"], "diagnostic");
    assert_eq!(payload["availability"].as_array().unwrap().len(), 1);
    assert_eq!(payload["availability"][0]["topic"], BRIDGE_AVAILABILITY);
    assert!(payload.get("availability_mode").is_none());
    assert!(payload.get("force_update").is_none());
}

#[tokio::test]
async fn connect_transition_publishes_unknown_state_and_online_availability() {
    let publisher = RecordingPublisher::new_connected();
    let integration = integration_with_scanner(publisher.clone()).await;
    publisher.clear();

    integration.set_scanner_connected("s1", true).await.unwrap();

    let state = publisher
        .last_on_topic(&format!("{SCANNER_BASE}/state"))
        .expect("state published");
    assert_eq!(state.payload, "unknown");
    assert!(!state.retained);

    let availability = publisher
        .last_on_topic(&format!("{SCANNER_BASE}/availability"))
        .expect("availability published");
    assert_eq!(availability.payload, "online");
    assert!(availability.retained);

    let attributes = publisher
        .last_on_topic(&format!("{SCANNER_BASE}/attributes"))
        .expect("attributes published");
    let attrs: Value = serde_json::from_str(&attributes.payload).unwrap();
    assert_eq!(attrs["scanner_id"], "s1");
    assert_eq!(attrs["keyboard_layout"], "us");
    assert_eq!(attrs["termination_char"], "enter");
}

#[tokio::test]
async fn set_connected_is_idempotent_on_retained_topics() {
    let publisher = RecordingPublisher::new_connected();
    let integration = integration_with_scanner(publisher.clone()).await;

    integration.set_scanner_connected("s1", true).await.unwrap();
    let first: Vec<_> = publisher
        .messages()
        .into_iter()
        .filter(|m| m.retained)
        .collect();

    publisher.clear();
    integration.set_scanner_connected("s1", true).await.unwrap();
    let second: Vec<_> = publisher
        .messages()
        .into_iter()
        .filter(|m| m.retained)
        .collect();

    // The second identical call writes the same retained availability value.
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].topic, format!("{SCANNER_BASE}/availability"));
    assert_eq!(second[0].payload, "online");
    assert!(first
        .iter()
        .any(|m| m.topic == second[0].topic && m.payload == second[0].payload));
}

#[tokio::test]
async fn diagnostics_summary_tracks_connectivity() {
    let publisher = RecordingPublisher::new_connected();
    let integration = Integration::new(publisher.clone(), ha_config(), "1.0.0");

    for id in ["s1", "s2"] {
        integration.add_scanner(id, id, &scanner_config(id)).await;
        integration.set_scanner_device_info(id, &descriptor()).await;
    }

    let diagnostics_state = format!("{DIAGNOSTICS_BASE}/state");

    integration.set_scanner_connected("s1", true).await.unwrap();
    assert_eq!(
        publisher.last_on_topic(&diagnostics_state).unwrap().payload,
        "partial"
    );

    integration.set_scanner_connected("s2", true).await.unwrap();
    assert_eq!(
        publisher.last_on_topic(&diagnostics_state).unwrap().payload,
        "online"
    );

    integration.set_scanner_connected("s1", false).await.unwrap();
    assert_eq!(
        publisher.last_on_topic(&diagnostics_state).unwrap().payload,
        "partial"
    );

    integration.set_scanner_connected("s2", false).await.unwrap();
    assert_eq!(
        publisher.last_on_topic(&diagnostics_state).unwrap().payload,
        "offline"
    );

    let attributes = publisher
        .last_on_topic(&format!("{DIAGNOSTICS_BASE}/attributes"))
        .unwrap();
    let attrs: Value = serde_json::from_str(&attributes.payload).unwrap();
    assert_eq!(attrs["connected_scanners"], 0);
    assert_eq!(attrs["total_scanners"], 2);
    assert_eq!(attrs["scanner_list"], serde_json::json!(["s1", "s2"]));
}

#[tokio::test]
async fn barcode_publish_is_not_retained() {
    let publisher = RecordingPublisher::new_connected();
    let integration = integration_with_scanner(publisher.clone()).await;
    integration.set_scanner_connected("s1", true).await.unwrap();
    publisher.clear();

    integration.publish_barcode("s1", "4006381333931").await.unwrap();

    let state = publisher
        .last_on_topic(&format!("{SCANNER_BASE}/state"))
        .expect("barcode state published");
    assert_eq!(state.payload, "4006381333931");
    assert!(!state.retained);

    let attributes = publisher
        .last_on_topic(&format!("{SCANNER_BASE}/attributes"))
        .expect("attributes published");
    assert!(!attributes.retained);
}

#[tokio::test]
async fn barcode_for_unknown_scanner_fails() {
    let publisher = RecordingPublisher::new_connected();
    let integration = Integration::new(publisher, ha_config(), "1.0.0");

    let err = integration.publish_barcode("ghost", "123").await.unwrap_err();
    assert!(matches!(err, IntegrationError::ScannerUnknown(_)));
}

#[tokio::test]
async fn barcode_fails_when_broker_disconnected() {
    let publisher = RecordingPublisher::new_connected();
    let integration = integration_with_scanner(publisher.clone()).await;

    publisher.set_connected(false);
    let err = integration.publish_barcode("s1", "123").await.unwrap_err();
    assert!(matches!(
        err,
        IntegrationError::Publish(PublishError::NotConnected)
    ));
}

#[tokio::test]
async fn broker_reconnect_republishes_discovery_and_bridge_availability() {
    let publisher = RecordingPublisher::new_connected();
    let integration = integration_with_scanner(publisher.clone()).await;
    integration.set_scanner_connected("s1", true).await.unwrap();

    // Broker drops and comes back.
    publisher.set_connected(false);
    publisher.set_connected(true);
    publisher.clear();

    integration.handle_broker_connect().await;

    let messages = publisher.messages();
    assert!(messages
        .iter()
        .any(|m| m.topic == format!("{SCANNER_BASE}/config") && m.retained));
    assert!(messages
        .iter()
        .any(|m| m.topic == format!("{DIAGNOSTICS_BASE}/config") && m.retained));

    let bridge = publisher.last_on_topic(BRIDGE_AVAILABILITY).unwrap();
    assert_eq!(bridge.payload, "online");
    assert!(bridge.retained);

    // Scanner availability is untouched by the reconnect path; the retained
    // value from the last SetScannerConnected stands.
    assert!(!messages
        .iter()
        .any(|m| m.topic == format!("{SCANNER_BASE}/availability")));
}

#[tokio::test]
async fn stop_publishes_offline_for_scanners_and_bridge() {
    use habridge_core::Service;

    let publisher = RecordingPublisher::new_connected();
    let integration = integration_with_scanner(publisher.clone()).await;
    integration.set_scanner_connected("s1", true).await.unwrap();
    publisher.clear();

    integration.stop().await.unwrap();

    let scanner_availability = publisher
        .last_on_topic(&format!("{SCANNER_BASE}/availability"))
        .expect("scanner offline published");
    assert_eq!(scanner_availability.payload, "offline");
    assert!(scanner_availability.retained);

    let bridge = publisher.last_on_topic(BRIDGE_AVAILABILITY).unwrap();
    assert_eq!(bridge.payload, "offline");
    assert!(bridge.retained);
}

#[tokio::test]
async fn device_name_falls_back_when_strings_are_empty() {
    let publisher = RecordingPublisher::new_connected();
    let integration = Integration::new(publisher.clone(), ha_config(), "1.0.0");
    integration.add_scanner("s9", "s9", &scanner_config("s9")).await;

    let blank = DeviceDescriptor {
        vendor_id: 1,
        product_id: 2,
        ..DeviceDescriptor::default()
    };
    integration.set_scanner_device_info("s9", &blank).await;

    let config = publisher
        .last_on_topic("homeassistant/sensor/ha-barcode-bridge-testhost-scanner-s9/config")
        .expect("discovery config published");
    let payload: Value = serde_json::from_str(&config.payload).unwrap();
    assert_eq!(payload["name"], "Scanner s9");
    assert!(payload["device"].get("manufacturer").is_none());
}

#[tokio::test]
async fn set_connected_for_unknown_scanner_fails() {
    let publisher = RecordingPublisher::new_connected();
    let integration = Integration::new(publisher, ha_config(), "1.0.0");

    let err = integration
        .set_scanner_connected("ghost", true)
        .await
        .unwrap_err();
    assert!(matches!(err, IntegrationError::ScannerUnknown(_)));
}
