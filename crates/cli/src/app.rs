//! Application wiring and service lifecycle.
//!
//! The orchestrator is the only party holding the manager, the integration
//! and the broker client together; the components themselves are wired with
//! single-direction callbacks. Every event — scans, connection changes and
//! broker reconnects — funnels into one mpsc channel consumed by a single
//! task, which serializes all integration mutations.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use habridge_core::{Config, Publisher, Service};
use habridge_homeassistant::Integration;
use habridge_mqtt::MqttClient;
use habridge_scanner::ScannerManager;

const SCANNER_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Events flowing from the components into the single handler task.
#[derive(Debug)]
enum BridgeEvent {
    Scan { scanner_id: String, barcode: String },
    ConnectionChange { scanner_id: String, connected: bool },
    BrokerConnected,
    BrokerDisconnected,
}

/// Ordered start / reverse-order stop over registered services.
struct ServiceManager {
    services: Vec<Arc<dyn Service>>,
}

impl ServiceManager {
    fn new() -> Self {
        Self {
            services: Vec::new(),
        }
    }

    fn register(&mut self, service: Arc<dyn Service>) {
        self.services.push(service);
    }

    async fn start_all(&self) -> anyhow::Result<()> {
        info!("starting application services");
        for service in &self.services {
            info!(service = service.name(), "starting service");
            service.start().await.map_err(|e| {
                e.context(format!("failed to start service {}", service.name()))
            })?;
            info!(service = service.name(), "service started");
        }
        info!("all services started");
        Ok(())
    }

    async fn stop_all(&self) {
        info!("stopping application services");
        for service in self.services.iter().rev() {
            info!(service = service.name(), "stopping service");
            if let Err(e) = service.stop().await {
                error!(service = service.name(), error = %e, "error stopping service");
            }
        }
        info!("all services stopped");
    }
}

pub struct Application {
    config: Config,
}

impl Application {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let (services, event_task) = self.build().await?;

        services.start_all().await?;

        shutdown_signal().await;

        services.stop_all().await;
        event_task.abort();
        info!("shutdown complete");
        Ok(())
    }

    async fn build(
        &self,
    ) -> anyhow::Result<(ServiceManager, tokio::task::JoinHandle<()>)> {
        // The bridge availability topic doubles as the broker will topic, so
        // an unclean exit flips the bridge (and with it every scanner, via
        // availability_mode=all) to offline.
        let will_topic = habridge_homeassistant::bridge_availability_topic(
            &self.config.homeassistant.discovery_prefix,
            &self.config.homeassistant.instance_id,
        );

        let mqtt = Arc::new(MqttClient::new(&self.config.mqtt, Some(will_topic))?);

        let publisher: Arc<dyn Publisher> = mqtt.clone();
        let integration = Arc::new(Integration::new(
            publisher,
            self.config.homeassistant.clone(),
            env!("CARGO_PKG_VERSION"),
        ));
        for config in self.config.scanners.values() {
            integration
                .add_scanner(&config.id, config.display_name(), config)
                .await;
        }

        let manager = Arc::new(ScannerManager::new(
            self.config.scanners.values().cloned().collect(),
        ));
        manager.set_reconnect_delay(SCANNER_RECONNECT_DELAY);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        wire_events(&mqtt, &manager, &event_tx);

        let event_task = tokio::spawn(handle_events(
            event_rx,
            integration.clone(),
            manager.clone(),
        ));

        let mut services = ServiceManager::new();
        services.register(mqtt);
        services.register(integration);
        services.register(manager);

        Ok((services, event_task))
    }
}

fn wire_events(
    mqtt: &Arc<MqttClient>,
    manager: &Arc<ScannerManager>,
    event_tx: &mpsc::UnboundedSender<BridgeEvent>,
) {
    let tx = event_tx.clone();
    manager.set_on_scan_callback(Arc::new(move |scanner_id, barcode| {
        let _ = tx.send(BridgeEvent::Scan {
            scanner_id: scanner_id.to_string(),
            barcode: barcode.to_string(),
        });
    }));

    let tx = event_tx.clone();
    manager.set_on_connection_change_callback(Arc::new(move |scanner_id, connected| {
        let _ = tx.send(BridgeEvent::ConnectionChange {
            scanner_id: scanner_id.to_string(),
            connected,
        });
    }));

    let tx = event_tx.clone();
    mqtt.set_on_connect_callback(Arc::new(move || {
        let _ = tx.send(BridgeEvent::BrokerConnected);
    }));

    let tx = event_tx.clone();
    mqtt.set_on_disconnect_callback(Arc::new(move || {
        let _ = tx.send(BridgeEvent::BrokerDisconnected);
    }));
}

/// The single consumer of bridge events; all integration mutations happen
/// here, in arrival order.
async fn handle_events(
    mut event_rx: mpsc::UnboundedReceiver<BridgeEvent>,
    integration: Arc<Integration>,
    manager: Arc<ScannerManager>,
) {
    while let Some(event) = event_rx.recv().await {
        match event {
            BridgeEvent::Scan {
                scanner_id,
                barcode,
            } => {
                info!(
                    scanner_id = %scanner_id,
                    length = barcode.len(),
                    "barcode scanned"
                );
                if let Err(e) = integration.publish_barcode(&scanner_id, &barcode).await {
                    error!(scanner_id = %scanner_id, error = %e, "failed to publish barcode");
                }
            }
            BridgeEvent::ConnectionChange {
                scanner_id,
                connected,
            } => {
                handle_connection_change(&integration, &manager, &scanner_id, connected).await;
            }
            BridgeEvent::BrokerConnected => {
                integration.handle_broker_connect().await;
            }
            BridgeEvent::BrokerDisconnected => {
                warn!("MQTT disconnected");
            }
        }
    }
}

async fn handle_connection_change(
    integration: &Integration,
    manager: &ScannerManager,
    scanner_id: &str,
    connected: bool,
) {
    if connected {
        info!(scanner_id = %scanner_id, "scanner connected");
        match manager.get_scanner(scanner_id) {
            Some(session) => match session.connected_device_info() {
                Some(descriptor) => {
                    info!(
                        scanner_id = %scanner_id,
                        manufacturer = %descriptor.manufacturer,
                        product = %descriptor.product,
                        "scanner device detected"
                    );
                    integration
                        .set_scanner_device_info(scanner_id, &descriptor)
                        .await;
                }
                None => {
                    warn!(scanner_id = %scanner_id, "scanner connected but device info unavailable")
                }
            },
            None => error!(scanner_id = %scanner_id, "scanner not found in manager"),
        }
    } else {
        info!(scanner_id = %scanner_id, "scanner disconnected");
    }

    if let Err(e) = integration
        .set_scanner_connected(scanner_id, connected)
        .await
    {
        error!(scanner_id = %scanner_id, error = %e, "failed to update sensor state");
    }
}

/// Resolve on SIGINT or SIGTERM, once.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                info!("received interrupt signal");
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received interrupt signal"),
            _ = terminate.recv() => info!("received terminate signal"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received interrupt signal");
    }
}
