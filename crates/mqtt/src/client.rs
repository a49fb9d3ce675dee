//! Asynchronous MQTT client with automatic reconnection.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, Event, LastWill, MqttOptions, Packet, QoS, TlsConfiguration, Transport,
};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use habridge_core::{MqttConfig, PublishError, Publisher, Service};

const EVENT_CHANNEL_CAPACITY: usize = 10;
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(2);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECTION_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub type ConnectionCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Error)]
pub enum MqttError {
    #[error("invalid broker URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("unsupported broker URL scheme '{0}'")]
    UnsupportedScheme(String),

    #[error("TLS configuration failed: {0}")]
    Tls(String),

    #[error("MQTT client is not connected")]
    NotConnected,

    #[error("publish to {topic} failed: {source}")]
    Publish {
        topic: String,
        source: rumqttc::ClientError,
    },

    #[error("publish to {topic} timed out")]
    PublishTimeout { topic: String },

    #[error("timeout waiting for MQTT connection")]
    ConnectTimeout,
}

/// State shared between the client handle and its event-loop task.
struct ClientState {
    connected: RwLock<bool>,
    on_connect: RwLock<Option<ConnectionCallback>>,
    on_disconnect: RwLock<Option<ConnectionCallback>>,
}

impl ClientState {
    fn set_connected(&self, connected: bool) {
        *self.connected.write().unwrap_or_else(PoisonError::into_inner) = connected;
    }

    fn is_connected(&self) -> bool {
        *self.connected.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn connect_callback(&self) -> Option<ConnectionCallback> {
        self.on_connect
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn disconnect_callback(&self) -> Option<ConnectionCallback> {
        self.on_disconnect
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub struct MqttClient {
    broker_url: String,
    client: AsyncClient,
    qos: QoS,
    state: Arc<ClientState>,
    event_loop: Mutex<Option<rumqttc::EventLoop>>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttClient {
    /// Build the client. When `will_topic` is given, the broker will publish
    /// `offline` (retained) on that topic after an unclean disconnect.
    pub fn new(config: &MqttConfig, will_topic: Option<String>) -> Result<Self, MqttError> {
        let qos = qos_level(config.qos);
        let options = build_options(config, will_topic.as_deref(), qos)?;
        let (client, event_loop) = AsyncClient::new(options, EVENT_CHANNEL_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            broker_url: config.broker_url.clone(),
            client,
            qos,
            state: Arc::new(ClientState {
                connected: RwLock::new(false),
                on_connect: RwLock::new(None),
                on_disconnect: RwLock::new(None),
            }),
            event_loop: Mutex::new(Some(event_loop)),
            shutdown_tx,
            task: Mutex::new(None),
        })
    }

    pub fn set_on_connect_callback(&self, callback: ConnectionCallback) {
        *self
            .state
            .on_connect
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    pub fn set_on_disconnect_callback(&self, callback: ConnectionCallback) {
        *self
            .state
            .on_disconnect
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    /// Spawn the event-loop task. Connection establishment is asynchronous;
    /// use [`wait_for_connection`](Self::wait_for_connection) to block on it.
    pub fn connect(&self) {
        let Some(event_loop) = self
            .event_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        info!(broker = %self.broker_url, "connecting to MQTT broker");
        let state = self.state.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(run_event_loop(event_loop, state, shutdown_rx));
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Disconnect from the broker and stop the event-loop task. Safe to call
    /// repeatedly and before `connect`.
    pub async fn disconnect(&self) {
        info!("disconnecting from MQTT broker");
        let _ = self.client.disconnect().await;
        let _ = self.shutdown_tx.send(true);
        self.state.set_connected(false);

        let handle = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Publish a payload. Fails immediately when disconnected; callers must
    /// not queue.
    pub async fn publish(
        &self,
        topic: &str,
        payload: &str,
        retained: bool,
    ) -> Result<(), MqttError> {
        if !self.is_connected() {
            return Err(MqttError::NotConnected);
        }

        debug!(topic, retained, "publishing");
        let send = self.client.publish(topic, self.qos, retained, payload);
        match tokio::time::timeout(WRITE_TIMEOUT, send).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(MqttError::Publish {
                topic: topic.to_string(),
                source,
            }),
            Err(_) => Err(MqttError::PublishTimeout {
                topic: topic.to_string(),
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    /// Poll the connected flag until it is set or the timeout elapses.
    pub async fn wait_for_connection(&self, timeout: Duration) -> Result<(), MqttError> {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.is_connected() {
                return Ok(());
            }
            tokio::time::sleep(CONNECTION_POLL_INTERVAL).await;
        }
        Err(MqttError::ConnectTimeout)
    }
}

/// Poll the rumqttc event loop, maintaining the connected flag and firing
/// the user callbacks. Errors trigger a bounded exponential backoff before
/// the next poll re-attempts the connection.
async fn run_event_loop(
    mut event_loop: rumqttc::EventLoop,
    state: Arc<ClientState>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut backoff = INITIAL_RECONNECT_DELAY;

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            event = event_loop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("MQTT client connected");
                    backoff = INITIAL_RECONNECT_DELAY;
                    state.set_connected(true);
                    if let Some(callback) = state.connect_callback() {
                        callback();
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    let was_connected = state.is_connected();
                    state.set_connected(false);
                    if was_connected {
                        warn!(error = %e, "MQTT connection lost");
                        if let Some(callback) = state.disconnect_callback() {
                            callback();
                        }
                    } else {
                        debug!(error = %e, "MQTT connection attempt failed");
                    }

                    tokio::select! {
                        _ = shutdown_rx.changed() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_RECONNECT_DELAY);
                }
            }
        }
    }
    debug!("MQTT event loop stopped");
}

fn build_options(
    config: &MqttConfig,
    will_topic: Option<&str>,
    qos: QoS,
) -> Result<MqttOptions, MqttError> {
    let url = Url::parse(&config.broker_url).map_err(|e| MqttError::InvalidUrl {
        url: config.broker_url.clone(),
        reason: e.to_string(),
    })?;
    let host = url
        .host_str()
        .ok_or_else(|| MqttError::InvalidUrl {
            url: config.broker_url.clone(),
            reason: "missing host".to_string(),
        })?
        .to_string();

    let (transport, default_port) = match url.scheme() {
        "mqtt" => (Transport::Tcp, 1883),
        "mqtts" => (Transport::Tls(tls_configuration(config)?), 8883),
        "ws" => (Transport::Ws, 80),
        "wss" => (Transport::Wss(tls_configuration(config)?), 443),
        other => return Err(MqttError::UnsupportedScheme(other.to_string())),
    };
    let port = url.port().unwrap_or(default_port);

    // The websocket transport wants the full URL as the broker address.
    let broker_addr = match url.scheme() {
        "ws" | "wss" => config.broker_url.clone(),
        _ => host,
    };

    let mut options = MqttOptions::new(&config.client_id, broker_addr, port);
    options.set_transport(transport);
    options.set_keep_alive(Duration::from_secs(config.keep_alive));
    options.set_clean_session(true);

    if let Some(username) = &config.username {
        options.set_credentials(username, config.password.as_deref().unwrap_or(""));
    }

    if let Some(topic) = will_topic {
        options.set_last_will(LastWill::new(topic, "offline", qos, true));
    }

    Ok(options)
}

/// TLS setup for the `mqtts`/`wss` schemes. The only recognized option is
/// `insecure_skip_verify`.
fn tls_configuration(config: &MqttConfig) -> Result<TlsConfiguration, MqttError> {
    let mut builder = native_tls::TlsConnector::builder();
    if config.insecure_skip_verify {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    }
    let connector = builder.build().map_err(|e| MqttError::Tls(e.to_string()))?;
    Ok(TlsConfiguration::NativeConnector(connector))
}

fn qos_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

#[async_trait]
impl Publisher for MqttClient {
    async fn publish(&self, topic: &str, payload: &str, retained: bool)
        -> Result<(), PublishError> {
        MqttClient::publish(self, topic, payload, retained)
            .await
            .map_err(|e| match e {
                MqttError::NotConnected => PublishError::NotConnected,
                other => PublishError::Failed {
                    topic: topic.to_string(),
                    reason: other.to_string(),
                },
            })
    }

    fn is_connected(&self) -> bool {
        MqttClient::is_connected(self)
    }
}

#[async_trait]
impl Service for MqttClient {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    /// Start the event loop and wait up to 10 s for the broker connection;
    /// not reaching it in time is a startup error.
    async fn start(&self) -> anyhow::Result<()> {
        self.connect();
        self.wait_for_connection(CONNECT_TIMEOUT).await?;
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.disconnect().await;
        Ok(())
    }
}
