//! Supervision of all configured scanner sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use hidapi::HidApi;
use tracing::{info, warn};

use habridge_core::{ScannerConfig, Service};

use crate::error::ScannerError;
use crate::session::{
    ConnectionCallback, DeviceDescriptor, ScanCallback, ScannerSession, SharedHidApi,
};

pub type ManagerScanCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;
pub type ManagerConnectionCallback = Arc<dyn Fn(&str, bool) + Send + Sync>;

const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Owns one [`ScannerSession`] per configured scanner and fans their events
/// out tagged with the configured scanner id.
pub struct ScannerManager {
    configs: Vec<ScannerConfig>,
    scanners: RwLock<HashMap<String, Arc<ScannerSession>>>,
    hid: Mutex<Option<SharedHidApi>>,
    on_scan: RwLock<Option<ManagerScanCallback>>,
    on_connection_change: RwLock<Option<ManagerConnectionCallback>>,
    reconnect_delay: RwLock<Duration>,
}

impl ScannerManager {
    pub fn new(configs: Vec<ScannerConfig>) -> Self {
        Self {
            configs,
            scanners: RwLock::new(HashMap::new()),
            hid: Mutex::new(None),
            on_scan: RwLock::new(None),
            on_connection_change: RwLock::new(None),
            reconnect_delay: RwLock::new(DEFAULT_RECONNECT_DELAY),
        }
    }

    pub fn set_on_scan_callback(&self, callback: ManagerScanCallback) {
        *write(&self.on_scan) = Some(callback);
    }

    pub fn set_on_connection_change_callback(&self, callback: ManagerConnectionCallback) {
        *write(&self.on_connection_change) = Some(callback);
    }

    /// Applies to sessions created afterwards as well as running ones.
    pub fn set_reconnect_delay(&self, delay: Duration) {
        *write(&self.reconnect_delay) = delay;
        for session in read(&self.scanners).values() {
            session.set_reconnect_delay(delay);
        }
    }

    pub fn get_scanner(&self, id: &str) -> Option<Arc<ScannerSession>> {
        read(&self.scanners).get(id).cloned()
    }

    /// Descriptors of all currently connected scanners, keyed by id.
    pub fn get_connected_scanners(&self) -> HashMap<String, DeviceDescriptor> {
        read(&self.scanners)
            .iter()
            .filter(|(_, session)| session.is_connected())
            .filter_map(|(id, session)| {
                session
                    .connected_device_info()
                    .map(|descriptor| (id.clone(), descriptor))
            })
            .collect()
    }

    /// Start all configured scanners.
    ///
    /// First probes every config once; when at least one scanner is
    /// configured and not a single device could be opened, startup fails —
    /// the usual cause is missing device permissions, not absent hardware
    /// on every port at once.
    pub async fn start_scanners(&self) -> Result<(), ScannerError> {
        info!(scanners = self.configs.len(), "starting scanner manager");

        let hid = self.shared_hid_api().await?;

        let mut reachable = 0usize;
        for config in &self.configs {
            let probe = ScannerSession::new(config.clone(), hid.clone());
            if probe.try_initial_connect().await {
                info!(scanner_id = %config.id, "initial connect probe succeeded");
                reachable += 1;
            } else {
                warn!(scanner_id = %config.id, "initial connect probe failed");
            }
        }
        if !self.configs.is_empty() && reachable == 0 {
            return Err(ScannerError::NoScannersAvailable);
        }

        for config in &self.configs {
            self.start_scanner(config, hid.clone());
        }

        info!(
            scanners = read(&self.scanners).len(),
            "scanner manager started"
        );
        Ok(())
    }

    fn start_scanner(&self, config: &ScannerConfig, hid: SharedHidApi) {
        let id = config.id.clone();
        let session = Arc::new(ScannerSession::new(config.clone(), hid));
        session.set_reconnect_delay(*read(&self.reconnect_delay));

        if let Some(callback) = read(&self.on_scan).clone() {
            let scan_id = id.clone();
            let tagged: ScanCallback = Arc::new(move |barcode| callback(&scan_id, barcode));
            session.set_on_scan_callback(tagged);
        }
        if let Some(callback) = read(&self.on_connection_change).clone() {
            let conn_id = id.clone();
            let tagged: ConnectionCallback =
                Arc::new(move |connected| callback(&conn_id, connected));
            session.set_on_connection_change_callback(tagged);
        }

        // Store before starting so connection callbacks can resolve the id
        // from the map immediately.
        write(&self.scanners).insert(id, session.clone());
        session.start();
    }

    /// Stop every session and clear the map. Idempotent.
    pub async fn stop_scanners(&self) {
        let sessions: Vec<(String, Arc<ScannerSession>)> = write(&self.scanners).drain().collect();
        for (id, session) in sessions {
            info!(scanner_id = %id, "stopping scanner");
            session.stop().await;
        }
        info!("all scanners stopped");
    }

    async fn shared_hid_api(&self) -> Result<SharedHidApi, ScannerError> {
        if let Some(hid) = lock(&self.hid).clone() {
            return Ok(hid);
        }
        let api = tokio::task::spawn_blocking(HidApi::new)
            .await
            .map_err(|e| {
                ScannerError::Init(hidapi::HidError::HidApiError {
                    message: e.to_string(),
                })
            })?
            .map_err(ScannerError::Init)?;
        let hid: SharedHidApi = Arc::new(Mutex::new(api));
        *lock(&self.hid) = Some(hid.clone());
        Ok(hid)
    }
}

#[async_trait]
impl Service for ScannerManager {
    fn name(&self) -> &'static str {
        "scanner-manager"
    }

    async fn start(&self) -> anyhow::Result<()> {
        self.start_scanners().await.map_err(Into::into)
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.stop_scanners().await;
        Ok(())
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(lock: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use habridge_core::{ScannerIdentification, TerminationChar};

    fn bogus_config(id: &str) -> ScannerConfig {
        ScannerConfig {
            id: id.to_string(),
            name: None,
            identification: ScannerIdentification {
                vendor_id: 0xFFFF,
                product_id: 0xFFFF,
                serial: None,
                interface: None,
            },
            termination_char: TerminationChar::Enter,
            keyboard_layout: "us".to_string(),
        }
    }

    #[tokio::test]
    async fn start_fails_when_no_configured_scanner_is_reachable() {
        let manager = ScannerManager::new(vec![bogus_config("a"), bogus_config("b")]);
        let result = manager.start_scanners().await;
        assert!(result.is_err());
        assert!(manager.get_scanner("a").is_none());
    }

    #[tokio::test]
    async fn stop_is_idempotent_without_start() {
        let manager = ScannerManager::new(vec![bogus_config("a")]);
        manager.stop_scanners().await;
        manager.stop_scanners().await;
        assert!(manager.get_connected_scanners().is_empty());
    }

    #[tokio::test]
    async fn unknown_scanner_lookup_returns_none() {
        let manager = ScannerManager::new(Vec::new());
        assert!(manager.get_scanner("nope").is_none());
    }
}
