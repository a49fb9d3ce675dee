//! Per-scanner session: enumerate, claim and drain one HID device.
//!
//! Each session runs a single task that loops through seek → drain →
//! disconnect → backoff until stopped. The blocking HID read happens on a
//! dedicated blocking task which hands raw reports to the session task over
//! a bounded channel; a 10 ms tick drives the decoder's idle-timeout probe.
//!
//! Event ordering per connection epoch: exactly one `connected=true` before
//! any scan, scans in report order, exactly one `connected=false` after the
//! last scan of the epoch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use hidapi::{HidApi, HidDevice};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use habridge_core::{ScannerConfig, ScannerIdentification};

use crate::decoder::HidDecoder;
use crate::error::ScannerError;

/// hidapi allows a single `HidApi` instance per process; sessions share it.
pub type SharedHidApi = Arc<Mutex<HidApi>>;

pub type ScanCallback = Arc<dyn Fn(&str) + Send + Sync>;
pub type ConnectionCallback = Arc<dyn Fn(bool) + Send + Sync>;

const REPORT_CHANNEL_CAPACITY: usize = 16;
const READ_TIMEOUT_MS: i32 = 100;
const DECODER_TICK: Duration = Duration::from_millis(10);
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Normalized identity of a connected device, emitted on connect and used
/// verbatim by the discovery integration to name the sensor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: String,
    pub product: String,
    pub serial: String,
    pub interface: i32,
}

pub struct ScannerSession {
    config: ScannerConfig,
    hid: SharedHidApi,
    /// Single writer: the session task.
    connected: AtomicBool,
    descriptor: RwLock<Option<DeviceDescriptor>>,
    reconnect_delay: RwLock<Duration>,
    on_scan: RwLock<Option<ScanCallback>>,
    on_connection_change: RwLock<Option<ConnectionCallback>>,
    cancel_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ScannerSession {
    pub fn new(config: ScannerConfig, hid: SharedHidApi) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            config,
            hid,
            connected: AtomicBool::new(false),
            descriptor: RwLock::new(None),
            reconnect_delay: RwLock::new(DEFAULT_RECONNECT_DELAY),
            on_scan: RwLock::new(None),
            on_connection_change: RwLock::new(None),
            cancel_tx,
            task: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn set_on_scan_callback(&self, callback: ScanCallback) {
        *lock_write(&self.on_scan) = Some(callback);
    }

    pub fn set_on_connection_change_callback(&self, callback: ConnectionCallback) {
        *lock_write(&self.on_connection_change) = Some(callback);
    }

    pub fn set_reconnect_delay(&self, delay: Duration) {
        *lock_write(&self.reconnect_delay) = delay;
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Descriptor of the currently open device, if any.
    pub fn connected_device_info(&self) -> Option<DeviceDescriptor> {
        lock_read(&self.descriptor).clone()
    }

    /// Spawn the session task running the reconnect loop.
    pub fn start(self: &Arc<Self>) {
        let session = Arc::clone(self);
        let handle = tokio::spawn(async move { session.run().await });
        *lock_mutex(&self.task) = Some(handle);
        info!(scanner_id = %self.config.id, "scanner session started");
    }

    /// Probe whether the configured device can be opened right now. The
    /// handle is closed immediately; used for the startup liveness check.
    pub async fn try_initial_connect(&self) -> bool {
        let hid = self.hid.clone();
        let ident = self.config.identification.clone();
        tokio::task::spawn_blocking(move || open_matching(&hid, &ident).map(drop))
            .await
            .map(|result| result.is_ok())
            .unwrap_or(false)
    }

    /// Cancel the session and wait for its task to finish. Idempotent.
    pub async fn stop(&self) {
        let _ = self.cancel_tx.send(true);
        let handle = lock_mutex(&self.task).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!(scanner_id = %self.config.id, "scanner session stopped");
    }

    async fn run(self: Arc<Self>) {
        let mut cancel_rx = self.cancel_tx.subscribe();

        loop {
            if *cancel_rx.borrow() {
                break;
            }

            match self.try_open().await {
                Some((device, descriptor)) => {
                    self.begin_epoch(descriptor);
                    self.drain(device, &mut cancel_rx).await;
                    self.end_epoch();
                }
                None => {
                    debug!(
                        scanner_id = %self.config.id,
                        "device not available, retrying after backoff"
                    );
                }
            }

            if *cancel_rx.borrow() {
                break;
            }
            let delay = *lock_read(&self.reconnect_delay);
            tokio::select! {
                _ = cancel_rx.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn try_open(&self) -> Option<(HidDevice, DeviceDescriptor)> {
        let hid = self.hid.clone();
        let ident = self.config.identification.clone();
        let result = tokio::task::spawn_blocking(move || open_matching(&hid, &ident))
            .await
            .ok()?;
        match result {
            Ok(opened) => Some(opened),
            Err(e) => {
                debug!(scanner_id = %self.config.id, error = %e, "open attempt failed");
                None
            }
        }
    }

    fn begin_epoch(&self, descriptor: DeviceDescriptor) {
        info!(
            scanner_id = %self.config.id,
            manufacturer = %descriptor.manufacturer,
            product = %descriptor.product,
            "connected to device"
        );
        *lock_write(&self.descriptor) = Some(descriptor);
        self.connected.store(true, Ordering::Release);

        let callback = lock_read(&self.on_connection_change).clone();
        if let Some(callback) = callback {
            callback(true);
        }
    }

    fn end_epoch(&self) {
        self.connected.store(false, Ordering::Release);
        *lock_write(&self.descriptor) = None;

        let callback = lock_read(&self.on_connection_change).clone();
        if let Some(callback) = callback {
            callback(false);
        }
        info!(scanner_id = %self.config.id, "device disconnected");
    }

    /// Read reports until the device fails, the reader exits, or the session
    /// is cancelled.
    async fn drain(&self, device: HidDevice, cancel_rx: &mut watch::Receiver<bool>) {
        let (report_tx, mut report_rx) = mpsc::channel::<Vec<u8>>(REPORT_CHANNEL_CAPACITY);
        let reader_cancel = self.cancel_tx.subscribe();
        let reader =
            tokio::task::spawn_blocking(move || read_loop(device, report_tx, reader_cancel));

        let mut decoder = HidDecoder::new(
            self.config.termination_char,
            &self.config.keyboard_layout,
        );
        if let Some(callback) = lock_read(&self.on_scan).clone() {
            decoder.set_on_scan(move |barcode| callback(barcode));
        }

        let mut tick = tokio::time::interval(DECODER_TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel_rx.changed() => break,
                report = report_rx.recv() => match report {
                    Some(report) => decoder.process_report(&report),
                    None => break,
                },
                _ = tick.tick() => decoder.check_timeout(),
            }
        }

        drop(report_rx);
        match reader.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(scanner_id = %self.config.id, error = %e, "device read error"),
            Err(e) => warn!(scanner_id = %self.config.id, error = %e, "reader task failed"),
        }
    }
}

/// Blocking read loop; runs on a dedicated blocking task and owns the device
/// handle, which is dropped (closed) on exit.
fn read_loop(
    device: HidDevice,
    report_tx: mpsc::Sender<Vec<u8>>,
    cancel_rx: watch::Receiver<bool>,
) -> Result<(), ScannerError> {
    let mut buffer = [0u8; 64];
    loop {
        if *cancel_rx.borrow() {
            return Ok(());
        }
        match device.read_timeout(&mut buffer, READ_TIMEOUT_MS) {
            // Timeout with no data is a no-op.
            Ok(0) => continue,
            Ok(n) => {
                if buffer[..n].iter().all(|&b| b == 0) {
                    continue;
                }
                if report_tx.blocking_send(buffer[..n].to_vec()).is_err() {
                    return Ok(());
                }
            }
            Err(e) => return Err(ScannerError::Read(e)),
        }
    }
}

/// Enumerate devices matching the identification and open the first
/// acceptable one.
fn open_matching(
    hid: &SharedHidApi,
    ident: &ScannerIdentification,
) -> Result<(HidDevice, DeviceDescriptor), ScannerError> {
    let mut api = lock_mutex(hid);
    api.refresh_devices().map_err(ScannerError::Enumerate)?;

    for info in api.device_list() {
        if info.vendor_id() != ident.vendor_id || info.product_id() != ident.product_id {
            continue;
        }
        if let Some(required) = &ident.serial {
            let serial = info.serial_number().unwrap_or("").trim();
            if serial != required {
                continue;
            }
        }
        if let Some(required) = ident.interface {
            if info.interface_number() != required {
                continue;
            }
        }

        match info.open_device(&api) {
            Ok(device) => {
                let descriptor = DeviceDescriptor {
                    vendor_id: info.vendor_id(),
                    product_id: info.product_id(),
                    manufacturer: info.manufacturer_string().unwrap_or("").trim().to_string(),
                    product: info.product_string().unwrap_or("").trim().to_string(),
                    serial: info.serial_number().unwrap_or("").trim().to_string(),
                    interface: info.interface_number(),
                };
                return Ok((device, descriptor));
            }
            Err(e) => {
                debug!(
                    vendor_id = %format_args!("{:04x}", ident.vendor_id),
                    product_id = %format_args!("{:04x}", ident.product_id),
                    error = %e,
                    "open failed, trying next match"
                );
                continue;
            }
        }
    }

    Err(ScannerError::DeviceNotFound(device_label(ident)))
}

fn device_label(ident: &ScannerIdentification) -> String {
    let mut label = format!("{:04x}:{:04x}", ident.vendor_id, ident.product_id);
    if let Some(serial) = &ident.serial {
        label.push_str(&format!(" with serial '{serial}'"));
    }
    if let Some(interface) = ident.interface {
        label.push_str(&format!(" on interface {interface}"));
    }
    label
}

fn lock_read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn lock_write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock_mutex<T>(lock: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}
