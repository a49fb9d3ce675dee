//! Scanner error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScannerError {
    /// The HID subsystem could not be initialized at all.
    #[error("failed to initialize HID subsystem: {0}")]
    Init(hidapi::HidError),

    /// Enumerating the device list failed.
    #[error("failed to refresh HID device list: {0}")]
    Enumerate(hidapi::HidError),

    /// No acceptable device matched the configured identification.
    #[error("device {0} not found")]
    DeviceNotFound(String),

    /// A read from an open device failed; the session disconnects and the
    /// reconnect loop takes over.
    #[error("device read failed: {0}")]
    Read(hidapi::HidError),

    /// Startup probe found zero openable scanners across all configs.
    #[error(
        "none of the configured scanners could be opened; \
         check device permissions (udev rules on Linux) and connections"
    )]
    NoScannersAvailable,
}
