//! USB HID barcode scanner support.
//!
//! A [`session::ScannerSession`] owns the connect → drain → reconnect loop
//! for one configured scanner and turns HID keyboard reports into barcode
//! strings via [`decoder::HidDecoder`] and the embedded keyboard layout
//! tables in [`layouts`]. The [`manager::ScannerManager`] supervises one
//! session per configured scanner and tags their events with the scanner id.

pub mod decoder;
pub mod devices;
pub mod error;
pub mod layouts;
pub mod manager;
pub mod session;

pub use decoder::HidDecoder;
pub use devices::{list_all_devices, HidDeviceSummary};
pub use error::ScannerError;
pub use layouts::KeyboardLayout;
pub use manager::ScannerManager;
pub use session::{DeviceDescriptor, ScannerSession, SharedHidApi};
