//! HID device enumeration for diagnostics.

use hidapi::HidApi;

use crate::error::ScannerError;

/// Summary of one enumerated HID device, as printed by `--list-devices`.
#[derive(Debug, Clone)]
pub struct HidDeviceSummary {
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: String,
    pub product: String,
    pub serial: String,
    pub interface: i32,
    pub path: String,
    pub usage_page: u16,
    pub usage: u16,
}

/// Enumerate every HID device visible to the process.
pub fn list_all_devices() -> Result<Vec<HidDeviceSummary>, ScannerError> {
    let api = HidApi::new().map_err(ScannerError::Init)?;
    Ok(api
        .device_list()
        .map(|info| HidDeviceSummary {
            vendor_id: info.vendor_id(),
            product_id: info.product_id(),
            manufacturer: info.manufacturer_string().unwrap_or("").trim().to_string(),
            product: info.product_string().unwrap_or("").trim().to_string(),
            serial: info.serial_number().unwrap_or("").trim().to_string(),
            interface: info.interface_number(),
            path: info.path().to_string_lossy().into_owned(),
            usage_page: info.usage_page(),
            usage: info.usage(),
        })
        .collect())
}
