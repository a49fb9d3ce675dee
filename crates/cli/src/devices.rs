//! `--list-devices`: print enumerated HID devices as a ready-to-paste
//! `scanners:` configuration snippet.

use anyhow::Result;

use habridge_scanner::{list_all_devices, HidDeviceSummary};

pub fn print_config_snippet() -> Result<()> {
    let devices = list_all_devices()?;
    if devices.is_empty() {
        println!("# No HID devices found - check permissions or udev rules");
        return Ok(());
    }

    println!("scanners:");
    for device in &devices {
        print_device(device);
    }
    Ok(())
}

fn print_device(device: &HidDeviceSummary) {
    let name = friendly_name(device);
    let scanner_id = generate_scanner_id(&name, device);

    println!("  {scanner_id}:");
    println!("    # Device Path: {}", device.path);
    if !device.manufacturer.is_empty() {
        println!("    # Manufacturer: {}", device.manufacturer);
    }
    if !device.product.is_empty() {
        println!("    # Product: {}", device.product);
    }
    println!(
        "    # Usage Page: {}, Usage: {}",
        device.usage_page, device.usage
    );
    if device.interface > 0 {
        println!(
            "    # Note: multiple interfaces found for device {:04x}:{:04x} (serial: {}).",
            device.vendor_id, device.product_id, device.serial
        );
        println!("    # Test which interface responds to scans.");
    }

    println!("    name: \"{name}\"");
    println!("    identification:");
    println!("      vendor_id: 0x{:04x}", device.vendor_id);
    println!("      product_id: 0x{:04x}", device.product_id);
    if !device.serial.is_empty() {
        println!("      serial: \"{}\"", device.serial);
    }
    if device.interface > 0 {
        println!("      interface: {}", device.interface);
    }
    println!("    termination_char: \"enter\"  # Options: enter, tab, none");
    println!();
}

fn friendly_name(device: &HidDeviceSummary) -> String {
    let mut name = if device.product.is_empty() {
        "Unknown Device".to_string()
    } else {
        device.product.clone()
    };
    if !device.manufacturer.is_empty() && device.manufacturer != name {
        name = format!("{} {}", device.manufacturer, name);
    }
    name
}

/// Derive a valid YAML map key from the device name, qualified with the
/// interface index and serial when present so that same-VID:PID devices get
/// distinct ids.
fn generate_scanner_id(name: &str, device: &HidDeviceSummary) -> String {
    let mut id = sanitize(name);

    if id.is_empty() || id.starts_with(|c: char| c.is_ascii_digit()) {
        id = format!("scanner_{id}");
    }
    if id == "scanner_" || id.is_empty() {
        id = "scanner".to_string();
    }

    if device.interface > 0 {
        id = format!("{id}_{}", device.interface);
    }
    if !device.serial.is_empty() {
        let suffix = sanitize(&device.serial);
        if !suffix.is_empty() {
            id = format!("{id}_{suffix}");
        }
    }
    id
}

/// Lowercase, with every non-alphanumeric run collapsed to one underscore.
fn sanitize(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    let mut last_was_separator = true;
    for c in value.chars() {
        if c.is_ascii_alphanumeric() {
            result.push(c.to_ascii_lowercase());
            last_was_separator = false;
        } else if !last_was_separator {
            result.push('_');
            last_was_separator = true;
        }
    }
    result.trim_matches('_').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(product: &str, serial: &str, interface: i32) -> HidDeviceSummary {
        HidDeviceSummary {
            vendor_id: 0x0c2e,
            product_id: 0x0b61,
            manufacturer: "Honeywell".to_string(),
            product: product.to_string(),
            serial: serial.to_string(),
            interface,
            path: "/dev/hidraw0".to_string(),
            usage_page: 1,
            usage: 6,
        }
    }

    #[test]
    fn sanitize_collapses_special_characters() {
        assert_eq!(sanitize("Voyager 1200g (USB)"), "voyager_1200g_usb");
        assert_eq!(sanitize("  --  "), "");
    }

    #[test]
    fn scanner_id_from_name() {
        let device = summary("Voyager 1200g", "", 0);
        assert_eq!(
            generate_scanner_id("Honeywell Voyager 1200g", &device),
            "honeywell_voyager_1200g"
        );
    }

    #[test]
    fn scanner_id_gets_interface_and_serial_suffixes() {
        let device = summary("Voyager", "S-12", 1);
        assert_eq!(
            generate_scanner_id("Honeywell Voyager", &device),
            "honeywell_voyager_1_s_12"
        );
    }

    #[test]
    fn scanner_id_for_numeric_name() {
        let device = summary("1200g", "", 0);
        assert_eq!(generate_scanner_id("1200g", &device), "scanner_1200g");
    }

    #[test]
    fn scanner_id_for_empty_name() {
        let device = summary("", "", 0);
        assert_eq!(generate_scanner_id("", &device), "scanner");
    }

    #[test]
    fn friendly_name_combines_manufacturer_and_product() {
        let device = summary("Voyager", "", 0);
        assert_eq!(friendly_name(&device), "Honeywell Voyager");

        let unnamed = HidDeviceSummary {
            manufacturer: String::new(),
            product: String::new(),
            ..summary("", "", 0)
        };
        assert_eq!(friendly_name(&unnamed), "Unknown Device");
    }
}
