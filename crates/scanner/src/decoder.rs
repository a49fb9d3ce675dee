//! HID keyboard report decoder.
//!
//! A scanner emulating a keyboard delivers input reports of up to 8 bytes:
//! a modifier byte, a reserved byte, and up to six keycodes. The decoder
//! accumulates mapped characters until it sees the configured termination
//! keycode or the buffer has been idle for longer than the intra-scan key
//! gap, then emits the trimmed barcode through the scan callback.
//!
//! The decoder is single-consumer: it is owned by one session task and all
//! methods take `&mut self`.

use std::time::{Duration, Instant};

use habridge_core::TerminationChar;
use tracing::warn;

use crate::layouts::{self, KeyboardLayout};

const HID_KEY_ENTER: u8 = 0x28;
const HID_KEY_TAB: u8 = 0x2B;
/// Either shift modifier bit (left 0x02, right 0x20).
const HID_MODIFIER_SHIFT: u8 = 0x22;

const BUFFER_CAPACITY: usize = 256;
/// Must stay above the intra-scan key gap of real scanners.
const IDLE_TIMEOUT: Duration = Duration::from_millis(100);

type ScanCallback = Box<dyn Fn(&str) + Send>;

pub struct HidDecoder {
    termination_keycode: Option<u8>,
    layout: Option<&'static KeyboardLayout>,
    buffer: [u8; BUFFER_CAPACITY],
    len: usize,
    last_activity: Instant,
    on_scan: Option<ScanCallback>,
}

impl HidDecoder {
    /// Create a decoder for the given termination and layout name. Unknown
    /// layout names fall back to `us` with a warning; they never fail.
    pub fn new(termination: TerminationChar, layout_name: &str) -> Self {
        let layout = match layouts::get(layout_name) {
            Ok(layout) => {
                if !layouts::is_available(layout_name) {
                    warn!(
                        layout = layout_name,
                        "keyboard layout not available, using us fallback"
                    );
                }
                Some(layout)
            }
            Err(e) => {
                warn!(layout = layout_name, error = %e, "keyboard layouts unavailable");
                None
            }
        };

        Self {
            termination_keycode: termination_keycode(termination),
            layout,
            buffer: [0; BUFFER_CAPACITY],
            len: 0,
            last_activity: Instant::now(),
            on_scan: None,
        }
    }

    pub fn set_on_scan(&mut self, callback: impl Fn(&str) + Send + 'static) {
        self.on_scan = Some(Box::new(callback));
    }

    /// Feed one HID input report. Reports shorter than 3 bytes and all-zero
    /// (idle) reports are ignored.
    pub fn process_report(&mut self, data: &[u8]) {
        if data.len() < 3 {
            return;
        }
        if data.iter().all(|&b| b == 0) {
            return;
        }

        let shifted = data[0] & HID_MODIFIER_SHIFT != 0;
        let end = data.len().min(8);

        for &keycode in &data[2..end] {
            if keycode == 0 {
                continue;
            }

            if self.termination_keycode == Some(keycode) {
                self.finalize();
                return;
            }

            let ch = self
                .layout
                .map(|layout| layout.lookup(keycode, shifted))
                .unwrap_or(0);
            if ch != 0 && self.len < BUFFER_CAPACITY - 1 {
                self.buffer[self.len] = ch;
                self.len += 1;
                self.last_activity = Instant::now();
            }
        }
    }

    /// Finalize the buffered barcode when input has gone idle. Driven by a
    /// periodic tick from the owning session.
    pub fn check_timeout(&mut self) {
        if self.len > 0 && self.last_activity.elapsed() > IDLE_TIMEOUT {
            self.finalize();
        }
    }

    /// Discard any buffered input.
    pub fn reset(&mut self) {
        self.len = 0;
    }

    fn finalize(&mut self) {
        if self.len == 0 {
            return;
        }

        let raw = String::from_utf8_lossy(&self.buffer[..self.len]).into_owned();
        self.len = 0;

        let barcode = raw.trim();
        if barcode.is_empty() {
            return;
        }
        if let Some(callback) = &self.on_scan {
            callback(barcode);
        }
    }
}

fn termination_keycode(termination: TerminationChar) -> Option<u8> {
    match termination {
        TerminationChar::Enter => Some(HID_KEY_ENTER),
        TerminationChar::Tab => Some(HID_KEY_TAB),
        TerminationChar::None => None,
    }
}
