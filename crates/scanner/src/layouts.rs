//! Embedded keyboard layout tables.
//!
//! Layouts are YAML descriptors bundled into the binary. Each descriptor
//! carries three keycode tables (`letters`, `numbers`, `symbols`) mapping a
//! HID keycode to an `[unshifted, shifted]` character pair, plus a set of
//! keycodes that must produce no output. Only single-byte (ASCII) characters
//! are representable because decoded barcodes are byte strings; layout files
//! omit positions that would produce anything else.
//!
//! The registry is process-wide and initialized once; [`load`] is called
//! explicitly at startup and every later lookup is read-only. A `us` layout
//! must be present — it is the fallback for unknown layout names.

use std::collections::HashMap;
use std::sync::OnceLock;

use rust_embed::RustEmbed;
use serde::Deserialize;
use thiserror::Error;

#[derive(RustEmbed)]
#[folder = "layouts/"]
struct LayoutFiles;

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("failed to parse layout file {file}: {source}")]
    Parse {
        file: String,
        source: serde_yaml::Error,
    },

    #[error("required us keyboard layout not found")]
    MissingUsLayout,
}

/// On-disk layout descriptor shape.
#[derive(Debug, Deserialize)]
struct LayoutDefinition {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    letters: HashMap<u8, [String; 2]>,
    #[serde(default)]
    numbers: HashMap<u8, [String; 2]>,
    #[serde(default)]
    symbols: HashMap<u8, [String; 2]>,
    #[serde(default)]
    ignored: Vec<u8>,
}

/// A loaded keyboard layout with byte-level lookup tables.
#[derive(Debug, Clone)]
pub struct KeyboardLayout {
    pub name: String,
    pub description: String,
    letters: HashMap<u8, [u8; 2]>,
    numbers: HashMap<u8, [u8; 2]>,
    symbols: HashMap<u8, [u8; 2]>,
    ignored: Vec<u8>,
}

impl KeyboardLayout {
    /// Map a keycode to an output byte. Lookup order: ignored short-circuits
    /// to 0, then letters, numbers, symbols; a miss yields 0.
    pub fn lookup(&self, keycode: u8, shifted: bool) -> u8 {
        if self.ignored.contains(&keycode) {
            return 0;
        }
        for table in [&self.letters, &self.numbers, &self.symbols] {
            if let Some(pair) = table.get(&keycode) {
                if pair[0] == 0 {
                    return 0;
                }
                return if shifted { pair[1] } else { pair[0] };
            }
        }
        0
    }
}

static LAYOUTS: OnceLock<HashMap<String, KeyboardLayout>> = OnceLock::new();

/// Load the embedded layouts. Idempotent; fails if any descriptor is
/// malformed or the `us` layout is missing.
pub fn load() -> Result<(), LayoutError> {
    registry().map(|_| ())
}

fn registry() -> Result<&'static HashMap<String, KeyboardLayout>, LayoutError> {
    if let Some(map) = LAYOUTS.get() {
        return Ok(map);
    }

    let mut parsed = HashMap::new();
    for file in LayoutFiles::iter() {
        let Some(layout_name) = file.strip_suffix(".yaml") else {
            continue;
        };
        let Some(data) = LayoutFiles::get(&file) else {
            continue;
        };
        let definition: LayoutDefinition =
            serde_yaml::from_slice(&data.data).map_err(|source| LayoutError::Parse {
                file: file.to_string(),
                source,
            })?;
        parsed.insert(layout_name.to_string(), convert(definition));
    }

    if !parsed.contains_key("us") {
        return Err(LayoutError::MissingUsLayout);
    }
    Ok(LAYOUTS.get_or_init(|| parsed))
}

fn convert(definition: LayoutDefinition) -> KeyboardLayout {
    KeyboardLayout {
        name: definition.name,
        description: definition.description,
        letters: convert_table(&definition.letters),
        numbers: convert_table(&definition.numbers),
        symbols: convert_table(&definition.symbols),
        ignored: definition.ignored,
    }
}

fn convert_table(source: &HashMap<u8, [String; 2]>) -> HashMap<u8, [u8; 2]> {
    source
        .iter()
        .filter(|(_, pair)| !pair[0].is_empty() && !pair[1].is_empty())
        .map(|(&keycode, pair)| (keycode, [pair[0].as_bytes()[0], pair[1].as_bytes()[0]]))
        .collect()
}

/// Look up a layout by name, falling back to `us` for unknown names.
pub fn get(name: &str) -> Result<&'static KeyboardLayout, LayoutError> {
    let map = registry()?;
    if let Some(layout) = map.get(name) {
        return Ok(layout);
    }
    map.get("us").ok_or(LayoutError::MissingUsLayout)
}

/// Sorted list of available layout names.
pub fn available() -> Vec<String> {
    let mut names: Vec<String> = registry()
        .map(|map| map.keys().cloned().collect())
        .unwrap_or_default();
    names.sort();
    names
}

pub fn is_available(name: &str) -> bool {
    registry().map(|map| map.contains_key(name)).unwrap_or(false)
}
