//! Persisted link settings.
//!
//! Settings live in a flat key/value file (TOML) using the historical
//! key names, including the per-port baud memory serialized as
//! `port:baud,port:baud` with no trailing comma. Load and save are
//! explicit calls against a path; nothing here is process-global.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::port::{DataBits, FlowControl, Parity, StopBits};

/// Line settings and per-port baud memory for a serial link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSettings {
    /// Port identifier, e.g. `/dev/ttyACM0` or `COM3`.
    pub port_name: String,
    /// Raw baud enumerant. May hold an out-of-set value verbatim while
    /// no device is attached.
    pub baud: u32,
    /// Data bits (5-8).
    pub data_bits: u8,
    /// Stop bits (1-2).
    pub stop_bits: u8,
    /// Parity: 0 = none, 2 = even, 1/3 = odd (legacy encoding).
    pub parity: u8,
    /// Flow control: 0 = none, 1 = hardware, 2 = software.
    pub flow_control: u8,
    /// Last-used baud rate per port identifier.
    pub port_baud_map: BTreeMap<String, u32>,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud: 115200,
            data_bits: 8,
            stop_bits: 1,
            parity: 0,
            flow_control: 0,
            port_baud_map: BTreeMap::new(),
        }
    }
}

/// On-disk mirror of [`LinkSettings`] with the historical key names.
#[derive(Debug, Serialize, Deserialize)]
struct SettingsFile {
    #[serde(rename = "SERIALLINK_COMM_PORT", default)]
    port: String,
    #[serde(rename = "SERIALLINK_COMM_BAUD", default = "default_baud")]
    baud: u32,
    #[serde(rename = "SERIALLINK_COMM_PARITY", default)]
    parity: u8,
    #[serde(rename = "SERIALLINK_COMM_STOPBITS", default = "default_stop_bits")]
    stop_bits: u8,
    #[serde(rename = "SERIALLINK_COMM_DATABITS", default = "default_data_bits")]
    data_bits: u8,
    #[serde(rename = "SERIALLINK_COMM_FLOW_CONTROL", default)]
    flow_control: u8,
    #[serde(rename = "SERIALLINK_COMM_PORTMAP", default)]
    port_map: String,
}

fn default_baud() -> u32 {
    115200
}

fn default_stop_bits() -> u8 {
    1
}

fn default_data_bits() -> u8 {
    8
}

impl LinkSettings {
    /// Load settings from `path`.
    ///
    /// A missing file yields the defaults. An empty decoded baud map is
    /// seeded with the stored port/baud pair.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No settings file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let text = fs::read_to_string(path)?;
        let file: SettingsFile =
            toml::from_str(&text).map_err(|e| Error::Config(e.to_string()))?;

        let mut port_baud_map = decode_port_map(&file.port_map);
        if port_baud_map.is_empty() && !file.port.is_empty() {
            port_baud_map.insert(file.port.clone(), file.baud);
        }

        Ok(Self {
            port_name: file.port,
            baud: file.baud,
            data_bits: file.data_bits,
            stop_bits: file.stop_bits,
            parity: file.parity,
            flow_control: file.flow_control,
            port_baud_map,
        })
    }

    /// Save settings to `path`, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = SettingsFile {
            port: self.port_name.clone(),
            baud: self.baud,
            parity: self.parity,
            stop_bits: self.stop_bits,
            data_bits: self.data_bits,
            flow_control: self.flow_control,
            port_map: encode_port_map(&self.port_baud_map),
        };

        let text = toml::to_string_pretty(&file).map_err(|e| Error::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, text)?;
        Ok(())
    }

    /// The remembered baud rate for `port`, if any.
    #[must_use]
    pub fn baud_for(&self, port: &str) -> Option<u32> {
        self.port_baud_map.get(port).copied()
    }

    /// Record `baud` as the last-used rate for `port`.
    pub fn remember_baud(&mut self, port: &str, baud: u32) {
        self.port_baud_map.insert(port.to_string(), baud);
    }

    /// The stored data bits as a line setting, defaulting to 8.
    #[must_use]
    pub fn line_data_bits(&self) -> DataBits {
        DataBits::from_count(self.data_bits).unwrap_or_default()
    }

    /// The stored stop bits as a line setting, defaulting to 1.
    #[must_use]
    pub fn line_stop_bits(&self) -> StopBits {
        StopBits::from_count(self.stop_bits).unwrap_or_default()
    }

    /// The stored parity as a line setting.
    ///
    /// Value 1 is accepted as odd for backwards compatibility alongside
    /// the usual 3.
    #[must_use]
    pub fn line_parity(&self) -> Parity {
        match self.parity {
            2 => Parity::Even,
            1 | 3 => Parity::Odd,
            _ => Parity::None,
        }
    }

    /// The stored flow control as a line setting.
    #[must_use]
    pub fn line_flow_control(&self) -> FlowControl {
        match self.flow_control {
            1 => FlowControl::Hardware,
            2 => FlowControl::Software,
            _ => FlowControl::None,
        }
    }
}

/// Serialize a baud map as `port:baud,port:baud` with no trailing comma.
#[must_use]
pub fn encode_port_map(map: &BTreeMap<String, u32>) -> String {
    let mut out = String::new();
    for (i, (port, baud)) in map.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        let _ = write!(out, "{port}:{baud}");
    }
    out
}

/// Parse a `port:baud,port:baud` string. Malformed entries are skipped.
#[must_use]
pub fn decode_port_map(encoded: &str) -> BTreeMap<String, u32> {
    let mut map = BTreeMap::new();
    for entry in encoded.split(',') {
        if entry.is_empty() {
            continue;
        }
        let mut parts = entry.splitn(2, ':');
        let port = parts.next().unwrap_or_default();
        let baud = parts.next().and_then(|b| b.parse::<u32>().ok());
        match baud {
            Some(baud) if !port.is_empty() => {
                map.insert(port.to_string(), baud);
            },
            _ => warn!("Skipping malformed port map entry: {entry:?}"),
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_map_round_trip() {
        let mut map = BTreeMap::new();
        map.insert("COM3".to_string(), 57600);
        map.insert("/dev/ttyACM0".to_string(), 115200);

        let encoded = encode_port_map(&map);
        assert!(!encoded.ends_with(','));
        assert_eq!(encoded, "/dev/ttyACM0:115200,COM3:57600");
        assert_eq!(decode_port_map(&encoded), map);
    }

    #[test]
    fn decode_skips_malformed_entries() {
        let map = decode_port_map("COM3:57600,bogus,COM4:abc,:9600,COM5:115200");
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("COM3"), Some(&57600));
        assert_eq!(map.get("COM5"), Some(&115200));
    }

    #[test]
    fn decode_empty_string() {
        assert!(decode_port_map("").is_empty());
    }

    #[test]
    fn settings_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("px4flash.toml");

        let mut settings = LinkSettings {
            port_name: "/dev/ttyACM0".to_string(),
            baud: 57600,
            parity: 2,
            ..LinkSettings::default()
        };
        settings.remember_baud("/dev/ttyACM0", 57600);
        settings.remember_baud("COM7", 115200);
        settings.save(&path).unwrap();

        let loaded = LinkSettings::load(&path).unwrap();
        assert_eq!(loaded, settings);
        assert_eq!(loaded.line_parity(), Parity::Even);
    }

    #[test]
    fn load_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = LinkSettings::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(loaded, LinkSettings::default());
    }

    #[test]
    fn empty_map_is_seeded_with_current_pair() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("px4flash.toml");

        let settings = LinkSettings {
            port_name: "COM3".to_string(),
            baud: 38400,
            ..LinkSettings::default()
        };
        // No remembered baud for any port yet.
        settings.save(&path).unwrap();

        let loaded = LinkSettings::load(&path).unwrap();
        assert_eq!(loaded.baud_for("COM3"), Some(38400));
    }

    #[test]
    fn legacy_parity_one_is_odd() {
        let settings = LinkSettings {
            parity: 1,
            ..LinkSettings::default()
        };
        assert_eq!(settings.line_parity(), Parity::Odd);
    }
}
