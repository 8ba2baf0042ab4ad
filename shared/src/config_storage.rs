//! Station configuration storage.
//!
//! The station keeps its settings in a single YAML file (`config.yml` next to
//! the binary by default):
//!
//! ```yaml
//! flasher_list:
//!   - vid: "0x10c4"
//!     pid: "0xea60"
//!     serial: "0001"
//!   - serial: "0002"
//! bom_number: "OTO-100"
//! base_url: "https://mes.example.com"
//! ```
//!
//! `flasher_list` order is the display and processing order of the test
//! slots. `vid` and `pid` may be written as hex strings (the format the setup
//! tool saves) or plain integers, and default to the CP210x flasher board
//! when omitted.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;
use tracing::{debug, info};

/// Default config file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yml";

/// USB vendor ID assumed when an entry omits `vid` (Silicon Labs CP210x).
pub const DEFAULT_FLASHER_VID: u16 = 0x10C4;

/// USB product ID assumed when an entry omits `pid` (Silicon Labs CP210x).
pub const DEFAULT_FLASHER_PID: u16 = 0xEA60;

/// Firmware flashed when the config does not name one.
pub const DEFAULT_FIRMWARE_VERSION: &str = "v2.4.0.0-v5";

/// Errors loading or saving the station config.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file {0} not found")]
    NotFound(PathBuf),

    #[error("Failed to access config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Flasher board {0} is not in the flasher list")]
    UnknownFlasher(String),
}

/// One configured flasher board.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlasherEntry {
    #[serde(
        default = "default_vid",
        deserialize_with = "deserialize_usb_id",
        serialize_with = "serialize_usb_id"
    )]
    pub vid: u16,
    #[serde(
        default = "default_pid",
        deserialize_with = "deserialize_usb_id",
        serialize_with = "serialize_usb_id"
    )]
    pub pid: u16,
    #[serde(deserialize_with = "deserialize_scalar_string")]
    pub serial: String,
}

impl FlasherEntry {
    /// Entry for a standard CP210x flasher board.
    pub fn flasher(serial: impl Into<String>) -> Self {
        Self {
            vid: DEFAULT_FLASHER_VID,
            pid: DEFAULT_FLASHER_PID,
            serial: serial.into(),
        }
    }
}

fn default_vid() -> u16 {
    DEFAULT_FLASHER_VID
}

fn default_pid() -> u16 {
    DEFAULT_FLASHER_PID
}

/// Contents of `config.yml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationConfig {
    pub flasher_list: Vec<FlasherEntry>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_optional_scalar_string"
    )]
    pub bom_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
}

impl StationConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self, serde_yml::Error> {
        serde_yml::from_str(text)
    }

    pub fn to_yaml_string(&self) -> Result<String, serde_yml::Error> {
        serde_yml::to_string(self)
    }

    /// Firmware version to flash, falling back to [`DEFAULT_FIRMWARE_VERSION`].
    pub fn firmware_version(&self) -> &str {
        self.firmware_version
            .as_deref()
            .unwrap_or(DEFAULT_FIRMWARE_VERSION)
    }

    /// Bring `flasher_list` in line with the boards currently attached.
    ///
    /// Configured boards keep their order; boards that are no longer attached
    /// are dropped and newly attached `(vid, pid)` boards are appended in
    /// enumeration order. Returns the serials that were added.
    pub fn reconcile_flashers(&mut self, vid: u16, pid: u16, attached: &[String]) -> Vec<String> {
        self.flasher_list
            .retain(|entry| entry.vid != vid || entry.pid != pid || attached.contains(&entry.serial));

        let mut added = Vec::new();
        for serial in attached {
            let known = self
                .flasher_list
                .iter()
                .any(|e| e.vid == vid && e.pid == pid && &e.serial == serial);
            if !known {
                self.flasher_list.push(FlasherEntry {
                    vid,
                    pid,
                    serial: serial.clone(),
                });
                added.push(serial.clone());
            }
        }
        added
    }

    /// Move flasher boards to new slots.
    ///
    /// Boards named in `order` take the first slots in that order; the rest
    /// keep their relative order after them. Nothing changes if a serial is
    /// not configured.
    pub fn reorder_flashers<S: AsRef<str>>(&mut self, order: &[S]) -> Result<(), ConfigError> {
        let mut front = Vec::with_capacity(order.len());
        let mut rest = self.flasher_list.clone();
        for serial in order {
            let serial = serial.as_ref();
            let index = rest
                .iter()
                .position(|entry| entry.serial == serial)
                .ok_or_else(|| ConfigError::UnknownFlasher(serial.to_string()))?;
            front.push(rest.remove(index));
        }
        front.extend(rest);
        self.flasher_list = front;
        Ok(())
    }

    /// Swap slot `index` with the one above it. Returns false at the top.
    pub fn move_flasher_up(&mut self, index: usize) -> bool {
        if index == 0 || index >= self.flasher_list.len() {
            return false;
        }
        self.flasher_list.swap(index - 1, index);
        true
    }

    /// Swap slot `index` with the one below it. Returns false at the bottom.
    pub fn move_flasher_down(&mut self, index: usize) -> bool {
        if index + 1 >= self.flasher_list.len() {
            return false;
        }
        self.flasher_list.swap(index, index + 1);
        true
    }
}

/// Location of the station config on disk.
#[derive(Debug, Clone)]
pub struct ConfigStorage {
    path: PathBuf,
}

impl Default for ConfigStorage {
    fn default() -> Self {
        Self::with_path(PathBuf::from(DEFAULT_CONFIG_FILE))
    }
}

impl ConfigStorage {
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load and parse the config.
    ///
    /// A missing or malformed file is an error; the station refuses to start
    /// without a valid flasher list.
    pub fn load(&self) -> Result<StationConfig, ConfigError> {
        let text = fs::read_to_string(&self.path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(self.path.clone())
            } else {
                ConfigError::Io {
                    path: self.path.clone(),
                    source,
                }
            }
        })?;

        let config = StationConfig::from_yaml_str(&text).map_err(|e| ConfigError::Parse {
            path: self.path.clone(),
            message: e.to_string(),
        })?;
        debug!(
            "Loaded {} flasher board(s) from {}",
            config.flasher_list.len(),
            self.path.display()
        );
        Ok(config)
    }

    /// Write `config`, replacing the file.
    pub fn save(&self, config: &StationConfig) -> Result<(), ConfigError> {
        let text = config.to_yaml_string().map_err(|e| ConfigError::Parse {
            path: self.path.clone(),
            message: e.to_string(),
        })?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(&self.path, text).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })?;
        info!(
            "Saved {} flasher board(s) to {}",
            config.flasher_list.len(),
            self.path.display()
        );
        Ok(())
    }
}

fn serialize_usb_id<S: Serializer>(value: &u16, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("{value:#x}"))
}

fn deserialize_usb_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
    struct UsbIdVisitor;

    impl Visitor<'_> for UsbIdVisitor {
        type Value = u16;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a USB id as an integer or a hex string like \"0x10c4\"")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<u16, E> {
            u16::try_from(v).map_err(|_| E::custom(format!("USB id {v} out of range")))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<u16, E> {
            u16::try_from(v).map_err(|_| E::custom(format!("USB id {v} out of range")))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<u16, E> {
            let trimmed = v.trim();
            let parsed = match trimmed
                .strip_prefix("0x")
                .or_else(|| trimmed.strip_prefix("0X"))
            {
                Some(hex) => u16::from_str_radix(hex, 16),
                None => trimmed.parse(),
            };
            parsed.map_err(|_| E::custom(format!("invalid USB id {v:?}")))
        }
    }

    deserializer.deserialize_any(UsbIdVisitor)
}

struct ScalarStringVisitor;

impl Visitor<'_> for ScalarStringVisitor {
    type Value = String;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a string or number")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<String, E> {
        Ok(v.to_string())
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<String, E> {
        Ok(v.to_string())
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<String, E> {
        Ok(v.to_string())
    }
}

// Serial numbers are sometimes written unquoted and arrive as integers.
fn deserialize_scalar_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    deserializer.deserialize_any(ScalarStringVisitor)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Text(String),
    Int(i64),
}

fn deserialize_optional_scalar_string<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    Ok(Option::<Scalar>::deserialize(deserializer)?.map(|scalar| match scalar {
        Scalar::Text(text) => text,
        Scalar::Int(number) => number.to_string(),
    }))
}
