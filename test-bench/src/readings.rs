//! CSV result files.
//!
//! Both files are append-only and headerless so that rows from successive
//! batches (and successive station restarts) accumulate in one file:
//!
//! - the batch file (`readings.csv`): one row per connected unit per flash
//!   batch, `device_id, battery_adc, zero_pressure_mean, zero_pressure_std_dev`
//! - the decay file (`<device_id> readings.csv`): one row per decay sampling
//!   iteration, `timestamp, pressure, scaled_std_dev, rate, rate_uncertainty`

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::unit::UnitRecord;

#[derive(Error, Debug)]
pub enum ReadingsError {
    #[error("failed to open {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write CSV {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// One row of the batch file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReading {
    pub device_id: String,
    pub battery_adc: Option<u32>,
    pub zero_pressure_mean: Option<f64>,
    pub zero_pressure_std_dev: Option<f64>,
}

impl BatchReading {
    /// `None` for units that never reported a device identity.
    pub fn from_record(record: &UnitRecord) -> Option<Self> {
        let device_id = record.device_id.clone()?;
        Some(Self {
            device_id,
            battery_adc: record.battery_adc,
            zero_pressure_mean: record.zero_pressure_mean,
            zero_pressure_std_dev: record.zero_pressure_std_dev,
        })
    }
}

/// One row of a unit's decay file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecayReading {
    /// Local wall-clock time, `%Y-%m-%d %H:%M:%S`.
    pub timestamp: String,
    /// Mean gauge pressure in kPa.
    pub pressure_kpa: f64,
    /// Standard deviation multiplied by the coverage factor.
    pub std_dev_scaled: f64,
    /// kPa/min relative to the first row; empty on the first row.
    pub rate: Option<f64>,
    pub rate_uncertainty: Option<f64>,
}

fn append_rows<T: Serialize>(path: &Path, rows: &[T]) -> Result<(), ReadingsError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| ReadingsError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| ReadingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    let csv_error = |source| ReadingsError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    for row in rows {
        writer.serialize(row).map_err(csv_error)?;
    }
    writer.flush().map_err(|source| ReadingsError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn read_rows<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>, ReadingsError> {
    let csv_error = |source| ReadingsError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_path(path)
        .map_err(csv_error)?;
    reader
        .deserialize()
        .collect::<Result<Vec<T>, _>>()
        .map_err(csv_error)
}

pub fn append_batch_readings(path: &Path, rows: &[BatchReading]) -> Result<(), ReadingsError> {
    append_rows(path, rows)
}

pub fn read_batch_readings(path: &Path) -> Result<Vec<BatchReading>, ReadingsError> {
    read_rows(path)
}

/// Decay file for `device_id` inside `dir`.
///
/// Path separators and `:` (MAC addresses) are replaced so the identity is
/// usable as a file name on every platform.
pub fn decay_log_path(dir: &Path, device_id: &str) -> PathBuf {
    let name: String = device_id
        .chars()
        .map(|c| if matches!(c, ':' | '/' | '\\') { '-' } else { c })
        .collect();
    dir.join(format!("{name} readings.csv"))
}

pub fn append_decay_reading(path: &Path, reading: &DecayReading) -> Result<(), ReadingsError> {
    append_rows(path, std::slice::from_ref(reading))
}

pub fn read_decay_readings(path: &Path) -> Result<Vec<DecayReading>, ReadingsError> {
    read_rows(path)
}
