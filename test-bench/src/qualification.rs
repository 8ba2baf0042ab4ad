//! Statistical qualification of a unit's sensors.
//!
//! Two checks live here:
//!
//! - **Zero pressure**: sample the raw pressure ADC with no pressure applied
//!   and require both the mean and the population standard deviation to fall
//!   inside the sensor variant's [`AcceptanceBand`]. Up to
//!   [`ZeroPressureSettings::trials`] windows are collected; the first passing
//!   window ends the check. A window with no samples at all is fatal
//!   immediately because it points at a dead stream, not a marginal sensor.
//! - **Battery**: average a fixed number of battery readings, either the raw
//!   ADC (before calibration) or the calibrated voltage (after it).
//!
//! Device access goes through [`PressureSampler`] and [`BatteryProbe`] so the
//! statistics can be driven with scripted readings.

use std::ops::RangeInclusive;
use std::thread;
use std::time::{Duration, Instant};

use hardware::oto::{
    DeviceSession, SensorSample, SessionError, SessionResult, SubscribeFrequency,
};
use thiserror::Error;

use crate::unit::AcceptanceBand;

/// Battery ADC counts accepted as a 4.1 V supply.
pub const BATTERY_ADC_RANGE: RangeInclusive<u32> = 2113..=2631;

/// Calibrated battery voltage accepted after calibration.
pub const BATTERY_VOLTAGE_RANGE: RangeInclusive<f64> = 4.05..=4.15;

/// Zero-pressure sampling parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ZeroPressureSettings {
    pub trials: u32,
    /// Wall-clock length of one collection window, settle time included.
    pub window: Duration,
    /// Delay after subscribing before stale packets are discarded.
    pub settle: Duration,
    pub frequency: SubscribeFrequency,
    /// Sleep between drains inside a window.
    pub poll_interval: Duration,
}

impl Default for ZeroPressureSettings {
    fn default() -> Self {
        Self {
            trials: 2,
            window: Duration::from_secs(3),
            settle: Duration::from_millis(100),
            frequency: SubscribeFrequency::Hz100,
            poll_interval: Duration::from_millis(10),
        }
    }
}

/// Battery sampling parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct BatterySettings {
    pub samples: u32,
    pub spacing: Duration,
}

impl Default for BatterySettings {
    fn default() -> Self {
        Self {
            samples: 9,
            spacing: Duration::from_millis(100),
        }
    }
}

/// Samples gathered over one collection window.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleWindow {
    pub samples: Vec<SensorSample>,
    pub elapsed: Duration,
}

/// Source of sensor sample windows.
pub trait PressureSampler {
    fn collect_window(&mut self, settings: &ZeroPressureSettings) -> SessionResult<SampleWindow>;
}

impl PressureSampler for DeviceSession {
    fn collect_window(&mut self, settings: &ZeroPressureSettings) -> SessionResult<SampleWindow> {
        let start = Instant::now();
        self.subscribe_sensor_stream(settings.frequency)?;
        thread::sleep(settings.settle);
        self.clear_sensor_backlog()?;

        let mut samples = Vec::new();
        while start.elapsed() <= settings.window {
            samples.extend(self.drain_sensor_samples()?);
            thread::sleep(settings.poll_interval);
        }
        samples.extend(self.drain_sensor_samples()?);
        self.subscribe_sensor_stream(SubscribeFrequency::Off)?;

        Ok(SampleWindow {
            samples,
            elapsed: start.elapsed(),
        })
    }
}

/// Instantaneous battery readings.
pub trait BatteryProbe {
    fn battery_adc(&mut self) -> SessionResult<u32>;
    fn battery_voltage(&mut self) -> SessionResult<f64>;
}

impl BatteryProbe for DeviceSession {
    fn battery_adc(&mut self) -> SessionResult<u32> {
        self.battery_voltage_adc()
    }

    fn battery_voltage(&mut self) -> SessionResult<f64> {
        DeviceSession::battery_voltage(self)
    }
}

/// Mean and population standard deviation of a window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowStats {
    pub mean: f64,
    pub std_dev: f64,
    pub count: usize,
}

impl WindowStats {
    /// `None` for an empty slice.
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let count = values.len();
        let mean = values.iter().sum::<f64>() / count as f64;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;
        Some(Self {
            mean,
            std_dev: variance.sqrt(),
            count,
        })
    }
}

/// Round half to even to `decimals` places.
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round_ties_even() / scale
}

/// Which part of the band a failed window missed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandViolation {
    Mean,
    StdDev,
    Both,
}

impl BandViolation {
    fn check(band: &AcceptanceBand, mean: f64, std_dev: f64) -> Option<Self> {
        match (band.accepts_mean(mean), band.accepts_std_dev(std_dev)) {
            (true, true) => None,
            (false, true) => Some(Self::Mean),
            (true, false) => Some(Self::StdDev),
            (false, false) => Some(Self::Both),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum QualificationError {
    #[error("No pressure data was collected.\n未收集压力数值")]
    NoDataCollected,

    #[error("{}", failed_message(.violation, .mean, .std_dev))]
    Failed {
        violation: BandViolation,
        mean: f64,
        std_dev: f64,
    },

    #[error("{0}")]
    Session(#[from] SessionError),
}

fn failed_message(violation: &BandViolation, mean: &f64, std_dev: &f64) -> String {
    let (what, chinese) = match violation {
        BandViolation::Both => ("Mean AND STD", "平均和标准差值零压力检查失败"),
        BandViolation::StdDev => ("STD", "标准差值零压力检查失败"),
        BandViolation::Mean => ("Mean", "平均值零压力检查失败"),
    };
    format!(
        "Failed Zero Pressure Check on {what}: Pressure: {} ADC, sigma: {} ADC\n{chinese}",
        group_thousands(*mean, 0),
        group_thousands(*std_dev, 1)
    )
}

/// Format with `,` thousands separators, e.g. `1,700,000`.
pub fn group_thousands(value: f64, decimals: usize) -> String {
    let text = format!("{:.*}", decimals, value.abs());
    let (int_part, frac_part) = match text.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (text.as_str(), None),
    };

    let mut grouped = String::new();
    for (i, digit) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }
    if let Some(frac) = frac_part {
        grouped.push('.');
        grouped.push_str(frac);
    }
    if value < 0.0 && grouped.chars().any(|c| c != '0' && c != '.' && c != ',') {
        grouped.insert(0, '-');
    }
    grouped
}

/// Outcome of a passing zero-pressure check.
#[derive(Debug, Clone, PartialEq)]
pub struct ZeroPressureReading {
    /// Mean raw ADC, rounded to whole counts.
    pub mean: f64,
    /// Population standard deviation, rounded to 0.1 counts.
    pub std_dev: f64,
    pub count: usize,
    pub elapsed: Duration,
    pub trials: u32,
}

/// Run the zero-pressure check against `band`.
///
/// `on_trial` sees the rounded mean and std-dev of every completed window,
/// passing or not, so callers can keep the latest values for reporting.
pub fn qualify_zero_pressure(
    sampler: &mut dyn PressureSampler,
    band: &AcceptanceBand,
    settings: &ZeroPressureSettings,
    on_trial: &mut dyn FnMut(f64, f64),
) -> Result<ZeroPressureReading, QualificationError> {
    let mut last_failure = None;

    for trial in 1..=settings.trials.max(1) {
        let window = sampler.collect_window(settings)?;
        let values: Vec<f64> = window
            .samples
            .iter()
            .map(|s| f64::from(s.pressure_adc))
            .collect();
        let stats = WindowStats::from_values(&values).ok_or(QualificationError::NoDataCollected)?;

        let mean = round_to(stats.mean, 0);
        let std_dev = round_to(stats.std_dev, 1);
        on_trial(mean, std_dev);

        match BandViolation::check(band, mean, std_dev) {
            None => {
                return Ok(ZeroPressureReading {
                    mean,
                    std_dev,
                    count: stats.count,
                    elapsed: window.elapsed,
                    trials: trial,
                })
            }
            Some(violation) => {
                tracing::debug!(
                    "Zero pressure trial {trial} failed ({violation:?}): mean {mean}, std {std_dev}"
                );
                last_failure = Some(QualificationError::Failed {
                    violation,
                    mean,
                    std_dev,
                });
            }
        }
    }

    Err(last_failure.unwrap_or(QualificationError::NoDataCollected))
}

/// Average of `settings.samples` raw battery ADC readings, rounded to whole
/// counts.
pub fn average_battery_adc(probe: &mut dyn BatteryProbe, settings: &BatterySettings) -> SessionResult<u32> {
    let mut readings = Vec::with_capacity(settings.samples as usize);
    for _ in 0..settings.samples.max(1) {
        readings.push(f64::from(probe.battery_adc()?));
        thread::sleep(settings.spacing);
    }
    let mean = readings.iter().sum::<f64>() / readings.len() as f64;
    Ok(round_to(mean, 0) as u32)
}

/// A battery ADC average outside [`BATTERY_ADC_RANGE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdcExcursion {
    Low,
    High,
}

pub fn check_battery_adc(adc: u32, range: &RangeInclusive<u32>) -> Result<(), AdcExcursion> {
    if adc < *range.start() {
        Err(AdcExcursion::Low)
    } else if adc > *range.end() {
        Err(AdcExcursion::High)
    } else {
        Ok(())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VoltageError {
    #[error("Board voltage is not 4.1±0.05V\n线路板没有读取4.1±0.05V: {volts} V")]
    OutOfRange { volts: f64 },

    #[error("Failed to read board voltage: {0}\n线路板电压读取失败")]
    Session(#[from] SessionError),
}

/// Average calibrated battery voltage, rounded to millivolts, checked
/// against [`BATTERY_VOLTAGE_RANGE`].
pub fn verify_battery_voltage(
    probe: &mut dyn BatteryProbe,
    settings: &BatterySettings,
) -> Result<f64, VoltageError> {
    let mut readings = Vec::with_capacity(settings.samples as usize);
    for _ in 0..settings.samples.max(1) {
        readings.push(probe.battery_voltage()?);
        thread::sleep(settings.spacing);
    }
    let volts = round_to(readings.iter().sum::<f64>() / readings.len() as f64, 3);

    if BATTERY_VOLTAGE_RANGE.contains(&volts) {
        Ok(volts)
    } else {
        Err(VoltageError::OutOfRange { volts })
    }
}
