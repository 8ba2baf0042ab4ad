//! Typed messages exchanged with an OtO unit.

use std::fmt;

use strum::EnumIter;

/// Hardware revision of the unit's pressure sensor.
///
/// The numeric codes are the values of the firmware's pressure sensor
/// version field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter)]
pub enum PressureSensorVariant {
    /// Sensor has not been probed by the firmware yet.
    Uninitialized,
    /// TPBD 15 psi gauge used on the previous board design.
    LegacyGauge,
    /// MPRL 15 psi gauge.
    Gauge15Psi,
    /// MPRL 30 psi gauge.
    Gauge30Psi,
    /// Any code this station does not know about.
    Unknown,
}

impl PressureSensorVariant {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::Uninitialized,
            1 => Self::LegacyGauge,
            2 => Self::Gauge15Psi,
            3 => Self::Gauge30Psi,
            _ => Self::Unknown,
        }
    }

    pub fn code(self) -> Option<u8> {
        match self {
            Self::Uninitialized => Some(0),
            Self::LegacyGauge => Some(1),
            Self::Gauge15Psi => Some(2),
            Self::Gauge30Psi => Some(3),
            Self::Unknown => None,
        }
    }
}

impl fmt::Display for PressureSensorVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::LegacyGauge => "TPBD 15 psi (legacy)",
            Self::Gauge15Psi => "MPRL 15 psi",
            Self::Gauge30Psi => "MPRL 30 psi",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Push rate of the sensor sample stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter)]
pub enum SubscribeFrequency {
    Off,
    Hz1,
    Hz10,
    Hz100,
}

impl SubscribeFrequency {
    /// Samples per second, 0 when the stream is off.
    pub fn hz(self) -> u32 {
        match self {
            Self::Off => 0,
            Self::Hz1 => 1,
            Self::Hz10 => 10,
            Self::Hz100 => 100,
        }
    }
}

/// One pushed sensor record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorSample {
    /// Raw pressure ADC count.
    pub pressure_adc: i32,
    /// Pressure converted by the firmware, in kPa.
    pub pressure_kpa: f64,
    /// Battery terminal voltage at sample time.
    pub battery_voltage_v: f64,
}

/// Valve drive direction for the decay-test fixture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValveDirection {
    /// Release pressure.
    Open,
    /// Seal the test volume.
    Close,
}
