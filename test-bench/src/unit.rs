//! Per-slot unit records and pipeline states.

use hardware::oto::PressureSensorVariant;
use hardware::ports::UsbIdentity;
use strum::{Display, EnumIter};

/// Where a unit is in its pipeline.
///
/// Flash workflow:
/// `Idle → Flashing → Connecting → Connected → CheckingPressure → ReadingAdc
/// → Writing → CalibrationSuccess → Success`.
///
/// Decay workflow:
/// `Idle → Connecting → Connected → CheckingPressure ⇄ Waiting → Success`.
///
/// Any stage may jump straight to its failure state instead. `CheckPower`
/// is set by the orchestrator on every unit of a flash batch in which any
/// unit read an out-of-range battery ADC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum UnitState {
    Idle,
    Flashing,
    Connecting,
    Connected,
    CheckingPressure,
    Waiting,
    ReadingAdc,
    Writing,
    CalibrationSuccess,
    Success,
    FailConnectFlasher,
    FailFlash,
    FailConnect,
    FailPressure,
    FailAdc,
    FailCalibration,
    FailBatteryVoltage,
    CheckPower,
}

impl UnitState {
    /// True while a pipeline is still working on the unit.
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            Self::Flashing
                | Self::Connecting
                | Self::Connected
                | Self::CheckingPressure
                | Self::Waiting
                | Self::ReadingAdc
                | Self::Writing
                | Self::CalibrationSuccess
        )
    }

    pub fn is_failure(self) -> bool {
        matches!(
            self,
            Self::FailConnectFlasher
                | Self::FailFlash
                | Self::FailConnect
                | Self::FailPressure
                | Self::FailAdc
                | Self::FailCalibration
                | Self::FailBatteryVoltage
                | Self::CheckPower
        )
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Success || self.is_failure()
    }
}

/// Zero-pressure acceptance thresholds for one sensor variant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcceptanceBand {
    pub std_dev_min: f64,
    pub std_dev_max: f64,
    pub adc_min: f64,
    pub adc_max: f64,
}

/// MPRL 15 psi gauge (±4σ of the January 2023 production population).
pub const BAND_15_PSI: AcceptanceBand = AcceptanceBand {
    std_dev_min: 96.5,
    std_dev_max: 387.8,
    adc_min: 1_611_555.0,
    adc_max: 1_786_755.0,
};

/// MPRL 30 psi gauge (±4σ of the January 2023 production population).
pub const BAND_30_PSI: AcceptanceBand = AcceptanceBand {
    std_dev_min: 66.5,
    std_dev_max: 206.9,
    adc_min: 1_630_925.0,
    adc_max: 1_764_145.0,
};

impl AcceptanceBand {
    /// Band for a sensor variant, or `None` if the station does not accept
    /// that variant.
    pub fn for_variant(variant: PressureSensorVariant) -> Option<Self> {
        match variant {
            PressureSensorVariant::Gauge15Psi => Some(BAND_15_PSI),
            PressureSensorVariant::Gauge30Psi => Some(BAND_30_PSI),
            _ => None,
        }
    }

    pub fn accepts_std_dev(&self, std_dev: f64) -> bool {
        (self.std_dev_min..=self.std_dev_max).contains(&std_dev)
    }

    pub fn accepts_mean(&self, mean: f64) -> bool {
        (self.adc_min..=self.adc_max).contains(&mean)
    }
}

/// Everything the station knows about one flasher board slot.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitRecord {
    /// Zero-based slot index in configured order.
    pub slot: usize,
    pub identity: UsbIdentity,
    pub port: Option<String>,
    pub state: UnitState,
    /// MAC address, set once the unit has been connected.
    pub device_id: Option<String>,
    pub sensor_variant: Option<PressureSensorVariant>,
    pub zero_pressure_mean: Option<f64>,
    pub zero_pressure_std_dev: Option<f64>,
    pub battery_adc: Option<u32>,
    /// Latest decay rate in kPa/min (decay workflow only).
    pub decay_rate: Option<f64>,
    pub adc_out_of_range: bool,
    pub pressure_failed: bool,
}

impl UnitRecord {
    pub fn new(slot: usize, identity: UsbIdentity) -> Self {
        Self {
            slot,
            identity,
            port: None,
            state: UnitState::Idle,
            device_id: None,
            sensor_variant: None,
            zero_pressure_mean: None,
            zero_pressure_std_dev: None,
            battery_adc: None,
            decay_rate: None,
            adc_out_of_range: false,
            pressure_failed: false,
        }
    }

    /// One-based slot number shown to operators.
    pub fn label(&self) -> String {
        (self.slot + 1).to_string()
    }

    /// Clear every per-run field so a new run starts from the first step.
    pub fn reset_for_run(&mut self) {
        *self = Self::new(self.slot, self.identity.clone());
    }
}
