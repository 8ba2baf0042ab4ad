//! Per-unit workflows.
//!
//! A pipeline drives one [`UnitRecord`] through an ordered sequence of
//! hardware steps. Each step either advances the unit's state or jumps to
//! that step's failure state; nothing is retried at this level. Every step
//! error is caught here, logged to the unit's own log as a bilingual message
//! and returned as the pipeline's result, so a failing board never takes the
//! worker thread or its neighbours down with it.
//!
//! Pipelines do not publish anything themselves. State changes and log lines
//! go to a [`UnitObserver`] supplied by the caller (the orchestrator).
//!
//! - [`flash`] - flash, qualify, calibrate and verify one unit
//! - [`decay`] - long-running pressure decay test of one unit

pub mod decay;
pub mod flash;

use std::error::Error as _;
use std::sync::Arc;

use hardware::flasher::{FirmwareFlasher, FlashError};
use hardware::oto::{DeviceSession, OtoConnector, PressureSensorVariant, SessionError};
use hardware::ports::{self, PortEnumerator, PortError};
use hardware::sim::SimulatedBench;
use thiserror::Error;
use tracing::{debug, error, info, warn, Level};

use crate::qualification::{AdcExcursion, QualificationError, VoltageError};
use crate::unit::{AcceptanceBand, UnitRecord, UnitState};

pub use decay::{run_decay_pipeline, DecaySettings};
pub use flash::{run_flash_pipeline, FlashSettings};

/// Receives everything a pipeline reports about its unit.
pub trait UnitObserver: Send + Sync {
    fn state_changed(&self, slot: usize, state: UnitState);
    fn log(&self, slot: usize, level: Level, line: &str);
}

/// The hardware seams a pipeline needs.
#[derive(Clone)]
pub struct StationHardware {
    pub ports: Arc<dyn PortEnumerator>,
    pub connector: Arc<dyn OtoConnector>,
    pub flasher: Arc<dyn FirmwareFlasher>,
}

impl StationHardware {
    pub fn simulated(bench: &SimulatedBench) -> Self {
        Self {
            ports: Arc::new(bench.ports()),
            connector: Arc::new(bench.connector()),
            flasher: Arc::new(bench.flasher()),
        }
    }
}

/// A failed pipeline step.
///
/// The display text is the operator-facing bilingual message.
#[derive(Error, Debug)]
pub enum StepError {
    #[error("{0}. Ensure flashing boards are connected to the computer\n确认USB通信测试板与计算机连接")]
    Port(#[source] PortError),

    #[error("Failed to flash PCB on {port}.\n存储{port}上的PCB失败\n{source}")]
    Flash {
        port: String,
        #[source]
        source: FlashError,
    },

    #[error("Failed to connect to board on port {port}:\n连接线路板失败\n{source}")]
    Connect {
        port: String,
        #[source]
        source: SessionError,
    },

    #[error("Failed to get pressure sensor address on port {port}:\n无法获得压力传感器地址\n{source}")]
    SensorQuery {
        port: String,
        #[source]
        source: SessionError,
    },

    #[error("{}", unsupported_sensor_message(.0))]
    UnsupportedSensor(PressureSensorVariant),

    #[error("{0}")]
    ZeroPressure(#[source] QualificationError),

    #[error("Failed to read voltage ADC from board on port {port}:\n线路板电压读取失败\n{source}")]
    BatteryAdcRead {
        port: String,
        #[source]
        source: SessionError,
    },

    #[error("{}", adc_excursion_message(.port, .excursion))]
    BatteryAdcOutOfRange {
        port: String,
        adc: u32,
        excursion: AdcExcursion,
    },

    #[error("Failed writing calibration value to board on port {port}:\n存储校正值到线路板失败\n{source}")]
    CalibrationWrite {
        port: String,
        #[source]
        source: SessionError,
    },

    #[error("{0}")]
    BatteryVoltage(#[source] VoltageError),

    #[error("Failed to drive the test valve on port {port}:\n阀门控制失败\n{source}")]
    Valve {
        port: String,
        #[source]
        source: SessionError,
    },

    #[error("{0}")]
    DecayPressure(#[source] QualificationError),
}

fn unsupported_sensor_message(variant: &PressureSensorVariant) -> &'static str {
    match variant {
        PressureSensorVariant::Uninitialized => "Uninitialized pressure sensor\n压力传感器未能启动",
        PressureSensorVariant::LegacyGauge => {
            "This is an old design board and should not be flashed on this station.\n这是一个旧的线路板设计, 不应存储到这个工作台"
        }
        _ => "Unknown pressure sensor detected\n检查到未知压力传感器",
    }
}

fn adc_excursion_message(port: &str, excursion: &AdcExcursion) -> String {
    match excursion {
        AdcExcursion::Low => format!("Measured voltage ADC value too low on port {port}\n测试电压太低"),
        AdcExcursion::High => format!("Measured voltage ADC value too high on port {port}\n测试电压太高"),
    }
}

impl StepError {
    /// The state a unit lands in when this step fails.
    pub fn failure_state(&self) -> UnitState {
        match self {
            Self::Port(_) => UnitState::FailConnectFlasher,
            Self::Flash { .. } => UnitState::FailFlash,
            Self::Connect { .. } | Self::SensorQuery { .. } | Self::Valve { .. } => {
                UnitState::FailConnect
            }
            Self::UnsupportedSensor(_) | Self::ZeroPressure(_) | Self::DecayPressure(_) => {
                UnitState::FailPressure
            }
            Self::BatteryAdcRead { .. } | Self::BatteryAdcOutOfRange { .. } => UnitState::FailAdc,
            Self::CalibrationWrite { .. } => UnitState::FailCalibration,
            Self::BatteryVoltage(_) => UnitState::FailBatteryVoltage,
        }
    }
}

/// A unit record plus the observer its pipeline reports to.
pub(crate) struct UnitContext<'a> {
    pub record: &'a mut UnitRecord,
    observer: &'a dyn UnitObserver,
}

impl<'a> UnitContext<'a> {
    pub fn new(record: &'a mut UnitRecord, observer: &'a dyn UnitObserver) -> Self {
        Self { record, observer }
    }

    pub fn transition(&mut self, state: UnitState) {
        debug!(unit = self.record.slot + 1, "{} -> {}", self.record.state, state);
        self.record.state = state;
        self.observer.state_changed(self.record.slot, state);
    }

    pub fn log(&self, level: Level, line: &str) {
        let unit = self.record.slot + 1;
        match level {
            Level::ERROR => error!(unit = unit, "{line}"),
            Level::WARN => warn!(unit = unit, "{line}"),
            Level::INFO => info!(unit = unit, "{line}"),
            _ => debug!(unit = unit, "{line}"),
        }
        self.observer.log(self.record.slot, level, line);
    }

    pub fn info(&self, line: &str) {
        self.log(Level::INFO, line);
    }

    pub fn warn(&self, line: &str) {
        self.log(Level::WARN, line);
    }

    /// Resolve the unit's flasher board to a live port.
    pub fn resolve_port(&mut self, enumerator: &dyn PortEnumerator) -> Result<String, StepError> {
        self.record.port = None;
        let port = ports::resolve(enumerator, &self.record.identity).map_err(StepError::Port)?;
        debug!(unit = self.record.slot + 1, "{} is on {port}", self.record.identity);
        self.record.port = Some(port.clone());
        Ok(port)
    }

    /// Connect `session` (resetting the unit) and record its MAC address.
    pub fn connect(&mut self, session: &mut DeviceSession, port: &str) -> Result<(), StepError> {
        let connect_error = |source| StepError::Connect {
            port: port.to_string(),
            source,
        };
        self.info("Waiting for board to reboot...\n等待线路板重启");
        session.connect(port, true).map_err(connect_error)?;
        let mac = session.identity().map_err(connect_error)?;
        self.info(&format!("Connected to {mac}"));
        self.record.device_id = Some(mac);
        Ok(())
    }

    /// Query the sensor variant and pick its acceptance band.
    pub fn detect_sensor(
        &mut self,
        session: &mut DeviceSession,
        port: &str,
    ) -> Result<AcceptanceBand, StepError> {
        let variant = session
            .pressure_sensor_variant()
            .map_err(|source| StepError::SensorQuery {
                port: port.to_string(),
                source,
            })?;
        self.record.sensor_variant = Some(variant);

        match variant {
            PressureSensorVariant::Gauge15Psi => {
                self.info("15 psi pressure sensor detected\n检测到0.1MPa压力传感器")
            }
            PressureSensorVariant::Gauge30Psi => {
                self.info("30 psi pressure sensor detected\n检测到0.21MPa压力传感器")
            }
            _ => {}
        }
        AcceptanceBand::for_variant(variant).ok_or(StepError::UnsupportedSensor(variant))
    }

    /// Log `err`, move to its failure state and hand it back.
    pub fn fail(&mut self, err: StepError) -> StepError {
        self.log(Level::ERROR, &err.to_string());
        if let Some(cause) = err.source() {
            if !err.to_string().contains(&cause.to_string()) {
                self.log(Level::DEBUG, &format!("Cause: {cause}"));
            }
        }
        self.transition(err.failure_state());
        err
    }
}
