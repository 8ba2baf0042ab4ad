//! Vendor protocol client seam.

use thiserror::Error;

use super::messages::{SensorSample, SubscribeFrequency, ValveDirection};

/// Errors raised by the device protocol layer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    /// Transport could not be established or is not open
    /// (timeout, protocol mismatch, call before connect).
    #[error("Connection error: {0}")]
    Connection(String),

    /// The unit answered with a malformed or unexpected message.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The unit has no stored calibration constant.
    ///
    /// Expected on first-time provisioning; callers treat it as
    /// "no prior value" rather than a fault.
    #[error("Device is not calibrated")]
    NotCalibrated,

    /// Generic transport failure on an established link.
    #[error("Transport failure: {0}")]
    Transport(String),
}

/// Result type for device session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Blocking RPC interface of a connected OtO unit.
///
/// Every call blocks the calling thread until the unit answers or the
/// client's own timeout expires. No additional timeout is layered on top.
pub trait OtoClient: Send {
    /// Bluetooth MAC address of the unit, e.g. `a4:cf:12:00:00:01`.
    fn mac_address(&mut self) -> SessionResult<String>;

    /// Raw pressure sensor version code.
    fn pressure_sensor_version(&mut self) -> SessionResult<u8>;

    /// Enable or disable the firmware's moving-average pressure filter.
    fn use_moving_average_filter(&mut self, enabled: bool) -> SessionResult<()>;

    /// Start, change or stop the pushed sensor stream.
    fn set_sensor_subscribe(&mut self, frequency: SubscribeFrequency) -> SessionResult<()>;

    /// Discard every packet received so far.
    fn clear_incoming_packets(&mut self);

    /// Consume every sensor packet received since the last call.
    fn read_sensor_packets(&mut self) -> SessionResult<Vec<SensorSample>>;

    /// Instantaneous raw battery ADC reading.
    fn battery_voltage_adc(&mut self) -> SessionResult<u32>;

    /// Instantaneous battery voltage after calibration, in volts.
    fn battery_voltage(&mut self) -> SessionResult<f64>;

    /// Stored 4.1 V calibration constant, or [`SessionError::NotCalibrated`].
    fn calibration_voltage(&mut self) -> SessionResult<u32>;

    /// Persist a new 4.1 V calibration constant on the unit.
    fn set_calibration_voltage(&mut self, adc: u32) -> SessionResult<()>;

    /// Drive the decay-test valve. Fire-and-forget on the unit side.
    fn set_valve(&mut self, direction: ValveDirection, duty_cycle_percent: u8) -> SessionResult<()>;

    /// Close the transport.
    fn stop_connection(&mut self);
}

/// Opens [`OtoClient`] connections on a serial port.
pub trait OtoConnector: Send + Sync {
    /// Establish a connection on `port`.
    ///
    /// With `reset_on_connect` the unit is hardware-reset through the flasher
    /// board's control lines and the call waits for it to boot.
    fn connect(&self, port: &str, reset_on_connect: bool) -> SessionResult<Box<dyn OtoClient>>;
}

/// Stand-in [`OtoConnector`] for builds without a vendor protocol client.
///
/// Every connection attempt fails, so ports and flashing still work against
/// attached hardware while every protocol step reports `FailConnect`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnlinkedConnector;

impl OtoConnector for UnlinkedConnector {
    fn connect(&self, port: &str, _reset_on_connect: bool) -> SessionResult<Box<dyn OtoClient>> {
        Err(SessionError::Connection(format!(
            "no OtO protocol client is linked into this build, cannot open {port}"
        )))
    }
}
