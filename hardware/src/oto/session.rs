//! Device session owning one unit's connection.

use std::sync::Arc;

use tracing::{debug, info};

use super::client::{OtoClient, OtoConnector, SessionError, SessionResult};
use super::messages::{PressureSensorVariant, SensorSample, SubscribeFrequency, ValveDirection};

/// A single bound connection to an OtO unit.
///
/// Owned exclusively by one unit pipeline for the duration of a run, so no
/// locking happens here. Dropping the session closes the connection.
pub struct DeviceSession {
    connector: Arc<dyn OtoConnector>,
    port: Option<String>,
    client: Option<Box<dyn OtoClient>>,
}

impl DeviceSession {
    pub fn new(connector: Arc<dyn OtoConnector>) -> Self {
        Self {
            connector,
            port: None,
            client: None,
        }
    }

    /// Connect to the unit on `port`, replacing any existing connection.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Connection`] if the transport cannot be
    /// established.
    pub fn connect(&mut self, port: &str, reset_on_connect: bool) -> SessionResult<()> {
        self.disconnect();

        debug!("Connecting to {port} (reset_on_connect={reset_on_connect})");
        let client = self.connector.connect(port, reset_on_connect)?;
        self.client = Some(client);
        self.port = Some(port.to_string());
        info!("Connected to unit on {port}");
        Ok(())
    }

    /// Port of the current connection, if any.
    pub fn port(&self) -> Option<&str> {
        self.port.as_deref()
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    fn client(&mut self) -> SessionResult<&mut Box<dyn OtoClient>> {
        self.client
            .as_mut()
            .ok_or_else(|| SessionError::Connection("session is not connected".to_string()))
    }

    /// Stable device address (Bluetooth MAC).
    pub fn identity(&mut self) -> SessionResult<String> {
        self.client()?.mac_address()
    }

    /// Query which pressure sensor the unit carries.
    pub fn pressure_sensor_variant(&mut self) -> SessionResult<PressureSensorVariant> {
        let code = self.client()?.pressure_sensor_version()?;
        Ok(PressureSensorVariant::from_code(code))
    }

    pub fn set_moving_average_filter(&mut self, enabled: bool) -> SessionResult<()> {
        self.client()?.use_moving_average_filter(enabled)
    }

    /// Toggle the pushed sensor stream. Samples queue up until drained.
    pub fn subscribe_sensor_stream(&mut self, frequency: SubscribeFrequency) -> SessionResult<()> {
        self.client()?.set_sensor_subscribe(frequency)
    }

    /// Drop queued packets, e.g. ones that arrived before a settle delay.
    pub fn clear_sensor_backlog(&mut self) -> SessionResult<()> {
        self.client()?.clear_incoming_packets();
        Ok(())
    }

    /// Take every sample accumulated since the previous drain.
    ///
    /// The returned iterator is finite and cannot be restarted; an empty
    /// drain means no packets arrived.
    pub fn drain_sensor_samples(&mut self) -> SessionResult<SampleDrain> {
        let samples = self.client()?.read_sensor_packets()?;
        Ok(SampleDrain {
            inner: samples.into_iter(),
        })
    }

    /// One instantaneous raw battery ADC reading.
    pub fn battery_voltage_adc(&mut self) -> SessionResult<u32> {
        self.client()?.battery_voltage_adc()
    }

    /// One instantaneous calibrated battery voltage reading, in volts.
    pub fn battery_voltage(&mut self) -> SessionResult<f64> {
        self.client()?.battery_voltage()
    }

    /// Read the stored calibration constant.
    ///
    /// Fails with [`SessionError::NotCalibrated`] on a fresh unit.
    pub fn read_calibration(&mut self) -> SessionResult<u32> {
        self.client()?.calibration_voltage()
    }

    pub fn write_calibration(&mut self, adc: u32) -> SessionResult<()> {
        self.client()?.set_calibration_voltage(adc)
    }

    /// Command the decay-test valve.
    pub fn set_actuator(&mut self, direction: ValveDirection, duty_cycle_percent: u8) -> SessionResult<()> {
        self.client()?.set_valve(direction, duty_cycle_percent.min(100))
    }

    /// Release the transport. Safe to call any number of times.
    pub fn disconnect(&mut self) {
        if let Some(mut client) = self.client.take() {
            client.stop_connection();
            if let Some(port) = self.port.take() {
                debug!("Disconnected from {port}");
            }
        }
        self.port = None;
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Samples taken by [`DeviceSession::drain_sensor_samples`].
#[derive(Debug)]
pub struct SampleDrain {
    inner: std::vec::IntoIter<SensorSample>,
}

impl Iterator for SampleDrain {
    type Item = SensorSample;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for SampleDrain {}
