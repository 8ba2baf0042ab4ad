//! Simulated flashing bench.
//!
//! A [`SimulatedBench`] stands in for a rack of flasher boards with OtO units
//! attached. It hands out the three hardware seams the station is written
//! against:
//!
//! - [`SimulatedPorts`] - a [`PortEnumerator`] listing one CP210x port per board
//! - [`SimulatedConnector`] - an [`OtoConnector`] opening protocol clients
//! - [`SimulatedFlasher`] - a [`FirmwareFlasher`] that pretends to run esptool
//!
//! All three share the same board state, so calibration written through one
//! connection is visible after a reconnect and a board unplugged through
//! [`SimulatedBench::set_attached`] disappears from enumeration.
//!
//! Sensor packets are produced lazily at the subscribed rate: whenever the
//! client is polled, every packet that would have arrived since the last poll
//! is synthesised with Gaussian noise from a per-board seeded RNG.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use tracing::debug;

use crate::flasher::{FirmwareFlasher, FlashError};
use crate::oto::{
    OtoClient, OtoConnector, SensorSample, SessionError, SessionResult, SubscribeFrequency,
    ValveDirection,
};
use crate::ports::{PortEnumerator, PortError, PortIdentity, UsbIdentity, FLASHER_PID, FLASHER_VID};

/// Battery voltage the calibration constant is referenced to.
const CALIBRATION_REFERENCE_V: f64 = 4.1;

/// Calibration constant assumed by the firmware before one is written.
const FACTORY_CALIBRATION_ADC: u32 = 2372;

/// Injected failures for a simulated board.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoardFaults {
    /// esptool cannot sync with the bootloader.
    pub flash_fails: bool,
    /// The protocol client cannot open the port.
    pub connect_fails: bool,
    /// The pressure sensor version query returns garbage.
    pub sensor_query_fails: bool,
    /// Subscribed but no packets ever arrive.
    pub silent_sensor: bool,
    /// Battery ADC reads fail on the transport.
    pub battery_adc_fails: bool,
    /// Calibration writes are rejected.
    pub calibration_write_fails: bool,
}

/// Physical characteristics of one simulated unit and its flasher board.
#[derive(Debug, Clone, PartialEq)]
pub struct BoardProfile {
    /// Serial number of the CP210x flasher board.
    pub flasher_serial: String,
    /// Bluetooth MAC address reported by the unit.
    pub mac: String,
    /// Raw pressure sensor version code.
    pub sensor_version: u8,
    /// Mean raw pressure ADC at atmospheric pressure.
    pub zero_pressure_adc: f64,
    /// Standard deviation of the raw pressure ADC.
    pub zero_pressure_std: f64,
    /// Gauge pressure when the decay fixture valve is closed, in kPa.
    pub pressure_kpa: f64,
    /// Standard deviation of the converted pressure, in kPa.
    pub pressure_noise_kpa: f64,
    /// Leak rate of the sealed fixture, in kPa per minute.
    pub leak_kpa_per_min: f64,
    /// Battery ADC count with the bench supply attached.
    pub battery_adc: u32,
    /// Error added to every reported battery voltage, in volts.
    pub voltage_offset_v: f64,
    /// Calibration constant stored on the unit before the run.
    pub calibration: Option<u32>,
    /// Time a simulated esptool run takes.
    pub flash_duration: Duration,
    pub faults: BoardFaults,
}

impl BoardProfile {
    /// A healthy 15 psi unit that passes every station check.
    pub fn nominal(index: usize) -> Self {
        Self {
            flasher_serial: format!("SIM{index:04}"),
            mac: format!("a4:cf:12:00:{:02x}:{:02x}", (index >> 8) & 0xff, index & 0xff),
            sensor_version: 2,
            zero_pressure_adc: 1_700_000.0,
            zero_pressure_std: 200.0,
            pressure_kpa: 100.0,
            pressure_noise_kpa: 0.05,
            leak_kpa_per_min: 0.2,
            battery_adc: 2372,
            voltage_offset_v: 0.0,
            calibration: None,
            flash_duration: Duration::ZERO,
            faults: BoardFaults::default(),
        }
    }

    pub fn usb_identity(&self) -> UsbIdentity {
        UsbIdentity::flasher(self.flasher_serial.clone())
    }
}

#[derive(Debug)]
struct BoardState {
    attached: bool,
    calibration: Option<u32>,
    flashed_version: Option<String>,
    moving_average: bool,
    subscription: SubscribeFrequency,
    stream_start: Instant,
    emitted: u64,
    pending: Vec<SensorSample>,
    valve: Option<ValveDirection>,
    valve_closed_at: Option<Instant>,
    rng: StdRng,
}

impl BoardState {
    fn new(index: usize, profile: &BoardProfile) -> Self {
        Self {
            attached: true,
            calibration: profile.calibration,
            flashed_version: None,
            moving_average: false,
            subscription: SubscribeFrequency::Off,
            stream_start: Instant::now(),
            emitted: 0,
            pending: Vec::new(),
            valve: None,
            valve_closed_at: None,
            rng: StdRng::seed_from_u64(index as u64),
        }
    }

    /// Queue every packet the unit would have pushed up to `now`.
    fn catch_up(&mut self, profile: &BoardProfile, now: Instant) {
        let hz = self.subscription.hz();
        if hz == 0 || profile.faults.silent_sensor {
            return;
        }

        let elapsed = now.saturating_duration_since(self.stream_start).as_secs_f64();
        let due = (elapsed * f64::from(hz)).floor() as u64;
        while self.emitted < due {
            let sample = self.sample(profile, now);
            self.pending.push(sample);
            self.emitted += 1;
        }
    }

    fn sample(&mut self, profile: &BoardProfile, now: Instant) -> SensorSample {
        let pressure_adc = gaussian(&mut self.rng, profile.zero_pressure_adc, profile.zero_pressure_std);

        let gauge_kpa = match self.valve_closed_at {
            Some(closed_at) => {
                let minutes = now.saturating_duration_since(closed_at).as_secs_f64() / 60.0;
                profile.pressure_kpa - profile.leak_kpa_per_min * minutes
            }
            None => 0.0,
        };
        let pressure_kpa = gaussian(&mut self.rng, gauge_kpa, profile.pressure_noise_kpa);
        let battery_voltage_v = self.voltage(profile, f64::from(profile.battery_adc));

        SensorSample {
            pressure_adc: pressure_adc.round() as i32,
            pressure_kpa,
            battery_voltage_v,
        }
    }

    fn battery_adc(&mut self, profile: &BoardProfile) -> u32 {
        gaussian(&mut self.rng, f64::from(profile.battery_adc), 1.0)
            .round()
            .max(0.0) as u32
    }

    fn voltage(&self, profile: &BoardProfile, adc: f64) -> f64 {
        let reference = self.calibration.unwrap_or(FACTORY_CALIBRATION_ADC).max(1);
        CALIBRATION_REFERENCE_V * adc / f64::from(reference) + profile.voltage_offset_v
    }
}

fn gaussian(rng: &mut StdRng, mean: f64, std_dev: f64) -> f64 {
    match Normal::new(mean, std_dev) {
        Ok(dist) => dist.sample(rng),
        Err(_) => mean,
    }
}

#[derive(Debug)]
struct SimBoard {
    port: String,
    profile: BoardProfile,
    state: Mutex<BoardState>,
}

impl SimBoard {
    fn state(&self) -> MutexGuard<'_, BoardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
struct BenchInner {
    boards: Vec<SimBoard>,
}

impl BenchInner {
    fn board_on(&self, port: &str) -> Option<&SimBoard> {
        self.boards
            .iter()
            .find(|board| board.port == port && board.state().attached)
    }
}

/// A rack of simulated flasher boards with units attached.
#[derive(Debug, Clone)]
pub struct SimulatedBench {
    inner: Arc<BenchInner>,
}

impl SimulatedBench {
    pub fn new(profiles: Vec<BoardProfile>) -> Self {
        let boards = profiles
            .into_iter()
            .enumerate()
            .map(|(index, profile)| SimBoard {
                port: sim_port_name(index),
                state: Mutex::new(BoardState::new(index, &profile)),
                profile,
            })
            .collect();
        Self {
            inner: Arc::new(BenchInner { boards }),
        }
    }

    /// `count` healthy boards built from [`BoardProfile::nominal`].
    pub fn with_boards(count: usize) -> Self {
        Self::new((0..count).map(BoardProfile::nominal).collect())
    }

    /// One healthy board per flasher serial, in the given order.
    pub fn with_serials<S: AsRef<str>>(serials: &[S]) -> Self {
        Self::new(
            serials
                .iter()
                .enumerate()
                .map(|(index, serial)| BoardProfile {
                    flasher_serial: serial.as_ref().to_string(),
                    ..BoardProfile::nominal(index)
                })
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.inner.boards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.boards.is_empty()
    }

    pub fn connector(&self) -> SimulatedConnector {
        SimulatedConnector {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn ports(&self) -> SimulatedPorts {
        SimulatedPorts {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn flasher(&self) -> SimulatedFlasher {
        SimulatedFlasher {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Port name board `index` enumerates under.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn port_name(&self, index: usize) -> String {
        self.inner.boards[index].port.clone()
    }

    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn profile(&self, index: usize) -> &BoardProfile {
        &self.inner.boards[index].profile
    }

    /// Flasher identities of every board, in rack order.
    pub fn identities(&self) -> Vec<UsbIdentity> {
        self.inner
            .boards
            .iter()
            .map(|board| board.profile.usb_identity())
            .collect()
    }

    /// Plug or unplug a flasher board.
    pub fn set_attached(&self, index: usize, attached: bool) {
        self.inner.boards[index].state().attached = attached;
    }

    /// Calibration constant currently stored on unit `index`.
    pub fn calibration(&self, index: usize) -> Option<u32> {
        self.inner.boards[index].state().calibration
    }

    /// Firmware version last written to unit `index`.
    pub fn flashed_version(&self, index: usize) -> Option<String> {
        self.inner.boards[index].state().flashed_version.clone()
    }

    /// Whether unit `index` has its moving-average pressure filter on.
    pub fn moving_average_enabled(&self, index: usize) -> bool {
        self.inner.boards[index].state().moving_average
    }

    /// Last valve command received by unit `index`.
    pub fn valve(&self, index: usize) -> Option<ValveDirection> {
        self.inner.boards[index].state().valve
    }
}

fn sim_port_name(index: usize) -> String {
    format!("/sim/ttyOTO{index}")
}

/// [`PortEnumerator`] over the attached simulated flasher boards.
#[derive(Debug, Clone)]
pub struct SimulatedPorts {
    inner: Arc<BenchInner>,
}

impl PortEnumerator for SimulatedPorts {
    fn list_ports(&self) -> Result<Vec<PortIdentity>, PortError> {
        Ok(self
            .inner
            .boards
            .iter()
            .filter(|board| board.state().attached)
            .map(|board| PortIdentity {
                name: board.port.clone(),
                vid: FLASHER_VID,
                pid: FLASHER_PID,
                serial_number: Some(board.profile.flasher_serial.clone()),
            })
            .collect())
    }
}

/// [`OtoConnector`] opening clients on simulated units.
#[derive(Debug, Clone)]
pub struct SimulatedConnector {
    inner: Arc<BenchInner>,
}

impl OtoConnector for SimulatedConnector {
    fn connect(&self, port: &str, reset_on_connect: bool) -> SessionResult<Box<dyn OtoClient>> {
        let index = self
            .inner
            .boards
            .iter()
            .position(|board| board.port == port && board.state().attached)
            .ok_or_else(|| SessionError::Connection(format!("no unit answering on {port}")))?;

        let board = &self.inner.boards[index];
        if board.profile.faults.connect_fails {
            return Err(SessionError::Connection(format!(
                "timed out waiting for handshake on {port}"
            )));
        }

        let mut state = board.state();
        state.subscription = SubscribeFrequency::Off;
        state.pending.clear();
        if reset_on_connect {
            state.moving_average = false;
            state.valve = None;
            state.valve_closed_at = None;
        }
        drop(state);

        debug!("Simulated unit {} connected on {port}", board.profile.mac);
        Ok(Box::new(SimulatedClient {
            inner: Arc::clone(&self.inner),
            index,
            open: true,
        }))
    }
}

struct SimulatedClient {
    inner: Arc<BenchInner>,
    index: usize,
    open: bool,
}

impl SimulatedClient {
    fn board(&self) -> SessionResult<&SimBoard> {
        let board = &self.inner.boards[self.index];
        if !self.open {
            return Err(SessionError::Connection("connection closed".to_string()));
        }
        if !board.state().attached {
            return Err(SessionError::Transport(format!("{} disappeared", board.port)));
        }
        Ok(board)
    }
}

impl OtoClient for SimulatedClient {
    fn mac_address(&mut self) -> SessionResult<String> {
        Ok(self.board()?.profile.mac.clone())
    }

    fn pressure_sensor_version(&mut self) -> SessionResult<u8> {
        let board = self.board()?;
        if board.profile.faults.sensor_query_fails {
            return Err(SessionError::Protocol(
                "pressure sensor version response truncated".to_string(),
            ));
        }
        Ok(board.profile.sensor_version)
    }

    fn use_moving_average_filter(&mut self, enabled: bool) -> SessionResult<()> {
        self.board()?.state().moving_average = enabled;
        Ok(())
    }

    fn set_sensor_subscribe(&mut self, frequency: SubscribeFrequency) -> SessionResult<()> {
        let board = self.board()?;
        let now = Instant::now();
        let mut state = board.state();
        state.catch_up(&board.profile, now);
        state.subscription = frequency;
        state.stream_start = now;
        state.emitted = 0;
        Ok(())
    }

    fn clear_incoming_packets(&mut self) {
        if let Ok(board) = self.board() {
            let mut state = board.state();
            state.catch_up(&board.profile, Instant::now());
            state.pending.clear();
        }
    }

    fn read_sensor_packets(&mut self) -> SessionResult<Vec<SensorSample>> {
        let board = self.board()?;
        let mut state = board.state();
        state.catch_up(&board.profile, Instant::now());
        Ok(std::mem::take(&mut state.pending))
    }

    fn battery_voltage_adc(&mut self) -> SessionResult<u32> {
        let board = self.board()?;
        if board.profile.faults.battery_adc_fails {
            return Err(SessionError::Transport(
                "no response to battery ADC request".to_string(),
            ));
        }
        Ok(board.state().battery_adc(&board.profile))
    }

    fn battery_voltage(&mut self) -> SessionResult<f64> {
        let board = self.board()?;
        let mut state = board.state();
        let adc = state.battery_adc(&board.profile);
        Ok(state.voltage(&board.profile, f64::from(adc)))
    }

    fn calibration_voltage(&mut self) -> SessionResult<u32> {
        self.board()?
            .state()
            .calibration
            .ok_or(SessionError::NotCalibrated)
    }

    fn set_calibration_voltage(&mut self, adc: u32) -> SessionResult<()> {
        let board = self.board()?;
        if board.profile.faults.calibration_write_fails {
            return Err(SessionError::Protocol("calibration write rejected".to_string()));
        }
        board.state().calibration = Some(adc);
        Ok(())
    }

    fn set_valve(&mut self, direction: ValveDirection, duty_cycle_percent: u8) -> SessionResult<()> {
        let board = self.board()?;
        let mut state = board.state();
        state.valve = Some(direction);
        state.valve_closed_at = match direction {
            ValveDirection::Close if duty_cycle_percent > 0 => Some(Instant::now()),
            _ => None,
        };
        Ok(())
    }

    fn stop_connection(&mut self) {
        if self.open {
            let board = &self.inner.boards[self.index];
            board.state().subscription = SubscribeFrequency::Off;
            self.open = false;
        }
    }
}

/// [`FirmwareFlasher`] producing esptool-like output for simulated units.
#[derive(Debug, Clone)]
pub struct SimulatedFlasher {
    inner: Arc<BenchInner>,
}

impl FirmwareFlasher for SimulatedFlasher {
    fn flash(
        &self,
        port: &str,
        firmware_version: &str,
        output: &mut dyn FnMut(&str),
    ) -> Result<(), FlashError> {
        output("esptool.py v4.7.0");
        output(&format!("Serial port {port}"));
        output("Connecting....");

        let Some(board) = self.inner.board_on(port) else {
            return Err(FlashError::ToolFailed {
                code: Some(2),
                stderr: format!(
                    "A fatal error occurred: Could not open {port}, the port doesn't exist"
                ),
            });
        };

        if board.profile.faults.flash_fails {
            return Err(FlashError::ToolFailed {
                code: Some(2),
                stderr: "A fatal error occurred: Failed to connect to ESP32: No serial data received."
                    .to_string(),
            });
        }

        output("Chip is ESP32-D0WD-V3 (revision v3.0)");
        output(&format!("MAC: {}", board.profile.mac));
        if !board.profile.flash_duration.is_zero() {
            thread::sleep(board.profile.flash_duration);
        }
        output("Hash of data verified.");
        output("Hard resetting via RTS pin...");

        board.state().flashed_version = Some(firmware_version.to_string());
        Ok(())
    }
}
