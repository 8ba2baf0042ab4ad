//! Decay workflow: seal the fixture and track pressure loss over time.
//!
//! The unit's valve is closed once, then the gauge pressure is sampled for a
//! short window at every interval. Each window's mean is compared with the
//! first window's to give a leak rate in kPa per minute of elapsed time. Every
//! iteration appends a row to the unit's decay CSV.

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Local;
use hardware::oto::{DeviceSession, SubscribeFrequency, ValveDirection};

use super::{StationHardware, StepError, UnitContext, UnitObserver};
use crate::qualification::{
    PressureSampler, QualificationError, WindowStats, ZeroPressureSettings,
};
use crate::readings::{append_decay_reading, decay_log_path, DecayReading};
use crate::unit::{UnitRecord, UnitState};

/// Coverage factor applied to standard deviations in the decay file.
pub const COVERAGE_FACTOR: f64 = 2.75;

/// Valve duty cycle while the fixture is sealed.
const VALVE_DUTY_PERCENT: u8 = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct DecaySettings {
    /// Time between the starts of consecutive sampling windows.
    pub interval: Duration,
    pub iterations: u32,
    /// Window used for each pressure sample.
    pub sampling: ZeroPressureSettings,
    /// Directory receiving one `<device_id> readings.csv` per unit.
    pub output_dir: PathBuf,
}

impl Default for DecaySettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(120),
            iterations: 15,
            sampling: ZeroPressureSettings {
                trials: 1,
                window: Duration::from_secs(3),
                settle: Duration::from_millis(100),
                frequency: SubscribeFrequency::Hz100,
                poll_interval: Duration::from_millis(10),
            },
            output_dir: PathBuf::from("."),
        }
    }
}

/// Pressure lost per minute between two means.
pub fn decay_rate(first_kpa: f64, current_kpa: f64, elapsed: Duration) -> f64 {
    (first_kpa - current_kpa) / minutes(elapsed)
}

/// Uncertainty of [`decay_rate`] from the two windows' standard deviations.
pub fn rate_uncertainty(first_std_dev: f64, current_std_dev: f64, elapsed: Duration) -> f64 {
    COVERAGE_FACTOR * (first_std_dev + current_std_dev) / minutes(elapsed)
}

fn minutes(elapsed: Duration) -> f64 {
    elapsed.as_secs_f64() / 60.0
}

struct Baseline {
    started: Instant,
    stats: WindowStats,
}

/// Run the decay workflow on one unit.
///
/// Returns once every iteration has been sampled, leaving the unit in its
/// last busy state for the orchestrator to promote. The valve is opened again
/// whenever the valve was closed, including on failure.
pub fn run_decay_pipeline(
    record: &mut UnitRecord,
    hardware: &StationHardware,
    settings: &DecaySettings,
    observer: &dyn UnitObserver,
) -> Result<(), StepError> {
    record.reset_for_run();
    let mut ctx = UnitContext::new(record, observer);
    ctx.info("Started decay test\n启动泄漏测试...");

    let mut session = DeviceSession::new(hardware.connector.clone());
    let mut valve_closed = false;
    let result = decay_steps(&mut ctx, &mut session, hardware, settings, &mut valve_closed);

    if valve_closed {
        if let Err(err) = session.set_actuator(ValveDirection::Open, VALVE_DUTY_PERCENT) {
            ctx.warn(&format!("Failed to open the test valve\n阀门打开失败\n{err}"));
        }
    }
    session.disconnect();

    match result {
        Ok(()) => {
            ctx.info("Decay test completed.\n泄漏测试完成");
            Ok(())
        }
        Err(err) => Err(ctx.fail(err)),
    }
}

fn decay_steps(
    ctx: &mut UnitContext<'_>,
    session: &mut DeviceSession,
    hardware: &StationHardware,
    settings: &DecaySettings,
    valve_closed: &mut bool,
) -> Result<(), StepError> {
    let port = ctx.resolve_port(hardware.ports.as_ref())?;

    ctx.transition(UnitState::Connecting);
    ctx.connect(session, &port)?;
    ctx.transition(UnitState::Connected);
    ctx.detect_sensor(session, &port)?;

    session
        .set_actuator(ValveDirection::Close, VALVE_DUTY_PERCENT)
        .map_err(|source| StepError::Valve {
            port: port.clone(),
            source,
        })?;
    *valve_closed = true;

    let device_id = ctx.record.device_id.clone().unwrap_or_else(|| port.clone());
    let log_path = decay_log_path(&settings.output_dir, &device_id);
    ctx.info(&format!("Logging readings to {}", log_path.display()));

    let mut baseline: Option<Baseline> = None;
    for iteration in 1..=settings.iterations.max(1) {
        let started = Instant::now();
        ctx.transition(UnitState::CheckingPressure);

        let window = session
            .collect_window(&settings.sampling)
            .map_err(|e| StepError::DecayPressure(e.into()))?;
        let values: Vec<f64> = window.samples.iter().map(|s| s.pressure_kpa).collect();
        let stats = WindowStats::from_values(&values)
            .ok_or(StepError::DecayPressure(QualificationError::NoDataCollected))?;

        let (rate, uncertainty) = match &baseline {
            None => (None, None),
            Some(first) => {
                let elapsed = started.saturating_duration_since(first.started);
                (
                    Some(decay_rate(first.stats.mean, stats.mean, elapsed)),
                    Some(rate_uncertainty(first.stats.std_dev, stats.std_dev, elapsed)),
                )
            }
        };

        let reading = DecayReading {
            timestamp: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            pressure_kpa: stats.mean,
            std_dev_scaled: stats.std_dev * COVERAGE_FACTOR,
            rate,
            rate_uncertainty: uncertainty,
        };
        if let Err(err) = append_decay_reading(&log_path, &reading) {
            ctx.warn(&format!("Failed to save reading\n读数保存失败\n{err}"));
        }

        let summary = match (rate, uncertainty) {
            (Some(rate), Some(uncertainty)) => format!(
                "[{iteration}/{}] Pressure 压力: {:.3} ± {:.3} kPa, Rate 泄漏率: {rate:.4} ± {uncertainty:.4} kPa/min",
                settings.iterations, stats.mean, reading.std_dev_scaled
            ),
            _ => format!(
                "[{iteration}/{}] Pressure 压力: {:.3} ± {:.3} kPa, points 数据数量: {}",
                settings.iterations, stats.mean, reading.std_dev_scaled, stats.count
            ),
        };
        ctx.info(&summary);
        if rate.is_some() {
            ctx.record.decay_rate = rate;
        }
        if baseline.is_none() {
            baseline = Some(Baseline { started, stats });
        }

        if iteration < settings.iterations {
            ctx.transition(UnitState::Waiting);
            thread::sleep(settings.interval.saturating_sub(started.elapsed()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::RecordingObserver;
    use crate::readings::read_decay_readings;
    use approx::assert_relative_eq;
    use hardware::sim::{BoardProfile, SimulatedBench};
    use tempfile::tempdir;

    fn fast_settings(output_dir: PathBuf) -> DecaySettings {
        DecaySettings {
            interval: Duration::from_millis(150),
            iterations: 3,
            sampling: ZeroPressureSettings {
                trials: 1,
                window: Duration::from_millis(60),
                settle: Duration::from_millis(5),
                frequency: SubscribeFrequency::Hz100,
                poll_interval: Duration::from_millis(5),
            },
            output_dir,
        }
    }

    #[test]
    fn test_decay_rate_over_two_minutes() {
        let elapsed = Duration::from_secs(120);
        assert_relative_eq!(decay_rate(100.0, 98.0, elapsed), 1.0);
        assert_relative_eq!(rate_uncertainty(0.1, 0.1, elapsed), 0.275);
        assert_relative_eq!(decay_rate(98.0, 100.0, elapsed), -1.0);
    }

    #[test]
    fn test_decay_run_writes_one_row_per_iteration() {
        let dir = tempdir().unwrap();
        let bench = SimulatedBench::with_boards(1);
        let hardware = StationHardware::simulated(&bench);
        let mut record = UnitRecord::new(0, bench.profile(0).usb_identity());
        let observer = RecordingObserver::default();

        run_decay_pipeline(&mut record, &hardware, &fast_settings(dir.path().to_path_buf()), &observer)
            .unwrap();

        let path = decay_log_path(dir.path(), &bench.profile(0).mac);
        let rows = read_decay_readings(&path).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows[0].rate.is_none());
        assert!(rows[1].rate.is_some() && rows[2].rate_uncertainty.is_some());
        assert_relative_eq!(rows[0].pressure_kpa, 100.0, epsilon = 0.5);

        assert!(record.decay_rate.is_some());
        assert_eq!(bench.valve(0), Some(ValveDirection::Open));
        assert_eq!(
            observer.states_for(0),
            vec![
                UnitState::Connecting,
                UnitState::Connected,
                UnitState::CheckingPressure,
                UnitState::Waiting,
                UnitState::CheckingPressure,
                UnitState::Waiting,
                UnitState::CheckingPressure,
            ]
        );
        assert!(observer.text().contains("Decay test completed."));
    }

    #[test]
    fn test_silent_sensor_fails_and_reopens_valve() {
        let dir = tempdir().unwrap();
        let mut profile = BoardProfile::nominal(0);
        profile.faults.silent_sensor = true;
        let bench = SimulatedBench::new(vec![profile]);
        let hardware = StationHardware::simulated(&bench);
        let mut record = UnitRecord::new(0, bench.profile(0).usb_identity());

        let err = run_decay_pipeline(
            &mut record,
            &hardware,
            &fast_settings(dir.path().to_path_buf()),
            &RecordingObserver::default(),
        )
        .unwrap_err();

        assert!(matches!(
            err,
            StepError::DecayPressure(QualificationError::NoDataCollected)
        ));
        assert_eq!(record.state, UnitState::FailPressure);
        assert_eq!(bench.valve(0), Some(ValveDirection::Open));
    }

    #[test]
    fn test_unplugged_flasher_fails_before_connecting() {
        let dir = tempdir().unwrap();
        let bench = SimulatedBench::with_boards(1);
        bench.set_attached(0, false);
        let hardware = StationHardware::simulated(&bench);
        let mut record = UnitRecord::new(0, bench.profile(0).usb_identity());

        let err = run_decay_pipeline(
            &mut record,
            &hardware,
            &fast_settings(dir.path().to_path_buf()),
            &RecordingObserver::default(),
        )
        .unwrap_err();

        assert!(matches!(err, StepError::Port(_)));
        assert_eq!(record.state, UnitState::FailConnectFlasher);
        assert_eq!(bench.valve(0), None);
    }
}
