//! Flash workflow: flash firmware, qualify the pressure sensor, calibrate the
//! battery ADC and verify the calibrated voltage.

use std::path::PathBuf;

use hardware::oto::{DeviceSession, SessionError};
use shared::config_storage::DEFAULT_FIRMWARE_VERSION;

use super::{StationHardware, StepError, UnitContext, UnitObserver};
use crate::qualification::{
    average_battery_adc, check_battery_adc, group_thousands, qualify_zero_pressure,
    verify_battery_voltage, BatterySettings, QualificationError, ZeroPressureSettings,
    BATTERY_ADC_RANGE,
};
use crate::unit::{UnitRecord, UnitState};

/// Parameters of one flash batch.
#[derive(Debug, Clone, PartialEq)]
pub struct FlashSettings {
    pub firmware_version: String,
    pub zero_pressure: ZeroPressureSettings,
    pub battery: BatterySettings,
    /// Batch CSV appended after every run.
    pub readings_path: PathBuf,
}

impl Default for FlashSettings {
    fn default() -> Self {
        Self {
            firmware_version: DEFAULT_FIRMWARE_VERSION.to_string(),
            zero_pressure: ZeroPressureSettings::default(),
            battery: BatterySettings::default(),
            readings_path: PathBuf::from("readings.csv"),
        }
    }
}

/// Run the flash workflow on one unit.
///
/// On success the unit is left in [`UnitState::CalibrationSuccess`]; the
/// orchestrator decides whether it becomes `Success` once the whole batch is
/// in. On failure the unit is in the failing step's state and the error is
/// returned after being logged.
pub fn run_flash_pipeline(
    record: &mut UnitRecord,
    hardware: &StationHardware,
    settings: &FlashSettings,
    observer: &dyn UnitObserver,
) -> Result<(), StepError> {
    record.reset_for_run();
    let mut ctx = UnitContext::new(record, observer);
    ctx.info("Started processing\n启动程序...");
    ctx.transition(UnitState::Flashing);

    let mut session = DeviceSession::new(hardware.connector.clone());
    let result = flash_steps(&mut ctx, &mut session, hardware, settings);
    session.disconnect();

    match result {
        Ok(()) => {
            ctx.info("All steps completed.\n完成所有步骤");
            Ok(())
        }
        Err(err) => Err(ctx.fail(err)),
    }
}

fn flash_steps(
    ctx: &mut UnitContext<'_>,
    session: &mut DeviceSession,
    hardware: &StationHardware,
    settings: &FlashSettings,
) -> Result<(), StepError> {
    let port = ctx.resolve_port(hardware.ports.as_ref())?;

    hardware
        .flasher
        .flash(&port, &settings.firmware_version, &mut |line| ctx.info(line))
        .map_err(|source| StepError::Flash {
            port: port.clone(),
            source,
        })?;

    ctx.transition(UnitState::Connecting);
    ctx.connect(session, &port)?;
    ctx.transition(UnitState::Connected);

    let band = ctx.detect_sensor(session, &port)?;

    ctx.transition(UnitState::CheckingPressure);
    ctx.info("Checking zero pressure ADC value...\n检查零压力ADC值");
    session
        .set_moving_average_filter(true)
        .map_err(|e| StepError::ZeroPressure(e.into()))?;
    let zero = {
        let record = &mut *ctx.record;
        qualify_zero_pressure(session, &band, &settings.zero_pressure, &mut |mean, std_dev| {
            record.zero_pressure_mean = Some(mean);
            record.zero_pressure_std_dev = Some(std_dev);
        })
    };
    let zero = zero.map_err(|err| {
        if matches!(err, QualificationError::Failed { .. }) {
            ctx.record.pressure_failed = true;
        }
        StepError::ZeroPressure(err)
    })?;
    ctx.info(&format!(
        "Zero pressure 零压力: {} ADC\nSTD 标准差值: {} ADC\npoints 数据数量: {}, Elapsed 经过的时间: {:.4} sec",
        group_thousands(zero.mean, 0),
        group_thousands(zero.std_dev, 1),
        zero.count,
        zero.elapsed.as_secs_f64()
    ));

    log_prior_calibration(ctx, session);

    ctx.transition(UnitState::ReadingAdc);
    let adc = average_battery_adc(session, &settings.battery).map_err(|source| {
        StepError::BatteryAdcRead {
            port: port.clone(),
            source,
        }
    })?;
    ctx.record.battery_adc = Some(adc);
    ctx.info(&format!(
        "New voltage value from board: {} ADC\n线路板的新电压值",
        group_thousands(f64::from(adc), 0)
    ));
    if let Err(excursion) = check_battery_adc(adc, &BATTERY_ADC_RANGE) {
        ctx.record.adc_out_of_range = true;
        return Err(StepError::BatteryAdcOutOfRange {
            port: port.clone(),
            adc,
            excursion,
        });
    }

    ctx.transition(UnitState::Writing);
    session
        .write_calibration(adc)
        .map_err(|source| StepError::CalibrationWrite {
            port: port.clone(),
            source,
        })?;
    ctx.transition(UnitState::CalibrationSuccess);

    // Calibration only takes effect after a reboot.
    session.disconnect();
    ctx.connect(session, &port)?;

    let volts =
        verify_battery_voltage(session, &settings.battery).map_err(StepError::BatteryVoltage)?;
    ctx.info(&format!("Actual Battery 实际电池电压: {volts}V"));
    Ok(())
}

fn log_prior_calibration(ctx: &mut UnitContext<'_>, session: &mut DeviceSession) {
    match session.read_calibration() {
        Ok(present) => ctx.info(&format!(
            "Present value 当前数值: {} ADC\nCalibrating again 再次校准...",
            group_thousands(f64::from(present), 0)
        )),
        Err(SessionError::NotCalibrated) => {
            ctx.info("Board voltage not calibrated...\n线路板电压没被校准")
        }
        Err(err) => ctx.warn(&format!(
            "Unable to read a voltage calibration value\n无从读取电压校准值\n{err}"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::RecordingObserver;
    use hardware::ports::UsbIdentity;
    use hardware::sim::{BoardProfile, SimulatedBench};
    use std::time::Duration;

    fn fast_settings() -> FlashSettings {
        FlashSettings {
            zero_pressure: ZeroPressureSettings {
                window: Duration::from_millis(200),
                settle: Duration::from_millis(10),
                poll_interval: Duration::from_millis(5),
                ..Default::default()
            },
            battery: BatterySettings {
                samples: 9,
                spacing: Duration::ZERO,
            },
            ..Default::default()
        }
    }

    type Outcome = (SimulatedBench, UnitRecord, RecordingObserver, Result<(), StepError>);

    fn run(profile: BoardProfile) -> Outcome {
        let bench = SimulatedBench::new(vec![profile]);
        let hardware = StationHardware::simulated(&bench);
        let mut record = UnitRecord::new(0, bench.profile(0).usb_identity());
        let observer = RecordingObserver::default();
        let result = run_flash_pipeline(&mut record, &hardware, &fast_settings(), &observer);
        (bench, record, observer, result)
    }

    #[test]
    fn test_nominal_unit_walks_every_state() {
        let (bench, record, observer, result) = run(BoardProfile::nominal(0));

        result.unwrap();
        assert_eq!(
            observer.states_for(0),
            vec![
                UnitState::Flashing,
                UnitState::Connecting,
                UnitState::Connected,
                UnitState::CheckingPressure,
                UnitState::ReadingAdc,
                UnitState::Writing,
                UnitState::CalibrationSuccess,
            ]
        );
        assert_eq!(record.state, UnitState::CalibrationSuccess);
        assert_eq!(record.port.as_deref(), Some(bench.port_name(0).as_str()));
        assert_eq!(record.device_id.as_deref(), Some(bench.profile(0).mac.as_str()));
        assert!(record.zero_pressure_mean.is_some());
        assert_eq!(bench.calibration(0), record.battery_adc);
        assert_eq!(bench.flashed_version(0).as_deref(), Some(DEFAULT_FIRMWARE_VERSION));

        let text = observer.text();
        assert!(text.contains("Hash of data verified."));
        assert!(text.contains("Board voltage not calibrated"));
        assert!(text.contains("All steps completed."));
    }

    #[test]
    fn test_recalibration_logs_present_value() {
        let mut profile = BoardProfile::nominal(0);
        profile.calibration = Some(2400);
        let (_, _, observer, result) = run(profile);

        result.unwrap();
        assert!(observer.text().contains("Present value 当前数值: 2,400 ADC"));
    }

    #[test]
    fn test_missing_flasher_board() {
        let bench = SimulatedBench::with_boards(1);
        let hardware = StationHardware::simulated(&bench);
        let mut record = UnitRecord::new(0, UsbIdentity::flasher("NOPE"));
        let observer = RecordingObserver::default();

        let err = run_flash_pipeline(&mut record, &hardware, &fast_settings(), &observer).unwrap_err();
        assert!(matches!(err, StepError::Port(_)));
        assert_eq!(record.state, UnitState::FailConnectFlasher);
        assert!(record.port.is_none());
        assert!(observer.text().contains("确认USB通信测试板与计算机连接"));
    }

    #[test]
    fn test_flash_failure() {
        let mut profile = BoardProfile::nominal(0);
        profile.faults.flash_fails = true;
        let (_, record, _, result) = run(profile);

        assert!(matches!(result, Err(StepError::Flash { .. })));
        assert_eq!(record.state, UnitState::FailFlash);
        assert!(record.device_id.is_none());
    }

    #[test]
    fn test_connect_failure() {
        let mut profile = BoardProfile::nominal(0);
        profile.faults.connect_fails = true;
        let (_, record, _, result) = run(profile);

        assert!(matches!(result, Err(StepError::Connect { .. })));
        assert_eq!(record.state, UnitState::FailConnect);
    }

    #[test]
    fn test_legacy_board_rejected() {
        let mut profile = BoardProfile::nominal(0);
        profile.sensor_version = 1;
        let (_, record, observer, result) = run(profile);

        assert!(matches!(result, Err(StepError::UnsupportedSensor(_))));
        assert_eq!(record.state, UnitState::FailPressure);
        assert!(observer.text().contains("old design board"));
    }

    #[test]
    fn test_zero_pressure_failure_keeps_last_values() {
        let mut profile = BoardProfile::nominal(0);
        profile.zero_pressure_adc = 1_500_000.0;
        let (_, record, _, result) = run(profile);

        assert!(matches!(result, Err(StepError::ZeroPressure(_))));
        assert_eq!(record.state, UnitState::FailPressure);
        assert!(record.pressure_failed);
        assert!(record.zero_pressure_mean.unwrap() < 1_611_555.0);
        assert!(record.battery_adc.is_none());
    }

    #[test]
    fn test_silent_sensor_is_no_data() {
        let mut profile = BoardProfile::nominal(0);
        profile.faults.silent_sensor = true;
        let (_, record, observer, result) = run(profile);

        assert!(matches!(
            result,
            Err(StepError::ZeroPressure(QualificationError::NoDataCollected))
        ));
        assert_eq!(record.state, UnitState::FailPressure);
        assert!(!record.pressure_failed);
        assert!(observer.text().contains("未收集压力数值"));
    }

    #[test]
    fn test_adc_out_of_range_flags_unit() {
        let mut profile = BoardProfile::nominal(0);
        profile.battery_adc = 2000;
        let (bench, record, _, result) = run(profile);

        assert!(matches!(result, Err(StepError::BatteryAdcOutOfRange { .. })));
        assert_eq!(record.state, UnitState::FailAdc);
        assert!(record.adc_out_of_range);
        assert_eq!(record.battery_adc, Some(2000));
        assert_eq!(bench.calibration(0), None);
    }

    #[test]
    fn test_adc_read_error_does_not_flag_batch() {
        let mut profile = BoardProfile::nominal(0);
        profile.faults.battery_adc_fails = true;
        let (_, record, _, result) = run(profile);

        assert!(matches!(result, Err(StepError::BatteryAdcRead { .. })));
        assert_eq!(record.state, UnitState::FailAdc);
        assert!(!record.adc_out_of_range);
    }

    #[test]
    fn test_calibration_write_failure() {
        let mut profile = BoardProfile::nominal(0);
        profile.faults.calibration_write_fails = true;
        let (_, record, _, result) = run(profile);

        assert!(matches!(result, Err(StepError::CalibrationWrite { .. })));
        assert_eq!(record.state, UnitState::FailCalibration);
    }

    #[test]
    fn test_voltage_verification_failure() {
        let mut profile = BoardProfile::nominal(0);
        profile.voltage_offset_v = 0.2;
        let (_, record, observer, result) = run(profile);

        assert!(matches!(result, Err(StepError::BatteryVoltage(_))));
        assert_eq!(record.state, UnitState::FailBatteryVoltage);
        assert!(observer.text().contains("Board voltage is not 4.1±0.05V"));
    }

    #[test]
    fn test_rerun_resets_previous_outcome() {
        let bench = SimulatedBench::with_boards(1);
        let hardware = StationHardware::simulated(&bench);
        let mut record = UnitRecord::new(0, bench.profile(0).usb_identity());
        record.state = UnitState::FailAdc;
        record.adc_out_of_range = true;

        run_flash_pipeline(&mut record, &hardware, &fast_settings(), &RecordingObserver::default()).unwrap();
        assert!(!record.adc_out_of_range);
        assert_eq!(record.state, UnitState::CalibrationSuccess);
    }
}
