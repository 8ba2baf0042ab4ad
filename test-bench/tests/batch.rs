//! Batch runs against the simulated bench.

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver};
use hardware::ports::UsbIdentity;
use hardware::sim::{BoardProfile, SimulatedBench};
use test_bench::orchestrator::{
    BatchError, BatchEvent, BatchOrchestrator, Workflow, CHECK_POWER_MESSAGE, DEFAULT_WORKERS,
};
use test_bench::pipeline::{DecaySettings, FlashSettings, StationHardware};
use test_bench::qualification::{BatterySettings, ZeroPressureSettings};
use test_bench::readings::{decay_log_path, read_batch_readings, read_decay_readings};
use test_bench::unit::UnitState;
use tempfile::tempdir;

fn sampling() -> ZeroPressureSettings {
    ZeroPressureSettings {
        window: Duration::from_millis(200),
        settle: Duration::from_millis(10),
        poll_interval: Duration::from_millis(5),
        ..Default::default()
    }
}

fn flash_workflow(readings: &Path) -> Workflow {
    Workflow::Flash(FlashSettings {
        zero_pressure: sampling(),
        battery: BatterySettings {
            samples: 9,
            spacing: Duration::ZERO,
        },
        readings_path: readings.to_path_buf(),
        ..Default::default()
    })
}

fn orchestrator(bench: &SimulatedBench) -> (BatchOrchestrator, Receiver<BatchEvent>) {
    let (tx, rx) = unbounded();
    let orchestrator = BatchOrchestrator::new(
        StationHardware::simulated(bench),
        bench.identities(),
        tx,
        DEFAULT_WORKERS,
    )
    .unwrap();
    (orchestrator, rx)
}

fn logs_for(events: &[BatchEvent], slot: usize) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            BatchEvent::Log { slot: s, line, .. } if *s == slot => Some(line.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn test_healthy_batch_succeeds_and_records_readings() {
    let dir = tempdir().unwrap();
    let readings = dir.path().join("readings.csv");
    let bench = SimulatedBench::with_boards(4);
    let (orchestrator, _rx) = orchestrator(&bench);

    let summary = orchestrator.run_all(&flash_workflow(&readings)).unwrap();

    assert_eq!(summary.succeeded(), 4);
    assert!(!summary.any_adc_failure);
    let units = orchestrator.units_snapshot();
    assert!(units.iter().all(|u| u.state == UnitState::Success));

    let rows = read_batch_readings(&readings).unwrap();
    assert_eq!(rows.len(), 4);
    for (row, unit) in rows.iter().zip(&units) {
        assert_eq!(Some(&row.device_id), unit.device_id.as_ref());
        assert_eq!(row.battery_adc, unit.battery_adc);
        assert_eq!(row.zero_pressure_mean, unit.zero_pressure_mean);
        assert_eq!(row.zero_pressure_std_dev, unit.zero_pressure_std_dev);
    }
    for index in 0..4 {
        assert!(bench.calibration(index).is_some());
    }
}

#[test]
fn test_one_bad_adc_flags_every_unit() {
    let dir = tempdir().unwrap();
    let readings = dir.path().join("readings.csv");
    let mut low = BoardProfile::nominal(1);
    low.battery_adc = 2000;
    let bench = SimulatedBench::new(vec![BoardProfile::nominal(0), low, BoardProfile::nominal(2)]);
    let (orchestrator, rx) = orchestrator(&bench);

    let summary = orchestrator.run_all(&flash_workflow(&readings)).unwrap();
    let events: Vec<_> = rx.try_iter().collect();

    assert!(summary.any_adc_failure);
    assert_eq!(summary.succeeded(), 0);
    for unit in orchestrator.units_snapshot() {
        assert_eq!(unit.state, UnitState::CheckPower, "unit {}", unit.label());
        assert!(logs_for(&events, unit.slot)
            .iter()
            .any(|line| line == CHECK_POWER_MESSAGE));
    }
    assert_eq!(summary.outcomes[0].error, None);
    assert!(summary.outcomes[1]
        .error
        .as_deref()
        .unwrap()
        .starts_with("Measured voltage ADC value too low"));

    // Every unit reached the device, so every unit is in the batch file.
    assert_eq!(read_batch_readings(&readings).unwrap().len(), 3);
}

#[test]
fn test_failures_are_isolated() {
    let dir = tempdir().unwrap();
    let readings = dir.path().join("readings.csv");
    let mut no_flash = BoardProfile::nominal(0);
    no_flash.faults.flash_fails = true;
    let mut bad_sensor = BoardProfile::nominal(1);
    bad_sensor.zero_pressure_std = 5.0;
    let bench = SimulatedBench::new(vec![no_flash, bad_sensor, BoardProfile::nominal(2)]);
    let (orchestrator, _rx) = orchestrator(&bench);

    let summary = orchestrator.run_all(&flash_workflow(&readings)).unwrap();

    let states: Vec<_> = summary.outcomes.iter().map(|o| o.state).collect();
    assert_eq!(
        states,
        vec![UnitState::FailFlash, UnitState::FailPressure, UnitState::Success]
    );

    // The unit that never connected has no device id and no row.
    let rows = read_batch_readings(&readings).unwrap();
    let ids: Vec<_> = rows.iter().map(|r| r.device_id.as_str()).collect();
    assert_eq!(ids, vec![bench.profile(1).mac.as_str(), bench.profile(2).mac.as_str()]);
    assert_eq!(rows[0].battery_adc, None);
    assert!(rows[0].zero_pressure_std_dev.unwrap() < 96.5);
}

#[test]
fn test_unplugged_flasher_board() {
    let dir = tempdir().unwrap();
    let readings = dir.path().join("readings.csv");
    let bench = SimulatedBench::with_boards(1);
    let (tx, _rx) = unbounded();
    let orchestrator = BatchOrchestrator::new(
        StationHardware::simulated(&bench),
        vec![bench.profile(0).usb_identity(), UsbIdentity::flasher("MISSING")],
        tx,
        DEFAULT_WORKERS,
    )
    .unwrap();

    let summary = orchestrator.run_all(&flash_workflow(&readings)).unwrap();

    assert_eq!(summary.outcomes[0].state, UnitState::Success);
    assert_eq!(summary.outcomes[1].state, UnitState::FailConnectFlasher);
    assert_eq!(read_batch_readings(&readings).unwrap().len(), 1);
}

#[test]
fn test_second_run_is_rejected_while_in_flight() {
    let dir = tempdir().unwrap();
    let readings = dir.path().join("readings.csv");
    let mut slow = BoardProfile::nominal(0);
    slow.flash_duration = Duration::from_millis(500);
    let bench = SimulatedBench::new(vec![slow]);
    let (orchestrator, _rx) = orchestrator(&bench);
    let orchestrator = Arc::new(orchestrator);
    let workflow = flash_workflow(&readings);

    let first = {
        let orchestrator = Arc::clone(&orchestrator);
        let workflow = workflow.clone();
        thread::spawn(move || orchestrator.run_all(&workflow))
    };

    let deadline = Instant::now() + Duration::from_secs(5);
    while !orchestrator.is_running() {
        assert!(Instant::now() < deadline, "first batch never started");
        thread::sleep(Duration::from_millis(5));
    }
    assert!(matches!(
        orchestrator.run_all(&workflow),
        Err(BatchError::AlreadyRunning)
    ));

    let summary = first.join().unwrap().unwrap();
    assert_eq!(summary.succeeded(), 1);
    assert!(!orchestrator.is_running());

    // The guard is released, so the station can be re-armed.
    assert_eq!(orchestrator.run_all(&workflow).unwrap().succeeded(), 1);
    assert_eq!(read_batch_readings(&readings).unwrap().len(), 2);
}

#[test]
fn test_finished_event_follows_every_unit_event() {
    let dir = tempdir().unwrap();
    let bench = SimulatedBench::with_boards(2);
    let (orchestrator, rx) = orchestrator(&bench);

    orchestrator
        .run_all(&flash_workflow(&dir.path().join("readings.csv")))
        .unwrap();
    let events: Vec<_> = rx.try_iter().collect();

    assert!(matches!(events.last(), Some(BatchEvent::Finished(_))));
    let finished = events
        .iter()
        .filter(|e| matches!(e, BatchEvent::Finished(_)))
        .count();
    assert_eq!(finished, 1);

    let last_states: Vec<_> = (0..2)
        .map(|slot| {
            events
                .iter()
                .rev()
                .find_map(|e| match e {
                    BatchEvent::UnitState { slot: s, state } if *s == slot => Some(*state),
                    _ => None,
                })
                .unwrap()
        })
        .collect();
    assert_eq!(last_states, vec![UnitState::Success, UnitState::Success]);
}

#[test]
fn test_decay_batch() {
    let dir = tempdir().unwrap();
    let bench = SimulatedBench::with_boards(2);
    let (orchestrator, _rx) = orchestrator(&bench);
    let workflow = Workflow::Decay(DecaySettings {
        interval: Duration::from_millis(150),
        iterations: 2,
        sampling: ZeroPressureSettings {
            trials: 1,
            window: Duration::from_millis(60),
            ..sampling()
        },
        output_dir: dir.path().to_path_buf(),
    });

    let summary = orchestrator.run_all(&workflow).unwrap();

    assert_eq!(summary.succeeded(), 2);
    for index in 0..2 {
        let rows = read_decay_readings(&decay_log_path(dir.path(), &bench.profile(index).mac)).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[1].rate.is_some());
    }
    assert!(!dir.path().join("readings.csv").exists());
}
