//! Batch runs across every configured slot.
//!
//! [`BatchOrchestrator::run_all`] runs one pipeline per unit on a bounded
//! rayon pool and waits for all of them before post-processing the batch.
//! The orchestrator is the only publisher of [`BatchEvent`]s: pipelines report
//! through a [`UnitObserver`] that forwards into the event channel, and the
//! batch-level outcome (promotion to `Success`, the power supply check, the
//! batch CSV) is published from here once the pool is idle again.
//!
//! Only one batch may run at a time. A second `run_all` while one is in
//! flight fails with [`BatchError::AlreadyRunning`] instead of queueing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use hardware::ports::UsbIdentity;
use thiserror::Error;
use tracing::{error, info, Level};

use crate::pipeline::{
    run_decay_pipeline, run_flash_pipeline, DecaySettings, FlashSettings, StationHardware,
    StepError, UnitObserver,
};
use crate::readings::{append_batch_readings, BatchReading, ReadingsError};
use crate::unit::{UnitRecord, UnitState};

/// Bench capacity: one worker per flasher board.
pub const DEFAULT_WORKERS: usize = 20;

/// Logged on every unit when any unit's battery ADC was out of range.
pub const CHECK_POWER_MESSAGE: &str =
    "A BOARD HAS FAILED THE ADC READING. CHECK POWERSUPPLY IS SET TO 4.1V AND REFLASH";

/// Which pipeline a batch runs.
#[derive(Debug, Clone)]
pub enum Workflow {
    Flash(FlashSettings),
    Decay(DecaySettings),
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchEvent {
    UnitState {
        slot: usize,
        state: UnitState,
    },
    Log {
        slot: usize,
        level: Level,
        line: String,
    },
    /// Published after the run guard is released.
    Finished(BatchSummary),
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnitOutcome {
    pub slot: usize,
    pub state: UnitState,
    /// Operator message of the failing step.
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BatchSummary {
    pub outcomes: Vec<UnitOutcome>,
    pub any_adc_failure: bool,
    pub elapsed: Duration,
}

impl BatchSummary {
    pub fn succeeded(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.state == UnitState::Success)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }
}

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("a batch is already running")]
    AlreadyRunning,

    #[error("failed to start worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),

    #[error("failed to save batch readings: {0}")]
    Readings(#[from] ReadingsError),
}

/// Forwards pipeline reports into the event channel.
struct ChannelObserver {
    events: Sender<BatchEvent>,
}

impl UnitObserver for ChannelObserver {
    fn state_changed(&self, slot: usize, state: UnitState) {
        let _ = self.events.send(BatchEvent::UnitState { slot, state });
    }

    fn log(&self, slot: usize, level: Level, line: &str) {
        let _ = self.events.send(BatchEvent::Log {
            slot,
            level,
            line: line.to_string(),
        });
    }
}

/// Holds the running flag for the lifetime of one batch.
struct RunGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, BatchError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| BatchError::AlreadyRunning)?;
        Ok(Self { flag })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub struct BatchOrchestrator {
    hardware: StationHardware,
    units: Mutex<Vec<UnitRecord>>,
    events: Sender<BatchEvent>,
    pool: rayon::ThreadPool,
    running: AtomicBool,
}

impl BatchOrchestrator {
    /// One unit per identity, in configured order.
    pub fn new(
        hardware: StationHardware,
        identities: Vec<UsbIdentity>,
        events: Sender<BatchEvent>,
        workers: usize,
    ) -> Result<Self, BatchError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("unit-worker-{i}"))
            .build()?;
        let units = identities
            .into_iter()
            .enumerate()
            .map(|(slot, identity)| UnitRecord::new(slot, identity))
            .collect();

        Ok(Self {
            hardware,
            units: Mutex::new(units),
            events,
            pool,
            running: AtomicBool::new(false),
        })
    }

    // A worker panicking mid-batch must not lock the station out.
    fn units(&self) -> MutexGuard<'_, Vec<UnitRecord>> {
        self.units.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.units().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Unit records as of the end of the last batch.
    pub fn units_snapshot(&self) -> Vec<UnitRecord> {
        self.units().clone()
    }

    /// Run `workflow` on every unit and wait for all of them.
    ///
    /// Unit failures are reported in the summary, not as errors. The only
    /// errors are a batch already being in flight and a failure to append the
    /// batch CSV; in the latter case the run itself has completed and its
    /// `Finished` event has been published.
    pub fn run_all(&self, workflow: &Workflow) -> Result<BatchSummary, BatchError> {
        let guard = RunGuard::acquire(&self.running)?;
        let started = Instant::now();
        let mut records = self.units_snapshot();
        info!("Starting {} batch on {} units", workflow.name(), records.len());

        let observer = ChannelObserver {
            events: self.events.clone(),
        };
        let mut results: Vec<Result<(), StepError>> = records.iter().map(|_| Ok(())).collect();
        self.pool.scope(|scope| {
            for (record, result) in records.iter_mut().zip(results.iter_mut()) {
                let hardware = &self.hardware;
                let observer = &observer;
                scope.spawn(move |_| {
                    *result = match workflow {
                        Workflow::Flash(settings) => {
                            run_flash_pipeline(record, hardware, settings, observer)
                        }
                        Workflow::Decay(settings) => {
                            run_decay_pipeline(record, hardware, settings, observer)
                        }
                    };
                });
            }
        });

        let any_adc_failure = matches!(workflow, Workflow::Flash(_))
            && records.iter().any(|record| record.adc_out_of_range);
        for (record, result) in records.iter_mut().zip(&results) {
            if any_adc_failure {
                record.state = UnitState::CheckPower;
                observer.state_changed(record.slot, record.state);
                error!(unit = record.slot + 1, "{CHECK_POWER_MESSAGE}");
                observer.log(record.slot, Level::ERROR, CHECK_POWER_MESSAGE);
            } else if result.is_ok() {
                record.state = UnitState::Success;
                observer.state_changed(record.slot, record.state);
            }
        }

        let saved = match workflow {
            Workflow::Flash(settings) => {
                let rows: Vec<BatchReading> =
                    records.iter().filter_map(BatchReading::from_record).collect();
                if rows.is_empty() {
                    Ok(())
                } else {
                    append_batch_readings(&settings.readings_path, &rows)
                }
            }
            Workflow::Decay(_) => Ok(()),
        };

        let summary = BatchSummary {
            outcomes: records
                .iter()
                .zip(&results)
                .map(|(record, result)| UnitOutcome {
                    slot: record.slot,
                    state: record.state,
                    error: result.as_ref().err().map(ToString::to_string),
                })
                .collect(),
            any_adc_failure,
            elapsed: started.elapsed(),
        };
        info!(
            "Batch finished in {:.1}s: {} succeeded, {} failed",
            summary.elapsed.as_secs_f64(),
            summary.succeeded(),
            summary.failed()
        );

        *self.units() = records;
        drop(guard);
        let _ = self.events.send(BatchEvent::Finished(summary.clone()));

        saved?;
        Ok(summary)
    }
}

impl Workflow {
    fn name(&self) -> &'static str {
        match self {
            Self::Flash(_) => "flash",
            Self::Decay(_) => "decay",
        }
    }
}
