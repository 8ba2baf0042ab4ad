//! OtO flashing and decay-test station.
//!
//! One [`unit::UnitRecord`] exists per configured flasher board slot. The
//! [`orchestrator::BatchOrchestrator`] runs a unit pipeline (flash and
//! calibrate, or pressure decay) for every slot on a bounded worker pool and
//! publishes every state change and log line as a [`orchestrator::BatchEvent`].
//!
//! # Modules
//!
//! - [`unit`] - Unit records, pipeline states and acceptance bands
//! - [`qualification`] - Zero-pressure qualification and battery voltage checks
//! - [`pipeline`] - Per-unit flash and decay workflows
//! - [`orchestrator`] - Batch runs across every slot
//! - [`readings`] - CSV result files
//! - [`presentation`] - Card colour and label for each state
//! - [`unit_log`] - Bounded per-unit log pane
//! - [`port_listener`] - Background flasher board hot-plug detection
//! - [`station`] - Units and hardware seams built from `config.yml`
//! - [`dashboard`] - Terminal dashboard

pub mod dashboard;
pub mod orchestrator;
pub mod pipeline;
pub mod port_listener;
pub mod presentation;
pub mod qualification;
pub mod readings;
pub mod station;
pub mod unit;
pub mod unit_log;
