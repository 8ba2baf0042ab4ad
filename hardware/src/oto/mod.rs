//! OtO device protocol session.
//!
//! The vendor protocol client is an external collaborator: a blocking,
//! RPC-style API that answers typed sensor, voltage and identity messages or
//! fails on transport errors. This module defines that seam as the
//! [`OtoClient`] / [`OtoConnector`] traits and builds the station's
//! [`DeviceSession`] on top of it.
//!
//! ```no_run
//! use std::sync::Arc;
//! use hardware::oto::{DeviceSession, SubscribeFrequency};
//! use hardware::sim::SimulatedBench;
//!
//! let bench = SimulatedBench::with_boards(1);
//! let mut session = DeviceSession::new(Arc::new(bench.connector()));
//! session.connect(&bench.port_name(0), true)?;
//! println!("Connected to {}", session.identity()?);
//!
//! session.subscribe_sensor_stream(SubscribeFrequency::Hz100)?;
//! std::thread::sleep(std::time::Duration::from_millis(50));
//! let samples: Vec<_> = session.drain_sensor_samples()?.collect();
//! session.subscribe_sensor_stream(SubscribeFrequency::Off)?;
//! println!("{} samples", samples.len());
//! # Ok::<(), hardware::oto::SessionError>(())
//! ```

mod client;
mod messages;
mod session;

pub use client::{OtoClient, OtoConnector, SessionError, SessionResult, UnlinkedConnector};
pub use messages::{PressureSensorVariant, SensorSample, SubscribeFrequency, ValveDirection};
pub use session::{DeviceSession, SampleDrain};
