//! Shared components for the OtO flashing station.
//!
//! Holds the station configuration (`config.yml`) that both the station
//! binary and the flasher board setup tool read and write.

pub mod config_storage;
