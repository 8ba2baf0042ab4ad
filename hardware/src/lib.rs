//! Hardware drivers for the OtO flashing station.
//!
//! This crate provides the pieces of the station that touch physical
//! equipment: locating flasher boards on the USB bus, talking to a unit
//! through the OtO device protocol, and driving esptool to write firmware.
//!
//! # Modules
//!
//! - [`ports`] - Resolve a configured flasher board identity to a live serial port
//! - [`oto`] - Device session on top of the vendor protocol client
//! - [`flasher`] - esptool invocation and firmware manifest handling
//! - [`sim`] - Simulated bench (ports, boards, flasher) for tests and dry runs

pub mod flasher;
pub mod oto;
pub mod ports;
pub mod sim;
