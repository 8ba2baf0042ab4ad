//! Flasher board discovery.
//!
//! Every test slot on the station has a USB flasher board (a CP210x bridge)
//! with a unique serial number. The operating system assigns those boards
//! port names in whatever order they enumerate, so the station never stores
//! port names: it stores the board's USB identity and asks the live
//! enumeration for the matching port each time a unit is processed.
//!
//! # Multiple matches
//!
//! Two ports carrying the same vid/pid/serial should not exist on a sane
//! bench. If they do, [`resolve_port`] returns the *last* match in
//! enumeration order. This is a known simplification, not a guarantee that
//! the right board was picked.

use std::fmt;

use serde::{Deserialize, Serialize};
use serialport::{available_ports, SerialPortType};
use shared::config_storage::{FlasherEntry, DEFAULT_FLASHER_PID, DEFAULT_FLASHER_VID};
use thiserror::Error;
use tracing::{debug, trace};

/// USB vendor ID of the OtO flasher board (Silicon Labs CP210x).
pub const FLASHER_VID: u16 = DEFAULT_FLASHER_VID;

/// USB product ID of the OtO flasher board (Silicon Labs CP210x).
pub const FLASHER_PID: u16 = DEFAULT_FLASHER_PID;

/// Hardware identity of a flasher board as stored in the station config.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UsbIdentity {
    pub vid: u16,
    pub pid: u16,
    pub serial: String,
}

impl UsbIdentity {
    pub fn new(vid: u16, pid: u16, serial: impl Into<String>) -> Self {
        Self {
            vid,
            pid,
            serial: serial.into(),
        }
    }

    /// Identity of a standard OtO flasher board with the given serial number.
    pub fn flasher(serial: impl Into<String>) -> Self {
        Self::new(FLASHER_VID, FLASHER_PID, serial)
    }

    /// Returns true if the enumerated port belongs to this board.
    pub fn matches(&self, port: &PortIdentity) -> bool {
        port.vid == self.vid
            && port.pid == self.pid
            && port.serial_number.as_deref() == Some(self.serial.as_str())
    }
}

impl From<&FlasherEntry> for UsbIdentity {
    fn from(entry: &FlasherEntry) -> Self {
        Self::new(entry.vid, entry.pid, entry.serial.clone())
    }
}

impl fmt::Display for UsbIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "serial {}, vid {:#06x}, pid {:#06x}",
            self.serial, self.vid, self.pid
        )
    }
}

/// One USB serial port as reported by the operating system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortIdentity {
    /// OS port name, e.g. `/dev/ttyUSB0` or `COM7`.
    pub name: String,
    pub vid: u16,
    pub pid: u16,
    pub serial_number: Option<String>,
}

/// Errors from port enumeration and resolution.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PortError {
    /// No enumerated port carries the requested identity.
    #[error("COM port with {0} not found")]
    PortNotFound(UsbIdentity),

    /// The operating system query itself failed.
    #[error("Serial port enumeration failed: {0}")]
    Enumeration(String),
}

/// Source of live serial port enumeration.
///
/// Abstracts the OS query so resolution and the port listener can be
/// exercised without boards attached.
pub trait PortEnumerator: Send + Sync {
    /// List every USB serial port currently attached.
    fn list_ports(&self) -> Result<Vec<PortIdentity>, PortError>;
}

/// Port enumeration backed by the operating system via `serialport`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPorts;

impl PortEnumerator for SystemPorts {
    fn list_ports(&self) -> Result<Vec<PortIdentity>, PortError> {
        let ports = available_ports().map_err(|e| PortError::Enumeration(e.to_string()))?;

        let usb_ports: Vec<PortIdentity> = ports
            .into_iter()
            .filter_map(|port| match port.port_type {
                SerialPortType::UsbPort(usb) => Some(PortIdentity {
                    name: port.port_name,
                    vid: usb.vid,
                    pid: usb.pid,
                    serial_number: usb.serial_number,
                }),
                _ => {
                    trace!("Skipping non-USB port {}", port.port_name);
                    None
                }
            })
            .collect();

        debug!("Enumerated {} USB serial port(s)", usb_ports.len());
        Ok(usb_ports)
    }
}

/// Find the port name for `target` in an enumeration snapshot.
///
/// Returns the last matching port when several match (see module docs).
///
/// # Errors
///
/// Returns [`PortError::PortNotFound`] if no port matches.
pub fn resolve_port(target: &UsbIdentity, ports: &[PortIdentity]) -> Result<String, PortError> {
    ports
        .iter()
        .filter(|port| target.matches(port))
        .last()
        .map(|port| port.name.clone())
        .ok_or_else(|| PortError::PortNotFound(target.clone()))
}

/// Query live enumeration and resolve `target` to a port name.
pub fn resolve(enumerator: &dyn PortEnumerator, target: &UsbIdentity) -> Result<String, PortError> {
    let ports = enumerator.list_ports()?;
    resolve_port(target, &ports)
}

/// Serial numbers of every attached port with the given vid/pid, in
/// enumeration order.
pub fn serials_matching(ports: &[PortIdentity], vid: u16, pid: u16) -> Vec<String> {
    ports
        .iter()
        .filter(|port| port.vid == vid && port.pid == pid)
        .filter_map(|port| port.serial_number.clone())
        .collect()
}
