//! Assembling a station from `config.yml`.
//!
//! Units are created from the configured `flasher_list`, one per entry and in
//! file order: slot order is the physical position on the bench.

use std::sync::Arc;

use hardware::flasher::EsptoolFlasher;
use hardware::oto::OtoConnector;
use hardware::ports::{SystemPorts, UsbIdentity};
use hardware::sim::SimulatedBench;
use shared::config_storage::StationConfig;

use crate::pipeline::StationHardware;

/// Flasher identities of every configured unit, in slot order.
pub fn unit_identities(config: &StationConfig) -> Vec<UsbIdentity> {
    config.flasher_list.iter().map(UsbIdentity::from).collect()
}

/// Hardware seams plus the units to run on them.
#[derive(Clone)]
pub struct Station {
    pub hardware: StationHardware,
    pub identities: Vec<UsbIdentity>,
}

impl Station {
    /// Attached hardware: live serial enumeration and esptool.
    ///
    /// `connector` opens protocol sessions on the units.
    pub fn attached(
        config: &StationConfig,
        flasher: EsptoolFlasher,
        connector: Arc<dyn OtoConnector>,
    ) -> Self {
        Self {
            hardware: StationHardware {
                ports: Arc::new(SystemPorts),
                connector,
                flasher: Arc::new(flasher),
            },
            identities: unit_identities(config),
        }
    }

    /// Simulated boards behind the configured flasher serials.
    ///
    /// Without a config file the bench is `boards` generic units.
    pub fn simulated(config: Option<&StationConfig>, boards: usize) -> (Self, SimulatedBench) {
        let bench = match config {
            Some(config) => {
                let serials: Vec<&str> =
                    config.flasher_list.iter().map(|e| e.serial.as_str()).collect();
                SimulatedBench::with_serials(&serials)
            }
            None => SimulatedBench::with_boards(boards),
        };
        let identities = match config {
            Some(config) => unit_identities(config),
            None => bench.identities(),
        };
        let station = Self {
            hardware: StationHardware::simulated(&bench),
            identities,
        };
        (station, bench)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use hardware::oto::UnlinkedConnector;
    use shared::config_storage::FlasherEntry;
    use std::time::Duration;

    use crate::orchestrator::{BatchOrchestrator, Workflow, DEFAULT_WORKERS};
    use crate::pipeline::FlashSettings;
    use crate::qualification::{BatterySettings, ZeroPressureSettings};
    use crate::unit::UnitState;

    fn config(serials: &[&str]) -> StationConfig {
        StationConfig {
            flasher_list: serials.iter().map(|s| FlasherEntry::flasher(*s)).collect(),
            ..Default::default()
        }
    }

    fn fast_flash(dir: &std::path::Path) -> Workflow {
        Workflow::Flash(FlashSettings {
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
            readings_path: dir.join("readings.csv"),
            ..Default::default()
        })
    }

    #[test]
    fn test_unit_identities_follow_config_order() {
        let mut config = config(&["B", "A"]);
        config.flasher_list.push(FlasherEntry {
            vid: 0x0403,
            pid: 0x6001,
            serial: "FTDI1".to_string(),
        });

        let identities = unit_identities(&config);
        assert_eq!(
            identities,
            vec![
                UsbIdentity::flasher("B"),
                UsbIdentity::flasher("A"),
                UsbIdentity::new(0x0403, 0x6001, "FTDI1"),
            ]
        );
    }

    #[test]
    fn test_simulated_station_slots_follow_config() {
        let (station, bench) = Station::simulated(Some(&config(&["B", "A"])), 5);
        assert_eq!(bench.len(), 2);

        let (tx, _rx) = unbounded();
        let orchestrator =
            BatchOrchestrator::new(station.hardware, station.identities, tx, DEFAULT_WORKERS)
                .unwrap();
        let serials: Vec<_> = orchestrator
            .units_snapshot()
            .into_iter()
            .map(|unit| (unit.slot, unit.identity.serial))
            .collect();
        assert_eq!(serials, vec![(0, "B".to_string()), (1, "A".to_string())]);

        let dir = tempfile::tempdir().unwrap();
        let summary = orchestrator.run_all(&fast_flash(dir.path())).unwrap();
        assert_eq!(summary.succeeded(), 2);
    }

    #[test]
    fn test_simulated_station_without_config_uses_generic_boards() {
        let (station, bench) = Station::simulated(None, 3);
        assert_eq!(bench.len(), 3);
        assert_eq!(station.identities, bench.identities());
    }

    #[test]
    fn test_empty_flasher_list_has_no_units() {
        let (station, bench) = Station::simulated(Some(&StationConfig::default()), 4);
        assert!(station.identities.is_empty());
        assert!(bench.is_empty());
    }

    #[test]
    fn test_attached_station_without_protocol_client() {
        let config = config(&["B", "A"]);
        let station = Station::attached(
            &config,
            EsptoolFlasher::new("binaries"),
            Arc::new(UnlinkedConnector),
        );
        assert_eq!(station.identities, unit_identities(&config));

        // Flashing goes through the real seams; only the protocol step is
        // missing, so simulated ports and flasher reach the connect step.
        let bench = SimulatedBench::with_serials(&["B"]);
        let hardware = StationHardware {
            connector: station.hardware.connector.clone(),
            ..StationHardware::simulated(&bench)
        };
        let (tx, _rx) = unbounded();
        let orchestrator =
            BatchOrchestrator::new(hardware, vec![UsbIdentity::flasher("B")], tx, 1).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let summary = orchestrator.run_all(&fast_flash(dir.path())).unwrap();

        assert_eq!(summary.outcomes[0].state, UnitState::FailConnect);
        assert_eq!(bench.flashed_version(0).as_deref(), Some("v2.4.0.0-v5"));
    }
}
