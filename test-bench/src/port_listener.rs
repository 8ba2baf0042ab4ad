//! Background flasher board hot-plug detection.
//!
//! A [`PortListener`] polls serial enumeration on its own thread and reports
//! flasher boards (by serial number) appearing and disappearing. Boards
//! already attached when the listener starts are reported as added on the
//! first poll.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use hardware::ports::{serials_matching, PortEnumerator};
use tracing::{debug, warn};

/// 4 Hz, fast enough to feel immediate when a board is plugged in.
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortEvent {
    /// Serial number of a newly attached flasher board.
    Added(String),
    /// Serial number of a flasher board that went away.
    Removed(String),
}

/// Events turning `previous` into `current`: removals first, then additions,
/// each in the order of the list they come from.
pub fn diff_serials(previous: &[String], current: &[String]) -> Vec<PortEvent> {
    let removed = previous
        .iter()
        .filter(|serial| !current.contains(serial))
        .map(|serial| PortEvent::Removed(serial.clone()));
    let added = current
        .iter()
        .filter(|serial| !previous.contains(serial))
        .map(|serial| PortEvent::Added(serial.clone()));
    removed.chain(added).collect()
}

pub struct PortListener {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl PortListener {
    /// Start polling `enumerator` for boards with the given vid/pid.
    ///
    /// The thread exits when the listener is stopped or dropped, or when the
    /// receiving end of `events` goes away.
    pub fn spawn(
        enumerator: Arc<dyn PortEnumerator>,
        vid: u16,
        pid: u16,
        interval: Duration,
        events: Sender<PortEvent>,
    ) -> io::Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let handle = thread::Builder::new()
            .name("port-listener".to_string())
            .spawn(move || {
                let mut known: Vec<String> = Vec::new();
                loop {
                    match enumerator.list_ports() {
                        Ok(ports) => {
                            let current = serials_matching(&ports, vid, pid);
                            for event in diff_serials(&known, &current) {
                                debug!("Flasher board event: {event:?}");
                                if events.send(event).is_err() {
                                    return;
                                }
                            }
                            known = current;
                        }
                        Err(err) => warn!("Port poll failed: {err}"),
                    }

                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                    }
                }
            })?;

        Ok(Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Stop polling and wait for the thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Dropping the sender disconnects the stop channel.
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Port listener thread panicked");
            }
        }
    }
}

impl Drop for PortListener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use hardware::ports::{FLASHER_PID, FLASHER_VID};
    use hardware::sim::SimulatedBench;

    fn serials(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_diff_serials() {
        let events = diff_serials(&serials(&["A", "B", "C"]), &serials(&["C", "D", "A"]));
        assert_eq!(
            events,
            vec![
                PortEvent::Removed("B".to_string()),
                PortEvent::Added("D".to_string()),
            ]
        );
        assert!(diff_serials(&serials(&["A"]), &serials(&["A"])).is_empty());
    }

    #[test]
    fn test_listener_reports_hot_plug() {
        let bench = SimulatedBench::with_boards(2);
        let (tx, rx) = unbounded();
        let listener = PortListener::spawn(
            Arc::new(bench.ports()),
            FLASHER_VID,
            FLASHER_PID,
            Duration::from_millis(10),
            tx,
        )
        .unwrap();

        let timeout = Duration::from_secs(2);
        assert_eq!(rx.recv_timeout(timeout).unwrap(), PortEvent::Added("SIM0000".to_string()));
        assert_eq!(rx.recv_timeout(timeout).unwrap(), PortEvent::Added("SIM0001".to_string()));

        bench.set_attached(1, false);
        assert_eq!(rx.recv_timeout(timeout).unwrap(), PortEvent::Removed("SIM0001".to_string()));

        bench.set_attached(1, true);
        assert_eq!(rx.recv_timeout(timeout).unwrap(), PortEvent::Added("SIM0001".to_string()));

        listener.stop();
    }

    #[test]
    fn test_listener_ignores_other_devices() {
        let bench = SimulatedBench::with_boards(1);
        let (tx, rx) = unbounded();
        let listener =
            PortListener::spawn(Arc::new(bench.ports()), 0x0403, 0x6001, Duration::from_millis(10), tx)
                .unwrap();

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(listener);
    }
}
