//! OtO factory station.
//!
//! Subcommands:
//! - `flash`: flash, qualify and calibrate every configured unit
//! - `decay`: run the pressure decay leak test on every configured unit
//! - `ports`: list attached USB serial ports
//! - `configure`: detect flasher boards and update `config.yml`
//!
//! `flash` and `decay` open the terminal dashboard unless `--headless` is
//! given. Units are the `flasher_list` entries of the config, in file order.
//! `--simulate N` swaps every piece of hardware for simulated boards behind
//! the configured serials, or N generic boards when there is no config file.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::{unbounded, Receiver};
use hardware::flasher::EsptoolFlasher;
use hardware::oto::UnlinkedConnector;
use hardware::ports::{serials_matching, PortEnumerator, SystemPorts};
use hardware::sim::SimulatedBench;
use shared::config_storage::{
    ConfigError, ConfigStorage, StationConfig, DEFAULT_CONFIG_FILE, DEFAULT_FIRMWARE_VERSION,
    DEFAULT_FLASHER_PID, DEFAULT_FLASHER_VID,
};
use test_bench::dashboard::run_dashboard;
use test_bench::orchestrator::{BatchEvent, BatchOrchestrator, BatchSummary, Workflow, DEFAULT_WORKERS};
use test_bench::pipeline::{DecaySettings, FlashSettings};
use test_bench::port_listener::{PortEvent, PortListener, POLL_INTERVAL};
use test_bench::station::Station;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Log file used while the dashboard owns the terminal.
const DASHBOARD_LOG_FILE: &str = "oto_station.log";

#[derive(Parser, Debug)]
#[command(name = "oto_station")]
#[command(about = "OtO factory flashing and test station")]
#[command(version)]
struct Args {
    /// Station configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Use N simulated boards instead of attached hardware
    #[arg(long, global = true, value_name = "BOARDS")]
    simulate: Option<usize>,

    /// Directory holding `<firmware_version>/build` trees
    #[arg(long, global = true, default_value = "binaries")]
    binaries_dir: PathBuf,

    /// esptool command line; words after the first are passed before the
    /// flash arguments, e.g. "python tools/esptool.py"
    #[arg(long, global = true, default_value = "esptool.py")]
    esptool: String,

    /// Units processed in parallel
    #[arg(long, global = true, default_value_t = DEFAULT_WORKERS)]
    workers: usize,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Flash, qualify and calibrate every configured unit
    Flash {
        /// Run one batch and print progress instead of opening the dashboard
        #[arg(long)]
        headless: bool,

        /// Batch readings CSV (appended)
        #[arg(long, default_value = "readings.csv")]
        readings: PathBuf,
    },

    /// Pressure decay leak test on every configured unit
    Decay {
        /// Seconds between samples
        #[arg(long, default_value_t = 120)]
        interval: u64,

        /// Number of samples per unit
        #[arg(long, default_value_t = 15)]
        iterations: u32,

        /// Directory for the per-unit readings CSVs
        #[arg(long, default_value = ".")]
        output_dir: PathBuf,

        /// Run one batch and print progress instead of opening the dashboard
        #[arg(long)]
        headless: bool,
    },

    /// List attached USB serial ports
    Ports,

    /// Detect flasher boards and reconcile them with the config
    Configure {
        /// Write the updated flasher list back to the config file
        #[arg(long)]
        save: bool,

        /// Keep listening for plugged/unplugged boards for this many seconds
        #[arg(long, value_name = "SECS")]
        watch: Option<u64>,

        /// Put these boards first, in this order (comma separated serials)
        #[arg(long, value_name = "SERIALS", value_delimiter = ',')]
        order: Vec<String>,

        /// Move the board in this slot (1-based) up one slot
        #[arg(long, value_name = "SLOT")]
        up: Option<usize>,

        /// Move the board in this slot (1-based) down one slot
        #[arg(long, value_name = "SLOT")]
        down: Option<usize>,
    },
}

fn init_logging(level: &str, to_file: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("Invalid log level {level:?}"))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if to_file {
        let file = File::create(DASHBOARD_LOG_FILE)
            .with_context(|| format!("Failed to create {DASHBOARD_LOG_FILE}"))?;
        builder.with_writer(Mutex::new(file)).with_ansi(false).init();
    } else {
        builder.init();
    }
    Ok(())
}

/// Station config for a batch command. Simulated runs tolerate a missing
/// file and get `None`.
fn batch_config(args: &Args) -> Result<Option<StationConfig>> {
    match ConfigStorage::with_path(&args.config).load() {
        Ok(config) => Ok(Some(config)),
        Err(ConfigError::NotFound(_)) if args.simulate.is_some() => Ok(None),
        Err(err) => Err(err).with_context(|| {
            format!("Fix {} and restart the station", args.config.display())
        }),
    }
}

/// Units and hardware seams for a batch command, with the firmware to flash.
fn station(args: &Args) -> Result<(Station, String)> {
    let config = batch_config(args)?;
    let firmware_version = config
        .as_ref()
        .map_or(DEFAULT_FIRMWARE_VERSION, StationConfig::firmware_version)
        .to_string();

    if let Some(boards) = args.simulate {
        let (station, bench) = Station::simulated(config.as_ref(), boards);
        info!("Simulating {} boards", bench.len());
        return Ok((station, firmware_version));
    }

    let Some(config) = config else {
        bail!("No station config at {}", args.config.display());
    };
    let flasher = esptool_flasher(args)?;
    flasher
        .command_args("<port>", &firmware_version)
        .context("Firmware binaries are not ready")?;

    // The vendor protocol client plugs in through `OtoConnector`; without it
    // units are flashed and then fail to connect.
    warn!("No OtO protocol client is linked into this build; units will stop at the connect step");
    let station = Station::attached(&config, flasher, Arc::new(UnlinkedConnector));
    Ok((station, firmware_version))
}

/// Serial enumeration for `ports` and `configure`.
fn enumerator(args: &Args) -> Arc<dyn PortEnumerator> {
    match args.simulate {
        Some(boards) => Arc::new(SimulatedBench::with_boards(boards).ports()),
        None => Arc::new(SystemPorts),
    }
}

fn esptool_flasher(args: &Args) -> Result<EsptoolFlasher> {
    let mut words = args.esptool.split_whitespace().map(str::to_string);
    let Some(program) = words.next() else {
        bail!("--esptool must not be empty");
    };
    Ok(EsptoolFlasher::with_command(program, words.collect(), &args.binaries_dir))
}

fn print_events(events: Receiver<BatchEvent>) {
    for event in events {
        match event {
            BatchEvent::UnitState { slot, state } => println!("[unit {}] -> {state}", slot + 1),
            BatchEvent::Log { slot, line, .. } => {
                for text in line.lines() {
                    println!("[unit {}] {text}", slot + 1);
                }
            }
            BatchEvent::Finished(_) => {}
        }
    }
}

fn print_summary(summary: &BatchSummary) {
    println!();
    println!(
        "{} passed, {} failed in {:.1}s",
        summary.succeeded(),
        summary.failed(),
        summary.elapsed.as_secs_f64()
    );
    for outcome in &summary.outcomes {
        let first_line = outcome
            .error
            .as_deref()
            .and_then(|e| e.lines().next())
            .unwrap_or("");
        println!("  unit {:>2}: {:<20} {first_line}", outcome.slot + 1, outcome.state);
    }
}

fn run_batch(args: &Args, station: Station, workflow: Workflow, headless: bool) -> Result<()> {
    if station.identities.is_empty() {
        bail!("No flasher boards configured in {}", args.config.display());
    }

    let (tx, rx) = unbounded();
    let orchestrator =
        BatchOrchestrator::new(station.hardware, station.identities, tx, args.workers)
            .context("Failed to create batch orchestrator")?;

    if !headless {
        return run_dashboard(Arc::new(orchestrator), workflow, rx).context("Dashboard failed");
    }

    let printer = thread::spawn(move || print_events(rx));
    let result = orchestrator.run_all(&workflow);
    drop(orchestrator);
    let _ = printer.join();

    let summary = result.context("Batch failed")?;
    print_summary(&summary);
    Ok(())
}

fn list_ports(enumerator: &dyn PortEnumerator) -> Result<()> {
    let ports = enumerator.list_ports().context("Failed to enumerate serial ports")?;
    if ports.is_empty() {
        println!("No USB serial ports found");
    }
    for port in ports {
        let flasher = if port.vid == DEFAULT_FLASHER_VID && port.pid == DEFAULT_FLASHER_PID {
            " (flasher)"
        } else {
            ""
        };
        println!(
            "{:<16} {:04x}:{:04x} serial {}{flasher}",
            port.name,
            port.vid,
            port.pid,
            port.serial_number.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

/// Slot changes requested on the `configure` command line.
struct SlotMoves {
    order: Vec<String>,
    up: Option<usize>,
    down: Option<usize>,
}

impl SlotMoves {
    fn is_empty(&self) -> bool {
        self.order.is_empty() && self.up.is_none() && self.down.is_none()
    }

    fn apply(&self, config: &mut StationConfig) -> Result<()> {
        config
            .reorder_flashers(&self.order)
            .context("Cannot reorder flasher boards")?;
        if let Some(slot) = self.up {
            if !config.move_flasher_up(slot.saturating_sub(1)) {
                bail!("Cannot move slot {slot} up");
            }
        }
        if let Some(slot) = self.down {
            if !config.move_flasher_down(slot.saturating_sub(1)) {
                bail!("Cannot move slot {slot} down");
            }
        }
        Ok(())
    }
}

fn configure(
    config_path: &Path,
    enumerator: Arc<dyn PortEnumerator>,
    save: bool,
    watch: Option<u64>,
    moves: &SlotMoves,
) -> Result<()> {
    let storage = ConfigStorage::with_path(config_path);
    let mut config = match storage.load() {
        Ok(config) => config,
        Err(ConfigError::NotFound(path)) => {
            println!("{} not found, starting a new flasher list", path.display());
            StationConfig::default()
        }
        Err(err) => return Err(err).context("Failed to load station config"),
    };

    if let Some(secs) = watch {
        println!("Watching for flasher boards for {secs}s...");
        let (tx, rx) = unbounded();
        let listener = PortListener::spawn(
            Arc::clone(&enumerator),
            DEFAULT_FLASHER_VID,
            DEFAULT_FLASHER_PID,
            POLL_INTERVAL,
            tx,
        )
        .context("Failed to start port listener")?;

        let deadline = Instant::now() + Duration::from_secs(secs);
        while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
            match rx.recv_timeout(remaining) {
                Ok(PortEvent::Added(serial)) => println!("  + {serial}"),
                Ok(PortEvent::Removed(serial)) => println!("  - {serial}"),
                Err(_) => break,
            }
        }
        listener.stop();
    }

    let ports = enumerator.list_ports().context("Failed to enumerate serial ports")?;
    let attached = serials_matching(&ports, DEFAULT_FLASHER_VID, DEFAULT_FLASHER_PID);
    let added = config.reconcile_flashers(DEFAULT_FLASHER_VID, DEFAULT_FLASHER_PID, &attached);
    moves.apply(&mut config)?;

    println!("Flasher boards:");
    for (index, entry) in config.flasher_list.iter().enumerate() {
        let marker = if added.contains(&entry.serial) { "NEW" } else { "" };
        println!("  {:>2}. {:<20} {marker}", index + 1, entry.serial);
    }

    if save {
        storage.save(&config).context("Failed to save station config")?;
        println!("Saved {}", storage.path().display());
    } else if !added.is_empty() || !moves.is_empty() {
        println!("Run with --save to write these slots to {}", config_path.display());
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let dashboard = matches!(
        args.command,
        Command::Flash { headless: false, .. } | Command::Decay { headless: false, .. }
    );
    init_logging(&args.log_level, dashboard)?;

    match &args.command {
        Command::Flash { headless, readings } => {
            let (station, firmware_version) = station(&args)?;
            let settings = FlashSettings {
                firmware_version,
                readings_path: readings.clone(),
                ..Default::default()
            };
            run_batch(&args, station, Workflow::Flash(settings), *headless)
        }
        Command::Decay {
            interval,
            iterations,
            output_dir,
            headless,
        } => {
            let (station, _) = station(&args)?;
            let settings = DecaySettings {
                interval: Duration::from_secs(*interval),
                iterations: *iterations,
                output_dir: output_dir.clone(),
                ..Default::default()
            };
            run_batch(&args, station, Workflow::Decay(settings), *headless)
        }
        Command::Ports => list_ports(enumerator(&args).as_ref()),
        Command::Configure {
            save,
            watch,
            order,
            up,
            down,
        } => {
            let moves = SlotMoves {
                order: order.clone(),
                up: *up,
                down: *down,
            };
            configure(&args.config, enumerator(&args), *save, *watch, &moves)
        }
    }
}
