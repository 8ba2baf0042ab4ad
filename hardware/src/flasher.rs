//! Firmware flashing through esptool.
//!
//! Firmware builds live under `<binaries>/<firmware_version>/build/`. The
//! ESP-IDF build drops a `flasher_args.json` manifest next to the images:
//!
//! ```json
//! {
//!   "write_flash_args": ["--flash_mode", "dio", "--flash_size", "detect", "--flash_freq", "40m"],
//!   "flash_files": {
//!     "0x1000": "bootloader/bootloader.bin",
//!     "0x8000": "partition_table/partition-table.bin",
//!     "0x49000": "ota_data_initial.bin",
//!     "0x50000": "OtO-Firmware.bin"
//!   }
//! }
//! ```
//!
//! Builds shipped without a manifest fall back to [`FlashManifest::default_oto`],
//! which describes the standard OtO partition layout.
//!
//! The flash itself is an esptool subprocess:
//!
//! ```text
//! esptool.py --chip esp32 --baud 921600 --port <port> --connect-attempts 20 \
//!     write_flash <write_flash_args...> <offset> <image> ...
//! ```
//!
//! Standard output is streamed line by line to the caller while the tool
//! runs; standard error is captured and embedded in the failure.

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Manifest file name inside a build directory.
pub const MANIFEST_FILE: &str = "flasher_args.json";

/// Target chip passed to esptool.
pub const CHIP: &str = "esp32";

/// Serial baud rate used for flashing.
pub const FLASH_BAUD: u32 = 921_600;

/// Number of times esptool tries to sync with the bootloader.
pub const CONNECT_ATTEMPTS: u32 = 20;

/// Errors from the flash stage.
#[derive(Error, Debug)]
pub enum FlashError {
    /// A binary referenced by the manifest is missing. Not retried.
    #[error("Binary file {0} not found")]
    MissingBinary(PathBuf),

    /// The manifest exists but cannot be read or parsed.
    #[error("Invalid flash manifest {path}: {reason}")]
    Manifest { path: PathBuf, reason: String },

    /// The flashing tool could not be started.
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The flashing tool ran and exited unsuccessfully.
    #[error("Flashing tool exited with {}: {stderr}", exit_code_text(.code))]
    ToolFailed { code: Option<i32>, stderr: String },

    /// I/O failure while streaming tool output.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn exit_code_text(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {code}"),
        None => "no exit code (terminated by signal)".to_string(),
    }
}

/// One image to write: flash offset and absolute path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashImage {
    pub offset: u32,
    pub path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct RawManifest {
    #[serde(default)]
    write_flash_args: Vec<String>,
    flash_files: BTreeMap<String, String>,
}

/// Parsed `flasher_args.json`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashManifest {
    /// Extra flags placed right after `write_flash`.
    pub write_flash_args: Vec<String>,
    /// `(offset, relative path)` pairs in ascending offset order.
    pub flash_files: Vec<(u32, String)>,
}

impl FlashManifest {
    /// Standard OtO layout used when a build ships without a manifest.
    pub fn default_oto() -> Self {
        Self {
            write_flash_args: ["--flash_mode", "dio", "--flash_size", "detect", "--flash_freq", "40m"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            flash_files: vec![
                (0x1000, "bootloader/bootloader.bin".to_string()),
                (0x8000, "partition_table/partition-table.bin".to_string()),
                (0x49000, "ota_data_initial.bin".to_string()),
                (0x50000, "OtO-Firmware.bin".to_string()),
            ],
        }
    }

    /// Parse manifest JSON text.
    pub fn from_json(text: &str) -> Result<Self, String> {
        let raw: RawManifest = serde_json::from_str(text).map_err(|e| e.to_string())?;

        let mut flash_files = raw
            .flash_files
            .into_iter()
            .map(|(offset, path)| parse_offset(&offset).map(|o| (o, path)))
            .collect::<Result<Vec<_>, _>>()?;
        flash_files.sort_by_key(|(offset, _)| *offset);

        Ok(Self {
            write_flash_args: raw.write_flash_args,
            flash_files,
        })
    }

    /// Load the manifest for a build directory, falling back to the default
    /// layout when the file does not exist.
    pub fn load(build_dir: &Path) -> Result<Self, FlashError> {
        let path = build_dir.join(MANIFEST_FILE);
        match fs::read_to_string(&path) {
            Ok(text) => Self::from_json(&text).map_err(|reason| FlashError::Manifest { path, reason }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("{} not found, using default manifest", path.display());
                Ok(Self::default_oto())
            }
            Err(e) => Err(FlashError::Manifest {
                path,
                reason: e.to_string(),
            }),
        }
    }

    /// Resolve every image against `build_dir`, checking each file exists.
    pub fn images(&self, build_dir: &Path) -> Result<Vec<FlashImage>, FlashError> {
        self.flash_files
            .iter()
            .map(|(offset, relative)| {
                let path = build_dir.join(relative);
                if !path.is_file() {
                    return Err(FlashError::MissingBinary(path));
                }
                Ok(FlashImage {
                    offset: *offset,
                    path: fs::canonicalize(&path).unwrap_or(path),
                })
            })
            .collect()
    }
}

fn parse_offset(text: &str) -> Result<u32, String> {
    let trimmed = text.trim();
    let parsed = match trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => trimmed.parse(),
    };
    parsed.map_err(|_| format!("invalid flash offset {text:?}"))
}

/// Build directory for a firmware version.
pub fn build_dir(binaries_dir: &Path, firmware_version: &str) -> PathBuf {
    binaries_dir.join(firmware_version).join("build")
}

/// Assemble the esptool argument list for writing `images` to `port`.
pub fn esptool_args(port: &str, manifest: &FlashManifest, images: &[FlashImage]) -> Vec<String> {
    let mut args = vec![
        "--chip".to_string(),
        CHIP.to_string(),
        "--baud".to_string(),
        FLASH_BAUD.to_string(),
        "--port".to_string(),
        port.to_string(),
        "--connect-attempts".to_string(),
        CONNECT_ATTEMPTS.to_string(),
        "write_flash".to_string(),
    ];
    args.extend(manifest.write_flash_args.iter().cloned());
    for image in images {
        args.push(format!("{:#x}", image.offset));
        args.push(image.path.display().to_string());
    }
    args
}

/// Writes firmware to a unit attached to a serial port.
pub trait FirmwareFlasher: Send + Sync {
    /// Flash `firmware_version` through `port`, passing every line of tool
    /// output to `output` as it arrives.
    fn flash(
        &self,
        port: &str,
        firmware_version: &str,
        output: &mut dyn FnMut(&str),
    ) -> Result<(), FlashError>;
}

/// [`FirmwareFlasher`] running esptool as a subprocess.
#[derive(Debug, Clone)]
pub struct EsptoolFlasher {
    program: PathBuf,
    leading_args: Vec<String>,
    binaries_dir: PathBuf,
}

impl EsptoolFlasher {
    /// Run `esptool.py` from `PATH`.
    pub fn new(binaries_dir: impl Into<PathBuf>) -> Self {
        Self::with_command("esptool.py", Vec::new(), binaries_dir)
    }

    /// Run a custom command, e.g. `python` with the path to `esptool.py` as
    /// the first leading argument.
    pub fn with_command(
        program: impl Into<PathBuf>,
        leading_args: Vec<String>,
        binaries_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            program: program.into(),
            leading_args,
            binaries_dir: binaries_dir.into(),
        }
    }

    pub fn binaries_dir(&self) -> &Path {
        &self.binaries_dir
    }

    /// Full argument list (after the program) for a flash of `port`.
    pub fn command_args(&self, port: &str, firmware_version: &str) -> Result<Vec<String>, FlashError> {
        let build_dir = build_dir(&self.binaries_dir, firmware_version);
        let manifest = FlashManifest::load(&build_dir)?;
        let images = manifest.images(&build_dir)?;

        let mut args = self.leading_args.clone();
        args.extend(esptool_args(port, &manifest, &images));
        Ok(args)
    }
}

impl FirmwareFlasher for EsptoolFlasher {
    fn flash(
        &self,
        port: &str,
        firmware_version: &str,
        output: &mut dyn FnMut(&str),
    ) -> Result<(), FlashError> {
        let args = self.command_args(port, firmware_version)?;
        let program = self.program.display().to_string();
        info!("Flashing {firmware_version} on {port}");
        debug!("{program} {}", args.join(" "));

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| FlashError::Spawn {
                program: program.clone(),
                source,
            })?;

        // Drain stderr on its own thread so a chatty tool cannot fill the pipe
        // while stdout is being streamed.
        let stderr_reader = child.stderr.take().map(|mut stderr| {
            thread::spawn(move || {
                let mut bytes = Vec::new();
                let _ = stderr.read_to_end(&mut bytes);
                String::from_utf8_lossy(&bytes).into_owned()
            })
        });

        // esptool progress output is not guaranteed to be UTF-8.
        if let Some(stdout) = child.stdout.take() {
            for chunk in BufReader::new(stdout).split(b'\n') {
                match chunk {
                    Ok(bytes) => {
                        let line = String::from_utf8_lossy(&bytes);
                        output(line.trim_end_matches('\r'));
                    }
                    Err(err) => {
                        warn!("Lost {program} output on {port}: {err}");
                        break;
                    }
                }
            }
        }

        // Always reap the child, even when its output could not be read.
        let status = child.wait()?;
        let stderr = stderr_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        if status.success() {
            Ok(())
        } else {
            warn!("{program} failed on {port} with {status}");
            Err(FlashError::ToolFailed {
                code: status.code(),
                stderr: stderr.trim().to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_default_build(root: &Path, version: &str) -> PathBuf {
        let build = build_dir(root, version);
        for (_, relative) in FlashManifest::default_oto().flash_files {
            let path = build.join(relative);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, b"\xe9firmware").unwrap();
        }
        build
    }

    #[test]
    fn test_default_manifest_sorted_by_offset() {
        let manifest = FlashManifest::default_oto();
        let offsets: Vec<u32> = manifest.flash_files.iter().map(|(o, _)| *o).collect();
        assert_eq!(offsets, vec![0x1000, 0x8000, 0x49000, 0x50000]);
    }

    #[test]
    fn test_manifest_from_json() {
        let json = r#"{
            "write_flash_args": ["--flash_mode", "qio"],
            "flash_settings": {"flash_mode": "qio"},
            "flash_files": {"0x10000": "app.bin", "0x1000": "boot.bin", "32768": "pt.bin"}
        }"#;

        let manifest = FlashManifest::from_json(json).unwrap();
        assert_eq!(manifest.write_flash_args, vec!["--flash_mode", "qio"]);
        assert_eq!(
            manifest.flash_files,
            vec![
                (0x1000, "boot.bin".to_string()),
                (0x8000, "pt.bin".to_string()),
                (0x10000, "app.bin".to_string()),
            ]
        );
    }

    #[test]
    fn test_manifest_rejects_bad_offset() {
        let json = r#"{"flash_files": {"0xZZ": "app.bin"}}"#;
        assert!(FlashManifest::from_json(json).is_err());
    }

    #[test]
    fn test_load_missing_manifest_uses_default() {
        let dir = TempDir::new().unwrap();
        let manifest = FlashManifest::load(dir.path()).unwrap();
        assert_eq!(manifest, FlashManifest::default_oto());
    }

    #[test]
    fn test_load_malformed_manifest_is_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(MANIFEST_FILE), "{ not json").unwrap();
        assert!(matches!(
            FlashManifest::load(dir.path()),
            Err(FlashError::Manifest { .. })
        ));
    }

    #[test]
    fn test_missing_binary_is_precondition_failure() {
        let dir = TempDir::new().unwrap();
        let build = write_default_build(dir.path(), "v1");
        fs::remove_file(build.join("OtO-Firmware.bin")).unwrap();

        let flasher = EsptoolFlasher::new(dir.path());
        match flasher.command_args("/dev/ttyUSB0", "v1") {
            Err(FlashError::MissingBinary(path)) => {
                assert!(path.ends_with("OtO-Firmware.bin"));
            }
            other => panic!("expected MissingBinary, got {other:?}"),
        }
    }

    #[test]
    fn test_command_args_layout() {
        let dir = TempDir::new().unwrap();
        write_default_build(dir.path(), "v2.4.0.0-v5");

        let flasher = EsptoolFlasher::with_command(
            "python",
            vec!["esptool.py".to_string()],
            dir.path(),
        );
        let args = flasher.command_args("COM7", "v2.4.0.0-v5").unwrap();

        assert_eq!(
            &args[..10],
            &[
                "esptool.py",
                "--chip",
                "esp32",
                "--baud",
                "921600",
                "--port",
                "COM7",
                "--connect-attempts",
                "20",
                "write_flash",
            ]
        );
        assert_eq!(
            &args[10..16],
            &["--flash_mode", "dio", "--flash_size", "detect", "--flash_freq", "40m"]
        );
        let pairs = &args[16..];
        assert_eq!(pairs.len(), 8);
        assert_eq!(pairs[0], "0x1000");
        assert!(pairs[1].ends_with("bootloader.bin"));
        assert_eq!(pairs[6], "0x50000");
        assert!(pairs[7].ends_with("OtO-Firmware.bin"));
    }

    #[cfg(unix)]
    #[test]
    fn test_flash_streams_stdout_and_succeeds() {
        let dir = TempDir::new().unwrap();
        write_default_build(dir.path(), "v1");

        let flasher = EsptoolFlasher::with_command(
            "sh",
            vec![
                "-c".to_string(),
                "echo Connecting....; echo 'Hash of data verified.'; exit 0".to_string(),
                "esptool".to_string(),
            ],
            dir.path(),
        );

        let mut lines = Vec::new();
        flasher
            .flash("/dev/ttyUSB0", "v1", &mut |line| lines.push(line.to_string()))
            .unwrap();
        assert_eq!(lines, vec!["Connecting....", "Hash of data verified."]);
    }

    #[cfg(unix)]
    #[test]
    fn test_flash_tolerates_non_utf8_output() {
        let dir = TempDir::new().unwrap();
        write_default_build(dir.path(), "v1");

        let flasher = EsptoolFlasher::with_command(
            "sh",
            vec![
                "-c".to_string(),
                "printf 'Writing\\377\\n'; echo 'Hash of data verified.'; printf 'warn\\376\\n' >&2; exit 0"
                    .to_string(),
                "esptool".to_string(),
            ],
            dir.path(),
        );

        let mut lines = Vec::new();
        flasher
            .flash("/dev/ttyUSB0", "v1", &mut |line| lines.push(line.to_string()))
            .unwrap();
        assert_eq!(lines, vec!["Writing\u{FFFD}", "Hash of data verified."]);
    }

    #[cfg(unix)]
    #[test]
    fn test_flash_non_utf8_failure_keeps_exit_code() {
        let dir = TempDir::new().unwrap();
        write_default_build(dir.path(), "v1");

        let flasher = EsptoolFlasher::with_command(
            "sh",
            vec![
                "-c".to_string(),
                "printf 'Connecting\\377\\n'; echo 'Failed to connect' >&2; exit 2".to_string(),
                "esptool".to_string(),
            ],
            dir.path(),
        );

        match flasher.flash("/dev/ttyUSB0", "v1", &mut |_| {}) {
            Err(FlashError::ToolFailed { code, stderr }) => {
                assert_eq!(code, Some(2));
                assert_eq!(stderr, "Failed to connect");
            }
            other => panic!("expected ToolFailed, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_flash_nonzero_exit_embeds_stderr() {
        let dir = TempDir::new().unwrap();
        write_default_build(dir.path(), "v1");

        let flasher = EsptoolFlasher::with_command(
            "sh",
            vec![
                "-c".to_string(),
                "echo 'A fatal error occurred: Failed to connect' >&2; exit 2".to_string(),
                "esptool".to_string(),
            ],
            dir.path(),
        );

        match flasher.flash("/dev/ttyUSB0", "v1", &mut |_| {}) {
            Err(FlashError::ToolFailed { code, stderr }) => {
                assert_eq!(code, Some(2));
                assert!(stderr.contains("Failed to connect"));
            }
            other => panic!("expected ToolFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_flash_spawn_failure() {
        let dir = TempDir::new().unwrap();
        write_default_build(dir.path(), "v1");

        let flasher =
            EsptoolFlasher::with_command("/nonexistent/esptool-binary", Vec::new(), dir.path());
        assert!(matches!(
            flasher.flash("/dev/ttyUSB0", "v1", &mut |_| {}),
            Err(FlashError::Spawn { .. })
        ));
    }
}
