//! px4flash CLI - Command-line tool for flashing PX4 autopilot boards.
//!
//! ## Features
//!
//! - Flash `.px4` firmware containers over the serial bootloader
//! - Wait for the board to be plugged in, or target a named port
//! - Show firmware container metadata
//! - List available serial ports
//! - Persisted link settings with per-port baud memory

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use px4flash::{
    BaudRate, CancelToken, FirmwareImage, LinkSettings, NativePort, NativePortEnumerator,
    PortEnumerator, PortSettings, Px4Uploader, UploadEvent, UploadPolicy, upload_via_hotplug,
};

/// px4flash - A cross-platform tool for flashing PX4 autopilot boards.
///
/// Environment variables:
///   PX4FLASH_PORT   - Serial port to flash (skips plug detection)
#[derive(Parser)]
#[command(name = "px4flash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to the settings file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Flash a .px4 firmware container.
    Flash {
        /// Path to the .px4 firmware file.
        firmware: PathBuf,

        /// Serial port to flash. When omitted, px4flash waits for a new
        /// port to appear and uses that.
        #[arg(short, long, env = "PX4FLASH_PORT")]
        port: Option<String>,

        /// Abort when the board reports bootloader revision 4 or newer.
        #[arg(long)]
        strict_bootloader: bool,

        /// Per-chunk retry budget for OTP reads.
        #[arg(long, default_value = "16")]
        otp_retries: u32,
    },

    /// Show information about a firmware container.
    Info {
        /// Path to the .px4 firmware file.
        firmware: PathBuf,
    },

    /// List available serial ports.
    ListPorts,

    /// Show or edit persisted link settings.
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
}

/// Settings subcommands.
#[derive(Subcommand)]
enum SettingsAction {
    /// Print the current settings.
    Show,
    /// Remember a preferred baud rate for a port.
    SetBaud {
        /// Port identifier (e.g. /dev/ttyACM0 or COM3).
        port: String,
        /// Baud rate to remember for that port.
        baud: u32,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!("px4flash v{}", env!("CARGO_PKG_VERSION"));

    match &cli.command {
        Commands::Flash {
            firmware,
            port,
            strict_bootloader,
            otp_retries,
        } => cmd_flash(
            &cli,
            firmware,
            port.as_deref(),
            *strict_bootloader,
            *otp_retries,
        ),
        Commands::Info { firmware } => cmd_info(firmware),
        Commands::ListPorts => cmd_list_ports(),
        Commands::Settings { action } => cmd_settings(&cli, action),
    }
}

/// Resolve the settings file path: `--config`, or the platform config
/// directory, or `./px4flash.toml` as a last resort.
fn settings_path(cli: &Cli) -> PathBuf {
    if let Some(path) = &cli.config_path {
        return path.clone();
    }
    directories::ProjectDirs::from("", "", "px4flash").map_or_else(
        || PathBuf::from("px4flash.toml"),
        |dirs| dirs.config_dir().join("settings.toml"),
    )
}

fn cmd_flash(
    cli: &Cli,
    firmware: &Path,
    port: Option<&str>,
    strict_bootloader: bool,
    otp_retries: u32,
) -> Result<()> {
    let image = FirmwareImage::from_file(firmware)
        .with_context(|| format!("failed to load {}", firmware.display()))?;

    if !cli.quiet {
        eprintln!(
            "Loaded {}: board id {}, {} bytes{}",
            firmware.display(),
            image.board_id(),
            image.declared_size(),
            if image.description().is_empty() {
                String::new()
            } else {
                format!(" ({})", image.description())
            }
        );
    }

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || cancel.cancel())
            .context("failed to install Ctrl-C handler")?;
    }

    let policy = UploadPolicy {
        abort_on_v4: strict_bootloader,
        otp_chunk_retries: otp_retries,
    };

    let (events, progress) = mpsc::channel();
    let worker = {
        let cancel = cancel.clone();
        let port = port.map(str::to_owned);
        thread::spawn(move || match port {
            Some(name) => {
                let settings = PortSettings::new(&name, BaudRate::Baud115200);
                let opened = NativePort::open(&settings)?;
                Px4Uploader::new(opened, image, events, cancel)
                    .with_policy(policy)
                    .run()
            },
            None => upload_via_hotplug(image, events, cancel, policy),
        })
    };

    let bar = if cli.quiet {
        ProgressBar::hidden()
    } else {
        let bar = ProgressBar::new(0);
        #[allow(clippy::unwrap_used)] // Static template string
        bar.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );
        bar.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        bar
    };

    for event in progress {
        match event {
            UploadEvent::DevicePlugRequested => {
                bar.suspend(|| eprintln!("Please unplug, and then plug back in, the board"));
            },
            UploadEvent::Status(message) => bar.set_message(message),
            UploadEvent::BootloaderRev(rev) => {
                bar.suspend(|| eprintln!("Bootloader rev: {rev}"));
            },
            UploadEvent::BoardId(id) => bar.suspend(|| eprintln!("Board ID: {id}")),
            UploadEvent::BoardRev(rev) => bar.suspend(|| eprintln!("Board rev: {rev}")),
            UploadEvent::FlashSize(size) => bar.suspend(|| eprintln!("Flash size: {size}")),
            UploadEvent::SerialNumber(serial) => {
                bar.suspend(|| eprintln!("Board SN: {serial}"));
            },
            UploadEvent::OtpDump(dump) => {
                if cli.verbose > 0 {
                    bar.suspend(|| eprintln!("OTP:\n{dump}"));
                }
            },
            UploadEvent::FlashProgress { written, total } => {
                bar.set_length(total);
                bar.set_position(written);
            },
            UploadEvent::Error(message) => bar.set_message(message),
            UploadEvent::Done => bar.finish_with_message("done"),
        }
    }

    let result = worker
        .join()
        .map_err(|_| anyhow::anyhow!("upload thread panicked"))?;
    match result {
        Ok(()) => {
            if !cli.quiet {
                eprintln!("Upload complete, board is rebooting");
            }
            Ok(())
        },
        Err(px4flash::Error::Cancelled) => {
            bar.abandon_with_message("cancelled");
            bail!("upload cancelled")
        },
        Err(e) => {
            bar.abandon();
            Err(e).context("upload failed")
        },
    }
}

fn cmd_info(firmware: &Path) -> Result<()> {
    let image = FirmwareImage::from_file(firmware)
        .with_context(|| format!("failed to load {}", firmware.display()))?;

    println!("File:        {}", firmware.display());
    println!("Board ID:    {}", image.board_id());
    println!("Image size:  {} bytes", image.declared_size());
    println!("Padded size: {} bytes", image.payload().len());
    if !image.description().is_empty() {
        println!("Description: {}", image.description());
    }
    Ok(())
}

fn cmd_list_ports() -> Result<()> {
    let ports = NativePortEnumerator::list_port_names().context("failed to enumerate ports")?;
    if ports.is_empty() {
        eprintln!("No serial ports found");
        return Ok(());
    }
    for port in ports {
        println!("{port}");
    }
    Ok(())
}

fn cmd_settings(cli: &Cli, action: &SettingsAction) -> Result<()> {
    let path = settings_path(cli);
    let mut settings = LinkSettings::load(&path)
        .with_context(|| format!("failed to load settings from {}", path.display()))?;

    match action {
        SettingsAction::Show => {
            println!("Settings file: {}", path.display());
            println!("Port:          {}", settings.port_name);
            println!("Baud:          {}", settings.baud);
            println!(
                "Framing:       {} data, {} stop, parity {}, flow {}",
                settings.data_bits, settings.stop_bits, settings.parity, settings.flow_control
            );
            if settings.port_baud_map.is_empty() {
                println!("Port baud map: (empty)");
            } else {
                println!("Port baud map:");
                for (port, baud) in &settings.port_baud_map {
                    println!("  {port}: {baud}");
                }
            }
        },
        SettingsAction::SetBaud { port, baud } => {
            if BaudRate::from_raw(*baud).is_none() {
                bail!("unsupported baud rate {baud}");
            }
            settings.remember_baud(port, *baud);
            settings
                .save(&path)
                .with_context(|| format!("failed to save settings to {}", path.display()))?;
            println!("Remembered {baud} baud for {port}");
        },
    }
    Ok(())
}
