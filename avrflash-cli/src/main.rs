//! avrflash CLI - Command-line tool for AVR109 (Butterfly) bootloaders.
//!
//! ## Features
//!
//! - Write, read and verify raw binary images in flash and EEPROM
//! - Erase the application flash
//! - Query bootloader and device information
//! - Interactive serial port selection
//! - Shell completion generation
//! - Environment variable support

use anyhow::Result;
use avrflash::{MemoryType, TargetDevice};
use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;
mod serial;

use config::Config;
use serial::{SerialOptions, ask_remember_port, select_serial_port};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether Ctrl-C was pressed.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Default number of handshake attempts.
const DEFAULT_ATTEMPTS: usize = avrflash::DEFAULT_HANDSHAKE_ATTEMPTS;

/// avrflash - program AVR microcontrollers through an AVR109 bootloader.
///
/// Environment variables:
///   AVRFLASH_PORT              - Default serial port
///   AVRFLASH_BAUD              - Default baud rate (default: 115200)
///   AVRFLASH_CHIP              - Default target chip (atmega32u4, atmega328p)
///   AVRFLASH_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "avrflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "Examples:\n  avrflash -p /dev/ttyACM0 write sketch.bin\n  avrflash read --memory eeprom eeprom.bin\n  avrflash info --json")]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "AVRFLASH_PORT")]
    pub port: Option<String>,

    /// Operating baud rate of the bootloader [default: 115200].
    #[arg(short, long, global = true, env = "AVRFLASH_BAUD")]
    pub baud: Option<u32>,

    /// Target chip [default: atmega32u4].
    #[arg(short, long, global = true, env = "AVRFLASH_CHIP")]
    pub chip: Option<Chip>,

    /// Reset/identify cycles before giving up [default: 10].
    #[arg(long, global = true, value_name = "N")]
    pub attempts: Option<usize>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "AVRFLASH_NON_INTERACTIVE")]
    pub non_interactive: bool,

    /// Confirm port selection even for auto-detected ports.
    #[arg(long, global = true)]
    pub confirm_port: bool,

    /// List all available ports (including unknown types).
    #[arg(long, global = true)]
    pub list_all_ports: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    pub config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Supported target chips.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum Chip {
    /// ATmega32U4 (Leonardo, Micro, Pro Micro).
    Atmega32u4,
    /// ATmega328P.
    Atmega328p,
}

impl From<Chip> for TargetDevice {
    fn from(chip: Chip) -> Self {
        match chip {
            Chip::Atmega32u4 => TargetDevice::Atmega32u4,
            Chip::Atmega328p => TargetDevice::Atmega328p,
        }
    }
}

/// Memory selectable on the command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum Memory {
    /// Program flash.
    Flash,
    /// Data EEPROM.
    Eeprom,
}

impl From<Memory> for MemoryType {
    fn from(memory: Memory) -> Self {
        match memory {
            Memory::Flash => MemoryType::Flash,
            Memory::Eeprom => MemoryType::Eeprom,
        }
    }
}

/// Available commands.
#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Show bootloader and device information.
    Info {
        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Erase the application flash.
    Erase,

    /// Write a raw binary image.
    Write {
        /// Binary image to write.
        file: PathBuf,

        /// Memory to write.
        #[arg(short, long, value_enum, default_value = "flash")]
        memory: Memory,

        /// Start byte address (hex with 0x prefix, or decimal).
        #[arg(short, long, value_parser = parse_address, default_value = "0")]
        address: u32,

        /// Erase the application flash before writing.
        #[arg(long)]
        erase: bool,

        /// Skip read-back verification.
        #[arg(long)]
        skip_verify: bool,
    },

    /// Read memory into a raw binary file.
    Read {
        /// Output file.
        output: PathBuf,

        /// Memory to read.
        #[arg(short, long, value_enum, default_value = "flash")]
        memory: Memory,

        /// Start byte address (hex with 0x prefix, or decimal).
        #[arg(short, long, value_parser = parse_address, default_value = "0")]
        address: u32,

        /// Number of bytes to read (default: up to the end of the memory).
        #[arg(short, long, value_parser = parse_address)]
        length: Option<u32>,
    },

    /// Compare a raw binary image against device memory.
    Verify {
        /// Binary image to compare.
        file: PathBuf,

        /// Memory to compare.
        #[arg(short, long, value_enum, default_value = "flash")]
        memory: Memory,

        /// Start byte address (hex with 0x prefix, or decimal).
        #[arg(short, long, value_parser = parse_address, default_value = "0")]
        address: u32,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions (auto-detected if not specified with --install).
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Automatically install completions to your shell configuration.
        #[arg(long)]
        install: bool,
    },
}

/// Parse an address or length: `0x` prefixed hex or decimal, underscores allowed.
fn parse_address(s: &str) -> Result<u32, String> {
    let s: String = s
        .trim()
        .chars()
        .filter(|c| *c != '_')
        .collect();
    let parsed = if let Some(hex) = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
    {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse::<u32>()
    };
    parsed.map_err(|e| format!("Invalid address '{s}': {e}"))
}

/// CLI failure classes that decide the process exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Invalid invocation or missing interactive terminal.
    #[error("{0}")]
    Usage(String),
    /// Invalid configuration value.
    #[error("{0}")]
    Config(String),
    /// Cancelled by the user.
    #[error("{0}")]
    Cancelled(String),
}

/// Map an error to the process exit code.
fn exit_code(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(cli_err) = cause.downcast_ref::<CliError>() {
            return match cli_err {
                CliError::Usage(_) => 2,
                CliError::Config(_) => 3,
                CliError::Cancelled(_) => 130,
            };
        }
        if let Some(lib_err) = cause.downcast_ref::<avrflash::Error>() {
            return match lib_err {
                avrflash::Error::Config(_) => 3,
                avrflash::Error::Interrupted => 130,
                e if e.is_device_not_found() => 4,
                _ => 1,
            };
        }
    }
    1
}

impl Cli {
    /// Target chip from flags, environment or config.
    pub(crate) fn target(&self, config: &Config) -> Result<TargetDevice> {
        if let Some(chip) = self.chip {
            return Ok(chip.into());
        }
        match &config.program.chip {
            Some(name) => TargetDevice::from_name(name).ok_or_else(|| {
                CliError::Config(format!("Unknown chip '{name}' in configuration")).into()
            }),
            None => Ok(TargetDevice::default()),
        }
    }

    /// Baud rate from flags, environment or config.
    pub(crate) fn baud(&self, config: &Config) -> u32 {
        self.baud
            .or(config.port.connection.baud)
            .unwrap_or(avrflash::port::DEFAULT_BAUD)
    }

    /// Handshake attempts from flags or config.
    pub(crate) fn attempts(&self, config: &Config) -> Result<usize> {
        let attempts = self
            .attempts
            .or(config.program.handshake_attempts)
            .unwrap_or(DEFAULT_ATTEMPTS);
        if attempts == 0 {
            return Err(CliError::Usage("--attempts must be at least 1".into()).into());
        }
        Ok(attempts)
    }
}

fn main() {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    // Help, version and usage errors are printed and exited by clap (0 / 2)
    let cli = Cli::try_parse().unwrap_or_else(|e| e.exit());

    // Setup logging based on verbosity
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

    debug!(
        "avrflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        debug!("Failed to install Ctrl-C handler: {e}");
    }
    avrflash::set_interrupt_checker(was_interrupted);

    if let Err(err) = run(&cli) {
        eprintln!("{} {err:#}", style("Error:").red().bold());
        std::process::exit(exit_code(&err));
    }
}

fn run(cli: &Cli) -> Result<()> {
    // Load configuration
    let mut config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Info { json } => commands::info::cmd_info(cli, &mut config, *json),
        Commands::Erase => commands::memory::cmd_erase(cli, &mut config),
        Commands::Write {
            file,
            memory,
            address,
            erase,
            skip_verify,
        } => {
            let options = commands::memory::WriteOptions {
                memory: (*memory).into(),
                address: *address,
                erase: *erase,
                verify: !(*skip_verify || config.program.skip_verify),
            };
            commands::memory::cmd_write(cli, &mut config, file, &options)
        },
        Commands::Read {
            output,
            memory,
            address,
            length,
        } => commands::memory::cmd_read(cli, &mut config, output, (*memory).into(), *address, *length),
        Commands::Verify {
            file,
            memory,
            address,
        } => commands::memory::cmd_verify(cli, &mut config, file, (*memory).into(), *address),
        Commands::ListPorts { json } => commands::info::cmd_list_ports(&config, *json),
        Commands::Completions { shell, install } => {
            if *install {
                commands::completions::cmd_completions_install(*shell)
            } else if let Some(shell) = shell {
                commands::completions::cmd_completions(*shell);
                Ok(())
            } else {
                Err(CliError::Usage(
                    "specify a shell type, e.g.: avrflash completions bash \
                     (or use --install to auto-install completions)"
                        .into(),
                )
                .into())
            }
        },
    }
}

/// Get serial port from CLI args, config or interactive selection.
pub(crate) fn get_port(cli: &Cli, config: &mut Config) -> Result<String> {
    let options = SerialOptions {
        port: cli.port.clone(),
        list_all_ports: cli.list_all_ports,
        non_interactive: cli.non_interactive,
        confirm_port: cli.confirm_port,
    };

    let selected = select_serial_port(&options, config)?;

    // Ask to remember if not a known device and interactive mode
    if !selected.is_known && !cli.non_interactive && options.port.is_none() {
        ask_remember_port(&selected.port, config)?;
    }

    Ok(selected.port.name)
}
