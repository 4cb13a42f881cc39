//! Command implementations.
//!
//! Each subcommand is implemented in its own module for clean separation.

pub(crate) mod completions;
pub(crate) mod info;
pub(crate) mod memory;

use anyhow::{Context, Result};
use avrflash::{NativePort, Programmer, SerialConfig};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::config::Config;
use crate::{Cli, CliError, get_port, use_fancy_output, was_interrupted};

pub(crate) fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("Interrupted by user".into()).into())
    } else {
        Ok(())
    }
}

/// Select a port, open it and run the bootloader handshake.
pub(crate) fn connect(cli: &Cli, config: &mut Config) -> Result<Programmer<NativePort>> {
    let target = cli.target(config)?;
    let baud = cli.baud(config);
    let attempts = cli.attempts(config)?;

    let port = get_port(cli, config)?;
    if !cli.quiet {
        eprintln!(
            "{} Using port {} at {} baud",
            style("🔌").cyan(),
            style(&port).cyan(),
            baud
        );
    }

    let serial = SerialConfig::new(&port, baud).with_reset_baud(config.reset_baud());
    let mut programmer = Programmer::open_with_config(&serial, target)
        .with_context(|| format!("Failed to open serial port {port}"))?;
    ensure_not_interrupted()?;

    if !cli.quiet {
        eprintln!("{} Waiting for bootloader...", style("⏳").yellow());
    }
    programmer
        .connect(attempts)
        .with_context(|| format!("Failed to connect to {target} on {port}"))?;
    ensure_not_interrupted()?;

    if !cli.quiet {
        eprintln!(
            "{} Connected to {} (block size {} bytes)",
            style("✓").green(),
            target,
            programmer.block_size()
        );
    }

    Ok(programmer)
}

/// Progress bar on stderr, hidden in quiet mode or without a terminal.
pub(crate) fn progress_bar(cli: &Cli, message: &str) -> ProgressBar {
    if cli.quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(100);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb.set_message(message.to_string());
    pb
}

/// Progress callback that drives `pb` as a percentage.
pub(crate) fn percent(pb: &ProgressBar) -> impl FnMut(usize, usize) + '_ {
    move |done, total| {
        if total > 0 {
            pb.set_position((done * 100 / total) as u64);
        }
    }
}
