//! Erase, write, read and verify command implementations.

use anyhow::{Context, Result};
use avrflash::{MemoryType, NativePort, Programmer};
use console::style;
use std::path::Path;

use super::{connect, ensure_not_interrupted, percent, progress_bar};
use crate::Cli;
use crate::config::Config;

/// Options for a write.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WriteOptions {
    /// Memory to write.
    pub memory: MemoryType,
    /// Start byte address.
    pub address: u32,
    /// Erase flash before writing.
    pub erase: bool,
    /// Read back and compare after writing.
    pub verify: bool,
}

fn read_image(file: &Path) -> Result<Vec<u8>> {
    std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))
}

/// Run `op` on a connected programmer, then leave the bootloader.
///
/// The bootloader is left even when `op` fails; a failure to leave is then
/// only logged.
fn with_programmer<T>(
    cli: &Cli,
    config: &mut Config,
    op: impl FnOnce(&mut Programmer<NativePort>) -> Result<T>,
) -> Result<T> {
    let mut programmer = connect(cli, config)?;
    let result = op(&mut programmer);

    if !cli.quiet && result.is_ok() {
        eprintln!("{} Starting application...", style("🔄").cyan());
    }
    let finished = programmer.finish();
    match (result, finished) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e).context("Failed to leave the bootloader"),
        (Err(e), Err(exit)) => {
            log::debug!("Leaving the bootloader after failure: {exit}");
            Err(e)
        },
        (Err(e), Ok(())) => Err(e),
    }
}

/// Erase command implementation.
pub(crate) fn cmd_erase(cli: &Cli, config: &mut Config) -> Result<()> {
    with_programmer(cli, config, |programmer| {
        if !cli.quiet {
            eprintln!("{} Erasing flash...", style("🗑").red());
        }
        programmer.erase().context("Chip erase failed")?;
        ensure_not_interrupted()
    })?;

    if !cli.quiet {
        eprintln!("\n{} Erase completed", style("✓").green().bold());
    }
    Ok(())
}

/// Write command implementation.
pub(crate) fn cmd_write(
    cli: &Cli,
    config: &mut Config,
    file: &Path,
    options: &WriteOptions,
) -> Result<()> {
    let image = read_image(file)?;
    if !cli.quiet {
        eprintln!(
            "{} Loaded {} ({} bytes)",
            style("📦").cyan(),
            file.display(),
            image.len()
        );
    }

    with_programmer(cli, config, |programmer| {
        if options.erase {
            if !cli.quiet {
                eprintln!("{} Erasing flash...", style("🗑").red());
            }
            programmer.erase().context("Chip erase failed")?;
            ensure_not_interrupted()?;
        }

        let pb = progress_bar(cli, &format!("Writing {}", options.memory));
        programmer
            .write(options.memory, options.address, &image, &mut percent(&pb))
            .with_context(|| format!("Failed to write {}", file.display()))?;
        pb.finish_with_message("Write complete");
        ensure_not_interrupted()?;

        if options.verify {
            let pb = progress_bar(cli, &format!("Verifying {}", options.memory));
            programmer.verify(options.memory, options.address, &image, &mut percent(&pb))?;
            pb.finish_with_message("Verify complete");
            if !cli.quiet {
                eprintln!("{} Verified {} bytes", style("✓").green(), image.len());
            }
        }
        Ok(())
    })?;

    if !cli.quiet {
        eprintln!("\n{} Write completed", style("🎉").green().bold());
    }
    Ok(())
}

/// Number of bytes to read when no length is given.
fn default_length(cli: &Cli, config: &Config, memory: MemoryType, address: u32) -> Result<u32> {
    let size = cli.target(config)?.memory_size(memory);
    Ok(size.saturating_sub(address))
}

/// Read command implementation.
pub(crate) fn cmd_read(
    cli: &Cli,
    config: &mut Config,
    output: &Path,
    memory: MemoryType,
    address: u32,
    length: Option<u32>,
) -> Result<()> {
    let length = match length {
        Some(length) => length,
        None => default_length(cli, config, memory, address)?,
    };

    let data = with_programmer(cli, config, |programmer| {
        let pb = progress_bar(cli, &format!("Reading {memory}"));
        let data = programmer.read(memory, address, length as usize, &mut percent(&pb))?;
        pb.finish_with_message("Read complete");
        ensure_not_interrupted()?;
        Ok(data)
    })?;

    std::fs::write(output, &data)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    if !cli.quiet {
        eprintln!(
            "\n{} Saved {} bytes of {} to {}",
            style("✓").green().bold(),
            data.len(),
            memory,
            output.display()
        );
    }
    Ok(())
}

/// Verify command implementation.
pub(crate) fn cmd_verify(
    cli: &Cli,
    config: &mut Config,
    file: &Path,
    memory: MemoryType,
    address: u32,
) -> Result<()> {
    let image = read_image(file)?;

    with_programmer(cli, config, |programmer| {
        let pb = progress_bar(cli, &format!("Verifying {memory}"));
        programmer.verify(memory, address, &image, &mut percent(&pb))?;
        pb.finish_with_message("Verify complete");
        Ok(())
    })?;

    if !cli.quiet {
        eprintln!(
            "\n{} {} matches {} bytes of {}",
            style("✓").green().bold(),
            file.display(),
            image.len(),
            memory
        );
    }
    Ok(())
}
