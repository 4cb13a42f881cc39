//! Shell completion generation and installation.

use anyhow::{Context, Result};
use clap::CommandFactory;
use clap_complete::{Shell, generate};
use console::style;
use directories::BaseDirs;
use std::env;
use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

use crate::Cli;

const BIN_NAME: &str = "avrflash";

/// Render the completion script for `shell` into `out`.
fn render(shell: Shell, out: &mut dyn io::Write) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, BIN_NAME, out);
}

/// Generate shell completions to stdout.
pub(crate) fn cmd_completions(shell: Shell) {
    render(shell, &mut io::stdout());
}

/// Detect the user's current shell from environment.
pub(crate) fn detect_shell_type() -> Option<Shell> {
    if let Ok(shell_path) = env::var("SHELL") {
        return shell_from_path(&shell_path);
    }

    // PowerShell sets PSModulePath, cmd.exe has no completion support
    if cfg!(windows) && env::var("PSModulePath").is_ok() {
        return Some(Shell::PowerShell);
    }

    None
}

/// Map a shell binary path to its `Shell`.
fn shell_from_path(shell_path: &str) -> Option<Shell> {
    let shell_name = Path::new(shell_path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");
    match shell_name {
        "bash" => Some(Shell::Bash),
        "zsh" => Some(Shell::Zsh),
        "fish" => Some(Shell::Fish),
        "elvish" => Some(Shell::Elvish),
        "pwsh" | "powershell" => Some(Shell::PowerShell),
        _ => None,
    }
}

fn base_dirs() -> Result<BaseDirs> {
    BaseDirs::new().context("Could not determine home directory")
}

/// Where the completion script for `shell` is installed.
fn install_path(dirs: &BaseDirs, shell: Shell) -> Result<PathBuf> {
    let path = match shell {
        Shell::Bash => dirs
            .data_dir()
            .join("bash-completion")
            .join("completions")
            .join(BIN_NAME),
        Shell::Zsh => dirs.home_dir().join(".zfunc").join(format!("_{BIN_NAME}")),
        Shell::Fish => dirs
            .config_dir()
            .join("fish")
            .join("completions")
            .join(format!("{BIN_NAME}.fish")),
        Shell::Elvish => dirs
            .config_dir()
            .join("elvish")
            .join("lib")
            .join(format!("{BIN_NAME}.elv")),
        Shell::PowerShell => {
            let dir = env::var_os("PROFILE")
                .and_then(|profile| PathBuf::from(profile).parent().map(Path::to_path_buf))
                .unwrap_or_else(|| dirs.config_dir().join("powershell").join("completions"));
            dir.join(format!("{BIN_NAME}.ps1"))
        },
        _ => anyhow::bail!("Unsupported shell for auto-install"),
    };
    Ok(path)
}

/// Make sure `~/.zfunc` is on zsh's `fpath`.
fn ensure_zsh_fpath(dirs: &BaseDirs) -> Result<()> {
    let zshrc = dirs.home_dir().join(".zshrc");
    let fpath_line = "fpath=(~/.zfunc $fpath)";

    let present = fs::read_to_string(&zshrc)
        .map(|content| content.contains(fpath_line))
        .unwrap_or(false);
    if present {
        return Ok(());
    }

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&zshrc)
        .with_context(|| format!("Failed to update {}", zshrc.display()))?;
    writeln!(file, "\n# {BIN_NAME} completions")?;
    writeln!(file, "{fpath_line}")?;
    writeln!(file, "autoload -Uz compinit && compinit")?;
    eprintln!(
        "{} Added fpath to {}",
        style("✓").green().bold(),
        style(zshrc.display()).yellow()
    );
    Ok(())
}

/// Install shell completions automatically.
pub(crate) fn cmd_completions_install(shell_arg: Option<Shell>) -> Result<()> {
    let shell = match shell_arg {
        Some(s) => s,
        None => detect_shell_type().context(
            "Could not detect your shell. Please specify it explicitly:\n  \
             avrflash completions --install bash",
        )?,
    };

    let dirs = base_dirs()?;
    let path = install_path(&dirs, shell)?;

    let mut buf = Vec::new();
    render(shell, &mut buf);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(&path, &buf)
        .with_context(|| format!("Failed to write completion file: {}", path.display()))?;

    eprintln!(
        "{} Installed {} completions to {}",
        style("✓").green().bold(),
        style(shell).cyan(),
        style(path.display()).yellow()
    );

    eprintln!();
    match shell {
        Shell::Bash => {
            eprintln!("Completions will be loaded automatically on new terminals.");
            eprintln!(
                "To activate now: {}",
                style(format!("source {}", path.display())).cyan()
            );
        },
        Shell::Zsh => {
            ensure_zsh_fpath(&dirs)?;
            eprintln!("Restart your shell or run: {}", style("exec zsh").cyan());
        },
        Shell::PowerShell => {
            eprintln!("Add this to your PowerShell profile to load on startup:");
            eprintln!(
                "  {}",
                style(format!("Import-Module {}", path.display())).cyan()
            );
        },
        _ => eprintln!("Completions will be loaded automatically in new {shell} sessions."),
    }

    Ok(())
}
