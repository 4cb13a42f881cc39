//! Interactive serial port selection.
//!
//! Ports are chosen in this order:
//! - an explicit `--port` / `AVRFLASH_PORT`
//! - the `serial` entry of the configuration
//! - auto-detection of known AVR boards and USB-UART bridges
//! - an interactive prompt when several candidates remain

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    avrflash::{DetectedPort, DeviceKind, device::detect_ports},
    console::style,
    dialoguer::{Confirm, Error as DialoguerError, Select, theme::ColorfulTheme},
    log::{debug, error, info},
    std::{cmp::Ordering, io::IsTerminal},
};

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI.
    pub port: Option<String>,
    /// List all ports (including unknown types).
    pub list_all_ports: bool,
    /// Non-interactive mode (fail if multiple ports).
    pub non_interactive: bool,
    /// Force confirmation even for single recognized port.
    pub confirm_port: bool,
}

/// Result of port selection including whether it was a known device.
pub struct SelectedPort {
    /// The selected port info.
    pub port: DetectedPort,
    /// Whether this port matched a known/configured device.
    pub is_known: bool,
}

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

fn cancelled() -> anyhow::Error {
    CliError::Cancelled("Port selection cancelled".into()).into()
}

/// Known ports first, bootloader ids ahead of bridges.
fn rank(port: &DetectedPort, config: &Config) -> u8 {
    if port.device.is_bootloader() {
        0
    } else if is_known_device(port, config) {
        1
    } else {
        2
    }
}

fn select_non_interactive_port(
    mut selection_ports: Vec<DetectedPort>,
    config: &Config,
) -> Result<SelectedPort> {
    // Exactly one candidate, or exactly one bootloader among several
    let bootloaders = selection_ports
        .iter()
        .filter(|p| p.device.is_bootloader())
        .count();
    if selection_ports.len() > 1 && bootloaders == 1 {
        selection_ports.retain(|p| p.device.is_bootloader());
    }

    match selection_ports.len().cmp(&1) {
        Ordering::Equal => {
            let port = selection_ports.swap_remove(0);
            Ok(SelectedPort {
                is_known: is_known_device(&port, config),
                port,
            })
        },
        Ordering::Greater => Err(usage_err(
            "Multiple serial ports found; specify one with --port in non-interactive mode",
        )),
        Ordering::Less => Err(avrflash::Error::DeviceNotFound.into()),
    }
}

/// Select a serial port interactively or automatically.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<SelectedPort> {
    // If port explicitly specified, use it
    if let Some(port_name) = &options.port {
        return Ok(find_port_by_name(port_name, config));
    }

    // If port in config, use it
    if let Some(port_name) = &config.port.connection.serial {
        debug!("Using port from config: {port_name}");
        return Ok(find_port_by_name(port_name, config));
    }

    let ports = detect_ports();

    if ports.is_empty() {
        return Err(avrflash::Error::DeviceNotFound.into());
    }

    // Filter to known devices (built-in + config)
    let known_ports: Vec<DetectedPort> = ports
        .iter()
        .filter(|p| is_known_device(p, config))
        .cloned()
        .collect();

    // Select candidate set: known first unless user asks for all
    let selection_ports: Vec<DetectedPort> = if options.list_all_ports || known_ports.is_empty() {
        ports
    } else {
        known_ports
    };

    // Non-interactive mode must never prompt
    if options.non_interactive {
        return select_non_interactive_port(selection_ports, config);
    }

    match selection_ports.len().cmp(&1) {
        Ordering::Greater => {
            ensure_interactive_terminal()?;
            select_port_interactive(selection_ports, config)
        },
        Ordering::Equal => {
            let mut selection_ports = selection_ports;
            let port = selection_ports.swap_remove(0);
            let is_known = is_known_device(&port, config);

            if is_known && !options.confirm_port {
                info!("Auto-selected port: {} [{}]", port.name, port.device.name());
                Ok(SelectedPort { port, is_known })
            } else {
                ensure_interactive_terminal()?;
                confirm_single_port(port)
            }
        },
        Ordering::Less => Err(avrflash::Error::DeviceNotFound.into()),
    }
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "Port selection needs an interactive terminal; use --port or --non-interactive",
        ))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                cancelled()
            } else {
                usage_err(&format!("Prompt failed: {io_err}"))
            }
        },
    }
}

/// Find a port by name, falling back to a placeholder for unlisted paths.
fn find_port_by_name(name: &str, config: &Config) -> SelectedPort {
    let ports = detect_ports();

    let found = ports
        .iter()
        .find(|p| p.name == name)
        // Windows port names are case-insensitive
        .or_else(|| ports.iter().find(|p| p.name.eq_ignore_ascii_case(name)));

    match found {
        Some(port) => SelectedPort {
            is_known: is_known_device(port, config),
            port: port.clone(),
        },
        None => SelectedPort {
            port: DetectedPort {
                name: name.to_string(),
                device: DeviceKind::Unknown,
                vid: None,
                pid: None,
                manufacturer: None,
                product: None,
                serial: None,
            },
            is_known: false,
        },
    }
}

/// Check if a port matches a known device (from config or built-in list).
pub(crate) fn is_known_device(port: &DetectedPort, config: &Config) -> bool {
    if port.device.is_known() {
        return true;
    }

    match (port.vid, port.pid) {
        (Some(vid), Some(pid)) => config
            .port
            .usb_device
            .iter()
            .any(|device| device.matches(vid, pid)),
        _ => false,
    }
}

/// Display label for the selection prompt.
fn port_label(port: &DetectedPort, config: &Config) -> String {
    let name = if is_known_device(port, config) {
        style(&port.name).bold().to_string()
    } else {
        port.name.clone()
    };

    let device_info = if port.device.is_known() {
        format!(" [{}]", style(port.device.name()).yellow())
    } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
        format!(" ({vid:04X}:{pid:04X})")
    } else {
        String::new()
    };

    let product = port
        .product
        .as_ref()
        .map(|p| format!(" - {}", style(p).dim()))
        .unwrap_or_default();

    format!("{name}{device_info}{product}")
}

/// Interactive port selection.
fn select_port_interactive(mut ports: Vec<DetectedPort>, config: &Config) -> Result<SelectedPort> {
    eprintln!(
        "{} Found {} serial ports",
        style("ℹ").blue(),
        ports.len()
    );
    eprintln!(
        "{}",
        style("Known AVR boards are shown in bold. A Leonardo in its bootloader appears briefly after reset.").dim()
    );

    ports.sort_by_key(|p| rank(p, config));

    // Truncate labels to the terminal width so items never wrap
    let term_width = console::Term::stderr().size().1 as usize;
    let max_item_width = term_width.saturating_sub(4);
    let port_names: Vec<String> = ports
        .iter()
        .map(|port| {
            console::truncate_str(&port_label(port, config), max_item_width, "\u{2026}")
                .into_owned()
        })
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select a serial port")
        .items(&port_names)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) => {
            let port = ports
                .into_iter()
                .nth(index)
                .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}"))?;
            let is_known = is_known_device(&port, config);
            Ok(SelectedPort { port, is_known })
        },
        None => Err(cancelled()),
    }
}

/// Confirm use of a single port.
fn confirm_single_port(port: DetectedPort) -> Result<SelectedPort> {
    let product_info = port
        .product
        .as_ref()
        .map(|p| format!(" - {p}"))
        .unwrap_or_default();

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Use serial port {}{product_info}?", port.name))
        .default(true)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        let is_known = port.device.is_known();
        Ok(SelectedPort { port, is_known })
    } else {
        Err(cancelled())
    }
}

/// Ask user if they want to remember this port.
pub fn ask_remember_port(port: &DetectedPort, config: &mut Config) -> Result<()> {
    let (Some(vid), Some(pid)) = (port.vid, port.pid) else {
        return Ok(());
    };

    if config.port.usb_device.iter().any(|d| d.matches(vid, pid)) {
        return Ok(());
    }

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt("Remember this device for future auto-detection?")
        .default(false)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        if let Err(e) = config.remember_usb_device(vid, pid) {
            error!("Failed to save port configuration: {e}");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        console::{measure_text_width, truncate_str},
    };

    fn port(name: &str, vid: Option<u16>, pid: Option<u16>) -> DetectedPort {
        DetectedPort {
            name: name.to_string(),
            device: match (vid, pid) {
                (Some(v), Some(p)) => DeviceKind::from_vid_pid(v, p),
                _ => DeviceKind::Unknown,
            },
            vid,
            pid,
            manufacturer: None,
            product: None,
            serial: None,
        }
    }

    fn expect_usage(result: Result<SelectedPort>) {
        let err = result.err().expect("expected error");
        assert!(matches!(err.downcast_ref::<CliError>(), Some(CliError::Usage(_))));
    }

    // ---- SerialOptions ----

    #[test]
    fn test_serial_options_default() {
        let options = SerialOptions::default();
        assert!(options.port.is_none());
        assert!(!options.list_all_ports);
        assert!(!options.non_interactive);
        assert!(!options.confirm_port);
    }

    // ---- is_known_device ----

    #[test]
    fn test_is_known_device_builtin() {
        let config = Config::default();
        assert!(is_known_device(&port("/dev/ttyACM0", Some(0x2341), Some(0x0036)), &config));
        assert!(is_known_device(&port("/dev/ttyUSB0", Some(0x1A86), Some(0x7523)), &config));
    }

    #[test]
    fn test_is_known_device_unknown() {
        let config = Config::default();
        assert!(!is_known_device(&port("/dev/ttyUSB0", Some(0x9999), Some(0x9999)), &config));
        assert!(!is_known_device(&port("/dev/ttyS0", None, None), &config));
    }

    #[test]
    fn test_is_known_device_from_config() {
        let mut config = Config::default();
        config.port.usb_device.push(crate::config::UsbDevice {
            vid: 0xABCD,
            pid: 0x1234,
        });
        assert!(is_known_device(&port("/dev/ttyUSB0", Some(0xABCD), Some(0x1234)), &config));
    }

    #[test]
    fn test_rank_orders_bootloader_first() {
        let config = Config::default();
        let mut ports = vec![
            port("/dev/ttyS0", None, None),
            port("/dev/ttyUSB0", Some(0x1A86), Some(0x7523)),
            port("/dev/ttyACM0", Some(0x2341), Some(0x0036)),
        ];
        ports.sort_by_key(|p| rank(p, &config));
        let names: Vec<_> = ports.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["/dev/ttyACM0", "/dev/ttyUSB0", "/dev/ttyS0"]);
    }

    #[test]
    fn test_port_label_truncates_to_width() {
        console::set_colors_enabled(false);
        let mut p = port("/dev/verylongttyusb0", Some(0x1A86), Some(0x7523));
        p.product = Some("Very Long Product Name That Would Wrap".into());
        let label = port_label(&p, &Config::default());
        assert!(label.contains("[CH340/CH341]"));

        let truncated = truncate_str(&label, 26, "\u{2026}").into_owned();
        assert!(measure_text_width(&truncated) <= 26);
        assert!(truncated.starts_with("/dev/verylong"));
    }

    // ---- find_port_by_name ----

    #[test]
    fn test_find_port_by_name_placeholder() {
        let selected = find_port_by_name("/dev/does-not-exist-avrflash", &Config::default());
        assert_eq!(selected.port.name, "/dev/does-not-exist-avrflash");
        assert_eq!(selected.port.device, DeviceKind::Unknown);
        assert!(!selected.is_known);
    }

    // ---- non-interactive selection ----

    #[test]
    fn test_select_non_interactive_multiple_ports_returns_usage_error() {
        let ports = vec![port("/dev/ttyUSB0", None, None), port("/dev/ttyUSB1", None, None)];
        expect_usage(select_non_interactive_port(ports, &Config::default()));
    }

    #[test]
    fn test_select_non_interactive_no_ports_is_device_not_found() {
        let err = select_non_interactive_port(vec![], &Config::default())
            .err()
            .expect("expected error");
        let lib_err = err.downcast_ref::<avrflash::Error>().expect("library error");
        assert!(lib_err.is_device_not_found());
    }

    #[test]
    fn test_select_non_interactive_single_port() {
        let ports = vec![port("/dev/ttyUSB0", None, None)];
        let selected = select_non_interactive_port(ports, &Config::default()).unwrap();
        assert_eq!(selected.port.name, "/dev/ttyUSB0");
        assert!(!selected.is_known);
    }

    #[test]
    fn test_select_non_interactive_prefers_single_bootloader() {
        let ports = vec![
            port("/dev/ttyUSB0", Some(0x1A86), Some(0x7523)),
            port("/dev/ttyACM0", Some(0x2341), Some(0x0036)),
        ];
        let selected = select_non_interactive_port(ports, &Config::default()).unwrap();
        assert_eq!(selected.port.name, "/dev/ttyACM0");
        assert!(selected.is_known);
    }
}
