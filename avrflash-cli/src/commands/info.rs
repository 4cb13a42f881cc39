//! Device info and port listing command implementations.

use {
    anyhow::Result,
    avrflash::{DetectedPort, DeviceInfo, device::{auto_detect_port, detect_ports}},
    console::style,
};

use crate::config::Config;
use crate::serial::is_known_device;
use crate::Cli;

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn info_json(info: &DeviceInfo) -> serde_json::Value {
    serde_json::json!({
        "ok": true,
        "data": {
            "chip": info.target.to_string(),
            "signature": hex(&info.signature),
            "software_version": info.software_version.to_string(),
            "programmer_type": info.programmer_type.map(|t| t.to_string()),
            "device_codes": info.device_codes,
            "block_size": info.block_size,
            "auto_increment": info.auto_increment,
            "flash_size": info.target.flash_size(),
            "eeprom_size": info.target.eeprom_size(),
        }
    })
}

fn port_json(port: &DetectedPort, config: &Config) -> serde_json::Value {
    serde_json::json!({
        "name": port.name,
        "device": port.device.name(),
        "known": is_known_device(port, config),
        "bootloader": port.device.is_bootloader(),
        "vid": port.vid,
        "pid": port.pid,
        "manufacturer": port.manufacturer,
        "product": port.product,
        "serial": port.serial,
    })
}

/// Info command implementation.
pub(crate) fn cmd_info(cli: &Cli, config: &mut Config, json: bool) -> Result<()> {
    let mut programmer = super::connect(cli, config)?;
    let info = programmer.device_info()?;
    programmer.finish()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&info_json(&info))?);
        return Ok(());
    }

    let yes_no = |b: bool| if b { "yes" } else { "no" };

    eprintln!("\n{}", style("Device Information").bold().underlined());
    eprintln!("  Chip:             {}", info.target);
    eprintln!("  Signature:        {}", hex(&info.signature));
    eprintln!("  Flash:            {} bytes", info.target.flash_size());
    eprintln!("  EEPROM:           {} bytes", info.target.eeprom_size());
    eprintln!("  Bootloader:       version {}", info.software_version);
    eprintln!(
        "  Programmer type:  {}",
        info.programmer_type
            .map_or_else(|| "unknown".to_string(), |t| t.to_string())
    );
    eprintln!("  Block size:       {} bytes", info.block_size);
    eprintln!("  Auto-increment:   {}", yes_no(info.auto_increment));
    if info.device_codes.is_empty() {
        eprintln!("  Device codes:     {}", style("none").dim());
    } else {
        eprintln!("  Device codes:     {}", hex(&info.device_codes));
    }

    Ok(())
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports(config: &Config, json: bool) -> Result<()> {
    let detected = detect_ports();

    if json {
        let ports: Vec<serde_json::Value> = detected
            .iter()
            .map(|p| port_json(p, config))
            .collect();
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "ports": ports,
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!("{}", style("Available serial ports").bold().underlined());

    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    for port in &detected {
        let device_type = if port.device.is_known() {
            format!(" [{}]", style(port.device.name()).yellow())
        } else {
            String::new()
        };

        let vid_pid = if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" ({vid:04X}:{pid:04X})")
        } else {
            String::new()
        };

        let product = port
            .product
            .as_deref()
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();

        eprintln!(
            "  {} {}{}{}{}",
            style("•").green(),
            style(&port.name).cyan(),
            device_type,
            vid_pid,
            product
        );
    }

    // Show auto-detection result
    if let Ok(auto_port) = auto_detect_port() {
        eprintln!(
            "\n{} Auto-detected: {}",
            style("→").green().bold(),
            style(&auto_port.name).cyan().bold()
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use avrflash::{DeviceKind, ProgrammerType, SoftwareVersion, TargetDevice};

    #[test]
    fn test_hex_formatting() {
        assert_eq!(hex(&[0x1E, 0x95, 0x87]), "1E 95 87");
        assert_eq!(hex(&[]), "");
    }

    #[test]
    fn test_info_json_shape() {
        let info = DeviceInfo {
            target: TargetDevice::Atmega32u4,
            signature: [0x1E, 0x95, 0x87],
            software_version: SoftwareVersion::Known { major: 1, minor: 0 },
            programmer_type: Some(ProgrammerType::Serial),
            device_codes: vec![0x44],
            block_size: 128,
            auto_increment: true,
        };
        let value = info_json(&info);
        assert_eq!(value["ok"], true);
        let data = &value["data"];
        assert_eq!(data["chip"], "ATmega32U4");
        assert_eq!(data["signature"], "1E 95 87");
        assert_eq!(data["software_version"], "1.0");
        assert_eq!(data["programmer_type"], "serial");
        assert_eq!(data["device_codes"], serde_json::json!([0x44]));
        assert_eq!(data["block_size"], 128);
        assert_eq!(data["auto_increment"], true);
        assert_eq!(data["flash_size"], 32768);
    }

    #[test]
    fn test_info_json_unknown_fields() {
        let info = DeviceInfo {
            target: TargetDevice::Atmega328p,
            signature: [0x1E, 0x95, 0x0F],
            software_version: SoftwareVersion::Unknown,
            programmer_type: None,
            device_codes: Vec::new(),
            block_size: 128,
            auto_increment: false,
        };
        let data = &info_json(&info)["data"];
        assert_eq!(data["software_version"], "unknown");
        assert!(data["programmer_type"].is_null());
        assert_eq!(data["device_codes"], serde_json::json!([]));
    }

    #[test]
    fn test_port_json_uses_config_devices() {
        let port = DetectedPort {
            name: "/dev/ttyUSB3".into(),
            device: DeviceKind::Unknown,
            vid: Some(0xABCD),
            pid: Some(0x0001),
            manufacturer: None,
            product: Some("Custom".into()),
            serial: None,
        };
        let mut config = Config::default();
        assert_eq!(port_json(&port, &config)["known"], false);

        config.port.usb_device.push(crate::config::UsbDevice {
            vid: 0xABCD,
            pid: 0x0001,
        });
        let value = port_json(&port, &config);
        assert_eq!(value["known"], true);
        assert_eq!(value["bootloader"], false);
        assert_eq!(value["vid"], 0xABCD);
        assert_eq!(value["product"], "Custom");
    }
}
