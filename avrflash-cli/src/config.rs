//! Configuration file support for avrflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (AVRFLASH_*)
//! 3. Local config file (./avrflash.toml)
//! 4. Global config file (~/.config/avrflash/config.toml)
//!
//! USB devices remembered from interactive selection live in a separate
//! ports file (./avrflash_ports.toml or ~/.config/avrflash/ports.toml).

use directories::ProjectDirs;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const LOCAL_CONFIG: &str = "avrflash.toml";
const LOCAL_PORTS: &str = "avrflash_ports.toml";

/// USB device identification for port matching.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsbDevice {
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
}

impl UsbDevice {
    /// Check if this device matches the given USB info.
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vid == vid && self.pid == pid
    }
}

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyACM0" or "COM3").
    pub serial: Option<String>,
    /// Operating baud rate.
    pub baud: Option<u32>,
    /// Baud rate of the reset touch, 0 disables the touch.
    pub reset_baud: Option<u32>,
}

/// Port-specific configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfig {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Known USB devices for auto-detection.
    #[serde(default)]
    pub usb_device: Vec<UsbDevice>,
}

/// Programming configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgramConfig {
    /// Default target chip.
    pub chip: Option<String>,
    /// Reset/identify cycles before giving up.
    pub handshake_attempts: Option<usize>,
    /// Skip read-back verification after writing.
    #[serde(default)]
    pub skip_verify: bool,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Port configuration.
    #[serde(default)]
    pub port: PortConfig,
    /// Programming configuration.
    #[serde(default)]
    pub program: ProgramConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        // Remembered devices extend whatever the config files listed
        if let Some(ports) = Self::load_ports_config() {
            config
                .port
                .usb_device
                .extend(ports.usb_device);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Load remembered devices, local file first.
    fn load_ports_config() -> Option<PortConfig> {
        let candidates = std::iter::once(PathBuf::from(LOCAL_PORTS))
            .chain(Self::global_config_dir().map(|dir| dir.join("ports.toml")));

        for path in candidates {
            if !path.exists() {
                continue;
            }
            match fs::read_to_string(&path)
                .ok()
                .and_then(|content| toml::from_str(&content).ok())
            {
                Some(ports) => {
                    debug!("Loaded ports config from {}", path.display());
                    return Some(ports);
                },
                None => warn!("Ignoring unreadable ports file {}", path.display()),
            }
        }

        None
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "avrflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        // Port config
        if other.port.connection.serial.is_some() {
            self.port.connection.serial = other.port.connection.serial;
        }
        if other.port.connection.baud.is_some() {
            self.port.connection.baud = other.port.connection.baud;
        }
        if other.port.connection.reset_baud.is_some() {
            self.port.connection.reset_baud = other.port.connection.reset_baud;
        }
        self.port.usb_device.extend(other.port.usb_device);

        // Program config
        if other.program.chip.is_some() {
            self.program.chip = other.program.chip;
        }
        if other.program.handshake_attempts.is_some() {
            self.program.handshake_attempts = other.program.handshake_attempts;
        }
        if other.program.skip_verify {
            self.program.skip_verify = true;
        }
    }

    /// Reset touch baud rate, `None` when disabled.
    pub fn reset_baud(&self) -> Option<u32> {
        match self.port.connection.reset_baud {
            Some(0) => None,
            Some(baud) => Some(baud),
            None => Some(avrflash::port::RESET_BAUD),
        }
    }

    /// Save USB device for future auto-detection.
    pub fn remember_usb_device(&mut self, vid: u16, pid: u16) -> anyhow::Result<()> {
        let device = UsbDevice { vid, pid };

        // Don't add duplicates
        if self.port.usb_device.contains(&device) {
            return Ok(());
        }

        // Try to save next to a local config first, fall back to global
        let path = if Path::new(LOCAL_PORTS).exists() || Path::new(LOCAL_CONFIG).exists() {
            PathBuf::from(LOCAL_PORTS)
        } else if let Some(global_dir) = Self::global_config_dir() {
            fs::create_dir_all(&global_dir)?;
            global_dir.join("ports.toml")
        } else {
            PathBuf::from(LOCAL_PORTS)
        };

        self.port.usb_device.push(device.clone());

        let ports = PortConfig {
            connection: ConnectionConfig::default(),
            usb_device: self.port.usb_device.clone(),
        };
        let content = toml::to_string_pretty(&ports)?;
        fs::write(&path, content)?;
        info!("Saved USB device {:04X}:{:04X} to {}", device.vid, device.pid, path.display());

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    // ---- Default values ----

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.port.connection.serial.is_none());
        assert!(config.port.connection.baud.is_none());
        assert!(config.port.usb_device.is_empty());
        assert!(config.program.chip.is_none());
        assert!(config.program.handshake_attempts.is_none());
        assert!(!config.program.skip_verify);
    }

    #[test]
    fn test_reset_baud_defaults_and_disable() {
        let mut config = Config::default();
        assert_eq!(config.reset_baud(), Some(1200));

        config.port.connection.reset_baud = Some(0);
        assert_eq!(config.reset_baud(), None);

        config.port.connection.reset_baud = Some(2400);
        assert_eq!(config.reset_baud(), Some(2400));
    }

    // ---- UsbDevice ----

    #[test]
    fn test_usb_device_matches() {
        let device = UsbDevice {
            vid: 0x2341,
            pid: 0x0036,
        };
        assert!(device.matches(0x2341, 0x0036));
        assert!(!device.matches(0x2341, 0x8036));
        assert!(!device.matches(0x1B4F, 0x0036));
    }

    // ---- Config merge ----

    #[test]
    fn test_config_merge_overrides() {
        let mut base = Config::default();
        base.port.connection.baud = Some(57600);

        let mut other = Config::default();
        other.port.connection.serial = Some("/dev/ttyACM0".to_string());
        other.port.connection.baud = Some(115200);
        other.program.chip = Some("atmega32u4".to_string());
        other.program.handshake_attempts = Some(3);

        base.merge(other);

        assert_eq!(base.port.connection.serial.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(base.port.connection.baud, Some(115200));
        assert_eq!(base.program.chip.as_deref(), Some("atmega32u4"));
        assert_eq!(base.program.handshake_attempts, Some(3));
    }

    #[test]
    fn test_config_merge_does_not_overwrite_with_none() {
        let mut base = Config::default();
        base.port.connection.serial = Some("/dev/ttyACM0".to_string());
        base.port.connection.reset_baud = Some(0);
        base.program.handshake_attempts = Some(4);

        base.merge(Config::default());

        assert_eq!(base.port.connection.serial.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(base.port.connection.reset_baud, Some(0));
        assert_eq!(base.program.handshake_attempts, Some(4));
    }

    #[test]
    fn test_config_merge_usb_devices_extend() {
        let mut base = Config::default();
        base.port.usb_device.push(UsbDevice { vid: 0x2341, pid: 0x0036 });

        let mut other = Config::default();
        other.port.usb_device.push(UsbDevice { vid: 0x1B4F, pid: 0x9205 });
        other.program.skip_verify = true;

        base.merge(other);
        assert_eq!(base.port.usb_device.len(), 2);
        assert!(base.program.skip_verify);
    }

    // ---- TOML ----

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
[port.connection]
serial = "/dev/ttyACM0"
baud = 115200
reset_baud = 1200

[[port.usb_device]]
vid = 9025
pid = 54

[program]
chip = "atmega32u4"
handshake_attempts = 5
skip_verify = true
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.port.connection.serial.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(config.port.connection.baud, Some(115200));
        assert_eq!(config.port.connection.reset_baud, Some(1200));
        assert_eq!(config.port.usb_device, [UsbDevice { vid: 0x2341, pid: 0x0036 }]);
        assert_eq!(config.program.chip.as_deref(), Some("atmega32u4"));
        assert_eq!(config.program.handshake_attempts, Some(5));
        assert!(config.program.skip_verify);
    }

    #[test]
    fn test_config_from_partial_toml() {
        let config: Config = toml::from_str("[program]\nchip = \"atmega328p\"\n").unwrap();
        assert!(config.port.connection.serial.is_none());
        assert_eq!(config.program.chip.as_deref(), Some("atmega328p"));
        assert!(!config.program.skip_verify);
    }

    #[test]
    fn test_config_from_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.port.usb_device.is_empty());
        assert!(config.program.chip.is_none());
    }

    // ---- load_from_path ----

    #[test]
    fn test_load_from_path_valid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[port.connection]\nserial = \"COM7\"\n[program]\nhandshake_attempts = 2\n",
        )
        .unwrap();

        let config = Config::load_from_path(&path);
        assert_eq!(config.port.connection.serial.as_deref(), Some("COM7"));
        assert_eq!(config.program.handshake_attempts, Some(2));
    }

    #[test]
    fn test_load_from_path_invalid_falls_back_to_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "invalid toml [[[").unwrap();

        let config = Config::load_from_path(&path);
        assert!(config.port.connection.serial.is_none());
    }

    #[test]
    fn test_load_from_path_nonexistent() {
        let config = Config::load_from_path(Path::new("/nonexistent/path/config.toml"));
        assert!(config.port.connection.serial.is_none());
    }

    #[test]
    fn test_global_config_path() {
        if let Some(p) = Config::global_config_path() {
            let p = p.to_string_lossy();
            assert!(p.contains("avrflash"));
            assert!(p.ends_with("config.toml"));
        }
    }
}
