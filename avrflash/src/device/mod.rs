//! Serial endpoint discovery and classification.
//!
//! Boards with a native USB AVR (ATmega32U4) enumerate as CDC ACM devices
//! and change their product id when they reboot into the bootloader. Boards
//! with a separate USB-UART bridge keep the bridge's ids.

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::port::{PortEnumerator, PortInfo};

#[cfg(feature = "native")]
use {crate::port::NativePortEnumerator, log::info};

/// Known USB device kinds seen on AVR109 capable boards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// Arduino Caterina bootloader or sketch (Leonardo, Micro).
    Caterina,
    /// Adafruit 32U4 board.
    Adafruit,
    /// SparkFun 32U4 board (Pro Micro).
    SparkFun,
    /// CH340/CH341 USB-to-Serial converter.
    Ch340,
    /// Silicon Labs CP210x USB-to-Serial converter.
    Cp210x,
    /// FTDI FT232 USB-to-Serial converter.
    Ftdi,
    /// Unknown device.
    Unknown,
}

/// Known USB VID/PID pairs. An empty PID list matches any product.
const KNOWN_USB_DEVICES: &[(u16, &[u16], DeviceKind)] = &[
    (0x2341, &[0x0036, 0x0037, 0x8036, 0x8037], DeviceKind::Caterina),
    (0x239A, &[], DeviceKind::Adafruit),
    (0x1B4F, &[], DeviceKind::SparkFun),
    (0x1A86, &[0x7523, 0x5523], DeviceKind::Ch340),
    (0x10C4, &[0xEA60], DeviceKind::Cp210x),
    (0x0403, &[0x6001, 0x6015], DeviceKind::Ftdi),
];

impl DeviceKind {
    /// Classify a VID/PID combination.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        for (known_vid, pids, device) in KNOWN_USB_DEVICES {
            if vid == *known_vid && (pids.is_empty() || pids.contains(&pid)) {
                return *device;
            }
        }
        Self::Unknown
    }

    /// Get a human-readable name for the device kind.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Caterina => "Arduino Caterina",
            Self::Adafruit => "Adafruit 32U4",
            Self::SparkFun => "SparkFun 32U4",
            Self::Ch340 => "CH340/CH341",
            Self::Cp210x => "CP210x",
            Self::Ftdi => "FTDI",
            Self::Unknown => "Unknown",
        }
    }

    /// Check if this is a known/expected device kind.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Check if the device is a native USB AVR that hosts the bootloader itself.
    pub fn is_bootloader(&self) -> bool {
        matches!(self, Self::Caterina | Self::Adafruit | Self::SparkFun)
    }
}

/// Discovered serial endpoint information.
#[derive(Debug, Clone)]
pub struct DetectedPort {
    /// Endpoint name/path (e.g., "/dev/ttyACM0" or "COM3").
    pub name: String,
    /// Classified device kind.
    pub device: DeviceKind,
    /// USB Vendor ID (if available).
    pub vid: Option<u16>,
    /// USB Product ID (if available).
    pub pid: Option<u16>,
    /// Device manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Device product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial: Option<String>,
}

impl DetectedPort {
    /// Check if this endpoint matches a VID/PID pair.
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vid == Some(vid) && self.pid == Some(pid)
    }

    /// Check if this endpoint is likely an AVR109 target.
    pub fn is_likely_avr(&self) -> bool {
        self.device.is_known()
    }
}

impl From<PortInfo> for DetectedPort {
    fn from(info: PortInfo) -> Self {
        let device = match (info.vid, info.pid) {
            (Some(vid), Some(pid)) => DeviceKind::from_vid_pid(vid, pid),
            _ => DeviceKind::Unknown,
        };
        Self {
            name: info.name,
            device,
            vid: info.vid,
            pid: info.pid,
            manufacturer: info.manufacturer,
            product: info.product,
            serial: info.serial_number,
        }
    }
}

/// Detect the endpoints listed by enumerator `E`.
///
/// Enumeration failures are logged and yield an empty list.
pub fn detect_ports_with<E: PortEnumerator>() -> Vec<DetectedPort> {
    match E::list_ports() {
        Ok(ports) => ports
            .into_iter()
            .map(DetectedPort::from)
            .inspect(|p| {
                if let (Some(vid), Some(pid)) = (p.vid, p.pid) {
                    trace!(
                        "Found USB port: {} (VID: {vid:04X}, PID: {pid:04X}, Device: {:?})",
                        p.name, p.device
                    );
                }
            })
            .collect(),
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
            Vec::new()
        },
    }
}

/// Detect all available endpoints with metadata.
#[cfg(feature = "native")]
pub fn detect_ports() -> Vec<DetectedPort> {
    detect_ports_with::<NativePortEnumerator>()
}

/// Detect all available endpoints (no serial backend compiled in).
#[cfg(not(feature = "native"))]
pub fn detect_ports() -> Vec<DetectedPort> {
    Vec::new()
}

/// Detect endpoints that are likely AVR109 targets.
pub fn detect_avr_ports() -> Vec<DetectedPort> {
    detect_ports()
        .into_iter()
        .filter(DetectedPort::is_likely_avr)
        .collect()
}

/// Pick the most likely endpoint: bootloader ids first, then bridges.
pub fn select_port(ports: &[DetectedPort]) -> Option<&DetectedPort> {
    ports
        .iter()
        .find(|p| p.device.is_bootloader())
        .or_else(|| ports.iter().find(|p| p.device.is_known()))
}

/// Auto-detect a single AVR109 endpoint.
#[cfg(feature = "native")]
pub fn auto_detect_port() -> Result<DetectedPort> {
    let ports = detect_ports();

    match select_port(&ports) {
        Some(port) => {
            info!("Auto-detected {} device: {}", port.device.name(), port.name);
            Ok(port.clone())
        },
        None => Err(Error::DeviceNotFound),
    }
}

/// Auto-detect a single AVR109 endpoint (no serial backend compiled in).
#[cfg(not(feature = "native"))]
pub fn auto_detect_port() -> Result<DetectedPort> {
    Err(Error::DeviceNotFound)
}

/// Format a list of detected endpoints for display.
pub fn format_port_list(ports: &[DetectedPort]) -> Vec<String> {
    let mut result = Vec::new();

    for port in ports {
        let device_info = if port.device.is_known() {
            format!(" [{}]", port.device.name())
        } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" [VID:{vid:04X} PID:{pid:04X}]")
        } else {
            String::new()
        };

        let product_info = port
            .product
            .as_ref()
            .map(|p| format!(" - {p}"))
            .unwrap_or_default();

        result.push(format!("{}{}{}", port.name, device_info, product_info));
    }

    result
}
