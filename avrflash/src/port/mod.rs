//! Port abstraction for the bootloader serial channel.
//!
//! The session never talks to an OS serial device directly. It drives a
//! [`Port`], which is a blocking duplex byte channel with a mutable read
//! timeout and one extra capability: rebooting the device into its
//! bootloader and reopening the channel.
//!
//! ```text
//! +---------------------+
//! | BootloaderSession   |  framing, acks, retries, state
//! +----------+----------+
//!            |
//!            v
//! +----------+----------+
//! |     Port trait      |  read / write / flush / timeout / reset
//! +----------+----------+
//!            |
//!            v
//! +----------+----------+
//! |     NativePort      |  serialport crate, 1200 baud touch
//! +---------------------+
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use avrflash::port::Port;
//!
//! fn example<P: Port>(port: &mut P) -> std::io::Result<()> {
//!     port.write_all(b"S")?;
//!     port.flush()?;
//!
//!     let mut buf = [0u8; 7];
//!     let n = port.read(&mut buf)?;
//!     println!("Received: {:?}", &buf[..n]);
//!
//!     Ok(())
//! }
//! ```

#[cfg(feature = "native")]
pub mod native;

#[cfg(test)]
pub(crate) mod mock;

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::Result;

/// Operating baud rate of AVR109 bootloaders.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Baud rate whose open/close makes CDC bootloaders reboot into bootloader mode.
pub const RESET_BAUD: u32 = 1200;

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyACM0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Default read/write timeout.
    pub timeout: Duration,
    /// Baud rate used for the reset touch, `None` to skip the touch.
    pub reset_baud: Option<u32>,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD,
            timeout: Duration::from_millis(1000),
            reset_baud: Some(RESET_BAUD),
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the reset touch baud rate (`None` disables the touch).
    #[must_use]
    pub fn with_reset_baud(mut self, reset_baud: Option<u32>) -> Self {
        self.reset_baud = reset_baud;
        self
    }
}

/// Serial port information.
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial_number: Option<String>,
}

/// Duplex byte channel used by the bootloader session.
///
/// A read that times out either returns `Ok(0)` or fails with
/// [`std::io::ErrorKind::TimedOut`]; callers treat both as "deadline elapsed".
/// Implementations perform no retries on reads or writes and no parsing.
pub trait Port: Read + Write + Send {
    /// Set the read/write timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the current timeout.
    fn timeout(&self) -> Duration;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Reboot the device into its bootloader and reopen the channel.
    ///
    /// The device needs a settle delay after this returns before it
    /// answers reliably; waiting is the caller's job.
    fn reset_to_bootloader(&mut self) -> Result<()>;
}

/// Trait for listing available serial ports.
///
/// This is separated from `Port` because it's a static operation that
/// doesn't require an open port instance.
pub trait PortEnumerator {
    /// List all available serial ports.
    fn list_ports() -> Result<Vec<PortInfo>>;
}

#[cfg(feature = "native")]
pub use native::{NativePort, NativePortEnumerator};
