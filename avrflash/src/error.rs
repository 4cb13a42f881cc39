//! Error types for avrflash.

use std::fmt;
use std::io;
use thiserror::Error;

use crate::session::SessionState;

/// Result type for avrflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for avrflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on the serial channel.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The bootloader identity was not confirmed within the attempt budget.
    #[error("Handshake failed after {attempts} attempts, last reply: {}", ObservedBytes(.observed))]
    HandshakeFailed {
        /// Number of reset/identify cycles performed.
        attempts: usize,
        /// Bytes received on the final attempt.
        observed: Vec<u8>,
    },

    /// A command was not acknowledged with a carriage return.
    #[error("Bootloader did not acknowledge {command} (got {})", ObservedByte(.observed))]
    CommandNotAcknowledged {
        /// Human-readable command label.
        command: String,
        /// Byte received instead of the acknowledgement, `None` on timeout.
        observed: Option<u8>,
    },

    /// Byte address that does not fit the 16-bit address field (flash
    /// addresses must also be even).
    #[error("Invalid address 0x{0:05X} for the 16-bit address field")]
    InvalidAddress(u32),

    /// Block length that is odd, empty or does not fit the 16-bit length field.
    #[error("Invalid block length {0}: must be even and between 2 and 65534")]
    InvalidBlockLength(usize),

    /// A read returned fewer bytes than requested.
    #[error("Incomplete transfer: expected {expected} bytes, received {actual}")]
    IncompleteTransfer {
        /// Number of bytes requested.
        expected: usize,
        /// Number of bytes received.
        actual: usize,
    },

    /// A block transfer was requested before any address was set.
    #[error("Cannot {0} before an address has been set")]
    AddressNotSet(&'static str),

    /// A memory-altering command was refused after an unacknowledged command.
    #[error("Refusing to {0}: a previous command was not acknowledged, reconnect first")]
    NeedsReconnect(&'static str),

    /// The operation is not allowed in the current session state.
    #[error("Cannot {operation} while session is {state}")]
    InvalidState {
        /// Operation that was refused.
        operation: &'static str,
        /// State the session was in.
        state: SessionState,
    },

    /// Device signature does not match the selected target.
    #[error("Device signature {} does not match {target} ({})", ObservedBytes(.actual), ObservedBytes(.expected))]
    SignatureMismatch {
        /// Name of the selected target.
        target: String,
        /// Signature expected for the target.
        expected: [u8; 3],
        /// Signature reported by the device.
        actual: [u8; 3],
    },

    /// Read-back data differs from the written image.
    #[error("Verify failed at 0x{address:05X}: expected 0x{expected:02X}, read 0x{actual:02X}")]
    VerifyMismatch {
        /// Byte address of the first differing byte.
        address: u32,
        /// Byte from the image.
        expected: u8,
        /// Byte read from the device.
        actual: u8,
    },

    /// Image does not fit into the target memory.
    #[error("Image of {len} bytes at 0x{start:05X} exceeds {memory} size of {size} bytes")]
    OutOfRange {
        /// Memory name.
        memory: &'static str,
        /// Start byte address.
        start: u32,
        /// Image length in bytes.
        len: usize,
        /// Memory size in bytes.
        size: u32,
    },

    /// No suitable serial port was found.
    #[error("Device not found or not in bootloader mode")]
    DeviceNotFound,

    /// The embedding application requested the operation to stop.
    #[error("Operation interrupted")]
    Interrupted,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this error is a fatal failure of the underlying channel.
    pub fn is_transport(&self) -> bool {
        match self {
            Self::Io(_) => true,
            #[cfg(feature = "native")]
            Self::Serial(_) => true,
            _ => false,
        }
    }

    /// Whether no device answered: missing port, no bootloader, or a
    /// failed handshake.
    pub fn is_device_not_found(&self) -> bool {
        match self {
            Self::DeviceNotFound | Self::HandshakeFailed { .. } => true,
            Self::Io(e) => e.kind() == io::ErrorKind::NotFound,
            #[cfg(feature = "native")]
            Self::Serial(e) => matches!(
                e.kind(),
                serialport::ErrorKind::NoDevice
                    | serialport::ErrorKind::Io(io::ErrorKind::NotFound)
            ),
            _ => false,
        }
    }
}

/// Formats received bytes as hex followed by their printable ASCII form.
struct ObservedBytes<'a>(&'a [u8]);

impl fmt::Display for ObservedBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "<nothing>");
        }
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{b:02X}")?;
        }
        if self.0.iter().all(u8::is_ascii_graphic) {
            write!(f, " \"{}\"", String::from_utf8_lossy(self.0))?;
        }
        Ok(())
    }
}

struct ObservedByte<'a>(&'a Option<u8>);

impl fmt::Display for ObservedByte<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self.0 {
            Some(b) => write!(f, "0x{b:02X}"),
            None => write!(f, "no reply"),
        }
    }
}
