//! Whole-image programming over a bootloader session.
//!
//! [`Programmer`] splits raw binary images into blocks of the size the
//! bootloader reported and drives the session block by block. Every block
//! transfer is preceded by an explicit `set_memory_address`, so devices
//! without auto-increment work the same way. Flash is addressed in words and
//! EEPROM in bytes; callers always pass byte addresses.
//!
//! ## Example
//!
//! ```rust,no_run
//! use avrflash::{MemoryType, Programmer, TargetDevice};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut programmer = Programmer::open("/dev/ttyACM0", 115200, TargetDevice::Atmega32u4)?;
//!     programmer.connect(10)?;
//!
//!     let info = programmer.device_info()?;
//!     println!("bootloader {} on {}", info.software_version, info.target);
//!
//!     let eeprom = programmer.read(MemoryType::Eeprom, 0, 1024, &mut |_, _| {})?;
//!     std::fs::write("eeprom.bin", eeprom)?;
//!
//!     programmer.finish()?;
//!     Ok(())
//! }
//! ```

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::avr109::{MemoryType, ProgrammerType, SoftwareVersion};
use crate::session::{BootloaderSession, SessionState};
use crate::target::chip::TargetDevice;

/// Block size used when the bootloader reports no block buffer.
pub const FALLBACK_BLOCK_SIZE: usize = 128;

/// Value of unprogrammed memory, used to pad odd-length images.
const ERASED_BYTE: u8 = 0xFF;

/// Everything the bootloader reports about itself and the target.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DeviceInfo {
    /// Target profile the signature was checked against.
    pub target: TargetDevice,
    /// Device signature bytes.
    pub signature: [u8; 3],
    /// Bootloader software version.
    pub software_version: SoftwareVersion,
    /// Programmer type, `None` if it never answered.
    pub programmer_type: Option<ProgrammerType>,
    /// Supported device codes.
    pub device_codes: Vec<u8>,
    /// Block buffer size as reported, 0 without block support.
    pub block_size: u16,
    /// Whether the address auto-increments after block transfers.
    pub auto_increment: bool,
}

/// Programs a single target through an AVR109 bootloader.
pub struct Programmer<P: Port> {
    session: BootloaderSession<P>,
    target: TargetDevice,
    block_size: usize,
    auto_increment: bool,
}

impl<P: Port> Programmer<P> {
    /// Create a programmer over an opened port.
    pub fn new(port: P, target: TargetDevice) -> Self {
        Self::with_session(BootloaderSession::new(port), target)
    }

    /// Create a programmer over an existing session.
    pub fn with_session(session: BootloaderSession<P>, target: TargetDevice) -> Self {
        Self {
            session,
            target,
            block_size: FALLBACK_BLOCK_SIZE,
            auto_increment: false,
        }
    }

    /// Target profile.
    pub fn target(&self) -> TargetDevice {
        self.target
    }

    /// Block size used for transfers.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Whether the bootloader reported auto-increment support.
    pub fn auto_increment(&self) -> bool {
        self.auto_increment
    }

    /// Get a reference to the underlying session.
    pub fn session(&self) -> &BootloaderSession<P> {
        &self.session
    }

    /// Get a mutable reference to the underlying session.
    pub fn session_mut(&mut self) -> &mut BootloaderSession<P> {
        &mut self.session
    }

    /// Consume the programmer and return the underlying session.
    pub fn into_session(self) -> BootloaderSession<P> {
        self.session
    }

    /// Handshake, check the signature and read the transfer parameters.
    pub fn connect(&mut self, attempts: usize) -> Result<()> {
        self.session.connect_and_verify(attempts)?;

        let signature = self.session.get_device_signature()?;
        let expected = self.target.signature();
        if signature != expected {
            return Err(Error::SignatureMismatch {
                target: self.target.to_string(),
                expected,
                actual: signature,
            });
        }

        let reported = usize::from(self.session.get_block_size()?) & !1;
        self.block_size = if reported == 0 {
            warn!("Bootloader reports no block buffer, using {FALLBACK_BLOCK_SIZE} byte blocks");
            FALLBACK_BLOCK_SIZE
        } else {
            reported
        };
        self.auto_increment = self.session.supports_auto_increment()?;

        info!(
            "Connected to {} (block size {}, auto-increment {})",
            self.target,
            self.block_size,
            if self.auto_increment { "yes" } else { "no" }
        );
        Ok(())
    }

    /// Query everything the bootloader reports.
    pub fn device_info(&mut self) -> Result<DeviceInfo> {
        Ok(DeviceInfo {
            target: self.target,
            signature: self.session.get_device_signature()?,
            software_version: self.session.get_software_version()?,
            programmer_type: self.session.get_programmer_type()?,
            device_codes: self.session.get_device_list()?,
            block_size: self.session.get_block_size()?,
            auto_increment: self.session.supports_auto_increment()?,
        })
    }

    /// Erase the application flash.
    pub fn erase(&mut self) -> Result<()> {
        info!("Erasing {} flash...", self.target);
        self.session.chip_erase()
    }

    /// Write `data` starting at byte address `start`.
    ///
    /// Flash writes must start on a word boundary. Odd-length data is padded
    /// with `0xFF`, or for an EEPROM write that ends at the last byte, widened
    /// by the byte before it as read back from the device. `progress`
    /// receives `(bytes_done, bytes_total)` after every block.
    pub fn write(
        &mut self,
        memory: MemoryType,
        start: u32,
        data: &[u8],
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<()> {
        if memory == MemoryType::Flash && start % 2 != 0 {
            return Err(Error::InvalidAddress(start));
        }
        if data.is_empty() {
            debug!("Nothing to write");
            return Ok(());
        }
        self.check_range(memory, start, data.len())?;
        let (start, image) = self.word_image(memory, start, data)?;

        info!("Writing {} bytes of {memory} at 0x{start:05X}", data.len());
        self.session.enter_program_mode()?;
        let result = self.write_blocks(memory, start, &image, progress);

        if self.session.state() == SessionState::ProgramMode {
            let left = self.session.leave_program_mode();
            match (&result, left) {
                (Ok(()), left) => left?,
                (Err(_), Err(e)) => debug!("Leaving program mode after failed write: {e}"),
                (Err(_), Ok(())) => {},
            }
        }
        result
    }

    /// Widen `data` to whole words, returning the new start address.
    fn word_image(
        &mut self,
        memory: MemoryType,
        start: u32,
        data: &[u8],
    ) -> Result<(u32, Vec<u8>)> {
        if data.len() % 2 == 0 {
            return Ok((start, data.to_vec()));
        }
        if !self.runs_past_end(memory, start, data.len() + 1) {
            let mut image = data.to_vec();
            image.push(ERASED_BYTE);
            return Ok((start, image));
        }

        // Only an odd EEPROM start can get here.
        let before = start.checked_sub(1).ok_or(Error::InvalidAddress(start))?;
        let mut image = self.read(memory, before, 1, &mut |_, _| {})?;
        image.extend_from_slice(data);
        Ok((before, image))
    }

    fn write_blocks(
        &mut self,
        memory: MemoryType,
        start: u32,
        image: &[u8],
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<()> {
        let total = image.len();
        let mut done = 0;

        for block in image.chunks(self.block_size) {
            if crate::is_interrupted_requested() {
                return Err(Error::Interrupted);
            }
            self.session.set_memory_address(memory, offset(start, done)?)?;
            self.session.write_block(memory, block)?;
            done += block.len();
            progress(done, total);
        }

        debug!("Wrote {done} bytes of {memory}");
        Ok(())
    }

    /// Read `len` bytes starting at byte address `start`.
    ///
    /// Flash reads must start on a word boundary.
    pub fn read(
        &mut self,
        memory: MemoryType,
        start: u32,
        len: usize,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<Vec<u8>> {
        if memory == MemoryType::Flash && start % 2 != 0 {
            return Err(Error::InvalidAddress(start));
        }
        self.check_range(memory, start, len)?;

        // Blocks are whole words. The extra byte goes after the window, or
        // before it when that would run past the end of memory.
        let padded = len + len % 2;
        let (first, skip) = if self.runs_past_end(memory, start, padded) {
            (start.checked_sub(1).ok_or(Error::InvalidAddress(start))?, 1)
        } else {
            (start, 0)
        };

        let mut data = Vec::with_capacity(padded);
        for size in block_sizes(padded, self.block_size) {
            if crate::is_interrupted_requested() {
                return Err(Error::Interrupted);
            }
            self.session.set_memory_address(memory, offset(first, data.len())?)?;
            let block = self.session.read_block_exact(memory, size)?;
            data.extend_from_slice(&block);
            progress(data.len().saturating_sub(skip).min(len), len);
        }

        data.drain(..skip.min(data.len()));
        data.truncate(len);
        Ok(data)
    }

    /// Read back `data` from `start` and compare it byte by byte.
    pub fn verify(
        &mut self,
        memory: MemoryType,
        start: u32,
        data: &[u8],
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<()> {
        info!("Verifying {} bytes of {memory} at 0x{start:05X}", data.len());
        let actual = self.read(memory, start, data.len(), progress)?;

        for (i, (&expected, &actual)) in data.iter().zip(actual.iter()).enumerate() {
            if expected != actual {
                return Err(Error::VerifyMismatch {
                    address: offset(start, i)?,
                    expected,
                    actual,
                });
            }
        }

        info!("Verify OK");
        Ok(())
    }

    /// Exit the bootloader and start the application.
    pub fn finish(&mut self) -> Result<()> {
        self.session.exit_bootloader()
    }

    fn runs_past_end(&self, memory: MemoryType, start: u32, len: usize) -> bool {
        let size = self.target.memory_size(memory);
        let end = u64::from(start).saturating_add(u64::try_from(len).unwrap_or(u64::MAX));
        end > u64::from(size)
    }

    fn check_range(&self, memory: MemoryType, start: u32, len: usize) -> Result<()> {
        if self.runs_past_end(memory, start, len) {
            let size = self.target.memory_size(memory);
            return Err(Error::OutOfRange {
                memory: memory.name(),
                start,
                len,
                size,
            });
        }
        Ok(())
    }
}

/// Split `total` bytes into transfer sizes of at most `block_size`.
fn block_sizes(total: usize, block_size: usize) -> impl Iterator<Item = usize> {
    let mut remaining = total;
    std::iter::from_fn(move || {
        if remaining == 0 {
            return None;
        }
        let size = remaining.min(block_size);
        remaining -= size;
        Some(size)
    })
}

fn offset(start: u32, done: usize) -> Result<u32> {
    u32::try_from(done)
        .ok()
        .and_then(|done| start.checked_add(done))
        .ok_or(Error::InvalidAddress(start))
}

// Native-specific convenience functions
#[cfg(feature = "native")]
mod native_impl {
    use super::{Programmer, Result, TargetDevice};
    use crate::port::{NativePort, SerialConfig};

    impl Programmer<NativePort> {
        /// Open a serial port with default settings and create a programmer.
        ///
        /// # Arguments
        ///
        /// * `port_name` - Serial port name (e.g., "/dev/ttyACM0" or "COM3")
        /// * `baud_rate` - Operating baud rate of the bootloader
        /// * `target` - Expected target device
        pub fn open(port_name: &str, baud_rate: u32, target: TargetDevice) -> Result<Self> {
            Self::open_with_config(&SerialConfig::new(port_name, baud_rate), target)
        }

        /// Open a serial port with full configuration and create a programmer.
        pub fn open_with_config(config: &SerialConfig, target: TargetDevice) -> Result<Self> {
            let port = NativePort::open(config)?;
            Ok(Self::new(port, target))
        }
    }
}
