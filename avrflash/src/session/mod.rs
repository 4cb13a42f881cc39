//! AVR109 bootloader session.
//!
//! [`BootloaderSession`] owns a [`Port`] and runs the strictly half-duplex
//! request/response protocol over it: reset and handshake, command framing,
//! acknowledgement checks and the few bounded retries the protocol needs.
//!
//! ## Example
//!
//! ```rust,no_run
//! use avrflash::port::{NativePort, SerialConfig};
//! use avrflash::protocol::MemoryType;
//! use avrflash::session::{BootloaderSession, DEFAULT_HANDSHAKE_ATTEMPTS};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let port = NativePort::open(&SerialConfig::new("/dev/ttyACM0", 115200))?;
//!     let mut session = BootloaderSession::new(port);
//!     session.connect_and_verify(DEFAULT_HANDSHAKE_ATTEMPTS)?;
//!
//!     println!("signature: {:02X?}", session.get_device_signature()?);
//!
//!     session.set_address(0)?;
//!     let first = session.read_block_exact(MemoryType::Flash, 128)?;
//!     println!("first block: {first:02X?}");
//!
//!     session.exit_bootloader()?;
//!     Ok(())
//! }
//! ```

mod state;
mod timeout;

pub use state::SessionState;

use std::io::{self, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};
use log::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::avr109::{
    ACK, BOOTLOADER_ID, CommandFrame, DEVICE_LIST_END, MAX_BLOCK_LEN, MemoryType, Opcode,
    ProgrammerType, SoftwareVersion, YES, is_bootloader_id,
};
use timeout::TimeoutGuard;

/// Default number of reset/identify cycles in [`BootloaderSession::connect_and_verify`].
pub const DEFAULT_HANDSHAKE_ATTEMPTS: usize = 10;

/// Timeout for the acknowledgement byte.
const ACK_TIMEOUT: Duration = Duration::from_secs(1);

/// Timeout for the bootloader id reply during the handshake.
const ID_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Timeout for fixed-size replies (signature, yes/no queries).
const REPLY_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-byte timeout for version, programmer type and device list queries.
const QUERY_TIMEOUT: Duration = Duration::from_millis(100);

/// Timeout for block read data.
const BLOCK_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Timeout of each stale-byte drain read.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

/// Upper bound on bytes discarded by a single drain.
const MAX_DRAIN_BYTES: usize = 4096;

/// Attempts of the programmer type send/expect exchange.
const PROGRAMMER_TYPE_ATTEMPTS: usize = 5;

/// Fixed delays required by the bootloader firmware.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Pacing {
    /// Wait after a reset before the bootloader answers reliably.
    pub settle: Duration,
    /// Wait before erase, program mode changes, exit and some queries.
    pub command_delay: Duration,
    /// Wait between attempts of a retried exchange.
    pub retry_delay: Duration,
    /// Overall bound on the device list reply.
    pub device_list_deadline: Duration,
}

impl Pacing {
    pub(crate) const HARDWARE: Self = Self {
        settle: Duration::from_millis(2500),
        command_delay: Duration::from_millis(100),
        retry_delay: Duration::from_millis(100),
        device_list_deadline: Duration::from_secs(2),
    };

    #[cfg(test)]
    pub(crate) const IMMEDIATE: Self = Self {
        settle: Duration::ZERO,
        command_delay: Duration::ZERO,
        retry_delay: Duration::ZERO,
        device_list_deadline: Duration::from_millis(50),
    };
}

/// Client side of an AVR109 bootloader conversation.
///
/// Generic over the port type `P`. Not meant for concurrent use; every call
/// blocks until its reply was read or its timeout elapsed.
pub struct BootloaderSession<P: Port> {
    port: P,
    state: SessionState,
    /// Byte address the next block transfer starts at.
    address: Option<u32>,
    /// Set when an acknowledgement was missed; framing can no longer be trusted.
    ack_failed: bool,
    pacing: Pacing,
}

impl<P: Port> BootloaderSession<P> {
    /// Create a session over an opened port.
    ///
    /// The session starts [`SessionState::Disconnected`]; call
    /// [`connect_and_verify`](Self::connect_and_verify) before anything else.
    pub fn new(port: P) -> Self {
        Self::with_pacing(port, Pacing::HARDWARE)
    }

    pub(crate) fn with_pacing(port: P, pacing: Pacing) -> Self {
        Self {
            port,
            state: SessionState::Disconnected,
            address: None,
            ack_failed: false,
            pacing,
        }
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Byte address the next block transfer starts at, if one was set.
    pub fn address(&self) -> Option<u32> {
        self.address
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Get a mutable reference to the underlying port.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Consume the session and return the underlying port.
    pub fn into_port(self) -> P {
        self.port
    }

    /// Reset the device into its bootloader and confirm its identity.
    ///
    /// Each attempt resets the device, waits the settle delay, drains stale
    /// input, sends `'S'` and compares the 7 byte reply with `AVRBOOT`.
    /// The interrupt checker is polled before every attempt.
    pub fn connect_and_verify(&mut self, max_attempts: usize) -> Result<()> {
        if max_attempts == 0 {
            return Err(Error::Config(
                "handshake needs at least one attempt".into(),
            ));
        }

        info!("Waiting for AVR109 bootloader on {}...", self.port.name());

        let mut observed = Vec::new();
        for attempt in 1..=max_attempts {
            if crate::is_interrupted_requested() {
                self.state = SessionState::Disconnected;
                return Err(Error::Interrupted);
            }
            if attempt > 1 {
                debug!("Handshake attempt {attempt}/{max_attempts}");
            }

            let result = self.reset_and_identify();
            observed = self.track(result)?;

            if is_bootloader_id(&observed) {
                self.state = SessionState::Connected { verified: true };
                self.ack_failed = false;
                info!("Bootloader identified as {}", String::from_utf8_lossy(&observed));
                return Ok(());
            }

            warn!(
                "Unexpected bootloader id {observed:02X?} (attempt {attempt}/{max_attempts})"
            );
            if attempt < max_attempts {
                thread::sleep(self.pacing.retry_delay);
            }
        }

        Err(Error::HandshakeFailed {
            attempts: max_attempts,
            observed,
        })
    }

    /// One reset/settle/identify cycle.
    fn reset_and_identify(&mut self) -> Result<Vec<u8>> {
        self.state = SessionState::Resetting;
        self.address = None;
        self.port.reset_to_bootloader()?;
        self.state = SessionState::Connected { verified: false };

        thread::sleep(self.pacing.settle);
        self.drain()?;

        self.send(&CommandFrame::new(Opcode::ReadBootloaderId))?;
        let mut port = TimeoutGuard::new(&mut self.port, ID_READ_TIMEOUT)?;
        read_up_to(&mut *port, BOOTLOADER_ID.len())
    }

    /// Read the single acknowledgement byte of the last command.
    ///
    /// The read timeout is narrowed for this read only and restored
    /// afterwards, also when the check fails.
    pub fn verify_command_sent(&mut self, command: &str) -> Result<()> {
        let reply = {
            let mut port = TimeoutGuard::new(&mut self.port, ACK_TIMEOUT)?;
            read_up_to(&mut *port, 1)?
        };

        match reply.first().copied() {
            Some(ACK) => {
                trace!("{command}: acknowledged");
                Ok(())
            },
            observed => {
                self.ack_failed = true;
                Err(Error::CommandNotAcknowledged {
                    command: command.to_string(),
                    observed,
                })
            },
        }
    }

    /// Set the byte address of the next flash block transfer.
    ///
    /// Flash is word addressed, so `byte_address` must be even.
    pub fn set_address(&mut self, byte_address: u32) -> Result<()> {
        self.set_memory_address(MemoryType::Flash, byte_address)
    }

    /// Set the byte address of the next block transfer in `memory`.
    ///
    /// The `'A'` field carries a word address for flash and the byte
    /// address itself for EEPROM.
    pub fn set_memory_address(&mut self, memory: MemoryType, byte_address: u32) -> Result<()> {
        let field = device_address(memory, byte_address)?;
        self.require_writable("set address")?;

        self.exchange(|s| {
            s.send(&CommandFrame::set_address(field))?;
            s.verify_command_sent(&format!("set address to 0x{field:04X}"))
        })?;

        debug!("{memory} address set to 0x{byte_address:05X} (field 0x{field:04X})");
        self.address = Some(byte_address);
        Ok(())
    }

    /// Write one block at the current address.
    ///
    /// `data` must have an even length. The bootloader advances its address
    /// past the block, and so does the session.
    pub fn write_block(&mut self, memory: MemoryType, data: &[u8]) -> Result<()> {
        let len = block_len(data.len())?;
        self.require_writable("write block")?;
        let address = self.require_address("write block")?;

        self.exchange(|s| {
            let header = CommandFrame::block_load(memory, len).build();
            trace!("Sending block load header {header:02X?} + {} bytes", data.len());
            s.port.write_all(&header)?;
            s.port.write_all(data)?;
            s.port.flush()?;
            s.verify_command_sent(&format!("block load of {} {memory} bytes", data.len()))
        })?;

        self.address = Some(address + u32::from(len));
        Ok(())
    }

    /// Read one block at the current address.
    ///
    /// Returns whatever arrived before the read timeout, which may be less
    /// than `size`. Use [`read_block_exact`](Self::read_block_exact) to treat
    /// a short read as an error.
    pub fn read_block(&mut self, memory: MemoryType, size: usize) -> Result<Vec<u8>> {
        let len = block_len(size)?;
        self.require_verified("read block")?;
        let address = self.require_address("read block")?;

        let data = self.exchange(|s| {
            s.send(&CommandFrame::block_read(memory, len))?;
            let mut port = TimeoutGuard::new(&mut s.port, BLOCK_READ_TIMEOUT)?;
            read_up_to(&mut *port, size)
        })?;

        if data.len() == size {
            self.address = Some(address + u32::from(len));
        } else {
            // Device address is unknown after a stalled read.
            warn!(
                "Short {memory} read at 0x{address:05X}: {}/{size} bytes",
                data.len()
            );
            self.address = None;
        }
        Ok(data)
    }

    /// Read one block and fail with [`Error::IncompleteTransfer`] on a short read.
    pub fn read_block_exact(&mut self, memory: MemoryType, size: usize) -> Result<Vec<u8>> {
        let data = self.read_block(memory, size)?;
        if data.len() != size {
            return Err(Error::IncompleteTransfer {
                expected: size,
                actual: data.len(),
            });
        }
        Ok(data)
    }

    /// Erase the application flash.
    pub fn chip_erase(&mut self) -> Result<()> {
        self.require_writable("erase chip")?;
        self.exchange(|s| {
            s.command_delay();
            s.send(&CommandFrame::new(Opcode::ChipErase))?;
            s.verify_command_sent(Opcode::ChipErase.label())
        })?;
        info!("Chip erased");
        Ok(())
    }

    /// Enter programming mode. The bootloader sends no acknowledgement.
    pub fn enter_program_mode(&mut self) -> Result<()> {
        if self.state != (SessionState::Connected { verified: true }) {
            return Err(self.invalid_state("enter program mode"));
        }
        self.exchange(|s| {
            s.command_delay();
            s.send(&CommandFrame::new(Opcode::EnterProgramMode))
        })?;
        self.state = SessionState::ProgramMode;
        debug!("Entered program mode");
        Ok(())
    }

    /// Leave programming mode.
    pub fn leave_program_mode(&mut self) -> Result<()> {
        if self.state != SessionState::ProgramMode {
            return Err(self.invalid_state("leave program mode"));
        }
        self.exchange(|s| {
            s.command_delay();
            s.send(&CommandFrame::new(Opcode::LeaveProgramMode))?;
            s.verify_command_sent(Opcode::LeaveProgramMode.label())
        })?;
        self.state = SessionState::Connected { verified: true };
        debug!("Left program mode");
        Ok(())
    }

    /// Exit the bootloader and start the application.
    ///
    /// The session is disconnected afterwards even if the acknowledgement
    /// is missing.
    pub fn exit_bootloader(&mut self) -> Result<()> {
        self.require_verified("exit bootloader")?;
        let result = self.exchange(|s| {
            s.command_delay();
            s.send(&CommandFrame::new(Opcode::ExitBootloader))?;
            s.verify_command_sent(Opcode::ExitBootloader.label())
        });
        self.state = SessionState::Disconnected;
        self.address = None;
        if result.is_ok() {
            info!("Bootloader exited");
        }
        result
    }

    /// Whether the bootloader auto-increments the address after block transfers.
    pub fn supports_auto_increment(&mut self) -> Result<bool> {
        self.require_verified("query auto-increment")?;
        let reply = self.exchange(|s| {
            s.command_delay();
            s.send(&CommandFrame::new(Opcode::AutoIncrement))?;
            let mut port = TimeoutGuard::new(&mut s.port, REPLY_TIMEOUT)?;
            read_up_to(&mut *port, 1)
        })?;
        Ok(reply.first() == Some(&YES))
    }

    /// Block buffer size in bytes, 0 if block mode is not supported.
    pub fn get_block_size(&mut self) -> Result<u16> {
        self.require_verified("query block size")?;
        self.exchange(|s| {
            s.command_delay();
            s.send(&CommandFrame::new(Opcode::BlockSize))?;
            let mut port = TimeoutGuard::new(&mut s.port, REPLY_TIMEOUT)?;
            if read_up_to(&mut *port, 1)?.first() != Some(&YES) {
                return Ok(0);
            }
            let size = read_up_to(&mut *port, 2)?;
            if size.len() < 2 {
                return Err(Error::IncompleteTransfer {
                    expected: 2,
                    actual: size.len(),
                });
            }
            Ok(BigEndian::read_u16(&size))
        })
    }

    /// Bootloader software version, [`SoftwareVersion::Unknown`] if the
    /// reply is shorter than two bytes.
    pub fn get_software_version(&mut self) -> Result<SoftwareVersion> {
        self.require_verified("query software version")?;
        let reply = self.exchange(|s| {
            s.command_delay();
            s.send(&CommandFrame::new(Opcode::SoftwareVersion))?;
            let mut port = TimeoutGuard::new(&mut s.port, QUERY_TIMEOUT)?;
            read_up_to(&mut *port, 2)
        })?;
        Ok(SoftwareVersion::from_reply(&reply))
    }

    /// Programmer type, retried a few times until the device answers `'S'`.
    ///
    /// Returns `None` if the type was never confirmed.
    pub fn get_programmer_type(&mut self) -> Result<Option<ProgrammerType>> {
        self.require_verified("query programmer type")?;
        self.exchange(|s| {
            s.drain()?;
            for attempt in 1..=PROGRAMMER_TYPE_ATTEMPTS {
                s.send(&CommandFrame::new(Opcode::ProgrammerType))?;
                let reply = {
                    let mut port = TimeoutGuard::new(&mut s.port, QUERY_TIMEOUT)?;
                    read_up_to(&mut *port, 1)?
                };
                if let Some(kind) = reply.first().copied().and_then(ProgrammerType::from_byte) {
                    return Ok(Some(kind));
                }
                debug!(
                    "Programmer type reply {reply:02X?} (attempt {attempt}/{PROGRAMMER_TYPE_ATTEMPTS})"
                );
                if attempt < PROGRAMMER_TYPE_ATTEMPTS {
                    thread::sleep(s.pacing.retry_delay);
                }
            }
            Ok(None)
        })
    }

    /// Supported device codes; the zero terminator is not included.
    ///
    /// A timed-out read ends the list as well, and the whole reply is bounded
    /// by an overall deadline.
    pub fn get_device_list(&mut self) -> Result<Vec<u8>> {
        self.require_verified("query device list")?;
        self.exchange(|s| {
            s.send(&CommandFrame::new(Opcode::DeviceList))?;
            let mut port = TimeoutGuard::new(&mut s.port, QUERY_TIMEOUT)?;
            let deadline = Instant::now() + s.pacing.device_list_deadline;
            let mut devices = Vec::new();

            loop {
                match read_up_to(&mut *port, 1)?.first().copied() {
                    None | Some(DEVICE_LIST_END) => break,
                    Some(code) => devices.push(code),
                }
                if Instant::now() >= deadline {
                    warn!("Device list not terminated after {} codes", devices.len());
                    break;
                }
            }
            Ok(devices)
        })
    }

    /// Read the 3 byte device signature.
    pub fn get_device_signature(&mut self) -> Result<[u8; 3]> {
        self.require_verified("read signature")?;
        let reply = self.exchange(|s| {
            s.send(&CommandFrame::new(Opcode::ReadSignature))?;
            let mut port = TimeoutGuard::new(&mut s.port, REPLY_TIMEOUT)?;
            read_up_to(&mut *port, 3)
        })?;
        match reply[..] {
            [a, b, c] => Ok([a, b, c]),
            _ => Err(Error::IncompleteTransfer {
                expected: 3,
                actual: reply.len(),
            }),
        }
    }

    /// Write a frame and flush it.
    fn send(&mut self, frame: &CommandFrame) -> Result<()> {
        let data = frame.build();
        trace!("Sending {} {data:02X?}", frame.opcode().label());
        self.port.write_all(&data)?;
        self.port.flush()?;
        Ok(())
    }

    /// Discard whatever is buffered on the receive side.
    ///
    /// Read errors are ignored here: stale input is expected after a reset
    /// and a broken channel shows up on the next write.
    fn drain(&mut self) -> Result<()> {
        let mut port = TimeoutGuard::new(&mut self.port, DRAIN_TIMEOUT)?;
        let mut buf = [0u8; 64];
        let mut discarded = 0;

        while discarded < MAX_DRAIN_BYTES {
            match port.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => discarded += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(_) => break,
            }
        }

        if discarded > 0 {
            debug!("Discarded {discarded} stale bytes");
        }
        Ok(())
    }

    fn command_delay(&self) {
        thread::sleep(self.pacing.command_delay);
    }

    /// Run one exchange, dropping to `Disconnected` if the channel failed.
    fn exchange<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let result = f(self);
        self.track(result)
    }

    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_transport() {
                warn!("Transport failure, session disconnected: {e}");
                self.state = SessionState::Disconnected;
                self.address = None;
            }
        }
        result
    }

    fn require_verified(&self, operation: &'static str) -> Result<()> {
        if self.state.is_verified() {
            Ok(())
        } else {
            Err(self.invalid_state(operation))
        }
    }

    fn require_writable(&self, operation: &'static str) -> Result<()> {
        self.require_verified(operation)?;
        if self.ack_failed {
            return Err(Error::NeedsReconnect(operation));
        }
        Ok(())
    }

    fn require_address(&self, operation: &'static str) -> Result<u32> {
        self.address.ok_or(Error::AddressNotSet(operation))
    }

    fn invalid_state(&self, operation: &'static str) -> Error {
        Error::InvalidState {
            operation,
            state: self.state,
        }
    }
}

/// Convert a byte address to the 16-bit field sent with `'A'`.
fn device_address(memory: MemoryType, byte_address: u32) -> Result<u16> {
    let field = match memory {
        MemoryType::Flash if byte_address % 2 != 0 => {
            return Err(Error::InvalidAddress(byte_address));
        },
        MemoryType::Flash => byte_address / 2,
        MemoryType::Eeprom => byte_address,
    };
    u16::try_from(field).map_err(|_| Error::InvalidAddress(byte_address))
}

/// Validate a block length for the 16-bit length field.
fn block_len(len: usize) -> Result<u16> {
    if len == 0 || len % 2 != 0 || len > MAX_BLOCK_LEN {
        return Err(Error::InvalidBlockLength(len));
    }
    u16::try_from(len).map_err(|_| Error::InvalidBlockLength(len))
}

/// Read up to `n` bytes, stopping early when the port's timeout elapses.
///
/// The timeout bounds the whole call: reads after the first only get what
/// is left of it. The port's timeout is restored before returning.
fn read_up_to<P: Port>(port: &mut P, n: usize) -> Result<Vec<u8>> {
    let timeout = port.timeout();
    let deadline = Instant::now() + timeout;
    let mut buf = vec![0u8; n];
    let mut got = 0;

    while got < n {
        match port.read(&mut buf[got..]) {
            Ok(0) => break,
            Ok(k) => got += k,
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                break;
            },
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
            Err(e) => return Err(Error::Io(e)),
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        if got < n {
            port.set_timeout(remaining)?;
        }
    }

    if port.timeout() != timeout {
        port.set_timeout(timeout)?;
    }
    buf.truncate(got);
    trace!("Received {got}/{n} bytes: {buf:02X?}");
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::MockPort;

    /// Session that completed a handshake; `script` queues the replies for
    /// the commands issued afterwards.
    fn connected(script: impl FnOnce(&mut MockPort)) -> BootloaderSession<MockPort> {
        let mut port = MockPort::new();
        port.reply(BOOTLOADER_ID);
        script(&mut port);

        let mut session = BootloaderSession::with_pacing(port, Pacing::IMMEDIATE);
        session.connect_and_verify(1).unwrap();
        session.port_mut().written.clear();
        session
    }

    fn written(session: &BootloaderSession<MockPort>) -> &[u8] {
        &session.port().written
    }

    // ---- Handshake ----

    #[test]
    fn test_handshake_succeeds_first_try() {
        let session = connected(|_| {});
        assert_eq!(session.state(), SessionState::Connected { verified: true });
        assert_eq!(session.port().resets, 1);
    }

    #[test]
    fn test_handshake_retries_until_id_matches() {
        for k in 0..4 {
            let mut port = MockPort::new();
            for _ in 0..k {
                port.reply(b"CATERIN");
            }
            port.reply(b"AVRBOOT");

            let mut session = BootloaderSession::with_pacing(port, Pacing::IMMEDIATE);
            session.connect_and_verify(5).unwrap();

            assert_eq!(session.port().resets, k + 1, "k = {k}");
            assert_eq!(session.port().written, vec![b'S'; k + 1]);
            assert!(session.state().is_verified());
        }
    }

    #[test]
    fn test_handshake_fails_with_last_observed_bytes() {
        let mut port = MockPort::new();
        port.reply(b"GARBAGE").reply(b"BOOTAVR").reply(b"AVRBO");

        let mut session = BootloaderSession::with_pacing(port, Pacing::IMMEDIATE);
        let err = session.connect_and_verify(3).unwrap_err();

        match err {
            Error::HandshakeFailed { attempts, observed } => {
                assert_eq!(attempts, 3);
                assert_eq!(observed, b"AVRBO");
            },
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(session.port().resets, 3);
        assert!(!session.state().is_verified());
    }

    #[test]
    fn test_handshake_timeout_reports_empty_reply() {
        let mut port = MockPort::new();
        port.silence().silence();

        let mut session = BootloaderSession::with_pacing(port, Pacing::IMMEDIATE);
        let err = session.connect_and_verify(2).unwrap_err();
        assert!(matches!(err, Error::HandshakeFailed { ref observed, .. } if observed.is_empty()));
    }

    #[test]
    fn test_handshake_drains_stale_bytes() {
        let mut port = MockPort::new();
        port.stale_after_reset(b"\r\r?junk").reply(b"AVRBOOT");

        let mut session = BootloaderSession::with_pacing(port, Pacing::IMMEDIATE);
        session.connect_and_verify(1).unwrap();
        assert_eq!(session.port().pending_rx(), 0);
    }

    #[test]
    fn test_handshake_rejects_zero_attempts() {
        let mut session = BootloaderSession::with_pacing(MockPort::new(), Pacing::IMMEDIATE);
        assert!(matches!(session.connect_and_verify(0), Err(Error::Config(_))));
        assert_eq!(session.port().resets, 0);
    }

    #[test]
    fn test_reconnect_clears_address() {
        let mut session = connected(|p| {
            p.reply(b"\r").reply(b"AVRBOOT");
        });
        session.set_address(0x100).unwrap();
        session.connect_and_verify(1).unwrap();
        assert_eq!(session.address(), None);
    }

    // ---- Acknowledgement ----

    #[test]
    fn test_ack_accepts_carriage_return() {
        let mut session = connected(|p| {
            p.reply(&[0x0D]);
        });
        session.chip_erase().unwrap();
        assert_eq!(written(&session), b"e");
    }

    #[test]
    fn test_ack_rejects_other_bytes() {
        for byte in [0x00, b'?', b'\n', 0xFF] {
            let mut session = connected(|p| {
                p.reply(&[byte]);
            });
            let err = session.chip_erase().unwrap_err();
            assert!(
                matches!(err, Error::CommandNotAcknowledged { observed: Some(b), .. } if b == byte),
                "byte 0x{byte:02X}: {err}"
            );
        }
    }

    #[test]
    fn test_ack_timeout_reports_none() {
        let mut session = connected(|p| {
            p.silence();
        });
        let err = session.chip_erase().unwrap_err();
        assert!(matches!(
            err,
            Error::CommandNotAcknowledged { observed: None, ref command } if command == "chip erase"
        ));
    }

    #[test]
    fn test_ack_restores_previous_timeout() {
        for reply in [&b"\r"[..], b"x", b""] {
            let mut session = connected(|p| {
                p.reply(reply);
            });
            session.port_mut().set_timeout(Duration::from_secs(5)).unwrap();

            let _ = session.chip_erase();

            assert_eq!(session.port().timeout(), Duration::from_secs(5));
            let set = &session.port().timeouts_set;
            assert_eq!(set[set.len() - 2], ACK_TIMEOUT);
            assert_eq!(set[set.len() - 1], Duration::from_secs(5));
        }
    }

    #[test]
    fn test_missed_ack_blocks_memory_commands_until_reconnect() {
        let mut session = connected(|p| {
            p.reply(b"!").reply(&[0x1E, 0x95, 0x0F]).reply(b"AVRBOOT").reply(b"\r");
        });

        assert!(session.chip_erase().is_err());
        assert!(matches!(session.set_address(0), Err(Error::NeedsReconnect(_))));
        assert!(matches!(session.chip_erase(), Err(Error::NeedsReconnect(_))));

        // Queries still work for diagnostics.
        assert_eq!(session.get_device_signature().unwrap(), [0x1E, 0x95, 0x0F]);

        session.connect_and_verify(1).unwrap();
        session.set_address(0).unwrap();
    }

    // ---- Timed reads ----

    #[test]
    fn test_read_up_to_shrinks_timeout_after_first_read() {
        let mut port = MockPort::new();
        port.reply(&[1, 2]);
        port.flush().unwrap();

        assert_eq!(read_up_to(&mut port, 4).unwrap(), [1, 2]);

        // One narrowed timeout before the second read, then the restore.
        assert_eq!(port.timeouts_set.len(), 2);
        assert!(port.timeouts_set[0] <= Duration::from_secs(1));
        assert_eq!(port.timeouts_set[1], Duration::from_secs(1));
        assert_eq!(port.timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_read_up_to_complete_read_keeps_timeout() {
        let mut port = MockPort::new();
        port.reply(&[1, 2, 3]);
        port.flush().unwrap();

        assert_eq!(read_up_to(&mut port, 3).unwrap(), [1, 2, 3]);
        assert!(port.timeouts_set.is_empty());
    }

    #[test]
    fn test_read_up_to_stream_fills_request() {
        let mut port = MockPort::new();
        port.stream(0x55);
        port.flush().unwrap();

        assert_eq!(read_up_to(&mut port, 8).unwrap(), [0x55; 8]);
    }

    // ---- Addressing and block I/O ----

    #[test]
    fn test_set_address_sends_word_address() {
        for n in [0u32, 1, 0x7F, 0x80, 0x1234, 0x3FFF, 0xFFFF] {
            let mut session = connected(|p| {
                p.reply(b"\r");
            });
            session.set_address(2 * n).unwrap();
            assert_eq!(
                written(&session),
                [b'A', ((n >> 8) & 0xFF) as u8, (n & 0xFF) as u8]
            );
            assert_eq!(session.address(), Some(2 * n));
        }
    }

    #[test]
    fn test_set_address_rejects_odd_address_without_io() {
        let mut session = connected(|_| {});
        let flushes = session.port().flushes;

        assert!(matches!(session.set_address(0x101), Err(Error::InvalidAddress(0x101))));
        assert!(written(&session).is_empty());
        assert_eq!(session.port().flushes, flushes);
    }

    #[test]
    fn test_set_address_rejects_address_beyond_word_range() {
        let mut session = connected(|_| {});
        assert!(matches!(session.set_address(0x2_0000), Err(Error::InvalidAddress(_))));
        assert!(written(&session).is_empty());
    }

    #[test]
    fn test_set_eeprom_address_sends_byte_address() {
        for n in [0u32, 1, 0x11, 0x80, 0x3FF, 0xFFFF] {
            let mut session = connected(|p| {
                p.reply(b"\r");
            });
            session.set_memory_address(MemoryType::Eeprom, n).unwrap();
            assert_eq!(
                written(&session),
                [b'A', ((n >> 8) & 0xFF) as u8, (n & 0xFF) as u8]
            );
            assert_eq!(session.address(), Some(n));
        }
    }

    #[test]
    fn test_set_eeprom_address_rejects_address_beyond_field() {
        let mut session = connected(|_| {});
        assert!(matches!(
            session.set_memory_address(MemoryType::Eeprom, 0x1_0000),
            Err(Error::InvalidAddress(0x1_0000))
        ));
        assert!(written(&session).is_empty());
    }

    #[test]
    fn test_write_block_framing() {
        for len in [2usize, 4, 64, 128, 256, 512] {
            let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let mut session = connected(|p| {
                p.reply(b"\r").reply(b"\r");
            });
            session.set_address(0).unwrap();
            session.port_mut().written.clear();

            session.write_block(MemoryType::Flash, &data).unwrap();

            let mut expected = vec![b'B', (len >> 8) as u8, (len & 0xFF) as u8, b'F'];
            expected.extend_from_slice(&data);
            assert_eq!(written(&session), expected, "len = {len}");
            assert_eq!(session.address(), Some(len as u32));
        }
    }

    #[test]
    fn test_write_block_eeprom_memtype() {
        let mut session = connected(|p| {
            p.reply(b"\r").reply(b"\r");
        });
        session.set_address(0x10).unwrap();
        session.port_mut().written.clear();

        session.write_block(MemoryType::Eeprom, &[0xAA, 0x55]).unwrap();
        assert_eq!(written(&session), [b'B', 0x00, 0x02, b'E', 0xAA, 0x55]);
        assert_eq!(session.address(), Some(0x12));
    }

    #[test]
    fn test_write_block_rejects_odd_length_without_io() {
        let mut session = connected(|p| {
            p.reply(b"\r");
        });
        session.set_address(0).unwrap();
        session.port_mut().written.clear();

        for len in [0usize, 1, 3, 127] {
            let err = session.write_block(MemoryType::Flash, &vec![0; len]).unwrap_err();
            assert!(matches!(err, Error::InvalidBlockLength(l) if l == len));
        }
        assert!(written(&session).is_empty());
    }

    #[test]
    fn test_write_block_requires_address() {
        let mut session = connected(|_| {});
        let err = session.write_block(MemoryType::Flash, &[0, 0]).unwrap_err();
        assert!(matches!(err, Error::AddressNotSet(_)));
        assert!(written(&session).is_empty());
    }

    #[test]
    fn test_write_block_not_acknowledged() {
        let mut session = connected(|p| {
            p.reply(b"\r").reply(b"?");
        });
        session.set_address(0).unwrap();
        let err = session.write_block(MemoryType::Flash, &[1, 2]).unwrap_err();
        assert!(matches!(err, Error::CommandNotAcknowledged { observed: Some(b'?'), .. }));
        assert_eq!(session.address(), Some(0));
    }

    #[test]
    fn test_read_block_returns_data() {
        let mut session = connected(|p| {
            p.reply(b"\r").reply(&[1, 2, 3, 4]);
        });
        session.set_address(0x40).unwrap();
        session.port_mut().written.clear();

        let data = session.read_block(MemoryType::Flash, 4).unwrap();
        assert_eq!(data, [1, 2, 3, 4]);
        assert_eq!(written(&session), [b'g', 0x00, 0x04, b'F']);
        assert_eq!(session.address(), Some(0x44));
    }

    #[test]
    fn test_read_block_short_read() {
        let mut session = connected(|p| {
            p.reply(b"\r").reply(&[1, 2]).reply(b"\r").reply(&[1, 2]);
        });
        session.set_address(0).unwrap();
        let data = session.read_block(MemoryType::Eeprom, 8).unwrap();
        assert_eq!(data, [1, 2]);
        assert_eq!(session.address(), None);

        session.set_address(0).unwrap();
        let err = session.read_block_exact(MemoryType::Eeprom, 8).unwrap_err();
        assert!(matches!(
            err,
            Error::IncompleteTransfer {
                expected: 8,
                actual: 2
            }
        ));
    }

    #[test]
    fn test_read_block_restores_timeout() {
        let mut session = connected(|p| {
            p.reply(b"\r").silence();
        });
        session.set_address(0).unwrap();
        session.port_mut().set_timeout(Duration::from_millis(333)).unwrap();

        let data = session.read_block(MemoryType::Flash, 2).unwrap();
        assert!(data.is_empty());
        assert_eq!(session.port().timeout(), Duration::from_millis(333));
    }

    // ---- Queries ----

    #[test]
    fn test_software_version() {
        let mut session = connected(|p| {
            p.reply(b"17");
        });
        assert_eq!(session.get_software_version().unwrap().to_string(), "1.7");
        assert_eq!(written(&session), b"V");
    }

    #[test]
    fn test_software_version_unknown_on_timeout() {
        let mut session = connected(|p| {
            p.silence();
        });
        assert_eq!(
            session.get_software_version().unwrap(),
            SoftwareVersion::Unknown
        );
    }

    #[test]
    fn test_block_size() {
        let mut session = connected(|p| {
            p.reply(b"Y\x01\x00").reply(b"N").reply(b"Y\x00\x80");
        });
        assert_eq!(session.get_block_size().unwrap(), 256);
        assert_eq!(session.get_block_size().unwrap(), 0);
        assert_eq!(session.get_block_size().unwrap(), 128);
        assert_eq!(written(&session), b"bbb");
    }

    #[test]
    fn test_block_size_truncated() {
        let mut session = connected(|p| {
            p.reply(b"Y\x01");
        });
        assert!(matches!(
            session.get_block_size(),
            Err(Error::IncompleteTransfer {
                expected: 2,
                actual: 1
            })
        ));
    }

    #[test]
    fn test_auto_increment() {
        let mut session = connected(|p| {
            p.reply(b"Y").reply(b"N").silence();
        });
        assert!(session.supports_auto_increment().unwrap());
        assert!(!session.supports_auto_increment().unwrap());
        assert!(!session.supports_auto_increment().unwrap());
    }

    #[test]
    fn test_device_list() {
        let mut session = connected(|p| {
            p.reply(&[0x01, 0x02, 0x00]).reply(&[0x00]);
        });
        assert_eq!(session.get_device_list().unwrap(), [0x01, 0x02]);
        assert!(session.get_device_list().unwrap().is_empty());
        assert_eq!(written(&session), b"tt");
    }

    #[test]
    fn test_device_list_unterminated_ends_on_timeout() {
        let mut session = connected(|p| {
            p.reply(&[0x44, 0x45]);
        });
        assert_eq!(session.get_device_list().unwrap(), [0x44, 0x45]);
    }

    #[test]
    fn test_device_list_endless_stream_stops_at_deadline() {
        let mut session = connected(|p| {
            p.stream(0x44);
        });

        let started = Instant::now();
        let devices = session.get_device_list().unwrap();

        assert!(started.elapsed() >= Pacing::IMMEDIATE.device_list_deadline);
        assert!(!devices.is_empty());
        assert!(devices.iter().all(|&code| code == 0x44));
        assert!(session.state().is_verified());
    }

    #[test]
    fn test_device_list_deadline_on_hardware_is_two_seconds() {
        assert_eq!(Pacing::HARDWARE.device_list_deadline, Duration::from_secs(2));
    }

    #[test]
    fn test_device_list_leaves_bytes_after_terminator() {
        let mut session = connected(|p| {
            p.reply(&[0x44, 0x00, 0x0D]);
        });
        assert_eq!(session.get_device_list().unwrap(), [0x44]);
        assert_eq!(session.port().pending_rx(), 1);
    }

    #[test]
    fn test_device_signature() {
        let mut session = connected(|p| {
            p.reply(&[0x1E, 0x95, 0x87]).reply(&[0x1E]);
        });
        assert_eq!(session.get_device_signature().unwrap(), [0x1E, 0x95, 0x87]);
        assert!(matches!(
            session.get_device_signature(),
            Err(Error::IncompleteTransfer {
                expected: 3,
                actual: 1
            })
        ));
    }

    #[test]
    fn test_programmer_type_first_try() {
        let mut session = connected(|p| {
            p.reply(b"S");
        });
        assert_eq!(
            session.get_programmer_type().unwrap(),
            Some(ProgrammerType::Serial)
        );
        assert_eq!(written(&session), b"p");
    }

    #[test]
    fn test_programmer_type_retries() {
        let mut session = connected(|p| {
            p.silence().reply(b"?").reply(b"S");
        });
        assert_eq!(
            session.get_programmer_type().unwrap(),
            Some(ProgrammerType::Serial)
        );
        assert_eq!(written(&session), b"ppp");
    }

    #[test]
    fn test_programmer_type_gives_up_after_five_attempts() {
        let mut session = connected(|p| {
            for _ in 0..6 {
                p.silence();
            }
        });
        assert_eq!(session.get_programmer_type().unwrap(), None);
        assert_eq!(written(&session), b"ppppp");
        assert_eq!(session.port().pending_replies(), 1);
    }

    // ---- State machine ----

    #[test]
    fn test_commands_rejected_before_handshake() {
        let mut session = BootloaderSession::with_pacing(MockPort::new(), Pacing::IMMEDIATE);

        assert!(matches!(
            session.chip_erase(),
            Err(Error::InvalidState {
                state: SessionState::Disconnected,
                ..
            })
        ));
        assert!(session.get_device_signature().is_err());
        assert!(session.set_address(0).is_err());
        assert!(session.enter_program_mode().is_err());
        assert!(session.port().written.is_empty());
    }

    #[test]
    fn test_program_mode_transitions() {
        let mut session = connected(|p| {
            p.silence().reply(b"\r");
        });

        assert!(session.leave_program_mode().is_err());

        session.enter_program_mode().unwrap();
        assert_eq!(session.state(), SessionState::ProgramMode);
        assert!(matches!(
            session.enter_program_mode(),
            Err(Error::InvalidState { .. })
        ));

        session.leave_program_mode().unwrap();
        assert_eq!(session.state(), SessionState::Connected { verified: true });
        assert_eq!(written(&session), b"PL");
    }

    #[test]
    fn test_writes_allowed_in_program_mode() {
        let mut session = connected(|p| {
            p.silence().reply(b"\r").reply(b"\r");
        });
        session.enter_program_mode().unwrap();
        session.set_address(0).unwrap();
        session.write_block(MemoryType::Flash, &[0xFF, 0xFF]).unwrap();
    }

    #[test]
    fn test_exit_bootloader_disconnects() {
        let mut session = connected(|p| {
            p.reply(b"\r");
        });
        session.exit_bootloader().unwrap();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.get_device_signature().is_err());
    }

    #[test]
    fn test_exit_bootloader_disconnects_without_ack() {
        let mut session = connected(|p| {
            p.silence();
        });
        assert!(session.exit_bootloader().is_err());
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_transport_failure_disconnects() {
        let mut session = connected(|_| {});
        session.port_mut().fail_writes();

        let err = session.get_device_signature().unwrap_err();
        assert!(err.is_transport());
        assert_eq!(session.state(), SessionState::Disconnected);
    }
}
