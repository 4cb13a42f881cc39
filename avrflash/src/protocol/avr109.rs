//! AVR109 (Butterfly) bootloader commands and replies.
//!
//! Only the subset needed to program a single target is implemented.
//!
//! ## Frame Format
//!
//! Every command starts with a single ASCII opcode. Parameters follow
//! without any framing, multi-byte fields are big-endian:
//!
//! ```text
//! +--------+----------+----------+---------+-----------------+
//! | Opcode |  Field   |  Field   | MemType |     Payload     |
//! +--------+----------+----------+---------+-----------------+
//! |   'A'  | addr_hi  | addr_lo  |         |                 |
//! |   'B'  | len_hi   | len_lo   | 'F'/'E' | len bytes       |
//! |   'g'  | len_hi   | len_lo   | 'F'/'E' |                 |
//! | others |          |          |         |                 |
//! +--------+----------+----------+---------+-----------------+
//! ```
//!
//! There is no checksum and no resynchronisation marker. Replies are either
//! fixed size, zero terminated (`'t'`) or a single carriage return
//! acknowledgement.

use byteorder::{BigEndian, WriteBytesExt};
use std::fmt;

/// Acknowledgement byte sent after a successfully executed command.
pub const ACK: u8 = b'\r';

/// Identifier returned by a compatible bootloader for [`Opcode::ReadBootloaderId`].
pub const BOOTLOADER_ID: &[u8; 7] = b"AVRBOOT";

/// Positive answer to yes/no queries (`'a'`, `'b'`).
pub const YES: u8 = b'Y';

/// Programmer type byte of a serial AVR109 programmer.
pub const PROGRAMMER_TYPE_SERIAL: u8 = b'S';

/// Terminator of the supported device code list.
pub const DEVICE_LIST_END: u8 = 0x00;

/// Largest length encodable in the 16-bit length field, rounded to a word.
pub const MAX_BLOCK_LEN: usize = 0xFFFE;

/// Command opcodes of the supported subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Set word address (`'A'`).
    SetAddress = b'A',
    /// Start block load (`'B'`).
    BlockLoad = b'B',
    /// Start block read (`'g'`).
    BlockRead = b'g',
    /// Erase the application section (`'e'`).
    ChipErase = b'e',
    /// Enter programming mode (`'P'`).
    EnterProgramMode = b'P',
    /// Leave programming mode (`'L'`).
    LeaveProgramMode = b'L',
    /// Exit the bootloader and run the application (`'E'`).
    ExitBootloader = b'E',
    /// Query auto-increment support (`'a'`).
    AutoIncrement = b'a',
    /// Query block mode support and buffer size (`'b'`).
    BlockSize = b'b',
    /// Return the 7 byte bootloader identifier (`'S'`).
    ReadBootloaderId = b'S',
    /// Return software version (`'V'`).
    SoftwareVersion = b'V',
    /// Return programmer type (`'p'`).
    ProgrammerType = b'p',
    /// Return supported device codes (`'t'`).
    DeviceList = b't',
    /// Read the 3 byte device signature (`'s'`).
    ReadSignature = b's',
}

impl Opcode {
    /// The opcode byte on the wire.
    pub fn byte(self) -> u8 {
        self as u8
    }

    /// Human-readable name used in logs and errors.
    pub fn label(self) -> &'static str {
        match self {
            Self::SetAddress => "set address",
            Self::BlockLoad => "block load",
            Self::BlockRead => "block read",
            Self::ChipErase => "chip erase",
            Self::EnterProgramMode => "enter program mode",
            Self::LeaveProgramMode => "leave program mode",
            Self::ExitBootloader => "exit bootloader",
            Self::AutoIncrement => "auto-increment query",
            Self::BlockSize => "block size query",
            Self::ReadBootloaderId => "bootloader id query",
            Self::SoftwareVersion => "software version query",
            Self::ProgrammerType => "programmer type query",
            Self::DeviceList => "device list query",
            Self::ReadSignature => "signature read",
        }
    }
}

/// Memory addressed by block commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MemoryType {
    /// Program flash (`'F'`).
    Flash,
    /// Data EEPROM (`'E'`).
    Eeprom,
}

impl MemoryType {
    /// The memory type byte on the wire.
    pub fn byte(self) -> u8 {
        match self {
            Self::Flash => b'F',
            Self::Eeprom => b'E',
        }
    }

    /// Parse a memory type byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'F' => Some(Self::Flash),
            b'E' => Some(Self::Eeprom),
            _ => None,
        }
    }

    /// Lowercase name of the memory.
    pub fn name(self) -> &'static str {
        match self {
            Self::Flash => "flash",
            Self::Eeprom => "eeprom",
        }
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// AVR109 command frame builder.
///
/// Lengths and addresses are validated by the session before a frame is
/// built; the builder only lays out bytes.
#[derive(Debug, Clone)]
pub struct CommandFrame {
    opcode: Opcode,
    params: Vec<u8>,
}

impl CommandFrame {
    /// Create a frame consisting of the opcode only.
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            params: Vec::new(),
        }
    }

    /// Build set address frame (`'A' hi lo`) from a word address.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn set_address(word_address: u16) -> Self {
        let mut frame = Self::new(Opcode::SetAddress);
        frame.params.write_u16::<BigEndian>(word_address).unwrap();
        frame
    }

    /// Build block load header (`'B' len_hi len_lo memtype`).
    ///
    /// The payload is sent separately right after the header.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn block_load(memory: MemoryType, len: u16) -> Self {
        let mut frame = Self::new(Opcode::BlockLoad);
        frame.params.write_u16::<BigEndian>(len).unwrap();
        frame.params.push(memory.byte());
        frame
    }

    /// Build block read frame (`'g' len_hi len_lo memtype`).
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn block_read(memory: MemoryType, len: u16) -> Self {
        let mut frame = Self::new(Opcode::BlockRead);
        frame.params.write_u16::<BigEndian>(len).unwrap();
        frame.params.push(memory.byte());
        frame
    }

    /// Build the complete frame data.
    pub fn build(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + self.params.len());
        buf.push(self.opcode.byte());
        buf.extend_from_slice(&self.params);
        buf
    }

    /// Get the opcode.
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }
}

/// Bootloader software version reported by `'V'`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum SoftwareVersion {
    /// Version digits as reported by the device.
    Known {
        /// Major version.
        major: u8,
        /// Minor version.
        minor: u8,
    },
    /// The device did not answer with two bytes.
    Unknown,
}

impl SoftwareVersion {
    /// Decode the reply to `'V'`: two ASCII digits, major first.
    pub fn from_reply(reply: &[u8]) -> Self {
        match reply {
            [major, minor, ..] => Self::Known {
                major: major.wrapping_sub(b'0'),
                minor: minor.wrapping_sub(b'0'),
            },
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for SoftwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known { major, minor } => write!(f, "{major}.{minor}"),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

/// Programmer type reported by `'p'`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum ProgrammerType {
    /// Serial programmer (`'S'`).
    Serial,
}

impl ProgrammerType {
    /// Parse a programmer type byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        (byte == PROGRAMMER_TYPE_SERIAL).then_some(Self::Serial)
    }
}

impl fmt::Display for ProgrammerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial => f.write_str("serial"),
        }
    }
}

/// Check if a bootloader id reply identifies a compatible bootloader.
pub fn is_bootloader_id(reply: &[u8]) -> bool {
    reply == BOOTLOADER_ID
}
