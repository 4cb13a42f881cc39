//! Supported target microcontrollers.

use std::fmt;

use crate::protocol::avr109::MemoryType;

/// Target devices with a known memory layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TargetDevice {
    /// ATmega328P (Uno class boards with an AVR109 bootloader).
    Atmega328p,
    /// ATmega32U4 (Leonardo, Micro, Pro Micro).
    #[default]
    Atmega32u4,
}

impl TargetDevice {
    /// All supported targets.
    pub const ALL: [Self; 2] = [Self::Atmega328p, Self::Atmega32u4];

    /// Get the target from a string name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "atmega328p" | "m328p" | "328p" => Some(Self::Atmega328p),
            "atmega32u4" | "m32u4" | "32u4" => Some(Self::Atmega32u4),
            _ => None,
        }
    }

    /// Find the target reporting this signature.
    pub fn from_signature(signature: [u8; 3]) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.signature() == signature)
    }

    /// Device signature bytes as returned by `'s'`.
    #[must_use]
    pub fn signature(&self) -> [u8; 3] {
        match self {
            Self::Atmega328p => [0x1E, 0x95, 0x0F],
            Self::Atmega32u4 => [0x1E, 0x95, 0x87],
        }
    }

    /// Flash size in bytes.
    #[must_use]
    pub fn flash_size(&self) -> u32 {
        32 * 1024
    }

    /// EEPROM size in bytes.
    #[must_use]
    pub fn eeprom_size(&self) -> u32 {
        1024
    }

    /// Size of the given memory in bytes.
    #[must_use]
    pub fn memory_size(&self, memory: MemoryType) -> u32 {
        match memory {
            MemoryType::Flash => self.flash_size(),
            MemoryType::Eeprom => self.eeprom_size(),
        }
    }
}

impl fmt::Display for TargetDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Atmega328p => write!(f, "ATmega328P"),
            Self::Atmega32u4 => write!(f, "ATmega32U4"),
        }
    }
}
