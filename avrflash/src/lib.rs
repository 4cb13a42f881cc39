//! # avrflash
//!
//! A library for programming AVR microcontrollers through an AVR109
//! (Butterfly) serial bootloader, as used by Caterina based boards.
//!
//! This crate provides the host side of the conversation:
//!
//! - Reset into the bootloader via the 1200 baud touch
//! - Handshake with bounded retries and identity check
//! - AVR109 command framing and acknowledgement checks
//! - Block transfers for flash and EEPROM
//! - A [`Programmer`] that erases, writes, reads and verifies whole images
//!
//! ## Supported Targets
//!
//! - ATmega32U4 (Leonardo, Micro, Pro Micro)
//! - ATmega328P
//!
//! ## Features
//!
//! - `native` (default): Native serial port support via the `serialport` crate
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use avrflash::{MemoryType, Programmer, TargetDevice};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = std::fs::read("sketch.bin")?;
//!
//!     #[cfg(feature = "native")]
//!     {
//!         let mut programmer = Programmer::open("/dev/ttyACM0", 115200, TargetDevice::Atmega32u4)?;
//!         programmer.connect(10)?;
//!         programmer.erase()?;
//!         programmer.write(MemoryType::Flash, 0, &image, &mut |done, total| {
//!             println!("{done}/{total}");
//!         })?;
//!         programmer.verify(MemoryType::Flash, 0, &image, &mut |_, _| {})?;
//!         programmer.finish()?;
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod device;
pub mod error;
pub mod port;
pub mod protocol;
pub mod session;
pub mod target;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications). Only the first
/// registration takes effect.
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator};
pub use {
    device::{DetectedPort, DeviceKind},
    error::{Error, Result},
    port::{Port, PortEnumerator, PortInfo, SerialConfig},
    protocol::avr109::{CommandFrame, MemoryType, Opcode, ProgrammerType, SoftwareVersion},
    session::{BootloaderSession, DEFAULT_HANDSHAKE_ATTEMPTS, SessionState},
    target::{DeviceInfo, Programmer, TargetDevice},
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_checker_default_false() {
        assert!(!is_interrupted_requested());
    }
}
