//! Protocol implementations.

pub mod avr109;

// Re-export common types
pub use avr109::{CommandFrame, MemoryType, Opcode, ProgrammerType, SoftwareVersion};
