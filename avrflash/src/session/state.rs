//! Session states and transition guards.
//!
//! ```text
//!                 connect_and_verify()
//!  Disconnected ─────────────► Resetting
//!       ▲                          │ port reopened
//!       │                          ▼
//!       │                 Connected { verified: false }
//!       │                          │ bootloader id matched
//!       │                          ▼
//!       ├──────────────── Connected { verified: true } ◄──┐
//!       │  exit / I/O error        │ enter_program_mode   │ leave_program_mode
//!       │                          ▼                      │
//!       └──────────────────── ProgramMode ────────────────┘
//! ```

use std::fmt;

/// Lifecycle state of a bootloader session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No usable channel, or the bootloader was exited.
    #[default]
    Disconnected,
    /// Reset hint sent, waiting for the channel to come back.
    Resetting,
    /// Channel open; `verified` once the bootloader id matched.
    Connected {
        /// Whether the handshake confirmed a compatible bootloader.
        verified: bool,
    },
    /// Bootloader is in programming mode.
    ProgramMode,
}

impl SessionState {
    /// Whether a compatible bootloader is known to be listening.
    pub fn is_verified(self) -> bool {
        matches!(self, Self::Connected { verified: true } | Self::ProgramMode)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Resetting => f.write_str("resetting"),
            Self::Connected { verified: false } => f.write_str("connected (unverified)"),
            Self::Connected { verified: true } => f.write_str("connected"),
            Self::ProgramMode => f.write_str("in program mode"),
        }
    }
}
