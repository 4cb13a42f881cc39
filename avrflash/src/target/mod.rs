//! Target device profiles and whole-image programming.

pub mod chip;
pub mod programmer;

pub use chip::TargetDevice;
pub use programmer::{DeviceInfo, FALLBACK_BLOCK_SIZE, Programmer};
