//! Metal implementation of the `nngraph_core` device seam.

#[cfg(target_os = "macos")]
pub mod backend;
#[cfg(target_os = "macos")]
pub mod buffer;
#[cfg(target_os = "macos")]
pub mod device;
#[cfg(target_os = "macos")]
pub mod launch;

#[cfg(target_os = "macos")]
pub use backend::*;
#[cfg(target_os = "macos")]
pub use buffer::*;
#[cfg(target_os = "macos")]
pub use device::*;
#[cfg(target_os = "macos")]
pub use launch::*;

/// Whether this build can drive a Metal device at all.
pub const AVAILABLE: bool = cfg!(target_os = "macos");
