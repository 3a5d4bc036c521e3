//! Windows platform layer
//!
//! Everything that touches Win32 lives here: the DeviceIoControl transport
//! for the capture driver, the SetupAPI device enumerator, and Service
//! Control Manager hosting.

#![cfg(windows)]

pub mod driver;
pub mod enumerator;
pub mod service;

pub use driver::WinMonitor;
pub use enumerator::WinEnumerator;
