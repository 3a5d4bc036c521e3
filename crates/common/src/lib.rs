//! Shared utilities for the usbipd workspace
//!
//! Carries the pieces every other crate needs: the server-wide error
//! taxonomy and the tracing subscriber setup.

pub mod error;
pub mod logging;

pub use error::{Error, Result};
pub use logging::setup_logging;
