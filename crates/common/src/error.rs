//! Server-wide error taxonomy

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The kernel capture driver returned a non-success code
    #[error("capture driver error (rc {rc})")]
    Driver { rc: i32 },

    /// The installed capture driver does not match this build
    #[error("unsupported capture driver version {found_major}.{found_minor} (need {expected_major}.>={expected_minor})")]
    UnsupportedDriver {
        found_major: u32,
        found_minor: u32,
        expected_major: u32,
        expected_minor: u32,
    },

    /// The device disappeared during claim or operation
    #[error("device is gone")]
    DeviceGone,

    /// The capture driver refused to hand the device over
    #[error("device could not be claimed")]
    NotClaimable,

    /// The captured device did not re-enumerate within the claim window
    #[error("timed out waiting for the captured device to re-enumerate")]
    ClaimTimeout,

    /// Another attachment already holds this bus id
    #[error("bus id {0} is already attached")]
    AlreadyAttached(String),

    /// The bus id is not marked shared
    #[error("bus id {0} is not shared")]
    NotShared(String),

    /// The OS denied access to device information
    #[error("device enumeration failed: {0}")]
    EnumerationFailed(String),

    /// Submit refused because the endpoint halt feature is set
    #[error("endpoint {0:#04x} is halted")]
    EndpointHalted(u8),

    /// Wire protocol violation
    #[error(transparent)]
    Protocol(#[from] protocol::ProtocolError),

    /// I/O error on the socket or a handle
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// A channel or task endpoint went away
    #[error("channel error: {0}")]
    Channel(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Map to the URB status code reported in `RET_SUBMIT`
    pub fn urb_status(&self) -> i32 {
        match self {
            Error::DeviceGone => protocol::status::ENODEV,
            Error::EndpointHalted(_) => protocol::status::EPIPE,
            Error::Driver { .. } => protocol::status::EIO,
            _ => protocol::status::EIO,
        }
    }
}
