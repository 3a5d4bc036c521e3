//! Kernel capture driver shim
//!
//! Split into the typed driver surface ([`api`]), the attach logic built on
//! top of it ([`shim`]), and an in-process emulation used by the tests and
//! the loopback mode ([`emulated`]). The Windows transport lives in
//! [`crate::windows`].

pub mod api;
pub mod emulated;
pub mod shim;

pub use api::{
    DeviceToken, Direction, DriverVersion, FilterId, FilterSpec, MonitorApi, StubApi,
    StubCandidate, StubState, TransferKind, TransferOutcome, TransferRequest,
};
pub use shim::{CLAIM_POLL_INTERVAL, CLAIM_TIMEOUT, CaptureShim, ClaimedDevice, FilterGuard};
