//! URB status codes carried in RET frames
//!
//! The Linux VHCI driver interprets these as negative errno values, so the
//! server speaks errno regardless of the host OS.

/// Transfer completed successfully
pub const SUCCESS: i32 = 0;
/// Endpoint stalled (`-EPIPE`)
pub const EPIPE: i32 = -32;
/// Device is gone (`-ENODEV`)
pub const ENODEV: i32 = -19;
/// Generic transfer failure (`-EIO`)
pub const EIO: i32 = -5;
/// Transfer timed out (`-ETIMEDOUT`)
pub const ETIMEDOUT: i32 = -110;
/// Buffer overflow / babble (`-EOVERFLOW`)
pub const EOVERFLOW: i32 = -75;
/// Urb was unlinked or the attachment shut down (`-ECONNRESET`)
pub const ECONNRESET: i32 = -104;
/// Request rejected by the host stack (`-EINVAL`)
pub const EINVAL: i32 = -22;
