//! USB/IP wire protocol for the usbipd server
//!
//! This crate implements the USB/IP protocol (version `0x0111`) bit-exactly:
//! big-endian fixed-width fields, no length prefixes, framing derived from
//! the operation / command code. It is split into the two sub-codecs a
//! connection moves through:
//!
//! - [`op`] — the pre-attach phase: `OP_REQ_DEVLIST` and `OP_REQ_IMPORT`
//!   with their replies and 312-byte device records.
//! - [`cmd`] — the post-attach phase: `CMD_SUBMIT` / `CMD_UNLINK` and the
//!   matching `RET_` replies, including isochronous packet descriptors.
//!
//! The codec performs no I/O policy of its own: requests are read from any
//! [`tokio::io::AsyncRead`], replies are built as byte vectors.
//!
//! # Example
//!
//! ```
//! use protocol::op::OpRequest;
//!
//! // An OP_REQ_DEVLIST is the 8-byte header alone.
//! let bytes = OpRequest::DevList.to_bytes();
//! assert_eq!(bytes, [0x01, 0x11, 0x80, 0x05, 0, 0, 0, 0]);
//! ```

pub mod cmd;
pub mod error;
pub mod op;
pub mod status;
pub mod types;

pub use cmd::{
    CMD_SUBMIT, CMD_UNLINK, CmdHeader, CmdSubmit, CmdUnlink, Command, DIR_IN, DIR_OUT,
    ISO_PACKETS_NONE, IsoPacket, RET_SUBMIT, RET_UNLINK, Reply, RetSubmit, RetUnlink,
};
pub use error::{ProtocolError, Result};
pub use op::{OP_REQ_DEVLIST, OP_REQ_IMPORT, OP_STATUS_ERROR, OP_STATUS_OK, OpReply, OpRequest,
    USBIP_VERSION};
pub use types::{BusId, ExportedDevice, UsbInterface, UsbSpeed};
