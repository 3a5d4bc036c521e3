//! OP-phase codec: device list and import
//!
//! Before a device is attached, a USB/IP connection speaks operation frames:
//! an 8-byte header (`version u16 | code u16 | status u32`, big-endian)
//! followed by an operation-specific body. Device records are 312 bytes; the
//! devlist variant appends a 4-byte entry per interface, the import variant
//! does not.
//!
//! Layouts follow the Linux kernel's USB/IP documentation
//! (`Documentation/usb/usbip_protocol.rst`).

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{ProtocolError, Result};
use crate::types::{BusId, ExportedDevice, UsbInterface, UsbSpeed};

/// The protocol version this codec implements
pub const USBIP_VERSION: u16 = 0x0111;

/// Retrieve the list of exported devices
pub const OP_REQ_DEVLIST: u16 = 0x8005;
/// Reply carrying the exported device list
pub const OP_REP_DEVLIST: u16 = 0x0005;
/// Import (attach) a remote device by bus id
pub const OP_REQ_IMPORT: u16 = 0x8003;
/// Reply to an import request
pub const OP_REP_IMPORT: u16 = 0x0003;

/// OP reply status: success
pub const OP_STATUS_OK: u32 = 0;
/// OP reply status: request refused
pub const OP_STATUS_ERROR: u32 = 1;

/// Fixed part of a device record
pub const DEVICE_RECORD_SIZE: usize = 312;

/// Upper bound on the device count a devlist reply may declare
const MAX_DEVLIST_DEVICES: u32 = 256;

/// Client request during the OP phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpRequest {
    /// `OP_REQ_DEVLIST`: no body
    DevList,
    /// `OP_REQ_IMPORT`: body is the 32-byte bus id
    Import { bus_id: BusId },
}

impl OpRequest {
    /// Read one operation request from the socket
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let version = reader.read_u16().await?;
        if version != USBIP_VERSION {
            return Err(ProtocolError::UnsupportedVersion {
                found: version,
                expected: USBIP_VERSION,
            });
        }
        let code = reader.read_u16().await?;
        let _status = reader.read_u32().await?;

        match code {
            OP_REQ_DEVLIST => Ok(OpRequest::DevList),
            OP_REQ_IMPORT => {
                let mut raw = [0u8; 32];
                reader.read_exact(&mut raw).await?;
                Ok(OpRequest::Import {
                    bus_id: BusId::from_wire(&raw)?,
                })
            }
            code => Err(ProtocolError::UnknownOp { code }),
        }
    }

    /// Serialize the request (client side; used by the tests)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(40);
        buf.extend_from_slice(&USBIP_VERSION.to_be_bytes());
        match self {
            OpRequest::DevList => {
                buf.extend_from_slice(&OP_REQ_DEVLIST.to_be_bytes());
                buf.extend_from_slice(&0u32.to_be_bytes());
            }
            OpRequest::Import { bus_id } => {
                buf.extend_from_slice(&OP_REQ_IMPORT.to_be_bytes());
                buf.extend_from_slice(&0u32.to_be_bytes());
                buf.extend_from_slice(&bus_id.to_wire());
            }
        }
        buf
    }
}

/// Server reply during the OP phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpReply {
    /// `OP_REP_DEVLIST`: device count plus one record per device
    DevList { devices: Vec<ExportedDevice> },
    /// `OP_REP_IMPORT`: status plus a device record on success
    Import {
        status: u32,
        device: Option<ExportedDevice>,
    },
}

impl OpReply {
    pub fn devlist(devices: Vec<ExportedDevice>) -> Self {
        OpReply::DevList { devices }
    }

    pub fn import_success(device: ExportedDevice) -> Self {
        OpReply::Import {
            status: OP_STATUS_OK,
            device: Some(device),
        }
    }

    pub fn import_failure() -> Self {
        OpReply::Import {
            status: OP_STATUS_ERROR,
            device: None,
        }
    }

    /// Serialize the reply
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(DEVICE_RECORD_SIZE + 12);
        buf.extend_from_slice(&USBIP_VERSION.to_be_bytes());
        match self {
            OpReply::DevList { devices } => {
                buf.extend_from_slice(&OP_REP_DEVLIST.to_be_bytes());
                buf.extend_from_slice(&OP_STATUS_OK.to_be_bytes());
                buf.extend_from_slice(&(devices.len() as u32).to_be_bytes());
                for dev in devices {
                    write_device_record(&mut buf, dev, true);
                }
            }
            OpReply::Import { status, device } => {
                buf.extend_from_slice(&OP_REP_IMPORT.to_be_bytes());
                buf.extend_from_slice(&status.to_be_bytes());
                if let Some(dev) = device {
                    write_device_record(&mut buf, dev, false);
                }
            }
        }
        buf
    }

    /// Read one operation reply (client side; used by the tests)
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let version = reader.read_u16().await?;
        if version != USBIP_VERSION {
            return Err(ProtocolError::UnsupportedVersion {
                found: version,
                expected: USBIP_VERSION,
            });
        }
        let code = reader.read_u16().await?;
        let status = reader.read_u32().await?;

        match code {
            OP_REP_DEVLIST => {
                let count = reader.read_u32().await?;
                if count > MAX_DEVLIST_DEVICES {
                    return Err(ProtocolError::MalformedFrame {
                        reason: "devlist declares an absurd device count",
                    });
                }
                let mut devices = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    devices.push(read_device_record(reader, true).await?);
                }
                Ok(OpReply::DevList { devices })
            }
            OP_REP_IMPORT => {
                let device = if status == OP_STATUS_OK {
                    Some(read_device_record(reader, false).await?)
                } else {
                    None
                };
                Ok(OpReply::Import { status, device })
            }
            code => Err(ProtocolError::UnknownOp { code }),
        }
    }
}

/// Append a 312-byte device record, plus interface triples for the devlist
fn write_device_record(buf: &mut Vec<u8>, dev: &ExportedDevice, with_interfaces: bool) {
    let mut path = [0u8; 256];
    let path_bytes = dev.path.as_bytes();
    let n = path_bytes.len().min(255);
    path[..n].copy_from_slice(&path_bytes[..n]);
    buf.extend_from_slice(&path);
    buf.extend_from_slice(&dev.bus_id.to_wire());
    buf.extend_from_slice(&dev.bus_num.to_be_bytes());
    buf.extend_from_slice(&dev.dev_num.to_be_bytes());
    buf.extend_from_slice(&dev.speed.wire_code().to_be_bytes());
    buf.extend_from_slice(&dev.vendor_id.to_be_bytes());
    buf.extend_from_slice(&dev.product_id.to_be_bytes());
    buf.extend_from_slice(&dev.bcd_device.to_be_bytes());
    buf.push(dev.device_class);
    buf.push(dev.sub_class);
    buf.push(dev.protocol);
    buf.push(dev.configuration_value);
    buf.push(dev.num_configurations);
    buf.push(dev.num_interfaces);
    if with_interfaces {
        for intf in &dev.interfaces {
            buf.push(intf.class);
            buf.push(intf.sub_class);
            buf.push(intf.protocol);
            buf.push(0);
        }
    }
}

async fn read_device_record<R: AsyncRead + Unpin>(
    reader: &mut R,
    with_interfaces: bool,
) -> Result<ExportedDevice> {
    let mut path_raw = [0u8; 256];
    reader.read_exact(&mut path_raw).await?;
    let path_len = path_raw.iter().position(|&b| b == 0).unwrap_or(256);
    let path = String::from_utf8_lossy(&path_raw[..path_len]).into_owned();

    let mut bus_id_raw = [0u8; 32];
    reader.read_exact(&mut bus_id_raw).await?;
    let bus_id = BusId::from_wire(&bus_id_raw)?;

    let bus_num = reader.read_u32().await?;
    let dev_num = reader.read_u32().await?;
    let speed_code = reader.read_u32().await?;
    let speed = UsbSpeed::from_wire_code(speed_code).ok_or(ProtocolError::MalformedFrame {
        reason: "unknown speed code in device record",
    })?;
    let vendor_id = reader.read_u16().await?;
    let product_id = reader.read_u16().await?;
    let bcd_device = reader.read_u16().await?;
    let device_class = reader.read_u8().await?;
    let sub_class = reader.read_u8().await?;
    let protocol = reader.read_u8().await?;
    let configuration_value = reader.read_u8().await?;
    let num_configurations = reader.read_u8().await?;
    let num_interfaces = reader.read_u8().await?;

    let mut interfaces = Vec::new();
    if with_interfaces {
        for _ in 0..num_interfaces {
            let mut raw = [0u8; 4];
            reader.read_exact(&mut raw).await?;
            interfaces.push(UsbInterface {
                class: raw[0],
                sub_class: raw[1],
                protocol: raw[2],
            });
        }
    }

    Ok(ExportedDevice {
        bus_id,
        path,
        bus_num,
        dev_num,
        speed,
        vendor_id,
        product_id,
        bcd_device,
        device_class,
        sub_class,
        protocol,
        configuration_value,
        num_configurations,
        num_interfaces,
        interfaces,
    })
}
