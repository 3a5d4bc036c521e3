//! CMD-phase codec: submit, unlink and their replies
//!
//! Once a device is imported the connection switches to command frames and
//! never returns to the OP phase. Every frame starts with a 48-byte header:
//! a 20-byte basic header (`command | seqnum | devid | direction | ep`, all
//! big-endian u32) followed by 28 command-specific bytes. Frames have no
//! length prefix; the body layout is selected by `command`.

use byteorder::{BigEndian, ByteOrder};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{ProtocolError, Result};

/// Submit an URB
pub const CMD_SUBMIT: u32 = 0x0000_0001;
/// Cancel an in-flight URB
pub const CMD_UNLINK: u32 = 0x0000_0002;
/// Reply to a submit
pub const RET_SUBMIT: u32 = 0x0000_0003;
/// Reply to an unlink
pub const RET_UNLINK: u32 = 0x0000_0004;

/// Host-to-device transfer
pub const DIR_OUT: u32 = 0;
/// Device-to-host transfer
pub const DIR_IN: u32 = 1;

/// `number_of_packets` value marking a non-isochronous transfer
pub const ISO_PACKETS_NONE: u32 = 0xFFFF_FFFF;

/// Size of the fixed frame header
pub const HEADER_SIZE: usize = 48;

/// Size of one isochronous packet descriptor
pub const ISO_DESCRIPTOR_SIZE: usize = 16;

/// Allocation ceiling for a single transfer buffer
pub const MAX_TRANSFER_SIZE: usize = 32 * 1024 * 1024;

/// Upper bound on isochronous packets per URB
const MAX_ISO_PACKETS: u32 = 1024;

/// Basic header shared by every CMD-phase frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdHeader {
    pub command: u32,
    pub seqnum: u32,
    pub devid: u32,
    pub direction: u32,
    pub ep: u32,
}

impl CmdHeader {
    /// Header for the reply to this frame: same routing fields, new command
    pub fn reply(&self, command: u32) -> CmdHeader {
        CmdHeader { command, ..*self }
    }

    pub fn is_in(&self) -> bool {
        self.direction == DIR_IN
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.command.to_be_bytes());
        buf.extend_from_slice(&self.seqnum.to_be_bytes());
        buf.extend_from_slice(&self.devid.to_be_bytes());
        buf.extend_from_slice(&self.direction.to_be_bytes());
        buf.extend_from_slice(&self.ep.to_be_bytes());
    }

    fn parse(raw: &[u8; HEADER_SIZE]) -> CmdHeader {
        CmdHeader {
            command: BigEndian::read_u32(&raw[0..4]),
            seqnum: BigEndian::read_u32(&raw[4..8]),
            devid: BigEndian::read_u32(&raw[8..12]),
            direction: BigEndian::read_u32(&raw[12..16]),
            ep: BigEndian::read_u32(&raw[16..20]),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.direction != DIR_OUT && self.direction != DIR_IN {
            return Err(ProtocolError::MalformedFrame {
                reason: "direction is neither IN nor OUT",
            });
        }
        if self.ep > 15 {
            return Err(ProtocolError::MalformedFrame {
                reason: "endpoint number above 15",
            });
        }
        Ok(())
    }
}

/// One isochronous packet descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IsoPacket {
    pub offset: u32,
    pub length: u32,
    pub actual_length: u32,
    pub status: i32,
}

impl IsoPacket {
    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.offset.to_be_bytes());
        buf.extend_from_slice(&self.length.to_be_bytes());
        buf.extend_from_slice(&self.actual_length.to_be_bytes());
        buf.extend_from_slice(&self.status.to_be_bytes());
    }

    fn parse(raw: &[u8]) -> IsoPacket {
        IsoPacket {
            offset: BigEndian::read_u32(&raw[0..4]),
            length: BigEndian::read_u32(&raw[4..8]),
            actual_length: BigEndian::read_u32(&raw[8..12]),
            status: BigEndian::read_i32(&raw[12..16]),
        }
    }
}

async fn read_iso_packets<R: AsyncRead + Unpin>(
    reader: &mut R,
    count: usize,
) -> Result<Vec<IsoPacket>> {
    let mut raw = vec![0u8; count * ISO_DESCRIPTOR_SIZE];
    reader.read_exact(&mut raw).await?;
    Ok(raw
        .chunks_exact(ISO_DESCRIPTOR_SIZE)
        .map(IsoPacket::parse)
        .collect())
}

/// Number of iso packets declared by a frame, normalized
fn iso_count(number_of_packets: u32) -> Result<usize> {
    match number_of_packets {
        ISO_PACKETS_NONE | 0 => Ok(0),
        n if n > MAX_ISO_PACKETS => Err(ProtocolError::MalformedFrame {
            reason: "isochronous packet count out of range",
        }),
        n => Ok(n as usize),
    }
}

/// `CMD_SUBMIT`: one URB from the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdSubmit {
    pub header: CmdHeader,
    pub transfer_flags: u32,
    pub transfer_buffer_length: u32,
    pub start_frame: u32,
    pub number_of_packets: u32,
    pub interval: u32,
    /// Control setup packet; all zero for non-control transfers
    pub setup: [u8; 8],
    /// Payload for OUT transfers, empty for IN
    pub data: Vec<u8>,
    pub iso_packets: Vec<IsoPacket>,
}

impl CmdSubmit {
    pub fn is_iso(&self) -> bool {
        !self.iso_packets.is_empty()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.data.len());
        self.header.write_to(&mut buf);
        buf.extend_from_slice(&self.transfer_flags.to_be_bytes());
        buf.extend_from_slice(&self.transfer_buffer_length.to_be_bytes());
        buf.extend_from_slice(&self.start_frame.to_be_bytes());
        buf.extend_from_slice(&self.number_of_packets.to_be_bytes());
        buf.extend_from_slice(&self.interval.to_be_bytes());
        buf.extend_from_slice(&self.setup);
        buf.extend_from_slice(&self.data);
        for pkt in &self.iso_packets {
            pkt.write_to(&mut buf);
        }
        buf
    }

    async fn read_body<R: AsyncRead + Unpin>(
        reader: &mut R,
        header: CmdHeader,
        tail: &[u8],
    ) -> Result<CmdSubmit> {
        let transfer_flags = BigEndian::read_u32(&tail[0..4]);
        let transfer_buffer_length = BigEndian::read_u32(&tail[4..8]);
        let start_frame = BigEndian::read_u32(&tail[8..12]);
        let number_of_packets = BigEndian::read_u32(&tail[12..16]);
        let interval = BigEndian::read_u32(&tail[16..20]);
        let mut setup = [0u8; 8];
        setup.copy_from_slice(&tail[20..28]);

        if transfer_buffer_length as usize > MAX_TRANSFER_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: transfer_buffer_length as usize,
                max: MAX_TRANSFER_SIZE,
            });
        }

        let data = if header.direction == DIR_OUT {
            let mut data = vec![0u8; transfer_buffer_length as usize];
            reader.read_exact(&mut data).await?;
            data
        } else {
            Vec::new()
        };

        let packets = iso_count(number_of_packets)?;
        let iso_packets = read_iso_packets(reader, packets).await?;
        if packets > 0 {
            let declared: u64 = iso_packets.iter().map(|p| u64::from(p.length)).sum();
            if declared != u64::from(transfer_buffer_length) {
                return Err(ProtocolError::MalformedFrame {
                    reason: "iso packet lengths do not sum to the transfer length",
                });
            }
        }

        Ok(CmdSubmit {
            header,
            transfer_flags,
            transfer_buffer_length,
            start_frame,
            number_of_packets,
            interval,
            setup,
            data,
            iso_packets,
        })
    }
}

/// `CMD_UNLINK`: cancel the URB submitted under `unlink_seqnum`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdUnlink {
    pub header: CmdHeader,
    pub unlink_seqnum: u32,
}

impl CmdUnlink {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        self.header.write_to(&mut buf);
        buf.extend_from_slice(&self.unlink_seqnum.to_be_bytes());
        buf.extend_from_slice(&[0u8; 24]);
        buf
    }
}

/// A decoded CMD-phase frame from the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Submit(CmdSubmit),
    Unlink(CmdUnlink),
}

impl Command {
    /// Read one command frame from the socket
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Command> {
        let mut raw = [0u8; HEADER_SIZE];
        reader.read_exact(&mut raw).await?;
        let header = CmdHeader::parse(&raw);
        header.validate()?;
        let tail = &raw[20..];

        match header.command {
            CMD_SUBMIT => Ok(Command::Submit(
                CmdSubmit::read_body(reader, header, tail).await?,
            )),
            CMD_UNLINK => Ok(Command::Unlink(CmdUnlink {
                header,
                unlink_seqnum: BigEndian::read_u32(&tail[0..4]),
            })),
            code => Err(ProtocolError::UnknownCommand { code }),
        }
    }

    pub fn header(&self) -> &CmdHeader {
        match self {
            Command::Submit(s) => &s.header,
            Command::Unlink(u) => &u.header,
        }
    }
}

/// `RET_SUBMIT`: completion of one URB
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetSubmit {
    pub header: CmdHeader,
    pub status: i32,
    pub actual_length: u32,
    pub start_frame: u32,
    pub number_of_packets: u32,
    pub error_count: u32,
    /// Payload for IN transfers, empty for OUT
    pub data: Vec<u8>,
    pub iso_packets: Vec<IsoPacket>,
}

impl RetSubmit {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.data.len());
        self.header.write_to(&mut buf);
        buf.extend_from_slice(&self.status.to_be_bytes());
        buf.extend_from_slice(&self.actual_length.to_be_bytes());
        buf.extend_from_slice(&self.start_frame.to_be_bytes());
        buf.extend_from_slice(&self.number_of_packets.to_be_bytes());
        buf.extend_from_slice(&self.error_count.to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]);
        buf.extend_from_slice(&self.data);
        for pkt in &self.iso_packets {
            pkt.write_to(&mut buf);
        }
        buf
    }
}

/// `RET_UNLINK`: outcome of a cancel request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetUnlink {
    pub header: CmdHeader,
    pub status: i32,
}

impl RetUnlink {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        self.header.write_to(&mut buf);
        buf.extend_from_slice(&self.status.to_be_bytes());
        buf.extend_from_slice(&[0u8; 24]);
        buf
    }
}

/// A decoded CMD-phase reply (client side; used by the tests)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Submit(RetSubmit),
    Unlink(RetUnlink),
}

impl Reply {
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Reply> {
        let mut raw = [0u8; HEADER_SIZE];
        reader.read_exact(&mut raw).await?;
        let header = CmdHeader::parse(&raw);
        let tail = &raw[20..];

        match header.command {
            RET_SUBMIT => {
                let status = BigEndian::read_i32(&tail[0..4]);
                let actual_length = BigEndian::read_u32(&tail[4..8]);
                let start_frame = BigEndian::read_u32(&tail[8..12]);
                let number_of_packets = BigEndian::read_u32(&tail[12..16]);
                let error_count = BigEndian::read_u32(&tail[16..20]);

                if actual_length as usize > MAX_TRANSFER_SIZE {
                    return Err(ProtocolError::FrameTooLarge {
                        size: actual_length as usize,
                        max: MAX_TRANSFER_SIZE,
                    });
                }

                let data = if header.direction == DIR_IN {
                    let mut data = vec![0u8; actual_length as usize];
                    reader.read_exact(&mut data).await?;
                    data
                } else {
                    Vec::new()
                };
                let packets = iso_count(number_of_packets)?;
                let iso_packets = read_iso_packets(reader, packets).await?;

                Ok(Reply::Submit(RetSubmit {
                    header,
                    status,
                    actual_length,
                    start_frame,
                    number_of_packets,
                    error_count,
                    data,
                    iso_packets,
                }))
            }
            RET_UNLINK => Ok(Reply::Unlink(RetUnlink {
                header,
                status: BigEndian::read_i32(&tail[0..4]),
            })),
            code => Err(ProtocolError::UnknownCommand { code }),
        }
    }
}
