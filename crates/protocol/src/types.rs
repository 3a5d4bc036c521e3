//! USB/IP wire-level type definitions
//!
//! The types here mirror what actually crosses the wire: a device snapshot
//! as carried by the OP_REP_DEVLIST / OP_REP_IMPORT device record, plus the
//! bus id and speed encodings. Host-side state (handles, filters) lives in
//! the server crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ProtocolError;

/// Maximum bus id length on the wire (the 32-byte field keeps a NUL)
pub const BUS_ID_MAX: usize = 31;

/// Human-readable device location, form `<hub>-<port>`
///
/// ASCII, at most 31 bytes; NUL-padded to 32 bytes on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BusId(String);

impl TryFrom<String> for BusId {
    type Error = ProtocolError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<BusId> for String {
    fn from(bus_id: BusId) -> String {
        bus_id.0
    }
}

impl BusId {
    /// Parse a bus id, rejecting anything that cannot cross the wire
    pub fn new(s: impl Into<String>) -> Result<Self, ProtocolError> {
        let s = s.into();
        if s.is_empty() || s.len() > BUS_ID_MAX || !s.is_ascii() || s.bytes().any(|b| b == 0) {
            return Err(ProtocolError::InvalidBusId(s));
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// NUL-padded 32-byte wire form
    pub fn to_wire(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out[..self.0.len()].copy_from_slice(self.0.as_bytes());
        out
    }

    /// Parse the 32-byte wire field (bytes up to the first NUL)
    pub fn from_wire(raw: &[u8; 32]) -> Result<Self, ProtocolError> {
        let len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        let s = std::str::from_utf8(&raw[..len])
            .map_err(|_| ProtocolError::MalformedFrame {
                reason: "bus id is not valid ASCII",
            })?
            .to_owned();
        Self::new(s)
    }
}

impl fmt::Display for BusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BusId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// USB device speed with its USB/IP wire code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UsbSpeed {
    /// 1.5 Mbps
    Low,
    /// 12 Mbps
    Full,
    /// 480 Mbps
    High,
    /// 5 Gbps and up
    Super,
}

impl UsbSpeed {
    /// Numeric code used in device records
    pub fn wire_code(self) -> u32 {
        match self {
            UsbSpeed::Low => 1,
            UsbSpeed::Full => 2,
            UsbSpeed::High => 3,
            UsbSpeed::Super => 5,
        }
    }

    pub fn from_wire_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(UsbSpeed::Low),
            2 => Some(UsbSpeed::Full),
            3 => Some(UsbSpeed::High),
            5 => Some(UsbSpeed::Super),
            _ => None,
        }
    }
}

/// One interface entry of a devlist device record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbInterface {
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
}

/// Immutable snapshot of an enumerated device, as exported over USB/IP
///
/// `path` is the host-internal handle path; it fills the record's 256-byte
/// path field but carries no meaning for the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedDevice {
    pub bus_id: BusId,
    pub path: String,
    pub bus_num: u32,
    pub dev_num: u32,
    pub speed: UsbSpeed,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: u16,
    pub device_class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub configuration_value: u8,
    pub num_configurations: u8,
    pub num_interfaces: u8,
    /// Interface triples for the devlist record trailer
    ///
    /// Empty on devices decoded from an import reply, which carries the
    /// interface count but not the triples.
    pub interfaces: Vec<UsbInterface>,
}

impl ExportedDevice {
    /// Device id as used by the CMD header: `(bus_num << 16) | dev_num`
    pub fn devid(&self) -> u32 {
        (self.bus_num << 16) | self.dev_num
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_id_wire_roundtrip() {
        let id = BusId::new("1-2").unwrap();
        let wire = id.to_wire();
        assert_eq!(&wire[..3], b"1-2");
        assert!(wire[3..].iter().all(|&b| b == 0));
        assert_eq!(BusId::from_wire(&wire).unwrap(), id);
    }

    #[test]
    fn bus_id_rejects_oversize_and_non_ascii() {
        assert!(BusId::new("x".repeat(32)).is_err());
        assert!(BusId::new("").is_err());
        assert!(BusId::new("1-\u{e9}").is_err());
        assert!(BusId::new("x".repeat(31)).is_ok());
    }

    #[test]
    fn speed_codes_match_the_wire() {
        assert_eq!(UsbSpeed::Low.wire_code(), 1);
        assert_eq!(UsbSpeed::Full.wire_code(), 2);
        assert_eq!(UsbSpeed::High.wire_code(), 3);
        assert_eq!(UsbSpeed::Super.wire_code(), 5);
        assert_eq!(UsbSpeed::from_wire_code(4), None);
        assert_eq!(UsbSpeed::from_wire_code(5), Some(UsbSpeed::Super));
    }

    #[test]
    fn devid_packs_bus_and_device_number() {
        let dev = ExportedDevice {
            bus_id: BusId::new("1-2").unwrap(),
            path: String::new(),
            bus_num: 1,
            dev_num: 2,
            speed: UsbSpeed::High,
            vendor_id: 0x1234,
            product_id: 0x5678,
            bcd_device: 0x0100,
            device_class: 0,
            sub_class: 0,
            protocol: 0,
            configuration_value: 1,
            num_configurations: 1,
            num_interfaces: 0,
            interfaces: vec![],
        };
        assert_eq!(dev.devid(), 0x0001_0002);
    }
}
