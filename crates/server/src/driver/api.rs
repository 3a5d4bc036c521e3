//! Typed surface of the kernel capture driver
//!
//! The capture driver exposes two device objects: the monitor control
//! device, which owns the filter set, and one stub device per captured USB
//! device. Everything the server asks of them goes through the two traits
//! here, so the attach pipeline and the URB engine stay independent of the
//! OS transport (`DeviceIoControl` on Windows, an in-process emulation in
//! tests).

use std::sync::Arc;

use common::Result;
use protocol::cmd::IsoPacket;
use protocol::types::ExportedDevice;

/// Driver interface major version this build speaks
pub const DRIVER_MAJOR: u32 = 1;
/// Minimum minor version required within [`DRIVER_MAJOR`]
pub const DRIVER_MINOR: u32 = 3;

/// Version reported by the monitor or a stub device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverVersion {
    pub major: u32,
    pub minor: u32,
}

impl DriverVersion {
    /// Compatible when the major matches and the minor is at least ours
    pub fn is_compatible(self) -> bool {
        self.major == DRIVER_MAJOR && self.minor >= DRIVER_MINOR
    }
}

/// Opaque pointer-shaped token the driver uses to identify a captured device
///
/// Only ever compared against the filter set; never dereferenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceToken(pub u64);

/// Identifier of an installed capture filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilterId(pub u32);

/// Capture filter: every field is an exact match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterSpec {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: u16,
    pub device_class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub port: u32,
}

impl FilterSpec {
    pub fn for_device(dev: &ExportedDevice) -> FilterSpec {
        FilterSpec {
            vendor_id: dev.vendor_id,
            product_id: dev.product_id,
            bcd_device: dev.bcd_device,
            device_class: dev.device_class,
            sub_class: dev.sub_class,
            protocol: dev.protocol,
            port: dev.dev_num,
        }
    }
}

/// A stub device interface published by the capture driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubCandidate {
    pub path: String,
    pub hub: u32,
    pub port: u32,
}

/// Operational state of an opened stub
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StubState {
    pub operational: bool,
    pub claimed: bool,
}

/// Transfer direction as seen from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// USB transfer type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Control,
    Bulk,
    Interrupt,
    Isochronous,
}

/// One URB handed to the driver
///
/// For control transfers the 8-byte setup packet and the data stage travel
/// as a single request; the driver reports a single completion.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub seqnum: u32,
    pub kind: TransferKind,
    pub ep: u8,
    pub direction: Direction,
    pub flags: u32,
    pub setup: [u8; 8],
    pub interval: u32,
    pub start_frame: u32,
    /// OUT payload; empty for IN
    pub buffer: Vec<u8>,
    /// Requested length (IN capacity, OUT payload size)
    pub buffer_length: u32,
    /// Scheduling descriptors for isochronous transfers
    pub iso_packets: Vec<IsoPacket>,
}

/// Completion of one URB
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    /// errno-style URB status, 0 on success
    pub status: i32,
    pub actual_length: u32,
    /// IN payload; empty for OUT
    pub data: Vec<u8>,
    pub start_frame: u32,
    /// Per-packet results for isochronous transfers
    pub iso_packets: Vec<IsoPacket>,
    pub error_count: u32,
}

impl TransferOutcome {
    pub fn failed(status: i32) -> TransferOutcome {
        TransferOutcome {
            status,
            actual_length: 0,
            data: Vec::new(),
            start_frame: 0,
            iso_packets: Vec::new(),
            error_count: 0,
        }
    }
}

/// Control device of the capture driver
pub trait MonitorApi: Send + Sync {
    fn version(&self) -> Result<DriverVersion>;

    /// Install a capture filter; the device is not re-enumerated yet
    fn add_filter(&self, filter: &FilterSpec) -> Result<FilterId>;

    fn remove_filter(&self, id: FilterId) -> Result<()>;

    /// Re-evaluate capture on currently present devices, physically
    /// re-enumerating whatever the filter set now matches
    fn run_filters(&self) -> Result<()>;

    /// Whether `token` belongs to a device held by the filter set
    fn owns_device(&self, token: DeviceToken) -> Result<bool>;

    /// Stub device interfaces currently published by the driver
    fn scan_stubs(&self) -> Result<Vec<StubCandidate>>;

    fn open_stub(&self, candidate: &StubCandidate) -> Result<Arc<dyn StubApi>>;
}

/// One captured device
///
/// `submit` blocks the calling thread until the URB completes or is
/// cancelled; callers run it off the async runtime. `cancel` may be called
/// from any thread while a submit for that seqnum is in flight.
pub trait StubApi: Send + Sync {
    fn version(&self) -> Result<DriverVersion>;
    fn state(&self) -> Result<StubState>;
    fn token(&self) -> Result<DeviceToken>;

    /// Returns the driver's claim verdict (`false` = not claimable)
    fn claim(&self, token: DeviceToken) -> Result<bool>;

    fn submit(&self, request: TransferRequest) -> Result<TransferOutcome>;
    fn cancel(&self, seqnum: u32);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_compatibility() {
        assert!(DriverVersion { major: DRIVER_MAJOR, minor: DRIVER_MINOR }.is_compatible());
        assert!(DriverVersion { major: DRIVER_MAJOR, minor: DRIVER_MINOR + 2 }.is_compatible());
        assert!(!DriverVersion { major: DRIVER_MAJOR + 1, minor: DRIVER_MINOR }.is_compatible());
        assert!(
            !DriverVersion {
                major: DRIVER_MAJOR,
                minor: DRIVER_MINOR.saturating_sub(1),
            }
            .is_compatible()
        );
    }

    #[test]
    fn filter_spec_keys_on_port_not_bus() {
        let dev = ExportedDevice {
            bus_id: protocol::BusId::new("2-7").unwrap(),
            path: String::new(),
            bus_num: 2,
            dev_num: 7,
            speed: protocol::UsbSpeed::Full,
            vendor_id: 0x04f9,
            product_id: 0x2042,
            bcd_device: 0x0100,
            device_class: 7,
            sub_class: 1,
            protocol: 2,
            configuration_value: 1,
            num_configurations: 1,
            num_interfaces: 1,
            interfaces: vec![],
        };
        let spec = FilterSpec::for_device(&dev);
        assert_eq!(spec.port, 7);
        assert_eq!(spec.vendor_id, 0x04f9);
        assert_eq!(spec.device_class, 7);
    }
}
