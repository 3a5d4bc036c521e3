//! Host USB device enumeration
//!
//! Produces the list of currently present USB devices as
//! [`ExportedDevice`] snapshots. The Windows implementation walks the
//! SetupAPI device-interface sets; the emulated host implements the same
//! trait over its synthetic devices.

use common::Result;
use protocol::types::ExportedDevice;

/// Source of present host devices
///
/// The sequence is ordered lexicographically by bus id and is stable for a
/// single call. Hubs are enumerated like any other device. Implementations
/// skip individual devices they cannot read (with a logged warning) and
/// fail only when the OS denies device-info access altogether.
pub trait DeviceEnumerator: Send + Sync {
    fn enumerate(&self) -> Result<Vec<ExportedDevice>>;
}

/// Order devices the way `enumerate` must return them
pub fn sort_by_bus_id(devices: &mut [ExportedDevice]) {
    devices.sort_by(|a, b| a.bus_id.as_str().cmp(b.bus_id.as_str()));
}

/// Find a present device by its bus id
pub fn find_device(
    enumerator: &dyn DeviceEnumerator,
    bus_id: &protocol::BusId,
) -> Result<Option<ExportedDevice>> {
    Ok(enumerator
        .enumerate()?
        .into_iter()
        .find(|d| &d.bus_id == bus_id))
}
