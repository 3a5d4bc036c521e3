//! SetupAPI-based device enumeration
//!
//! Walks the `GUID_DEVINTERFACE_USB_DEVICE` interface class and lifts each
//! present device into an [`ExportedDevice`]. The device descriptor, speed
//! and configuration data come from the parent hub via
//! `IOCTL_USB_GET_NODE_CONNECTION_INFORMATION_EX`; interface triples are
//! parsed out of the configuration descriptor fetched through the same hub
//! connection.

#![cfg(windows)]

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::Arc;

use common::{Error, Result};
use protocol::types::{BusId, ExportedDevice, UsbInterface, UsbSpeed};
use tracing::warn;
use windows::Win32::Devices::DeviceAndDriverInstallation::{
    CM_Get_Parent, CR_SUCCESS, DIGCF_DEVICEINTERFACE, DIGCF_PRESENT, HDEVINFO,
    SP_DEVICE_INTERFACE_DATA, SP_DEVICE_INTERFACE_DETAIL_DATA_W, SP_DEVINFO_DATA,
    SPDRP_ADDRESS, SPDRP_BUSNUMBER, SetupDiDestroyDeviceInfoList, SetupDiEnumDeviceInfo,
    SetupDiEnumDeviceInterfaces, SetupDiGetClassDevsW, SetupDiGetDeviceInstanceIdW,
    SetupDiGetDeviceInterfaceDetailW, SetupDiGetDeviceRegistryPropertyW,
};
use windows::Win32::Devices::Usb::{
    GUID_DEVINTERFACE_USB_DEVICE, GUID_DEVINTERFACE_USB_HUB,
    IOCTL_USB_GET_DESCRIPTOR_FROM_NODE_CONNECTION,
    IOCTL_USB_GET_NODE_CONNECTION_INFORMATION_EX, USB_NODE_CONNECTION_INFORMATION_EX,
};
use windows::Win32::Foundation::{
    CloseHandle, ERROR_NO_MORE_ITEMS, GENERIC_READ, GENERIC_WRITE, HANDLE,
};
use windows::Win32::Storage::FileSystem::{
    CreateFileW, FILE_FLAGS_AND_ATTRIBUTES, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows::Win32::System::IO::DeviceIoControl;
use windows::core::PCWSTR;

use crate::enumerator::{DeviceEnumerator, sort_by_bus_id};

const USB_CONFIGURATION_DESCRIPTOR_TYPE: u8 = 2;
const USB_INTERFACE_DESCRIPTOR_TYPE: u8 = 4;

/// Enumerates host USB devices through SetupAPI and the hub driver
pub struct WinEnumerator;

impl WinEnumerator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl DeviceEnumerator for WinEnumerator {
    fn enumerate(&self) -> Result<Vec<ExportedDevice>> {
        let hubs = hub_paths_by_devinst()?;

        let set = unsafe {
            SetupDiGetClassDevsW(
                Some(&GUID_DEVINTERFACE_USB_DEVICE),
                PCWSTR::null(),
                None,
                DIGCF_PRESENT | DIGCF_DEVICEINTERFACE,
            )
        }
        .map_err(|e| Error::EnumerationFailed(e.to_string()))?;

        let mut devices = Vec::new();
        let mut index = 0u32;
        loop {
            let mut devinfo = SP_DEVINFO_DATA {
                cbSize: std::mem::size_of::<SP_DEVINFO_DATA>() as u32,
                ..Default::default()
            };
            let enumerated = unsafe { SetupDiEnumDeviceInfo(set, index, &mut devinfo) };
            if let Err(e) = enumerated {
                if e.code() == ERROR_NO_MORE_ITEMS.to_hresult() {
                    break;
                }
                unsafe {
                    let _ = SetupDiDestroyDeviceInfoList(set);
                }
                return Err(Error::EnumerationFailed(e.to_string()));
            }

            // A single unreadable device never aborts the walk.
            match describe_device(set, &devinfo, &hubs) {
                Ok(device) => devices.push(device),
                Err(e) => warn!(index, "skipping device: {}", e),
            }
            index += 1;
        }
        unsafe {
            let _ = SetupDiDestroyDeviceInfoList(set);
        }

        sort_by_bus_id(&mut devices);
        Ok(devices)
    }
}

/// Map from hub DevInst to its openable interface path
fn hub_paths_by_devinst() -> Result<HashMap<u32, String>> {
    let set = unsafe {
        SetupDiGetClassDevsW(
            Some(&GUID_DEVINTERFACE_USB_HUB),
            PCWSTR::null(),
            None,
            DIGCF_PRESENT | DIGCF_DEVICEINTERFACE,
        )
    }
    .map_err(|e| Error::EnumerationFailed(e.to_string()))?;

    let mut hubs = HashMap::new();
    let mut index = 0u32;
    loop {
        let mut data = SP_DEVICE_INTERFACE_DATA {
            cbSize: std::mem::size_of::<SP_DEVICE_INTERFACE_DATA>() as u32,
            ..Default::default()
        };
        let enumerated = unsafe {
            SetupDiEnumDeviceInterfaces(set, None, &GUID_DEVINTERFACE_USB_HUB, index, &mut data)
        };
        if enumerated.is_err() {
            break;
        }
        if let Ok((path, devinst)) = unsafe { interface_detail(set, &data) } {
            hubs.insert(devinst, path);
        }
        index += 1;
    }
    unsafe {
        let _ = SetupDiDestroyDeviceInfoList(set);
    }
    Ok(hubs)
}

/// Interface path plus the owning device's DevInst
unsafe fn interface_detail(
    set: HDEVINFO,
    data: &SP_DEVICE_INTERFACE_DATA,
) -> Result<(String, u32)> {
    let mut required = 0u32;
    let _ = unsafe {
        SetupDiGetDeviceInterfaceDetailW(set, data, None, 0, Some(&mut required), None)
    };
    let mut buffer = vec![0u8; required as usize];
    let detail = buffer.as_mut_ptr() as *mut SP_DEVICE_INTERFACE_DETAIL_DATA_W;
    let mut devinfo = SP_DEVINFO_DATA {
        cbSize: std::mem::size_of::<SP_DEVINFO_DATA>() as u32,
        ..Default::default()
    };
    unsafe {
        (*detail).cbSize = std::mem::size_of::<SP_DEVICE_INTERFACE_DETAIL_DATA_W>() as u32;
        SetupDiGetDeviceInterfaceDetailW(
            set,
            data,
            Some(detail),
            required,
            None,
            Some(&mut devinfo),
        )
        .map_err(|e| Error::EnumerationFailed(e.to_string()))?;
        let path_ptr = std::ptr::addr_of!((*detail).DevicePath) as *const u16;
        let mut len = 0;
        while *path_ptr.add(len) != 0 {
            len += 1;
        }
        let path = String::from_utf16_lossy(std::slice::from_raw_parts(path_ptr, len));
        Ok((path, devinfo.DevInst))
    }
}

fn registry_property_u32(
    set: HDEVINFO,
    devinfo: &SP_DEVINFO_DATA,
    property: windows::Win32::Devices::DeviceAndDriverInstallation::SETUP_DI_REGISTRY_PROPERTY,
) -> Result<u32> {
    let mut buffer = [0u8; 4];
    unsafe {
        SetupDiGetDeviceRegistryPropertyW(set, devinfo, property, None, Some(&mut buffer), None)
    }
    .map_err(|e| Error::EnumerationFailed(e.to_string()))?;
    Ok(u32::from_ne_bytes(buffer))
}

fn instance_id(set: HDEVINFO, devinfo: &SP_DEVINFO_DATA) -> Result<String> {
    let mut buffer = [0u16; 256];
    let mut required = 0u32;
    unsafe {
        SetupDiGetDeviceInstanceIdW(set, devinfo, Some(&mut buffer), Some(&mut required))
    }
    .map_err(|e| Error::EnumerationFailed(e.to_string()))?;
    let len = buffer.iter().position(|&c| c == 0).unwrap_or(buffer.len());
    Ok(String::from_utf16_lossy(&buffer[..len]))
}

fn describe_device(
    set: HDEVINFO,
    devinfo: &SP_DEVINFO_DATA,
    hubs: &HashMap<u32, String>,
) -> Result<ExportedDevice> {
    let port = registry_property_u32(set, devinfo, SPDRP_ADDRESS)?;
    let bus = registry_property_u32(set, devinfo, SPDRP_BUSNUMBER)?;
    let path = instance_id(set, devinfo)?;

    let mut parent = 0u32;
    let cr = unsafe { CM_Get_Parent(&mut parent, devinfo.DevInst, 0) };
    if cr != CR_SUCCESS {
        return Err(Error::EnumerationFailed(format!(
            "CM_Get_Parent failed (cr {})",
            cr.0
        )));
    }
    let hub_path = hubs
        .get(&parent)
        .ok_or_else(|| Error::EnumerationFailed(format!("no hub interface for {}", path)))?;

    let hub = HubHandle::open(hub_path)?;
    let info = hub.connection_info(port)?;
    let descriptor = info.DeviceDescriptor;
    let (num_interfaces, interfaces) = hub.interface_triples(port).unwrap_or_else(|e| {
        warn!(%path, "config descriptor unavailable: {}", e);
        (0, Vec::new())
    });

    let speed = match info.Speed {
        0 => UsbSpeed::Low,
        1 => UsbSpeed::Full,
        2 => UsbSpeed::High,
        _ => UsbSpeed::Super,
    };

    Ok(ExportedDevice {
        bus_id: BusId::new(format!("{}-{}", bus, port))
            .map_err(|e| Error::EnumerationFailed(e.to_string()))?,
        path,
        bus_num: bus,
        dev_num: port,
        speed,
        vendor_id: descriptor.idVendor,
        product_id: descriptor.idProduct,
        bcd_device: descriptor.bcdDevice,
        device_class: descriptor.bDeviceClass,
        sub_class: descriptor.bDeviceSubClass,
        protocol: descriptor.bDeviceProtocol,
        configuration_value: info.CurrentConfigurationValue,
        num_configurations: descriptor.bNumConfigurations,
        num_interfaces,
        interfaces,
    })
}

/// An open handle to a USB hub
struct HubHandle(HANDLE);

impl HubHandle {
    fn open(path: &str) -> Result<Self> {
        let wide: Vec<u16> = path.encode_utf16().chain(std::iter::once(0)).collect();
        let handle = unsafe {
            CreateFileW(
                PCWSTR(wide.as_ptr()),
                GENERIC_READ.0 | GENERIC_WRITE.0,
                FILE_SHARE_READ | FILE_SHARE_WRITE,
                None,
                OPEN_EXISTING,
                FILE_FLAGS_AND_ATTRIBUTES(0),
                None,
            )
        }
        .map_err(|e| Error::EnumerationFailed(e.to_string()))?;
        Ok(Self(handle))
    }

    /// Connection state and device descriptor for one downstream port
    fn connection_info(&self, port: u32) -> Result<USB_NODE_CONNECTION_INFORMATION_EX> {
        let mut info = USB_NODE_CONNECTION_INFORMATION_EX {
            ConnectionIndex: port,
            ..Default::default()
        };
        unsafe {
            DeviceIoControl(
                self.0,
                IOCTL_USB_GET_NODE_CONNECTION_INFORMATION_EX,
                Some(&info as *const _ as *const c_void),
                std::mem::size_of::<USB_NODE_CONNECTION_INFORMATION_EX>() as u32,
                Some(&mut info as *mut _ as *mut c_void),
                std::mem::size_of::<USB_NODE_CONNECTION_INFORMATION_EX>() as u32,
                None,
                None,
            )
        }
        .map_err(|e| Error::EnumerationFailed(e.to_string()))?;
        Ok(info)
    }

    /// Interface count and `(class, subclass, protocol)` triples from the
    /// device's configuration descriptor
    fn interface_triples(&self, port: u32) -> Result<(u8, Vec<UsbInterface>)> {
        // USB_DESCRIPTOR_REQUEST: ConnectionIndex + the 8-byte setup packet,
        // followed by the descriptor data on output.
        const REQUEST_HEADER: usize = 12;
        let capacity = REQUEST_HEADER + 4096;
        let mut buffer = vec![0u8; capacity];
        let data_len = (capacity - REQUEST_HEADER) as u16;
        buffer[0..4].copy_from_slice(&port.to_ne_bytes());
        buffer[4] = 0x80;
        buffer[5] = 0x06;
        buffer[6] = 0; // descriptor index
        buffer[7] = USB_CONFIGURATION_DESCRIPTOR_TYPE;
        buffer[8..10].copy_from_slice(&0u16.to_ne_bytes());
        buffer[10..12].copy_from_slice(&data_len.to_ne_bytes());

        let mut returned = 0u32;
        unsafe {
            DeviceIoControl(
                self.0,
                IOCTL_USB_GET_DESCRIPTOR_FROM_NODE_CONNECTION,
                Some(buffer.as_ptr() as *const c_void),
                buffer.len() as u32,
                Some(buffer.as_mut_ptr() as *mut c_void),
                buffer.len() as u32,
                Some(&mut returned),
                None,
            )
        }
        .map_err(|e| Error::EnumerationFailed(e.to_string()))?;

        let config = &buffer[REQUEST_HEADER..returned as usize];
        Ok(parse_interface_triples(config))
    }
}

impl Drop for HubHandle {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

/// Walk a configuration descriptor for alternate-setting-0 interfaces
fn parse_interface_triples(config: &[u8]) -> (u8, Vec<UsbInterface>) {
    if config.len() < 5 {
        return (0, Vec::new());
    }
    let num_interfaces = config[4];

    let mut interfaces = Vec::new();
    let mut offset = 0usize;
    while offset + 2 <= config.len() {
        let len = config[offset] as usize;
        if len == 0 || offset + len > config.len() {
            break;
        }
        let descriptor_type = config[offset + 1];
        if descriptor_type == USB_INTERFACE_DESCRIPTOR_TYPE && len >= 8 {
            let alternate_setting = config[offset + 3];
            if alternate_setting == 0 {
                interfaces.push(UsbInterface {
                    class: config[offset + 5],
                    sub_class: config[offset + 6],
                    protocol: config[offset + 7],
                });
            }
        }
        offset += len;
    }
    (num_interfaces, interfaces)
}
