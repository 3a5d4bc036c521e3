//! DeviceIoControl transport for the capture driver
//!
//! Implements [`MonitorApi`] against the driver's monitor control device
//! and [`StubApi`] against per-device stub handles. Control calls are
//! plain synchronous ioctls; URB submission uses a per-transfer
//! `OVERLAPPED` with its own event so an in-flight urb can be cancelled
//! individually with `CancelIoEx`.

#![cfg(windows)]

use std::collections::HashMap;
use std::ffi::c_void;
use std::os::windows::ffi::OsStrExt;
use std::sync::{Arc, Mutex};

use common::{Error, Result};
use protocol::cmd::IsoPacket;
use tracing::{trace, warn};
use windows::Win32::Devices::DeviceAndDriverInstallation::{
    DIGCF_DEVICEINTERFACE, DIGCF_PRESENT, HDEVINFO, SP_DEVICE_INTERFACE_DATA,
    SP_DEVICE_INTERFACE_DETAIL_DATA_W, SetupDiDestroyDeviceInfoList, SetupDiEnumDeviceInterfaces,
    SetupDiGetClassDevsW, SetupDiGetDeviceInterfaceDetailW,
};
use windows::Win32::Foundation::{
    CloseHandle, ERROR_IO_PENDING, ERROR_NO_MORE_ITEMS, GENERIC_READ, GENERIC_WRITE, HANDLE,
};
use windows::Win32::Storage::FileSystem::{
    CreateFileW, FILE_FLAG_OVERLAPPED, FILE_FLAGS_AND_ATTRIBUTES, FILE_SHARE_READ,
    FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows::Win32::System::IO::{CancelIoEx, DeviceIoControl, GetOverlappedResult, OVERLAPPED};
use windows::Win32::System::Threading::CreateEventW;
use windows::core::{GUID, PCWSTR};

use crate::driver::api::{
    DeviceToken, Direction, DriverVersion, FilterId, FilterSpec, MonitorApi, StubApi,
    StubCandidate, StubState, TransferKind, TransferOutcome, TransferRequest,
};

/// Win32 path of the monitor control device
const MONITOR_DEVICE_PATH: &str = r"\\.\UsbCaptureMon";

/// Device-interface class published for captured stub devices
const GUID_STUB_INTERFACE: GUID = GUID::from_u128(0x8d6a_44f5_8de4_4c1e_a3f5_2f0b9c4d71a2);

const fn ctl_code(function: u32) -> u32 {
    // FILE_DEVICE_UNKNOWN, METHOD_BUFFERED, FILE_ANY_ACCESS
    (0x22 << 16) | (function << 2)
}

const IOCTL_MONITOR_GET_VERSION: u32 = ctl_code(0x800);
const IOCTL_MONITOR_ADD_FILTER: u32 = ctl_code(0x801);
const IOCTL_MONITOR_REMOVE_FILTER: u32 = ctl_code(0x802);
const IOCTL_MONITOR_RUN_FILTERS: u32 = ctl_code(0x803);
const IOCTL_MONITOR_CHECK_DEVICE: u32 = ctl_code(0x804);

const IOCTL_STUB_GET_VERSION: u32 = ctl_code(0x810);
const IOCTL_STUB_GET_ADDRESS: u32 = ctl_code(0x811);
const IOCTL_STUB_GET_DEVICE: u32 = ctl_code(0x812);
const IOCTL_STUB_GET_STATE: u32 = ctl_code(0x813);
const IOCTL_STUB_CLAIM: u32 = ctl_code(0x814);
const IOCTL_STUB_SUBMIT_URB: u32 = ctl_code(0x815);

/// Fixed part of the submit-urb input block
const URB_REQUEST_HEADER_LEN: usize = 40;
/// Fixed part of the submit-urb output block
const URB_RESULT_HEADER_LEN: usize = 16;

fn wide(s: &str) -> Vec<u16> {
    std::ffi::OsStr::new(s)
        .encode_wide()
        .chain(std::iter::once(0))
        .collect()
}

/// Owned device handle; closed on drop
struct DeviceHandle(HANDLE);

// HANDLEs are thread-agnostic kernel object references.
unsafe impl Send for DeviceHandle {}
unsafe impl Sync for DeviceHandle {}

impl DeviceHandle {
    fn open(path: &str, overlapped: bool) -> Result<Self> {
        let wide_path = wide(path);
        let flags = if overlapped {
            FILE_FLAG_OVERLAPPED
        } else {
            FILE_FLAGS_AND_ATTRIBUTES(0)
        };
        let handle = unsafe {
            CreateFileW(
                PCWSTR(wide_path.as_ptr()),
                GENERIC_READ.0 | GENERIC_WRITE.0,
                FILE_SHARE_READ | FILE_SHARE_WRITE,
                None,
                OPEN_EXISTING,
                flags,
                None,
            )
        }
        .map_err(win_error)?;
        Ok(Self(handle))
    }

    /// Synchronous buffered ioctl; returns the output byte count
    fn control(&self, code: u32, input: &[u8], output: &mut [u8]) -> Result<usize> {
        let mut returned = 0u32;
        unsafe {
            DeviceIoControl(
                self.0,
                code,
                (!input.is_empty()).then_some(input.as_ptr() as *const c_void),
                input.len() as u32,
                (!output.is_empty()).then_some(output.as_mut_ptr() as *mut c_void),
                output.len() as u32,
                Some(&mut returned),
                None,
            )
        }
        .map_err(win_error)?;
        Ok(returned as usize)
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

fn win_error(e: windows::core::Error) -> Error {
    Error::Driver {
        rc: e.code().0 as i32,
    }
}

fn read_u32(raw: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes([raw[offset], raw[offset + 1], raw[offset + 2], raw[offset + 3]])
}

fn read_u64(raw: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&raw[offset..offset + 8]);
    u64::from_ne_bytes(bytes)
}

fn parse_version(raw: &[u8]) -> Result<DriverVersion> {
    if raw.len() < 8 {
        return Err(Error::Driver { rc: -1 });
    }
    Ok(DriverVersion {
        major: read_u32(raw, 0),
        minor: read_u32(raw, 4),
    })
}

/// Monitor control device of the installed capture driver
pub struct WinMonitor {
    handle: DeviceHandle,
}

impl WinMonitor {
    /// Open `\\.\UsbCaptureMon`
    pub fn open() -> Result<Arc<Self>> {
        let handle = DeviceHandle::open(MONITOR_DEVICE_PATH, false)?;
        Ok(Arc::new(Self { handle }))
    }

    /// Device paths currently published under the stub interface class
    fn stub_interface_paths() -> Result<Vec<String>> {
        let set = unsafe {
            SetupDiGetClassDevsW(
                Some(&GUID_STUB_INTERFACE),
                PCWSTR::null(),
                None,
                DIGCF_PRESENT | DIGCF_DEVICEINTERFACE,
            )
        }
        .map_err(win_error)?;

        let paths = unsafe { collect_interface_paths(set, &GUID_STUB_INTERFACE) };
        unsafe {
            let _ = SetupDiDestroyDeviceInfoList(set);
        }
        paths
    }
}

/// Walk a device-info set and return every interface's device path
///
/// Safety: `set` must be a valid device-info list for `interface_guid`.
pub(crate) unsafe fn collect_interface_paths(
    set: HDEVINFO,
    interface_guid: &GUID,
) -> Result<Vec<String>> {
    let mut paths = Vec::new();
    let mut index = 0u32;
    loop {
        let mut data = SP_DEVICE_INTERFACE_DATA {
            cbSize: std::mem::size_of::<SP_DEVICE_INTERFACE_DATA>() as u32,
            ..Default::default()
        };
        let enumerated = unsafe {
            SetupDiEnumDeviceInterfaces(set, None, interface_guid, index, &mut data)
        };
        if let Err(e) = enumerated {
            if e.code() == ERROR_NO_MORE_ITEMS.to_hresult() {
                break;
            }
            return Err(win_error(e));
        }

        let mut required = 0u32;
        // First call only reports the required buffer size.
        let _ = unsafe {
            SetupDiGetDeviceInterfaceDetailW(set, &data, None, 0, Some(&mut required), None)
        };
        let mut buffer = vec![0u8; required as usize];
        let detail = buffer.as_mut_ptr() as *mut SP_DEVICE_INTERFACE_DETAIL_DATA_W;
        unsafe {
            (*detail).cbSize = std::mem::size_of::<SP_DEVICE_INTERFACE_DETAIL_DATA_W>() as u32;
            SetupDiGetDeviceInterfaceDetailW(set, &data, Some(detail), required, None, None)
                .map_err(win_error)?;
            let path_ptr = std::ptr::addr_of!((*detail).DevicePath) as *const u16;
            let mut len = 0;
            while *path_ptr.add(len) != 0 {
                len += 1;
            }
            paths.push(String::from_utf16_lossy(std::slice::from_raw_parts(
                path_ptr, len,
            )));
        }
        index += 1;
    }
    Ok(paths)
}

impl MonitorApi for WinMonitor {
    fn version(&self) -> Result<DriverVersion> {
        let mut out = [0u8; 8];
        self.handle
            .control(IOCTL_MONITOR_GET_VERSION, &[], &mut out)?;
        parse_version(&out)
    }

    fn add_filter(&self, filter: &FilterSpec) -> Result<FilterId> {
        let mut input = Vec::with_capacity(16);
        input.extend_from_slice(&filter.vendor_id.to_ne_bytes());
        input.extend_from_slice(&filter.product_id.to_ne_bytes());
        input.extend_from_slice(&filter.bcd_device.to_ne_bytes());
        input.push(filter.device_class);
        input.push(filter.sub_class);
        input.push(filter.protocol);
        input.push(0);
        input.extend_from_slice(&filter.port.to_ne_bytes());

        let mut out = [0u8; 8];
        self.handle
            .control(IOCTL_MONITOR_ADD_FILTER, &input, &mut out)?;
        let id = read_u32(&out, 0);
        let rc = read_u32(&out, 4) as i32;
        if rc != 0 {
            return Err(Error::Driver { rc });
        }
        Ok(FilterId(id))
    }

    fn remove_filter(&self, id: FilterId) -> Result<()> {
        self.handle
            .control(IOCTL_MONITOR_REMOVE_FILTER, &id.0.to_ne_bytes(), &mut [])?;
        Ok(())
    }

    fn run_filters(&self) -> Result<()> {
        self.handle
            .control(IOCTL_MONITOR_RUN_FILTERS, &[], &mut [])?;
        Ok(())
    }

    fn owns_device(&self, token: DeviceToken) -> Result<bool> {
        let mut out = [0u8; 4];
        self.handle
            .control(IOCTL_MONITOR_CHECK_DEVICE, &token.0.to_ne_bytes(), &mut out)?;
        Ok(read_u32(&out, 0) != 0)
    }

    fn scan_stubs(&self) -> Result<Vec<StubCandidate>> {
        let mut candidates = Vec::new();
        for path in Self::stub_interface_paths()? {
            // The stub may still be re-enumerating; skip what we cannot ask.
            let handle = match DeviceHandle::open(&path, false) {
                Ok(handle) => handle,
                Err(e) => {
                    trace!(%path, "stub not openable yet: {}", e);
                    continue;
                }
            };
            let mut out = [0u8; 8];
            match handle.control(IOCTL_STUB_GET_ADDRESS, &[], &mut out) {
                Ok(_) => candidates.push(StubCandidate {
                    path,
                    hub: read_u32(&out, 0),
                    port: read_u32(&out, 4),
                }),
                Err(e) => warn!(%path, "stub address query failed: {}", e),
            }
        }
        Ok(candidates)
    }

    fn open_stub(&self, candidate: &StubCandidate) -> Result<Arc<dyn StubApi>> {
        let handle = DeviceHandle::open(&candidate.path, true)?;
        Ok(Arc::new(WinStub {
            handle,
            pending: Mutex::new(HashMap::new()),
        }))
    }
}

/// One captured stub device, opened for overlapped I/O
pub struct WinStub {
    handle: DeviceHandle,
    /// In-flight submit-urb ioctls by seqnum, for targeted cancellation
    pending: Mutex<HashMap<u32, *mut OVERLAPPED>>,
}

// The raw OVERLAPPED pointers are only dereferenced by the thread that owns
// the submit; the map itself is lock-protected.
unsafe impl Send for WinStub {}
unsafe impl Sync for WinStub {}

impl WinStub {
    fn encode_request(request: &TransferRequest) -> Vec<u8> {
        let kind = match request.kind {
            TransferKind::Control => 0u32,
            TransferKind::Bulk => 1,
            TransferKind::Interrupt => 2,
            TransferKind::Isochronous => 3,
        };
        let direction = match request.direction {
            Direction::Out => 0u32,
            Direction::In => 1,
        };
        let mut input =
            Vec::with_capacity(URB_REQUEST_HEADER_LEN + request.buffer.len() + 16 * request.iso_packets.len());
        input.extend_from_slice(&kind.to_ne_bytes());
        input.extend_from_slice(&u32::from(request.ep).to_ne_bytes());
        input.extend_from_slice(&direction.to_ne_bytes());
        input.extend_from_slice(&request.flags.to_ne_bytes());
        input.extend_from_slice(&request.interval.to_ne_bytes());
        input.extend_from_slice(&request.start_frame.to_ne_bytes());
        input.extend_from_slice(&request.setup);
        input.extend_from_slice(&request.buffer_length.to_ne_bytes());
        input.extend_from_slice(&(request.iso_packets.len() as u32).to_ne_bytes());
        input.extend_from_slice(&request.buffer);
        for pkt in &request.iso_packets {
            input.extend_from_slice(&pkt.offset.to_ne_bytes());
            input.extend_from_slice(&pkt.length.to_ne_bytes());
            input.extend_from_slice(&pkt.actual_length.to_ne_bytes());
            input.extend_from_slice(&pkt.status.to_ne_bytes());
        }
        input
    }

    fn decode_outcome(
        request: &TransferRequest,
        raw: &[u8],
        returned: usize,
    ) -> Result<TransferOutcome> {
        if returned < URB_RESULT_HEADER_LEN {
            return Err(Error::Driver { rc: -1 });
        }
        let status = read_u32(raw, 0) as i32;
        let actual_length = read_u32(raw, 4);
        let start_frame = read_u32(raw, 8);
        let error_count = read_u32(raw, 12);

        let mut offset = URB_RESULT_HEADER_LEN;
        let data = if matches!(request.direction, Direction::In) {
            let len = (actual_length as usize).min(returned.saturating_sub(offset));
            let data = raw[offset..offset + len].to_vec();
            offset += len;
            data
        } else {
            Vec::new()
        };

        let mut iso_packets = Vec::with_capacity(request.iso_packets.len());
        for _ in 0..request.iso_packets.len() {
            if offset + 16 > returned {
                break;
            }
            iso_packets.push(IsoPacket {
                offset: read_u32(raw, offset),
                length: read_u32(raw, offset + 4),
                actual_length: read_u32(raw, offset + 8),
                status: read_u32(raw, offset + 12) as i32,
            });
            offset += 16;
        }

        Ok(TransferOutcome {
            status,
            actual_length,
            data,
            start_frame,
            iso_packets,
            error_count,
        })
    }
}

impl StubApi for WinStub {
    fn version(&self) -> Result<DriverVersion> {
        let mut out = [0u8; 8];
        self.handle.control(IOCTL_STUB_GET_VERSION, &[], &mut out)?;
        parse_version(&out)
    }

    fn state(&self) -> Result<StubState> {
        let mut out = [0u8; 8];
        self.handle.control(IOCTL_STUB_GET_STATE, &[], &mut out)?;
        Ok(StubState {
            operational: read_u32(&out, 0) != 0,
            claimed: read_u32(&out, 4) != 0,
        })
    }

    fn token(&self) -> Result<DeviceToken> {
        let mut out = [0u8; 8];
        self.handle.control(IOCTL_STUB_GET_DEVICE, &[], &mut out)?;
        Ok(DeviceToken(read_u64(&out, 0)))
    }

    fn claim(&self, token: DeviceToken) -> Result<bool> {
        let mut out = [0u8; 4];
        self.handle
            .control(IOCTL_STUB_CLAIM, &token.0.to_ne_bytes(), &mut out)?;
        Ok(read_u32(&out, 0) != 0)
    }

    fn submit(&self, request: TransferRequest) -> Result<TransferOutcome> {
        let input = Self::encode_request(&request);
        let out_capacity = URB_RESULT_HEADER_LEN
            + if matches!(request.direction, Direction::In) {
                request.buffer_length as usize
            } else {
                0
            }
            + 16 * request.iso_packets.len();
        let mut output = vec![0u8; out_capacity];

        let event = unsafe { CreateEventW(None, true, false, PCWSTR::null()) }.map_err(win_error)?;
        let mut overlapped = OVERLAPPED {
            hEvent: event,
            ..Default::default()
        };

        self.pending
            .lock()
            .unwrap()
            .insert(request.seqnum, &mut overlapped as *mut OVERLAPPED);

        let mut returned = 0u32;
        let issued = unsafe {
            DeviceIoControl(
                self.handle.0,
                IOCTL_STUB_SUBMIT_URB,
                Some(input.as_ptr() as *const c_void),
                input.len() as u32,
                Some(output.as_mut_ptr() as *mut c_void),
                output.len() as u32,
                Some(&mut returned),
                Some(&mut overlapped as *mut OVERLAPPED),
            )
        };

        let wait_result = match issued {
            Ok(()) => Ok(returned),
            Err(e) if e.code() == ERROR_IO_PENDING.to_hresult() => {
                let mut transferred = 0u32;
                unsafe {
                    GetOverlappedResult(self.handle.0, &overlapped, &mut transferred, true)
                }
                .map(|_| transferred)
                .map_err(win_error)
            }
            Err(e) => Err(win_error(e)),
        };

        self.pending.lock().unwrap().remove(&request.seqnum);
        unsafe {
            let _ = CloseHandle(event);
        }

        let returned = match wait_result {
            Ok(n) => n as usize,
            // An aborted ioctl is a cancelled urb; the engine suppresses it.
            Err(_) => {
                return Ok(TransferOutcome::failed(protocol::status::ECONNRESET));
            }
        };
        Self::decode_outcome(&request, &output, returned)
    }

    fn cancel(&self, seqnum: u32) {
        let pending = self.pending.lock().unwrap();
        if let Some(&overlapped) = pending.get(&seqnum) {
            unsafe {
                if let Err(e) = CancelIoEx(self.handle.0, Some(overlapped)) {
                    warn!(seqnum, "CancelIoEx failed: {}", e);
                }
            }
        }
    }
}
