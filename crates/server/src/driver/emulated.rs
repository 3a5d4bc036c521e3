//! In-process emulation of the capture driver
//!
//! Implements [`MonitorApi`] and [`StubApi`] against a set of synthetic
//! devices, so full sessions can run on hosts without the kernel driver
//! installed. The integration tests drive the whole attach/submit/unlink
//! pipeline against it.
//!
//! Emulated endpoints answer the standard control requests a VHCI client
//! issues after import (GET_DESCRIPTOR, CLEAR_FEATURE). Bulk and interrupt
//! IN transfers drain a per-device queue of prepared results; when the
//! queue is empty the submit parks until it is cancelled, which is exactly
//! the shape the unlink race needs.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use common::{Error, Result};
use protocol::cmd::IsoPacket;
use protocol::status;
use protocol::types::{BusId, ExportedDevice};
use tracing::trace;

use super::api::{
    DeviceToken, Direction, DriverVersion, FilterId, FilterSpec, MonitorApi, StubApi,
    StubCandidate, StubState, TransferKind, TransferOutcome, TransferRequest,
};

/// Backstop for parked submits so a broken test cannot hang forever
const PARK_LIMIT: Duration = Duration::from_secs(30);

/// Queued result for an IN endpoint
enum InResponse {
    Data(Vec<u8>),
    Status(i32),
}

type Inbox = Arc<Mutex<VecDeque<InResponse>>>;

struct ParkedSubmit {
    cancelled: Mutex<bool>,
    cv: Condvar,
}

struct Slot {
    device: ExportedDevice,
    claimable: bool,
    inbox: Inbox,
    stub: Option<Arc<EmulatedStub>>,
}

/// Emulated monitor device plus its captured stubs
pub struct EmulatedHost {
    version: DriverVersion,
    slots: Mutex<Vec<Slot>>,
    filters: Mutex<HashMap<FilterId, FilterSpec>>,
    next_filter: AtomicU32,
    next_token: AtomicU64,
}

impl EmulatedHost {
    pub fn new(devices: Vec<ExportedDevice>) -> Arc<Self> {
        Self::with_version(
            devices,
            DriverVersion {
                major: super::api::DRIVER_MAJOR,
                minor: super::api::DRIVER_MINOR,
            },
        )
    }

    /// Report a specific driver version, for the startup gate tests
    pub fn with_version(devices: Vec<ExportedDevice>, version: DriverVersion) -> Arc<Self> {
        Arc::new(Self {
            version,
            slots: Mutex::new(
                devices
                    .into_iter()
                    .map(|device| Slot {
                        device,
                        claimable: true,
                        inbox: Arc::new(Mutex::new(VecDeque::new())),
                        stub: None,
                    })
                    .collect(),
            ),
            filters: Mutex::new(HashMap::new()),
            next_filter: AtomicU32::new(1),
            next_token: AtomicU64::new(0xFEED_0001),
        })
    }

    /// Make the driver refuse to claim this device
    pub fn set_not_claimable(&self, bus_id: &BusId) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.iter_mut().find(|s| &s.device.bus_id == bus_id) {
            slot.claimable = false;
        }
    }

    /// Queue data for the next bulk/interrupt IN submit on this device
    pub fn queue_in(&self, bus_id: &BusId, data: Vec<u8>) {
        self.push(bus_id, InResponse::Data(data));
    }

    /// Queue an errno-style failure for the next IN submit
    pub fn queue_in_error(&self, bus_id: &BusId, status: i32) {
        self.push(bus_id, InResponse::Status(status));
    }

    fn push(&self, bus_id: &BusId, response: InResponse) {
        let slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.iter().find(|s| &s.device.bus_id == bus_id) {
            slot.inbox.lock().unwrap().push_back(response);
        }
    }

    /// Number of installed capture filters
    pub fn filter_count(&self) -> usize {
        self.filters.lock().unwrap().len()
    }

    /// Number of devices currently diverted to the capture stack
    pub fn captured_count(&self) -> usize {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.stub.is_some())
            .count()
    }

    fn matches(filter: &FilterSpec, dev: &ExportedDevice) -> bool {
        filter.vendor_id == dev.vendor_id
            && filter.product_id == dev.product_id
            && filter.bcd_device == dev.bcd_device
            && filter.device_class == dev.device_class
            && filter.sub_class == dev.sub_class
            && filter.protocol == dev.protocol
            && filter.port == dev.dev_num
    }
}

impl MonitorApi for EmulatedHost {
    fn version(&self) -> Result<DriverVersion> {
        Ok(self.version)
    }

    fn add_filter(&self, filter: &FilterSpec) -> Result<FilterId> {
        let id = FilterId(self.next_filter.fetch_add(1, Ordering::SeqCst));
        self.filters.lock().unwrap().insert(id, *filter);
        Ok(id)
    }

    fn remove_filter(&self, id: FilterId) -> Result<()> {
        let Some(spec) = self.filters.lock().unwrap().remove(&id) else {
            return Err(Error::Driver { rc: 2 });
        };
        // Devices only this filter was holding fall back to the USB stack.
        let remaining: Vec<FilterSpec> = self.filters.lock().unwrap().values().copied().collect();
        let mut slots = self.slots.lock().unwrap();
        for slot in slots.iter_mut() {
            if Self::matches(&spec, &slot.device)
                && !remaining.iter().any(|f| Self::matches(f, &slot.device))
            {
                if let Some(stub) = slot.stub.take() {
                    stub.release();
                }
            }
        }
        Ok(())
    }

    fn run_filters(&self) -> Result<()> {
        let filters = self.filters.lock().unwrap();
        let mut slots = self.slots.lock().unwrap();
        for slot in slots.iter_mut() {
            if slot.stub.is_none()
                && filters.values().any(|f| Self::matches(f, &slot.device))
            {
                trace!(bus_id = %slot.device.bus_id, "emulated capture");
                slot.stub = Some(Arc::new(EmulatedStub {
                    device: slot.device.clone(),
                    version: self.version,
                    token: DeviceToken(self.next_token.fetch_add(1, Ordering::SeqCst)),
                    claimable: slot.claimable,
                    claimed: AtomicBool::new(false),
                    operational: AtomicBool::new(true),
                    inbox: Arc::clone(&slot.inbox),
                    parked: Mutex::new(HashMap::new()),
                    cancelled_early: Mutex::new(HashSet::new()),
                }));
            }
        }
        Ok(())
    }

    fn owns_device(&self, token: DeviceToken) -> Result<bool> {
        Ok(self
            .slots
            .lock()
            .unwrap()
            .iter()
            .any(|s| s.stub.as_ref().is_some_and(|stub| stub.token == token)))
    }

    fn scan_stubs(&self) -> Result<Vec<StubCandidate>> {
        Ok(self
            .slots
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.stub.is_some())
            .map(|s| StubCandidate {
                path: format!("emulated://{}", s.device.bus_id),
                hub: s.device.bus_num,
                port: s.device.dev_num,
            })
            .collect())
    }

    fn open_stub(&self, candidate: &StubCandidate) -> Result<Arc<dyn StubApi>> {
        let slots = self.slots.lock().unwrap();
        slots
            .iter()
            .find(|s| format!("emulated://{}", s.device.bus_id) == candidate.path)
            .and_then(|s| s.stub.clone())
            .map(|stub| stub as Arc<dyn StubApi>)
            .ok_or(Error::DeviceGone)
    }
}

impl crate::enumerator::DeviceEnumerator for EmulatedHost {
    fn enumerate(&self) -> Result<Vec<ExportedDevice>> {
        let mut devices: Vec<ExportedDevice> = self
            .slots
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.device.clone())
            .collect();
        crate::enumerator::sort_by_bus_id(&mut devices);
        Ok(devices)
    }
}

/// One emulated captured device
pub struct EmulatedStub {
    device: ExportedDevice,
    version: DriverVersion,
    token: DeviceToken,
    claimable: bool,
    claimed: AtomicBool,
    operational: AtomicBool,
    inbox: Inbox,
    parked: Mutex<HashMap<u32, Arc<ParkedSubmit>>>,
    /// Cancels that arrived before their submit reached the park
    cancelled_early: Mutex<HashSet<u32>>,
}

impl EmulatedStub {
    /// Called when the capture filter goes away: abort parked submits
    fn release(&self) {
        self.operational.store(false, Ordering::SeqCst);
        let parked: Vec<Arc<ParkedSubmit>> =
            self.parked.lock().unwrap().values().cloned().collect();
        for submit in parked {
            *submit.cancelled.lock().unwrap() = true;
            submit.cv.notify_all();
        }
    }

    /// 18-byte standard device descriptor for this device
    fn device_descriptor(&self) -> [u8; 18] {
        let d = &self.device;
        [
            18,
            0x01,
            0x00,
            0x02,
            d.device_class,
            d.sub_class,
            d.protocol,
            64,
            d.vendor_id as u8,
            (d.vendor_id >> 8) as u8,
            d.product_id as u8,
            (d.product_id >> 8) as u8,
            d.bcd_device as u8,
            (d.bcd_device >> 8) as u8,
            1,
            2,
            3,
            d.num_configurations,
        ]
    }

    fn control(&self, request: &TransferRequest) -> TransferOutcome {
        let bm_request_type = request.setup[0];
        let b_request = request.setup[1];
        let w_value = u16::from_le_bytes([request.setup[2], request.setup[3]]);

        match (bm_request_type, b_request) {
            // GET_DESCRIPTOR(DEVICE)
            (0x80, 0x06) if w_value >> 8 == 0x01 => {
                let descriptor = self.device_descriptor();
                let len = descriptor.len().min(request.buffer_length as usize);
                TransferOutcome {
                    status: status::SUCCESS,
                    actual_length: len as u32,
                    data: descriptor[..len].to_vec(),
                    start_frame: 0,
                    iso_packets: Vec::new(),
                    error_count: 0,
                }
            }
            // Everything else is acknowledged without data.
            _ => TransferOutcome {
                status: status::SUCCESS,
                actual_length: request.buffer.len() as u32,
                data: Vec::new(),
                start_frame: 0,
                iso_packets: Vec::new(),
                error_count: 0,
            },
        }
    }

    fn stream_in(&self, request: &TransferRequest) -> TransferOutcome {
        let queued = self.inbox.lock().unwrap().pop_front();
        match queued {
            Some(InResponse::Data(mut data)) => {
                data.truncate(request.buffer_length as usize);
                TransferOutcome {
                    status: status::SUCCESS,
                    actual_length: data.len() as u32,
                    data,
                    start_frame: 0,
                    iso_packets: Vec::new(),
                    error_count: 0,
                }
            }
            Some(InResponse::Status(code)) => TransferOutcome::failed(code),
            None => self.park(request.seqnum),
        }
    }

    /// Wait until the submit is cancelled, like a device with nothing to say
    fn park(&self, seqnum: u32) -> TransferOutcome {
        if self.cancelled_early.lock().unwrap().remove(&seqnum) {
            return TransferOutcome::failed(status::ECONNRESET);
        }
        let parked = Arc::new(ParkedSubmit {
            cancelled: Mutex::new(false),
            cv: Condvar::new(),
        });
        self.parked.lock().unwrap().insert(seqnum, Arc::clone(&parked));
        // A cancel may have slipped in between the check above and the
        // insert; it would have missed the park entry.
        if self.cancelled_early.lock().unwrap().remove(&seqnum) {
            self.parked.lock().unwrap().remove(&seqnum);
            return TransferOutcome::failed(status::ECONNRESET);
        }

        let mut done = parked.cancelled.lock().unwrap();
        while !*done {
            let (guard, timeout) = parked.cv.wait_timeout(done, PARK_LIMIT).unwrap();
            done = guard;
            if timeout.timed_out() {
                break;
            }
        }
        let was_cancelled = *done;
        drop(done);

        self.parked.lock().unwrap().remove(&seqnum);
        if was_cancelled {
            TransferOutcome::failed(status::ECONNRESET)
        } else {
            TransferOutcome::failed(status::ETIMEDOUT)
        }
    }

    fn isochronous(&self, request: &TransferRequest) -> TransferOutcome {
        // No real frames to move: IN reports empty packets, OUT accepts all.
        let sent = matches!(request.direction, Direction::Out);
        let iso_packets: Vec<IsoPacket> = request
            .iso_packets
            .iter()
            .map(|p| IsoPacket {
                offset: p.offset,
                length: p.length,
                actual_length: if sent { p.length } else { 0 },
                status: 0,
            })
            .collect();
        TransferOutcome {
            status: status::SUCCESS,
            actual_length: if sent { request.buffer.len() as u32 } else { 0 },
            data: Vec::new(),
            start_frame: request.start_frame,
            iso_packets,
            error_count: 0,
        }
    }
}

impl StubApi for EmulatedStub {
    fn version(&self) -> Result<DriverVersion> {
        Ok(self.version)
    }

    fn state(&self) -> Result<StubState> {
        Ok(StubState {
            operational: self.operational.load(Ordering::SeqCst),
            claimed: self.claimed.load(Ordering::SeqCst),
        })
    }

    fn token(&self) -> Result<DeviceToken> {
        Ok(self.token)
    }

    fn claim(&self, token: DeviceToken) -> Result<bool> {
        if token != self.token {
            return Err(Error::Driver { rc: 13 });
        }
        if !self.claimable {
            return Ok(false);
        }
        self.claimed.store(true, Ordering::SeqCst);
        Ok(true)
    }

    fn submit(&self, request: TransferRequest) -> Result<TransferOutcome> {
        if !self.operational.load(Ordering::SeqCst) {
            return Err(Error::DeviceGone);
        }
        let outcome = match request.kind {
            TransferKind::Control => self.control(&request),
            TransferKind::Isochronous => self.isochronous(&request),
            TransferKind::Bulk | TransferKind::Interrupt => match request.direction {
                Direction::In => self.stream_in(&request),
                Direction::Out => TransferOutcome {
                    status: status::SUCCESS,
                    actual_length: request.buffer.len() as u32,
                    data: Vec::new(),
                    start_frame: 0,
                    iso_packets: Vec::new(),
                    error_count: 0,
                },
            },
        };
        Ok(outcome)
    }

    fn cancel(&self, seqnum: u32) {
        if let Some(parked) = self.parked.lock().unwrap().get(&seqnum).cloned() {
            *parked.cancelled.lock().unwrap() = true;
            parked.cv.notify_all();
        } else {
            self.cancelled_early.lock().unwrap().insert(seqnum);
        }
    }
}
