//! Per-attachment URB engine
//!
//! Owns the claimed device and every in-flight transfer on it. Submits are
//! non-blocking: the driver call runs on a blocking thread and its result
//! crosses back into the async world through a FIFO completion channel, in
//! completion order (the protocol permits reorder across endpoints).
//!
//! The in-flight map is the single authority for the unlink race. A
//! completion is posted only if its seqnum is still mapped; `unlink`
//! removes the entry first and then asks the driver to cancel, so a
//! `Cancelled` verdict guarantees no completion for that seqnum will ever
//! be delivered, even if the OS reports the transfer as already complete.
//! Nothing awaits while the map lock is held.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use common::{Error, Result};
use protocol::cmd::{CmdSubmit, DIR_IN, ISO_PACKETS_NONE, IsoPacket};
use protocol::error::ProtocolError;
use protocol::status;
use tracing::trace;

use crate::driver::{Direction, StubApi, TransferKind, TransferOutcome, TransferRequest};

/// Completion queue depth; senders block briefly when the writer lags
const COMPLETION_QUEUE_DEPTH: usize = 256;

/// One finished urb, ready to be written as `RET_SUBMIT`
#[derive(Debug, Clone)]
pub struct Completion {
    pub seqnum: u32,
    pub devid: u32,
    pub direction: u32,
    pub ep: u32,
    pub status: i32,
    pub actual_length: u32,
    /// IN payload; empty for OUT transfers
    pub data: Vec<u8>,
    pub start_frame: u32,
    /// Echo of the submit for isochronous urbs, 0 otherwise
    pub number_of_packets: u32,
    pub error_count: u32,
    pub iso_packets: Vec<IsoPacket>,
}

/// Wire routing data kept while an urb is in flight
struct InflightUrb {
    devid: u32,
    direction: u32,
    ep: u32,
    number_of_packets: u32,
}

/// Verdict of an unlink request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlinkOutcome {
    /// The urb was still in flight; its completion is suppressed
    Cancelled,
    /// The urb already completed (or was never known); its reply stands
    AlreadyCompleted,
}

pub struct UrbEngine {
    stub: Arc<dyn StubApi>,
    devid: u32,
    inflight: Arc<Mutex<HashMap<u32, InflightUrb>>>,
    /// Endpoint addresses (direction bit included) with the halt feature set
    halted: Arc<Mutex<HashSet<u8>>>,
    completion_tx: async_channel::Sender<Completion>,
    completion_rx: async_channel::Receiver<Completion>,
}

impl UrbEngine {
    pub fn new(stub: Arc<dyn StubApi>, devid: u32) -> Self {
        let (completion_tx, completion_rx) = async_channel::bounded(COMPLETION_QUEUE_DEPTH);
        Self {
            stub,
            devid,
            inflight: Arc::new(Mutex::new(HashMap::new())),
            halted: Arc::new(Mutex::new(HashSet::new())),
            completion_tx,
            completion_rx,
        }
    }

    /// The FIFO stream of completions
    pub fn completions(&self) -> async_channel::Receiver<Completion> {
        self.completion_rx.clone()
    }

    /// Queue one urb with the driver and return immediately
    ///
    /// Refuses the submit when the endpoint's halt feature is set and when
    /// the seqnum is already in flight (the latter is a protocol violation,
    /// not a per-urb failure).
    pub fn submit(&self, cmd: CmdSubmit) -> Result<()> {
        let ep = cmd.header.ep as u8;
        let address = endpoint_address(ep, cmd.header.direction);

        if cmd.header.devid != self.devid {
            return Err(Error::Protocol(ProtocolError::MalformedFrame {
                reason: "devid does not match the attached device",
            }));
        }
        if self.halted.lock().unwrap().contains(&address) {
            return Err(Error::EndpointHalted(address));
        }

        let seqnum = cmd.header.seqnum;
        let is_iso = cmd.number_of_packets != ISO_PACKETS_NONE && cmd.number_of_packets != 0;
        let meta = InflightUrb {
            devid: cmd.header.devid,
            direction: cmd.header.direction,
            ep: cmd.header.ep,
            number_of_packets: if is_iso { cmd.number_of_packets } else { 0 },
        };
        {
            let mut inflight = self.inflight.lock().unwrap();
            if inflight.contains_key(&seqnum) {
                return Err(Error::Protocol(ProtocolError::MalformedFrame {
                    reason: "urb seqnum reused while in flight",
                }));
            }
            inflight.insert(seqnum, meta);
        }

        // A successful CLEAR_FEATURE(ENDPOINT_HALT) lifts the halt bit.
        let clears_halt = clear_halt_target(&cmd);

        let request = TransferRequest {
            seqnum,
            kind: transfer_kind(&cmd, is_iso),
            ep,
            direction: if cmd.header.is_in() {
                Direction::In
            } else {
                Direction::Out
            },
            flags: cmd.transfer_flags,
            setup: cmd.setup,
            interval: cmd.interval,
            start_frame: cmd.start_frame,
            buffer: cmd.data,
            buffer_length: cmd.transfer_buffer_length,
            iso_packets: cmd.iso_packets,
        };

        let stub = Arc::clone(&self.stub);
        let inflight = Arc::clone(&self.inflight);
        let halted = Arc::clone(&self.halted);
        let tx = self.completion_tx.clone();
        tokio::task::spawn_blocking(move || {
            let outcome = match stub.submit(request) {
                Ok(outcome) => outcome,
                Err(e) => TransferOutcome::failed(e.urb_status()),
            };

            let meta = match inflight.lock().unwrap().remove(&seqnum) {
                Some(meta) => meta,
                None => {
                    // Unlinked while in flight; the reply slot belongs to
                    // RET_UNLINK now.
                    trace!(seqnum, "completion suppressed");
                    return;
                }
            };

            if outcome.status == status::EPIPE {
                halted.lock().unwrap().insert(address);
            } else if outcome.status == status::SUCCESS {
                if let Some(target) = clears_halt {
                    halted.lock().unwrap().remove(&target);
                }
            }

            let completion = Completion {
                seqnum,
                devid: meta.devid,
                direction: meta.direction,
                ep: meta.ep,
                status: outcome.status,
                actual_length: outcome.actual_length,
                data: if meta.direction == DIR_IN {
                    outcome.data
                } else {
                    Vec::new()
                },
                start_frame: outcome.start_frame,
                number_of_packets: meta.number_of_packets,
                error_count: outcome.error_count,
                iso_packets: outcome.iso_packets,
            };
            // Teardown closes the channel; a failed send only means nobody
            // is listening anymore.
            let _ = tx.send_blocking(completion);
        });

        Ok(())
    }

    /// Try to cancel an in-flight urb
    pub fn unlink(&self, seqnum: u32) -> UnlinkOutcome {
        let removed = self.inflight.lock().unwrap().remove(&seqnum).is_some();
        if removed {
            self.stub.cancel(seqnum);
            UnlinkOutcome::Cancelled
        } else {
            UnlinkOutcome::AlreadyCompleted
        }
    }

    /// Cancel every outstanding urb, suppressing all their completions
    pub fn cancel_all(&self) {
        let seqnums: Vec<u32> = {
            let mut inflight = self.inflight.lock().unwrap();
            inflight.drain().map(|(seqnum, _)| seqnum).collect()
        };
        for seqnum in seqnums {
            self.stub.cancel(seqnum);
        }
    }

    /// Stop accepting completions; pending sends become no-ops
    pub fn close(&self) {
        self.completion_tx.close();
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.lock().unwrap().len()
    }

    pub fn devid(&self) -> u32 {
        self.devid
    }
}

fn endpoint_address(ep: u8, direction: u32) -> u8 {
    if direction == DIR_IN { ep | 0x80 } else { ep }
}

fn transfer_kind(cmd: &CmdSubmit, is_iso: bool) -> TransferKind {
    if cmd.header.ep == 0 {
        TransferKind::Control
    } else if is_iso {
        TransferKind::Isochronous
    } else if cmd.interval > 0 {
        TransferKind::Interrupt
    } else {
        TransferKind::Bulk
    }
}

/// Endpoint address a CLEAR_FEATURE(ENDPOINT_HALT) submit would un-halt
fn clear_halt_target(cmd: &CmdSubmit) -> Option<u8> {
    const CLEAR_FEATURE: u8 = 0x01;
    const RECIPIENT_ENDPOINT: u8 = 0x02;
    const FEATURE_ENDPOINT_HALT: u16 = 0;

    if cmd.header.ep != 0 {
        return None;
    }
    let w_value = u16::from_le_bytes([cmd.setup[2], cmd.setup[3]]);
    if cmd.setup[0] == RECIPIENT_ENDPOINT
        && cmd.setup[1] == CLEAR_FEATURE
        && w_value == FEATURE_ENDPOINT_HALT
    {
        Some(cmd.setup[4])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::api::MonitorApi;
    use crate::driver::emulated::EmulatedHost;
    use crate::enumerator::DeviceEnumerator;
    use protocol::cmd::{CMD_SUBMIT, CmdHeader, DIR_OUT};
    use protocol::types::{BusId, ExportedDevice, UsbSpeed};
    use std::time::Duration;

    fn device() -> ExportedDevice {
        ExportedDevice {
            bus_id: BusId::new("1-2").unwrap(),
            path: String::new(),
            bus_num: 1,
            dev_num: 2,
            speed: UsbSpeed::High,
            vendor_id: 0x1234,
            product_id: 0x5678,
            bcd_device: 0x0200,
            device_class: 3,
            sub_class: 0,
            protocol: 0,
            configuration_value: 1,
            num_configurations: 1,
            num_interfaces: 1,
            interfaces: vec![],
        }
    }

    async fn engine_on_emulated() -> (Arc<EmulatedHost>, UrbEngine, crate::driver::ClaimedDevice) {
        let host = EmulatedHost::new(vec![device()]);
        let dev = host.enumerate().unwrap().remove(0);
        let shim = crate::driver::CaptureShim::new(host.clone() as Arc<dyn MonitorApi>);
        let filter = shim.install_filter(&dev).unwrap();
        shim.run_filters().unwrap();
        let claimed = shim.claim(&dev, filter).await.unwrap();
        let engine = UrbEngine::new(claimed.stub(), dev.devid());
        (host, engine, claimed)
    }

    fn submit(seqnum: u32, direction: u32, ep: u32) -> CmdSubmit {
        CmdSubmit {
            header: CmdHeader {
                command: CMD_SUBMIT,
                seqnum,
                devid: 0x0001_0002,
                direction,
                ep,
            },
            transfer_flags: 0,
            transfer_buffer_length: 64,
            start_frame: 0,
            number_of_packets: ISO_PACKETS_NONE,
            interval: 0,
            setup: [0u8; 8],
            data: vec![],
            iso_packets: vec![],
        }
    }

    fn get_descriptor(seqnum: u32) -> CmdSubmit {
        let mut cmd = submit(seqnum, DIR_IN, 0);
        cmd.transfer_buffer_length = 18;
        cmd.setup = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00];
        cmd
    }

    #[tokio::test]
    async fn control_submit_completes_with_descriptor() {
        let (_host, engine, _claimed) = engine_on_emulated().await;
        let completions = engine.completions();

        engine.submit(get_descriptor(1)).unwrap();
        let c = completions.recv().await.unwrap();
        assert_eq!(c.seqnum, 1);
        assert_eq!(c.status, 0);
        assert_eq!(c.actual_length, 18);
        assert_eq!(c.data.len(), 18);
        assert_eq!(engine.inflight_count(), 0);
    }

    #[tokio::test]
    async fn unlink_in_flight_suppresses_the_completion() {
        let (_host, engine, _claimed) = engine_on_emulated().await;
        let completions = engine.completions();

        // No queued IN data: the emulated submit parks until cancelled.
        engine.submit(submit(7, DIR_IN, 1)).unwrap();
        assert_eq!(engine.unlink(7), UnlinkOutcome::Cancelled);

        let raced = tokio::time::timeout(Duration::from_millis(300), completions.recv()).await;
        assert!(raced.is_err(), "suppressed completion leaked: {raced:?}");
        assert_eq!(engine.inflight_count(), 0);
    }

    #[tokio::test]
    async fn unlink_after_completion_reports_already_completed() {
        let (host, engine, _claimed) = engine_on_emulated().await;
        let completions = engine.completions();

        host.queue_in(&BusId::new("1-2").unwrap(), vec![0xAA; 8]);
        engine.submit(submit(3, DIR_IN, 1)).unwrap();
        let c = completions.recv().await.unwrap();
        assert_eq!(c.seqnum, 3);
        assert_eq!(engine.unlink(3), UnlinkOutcome::AlreadyCompleted);
    }

    #[tokio::test]
    async fn foreign_devid_is_a_protocol_error() {
        let (_host, engine, _claimed) = engine_on_emulated().await;
        let mut cmd = submit(1, DIR_IN, 1);
        cmd.header.devid = 0x0005_0005;
        let err = engine.submit(cmd).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(engine.inflight_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_seqnum_is_a_protocol_error() {
        let (_host, engine, _claimed) = engine_on_emulated().await;
        engine.submit(submit(9, DIR_IN, 1)).unwrap();
        let err = engine.submit(submit(9, DIR_IN, 2)).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        engine.cancel_all();
    }

    #[tokio::test]
    async fn halted_endpoint_refuses_until_cleared() {
        let (host, engine, _claimed) = engine_on_emulated().await;
        let completions = engine.completions();
        let bus_id = BusId::new("1-2").unwrap();

        // A stall marks the endpoint halted.
        host.queue_in_error(&bus_id, status::EPIPE);
        engine.submit(submit(1, DIR_IN, 1)).unwrap();
        let c = completions.recv().await.unwrap();
        assert_eq!(c.status, status::EPIPE);

        let err = engine.submit(submit(2, DIR_IN, 1)).unwrap_err();
        assert!(matches!(err, Error::EndpointHalted(0x81)));

        // The same endpoint number in the other direction is unaffected.
        engine.submit(submit(3, DIR_OUT, 1)).unwrap();
        assert_eq!(completions.recv().await.unwrap().seqnum, 3);

        // CLEAR_FEATURE(ENDPOINT_HALT) for 0x81 lifts the refusal.
        let mut clear = submit(4, DIR_OUT, 0);
        clear.setup = [0x02, 0x01, 0x00, 0x00, 0x81, 0x00, 0x00, 0x00];
        engine.submit(clear).unwrap();
        assert_eq!(completions.recv().await.unwrap().seqnum, 4);

        host.queue_in(&bus_id, vec![1, 2, 3]);
        engine.submit(submit(5, DIR_IN, 1)).unwrap();
        assert_eq!(completions.recv().await.unwrap().actual_length, 3);
    }

    #[tokio::test]
    async fn cancel_all_clears_the_inflight_map() {
        let (_host, engine, _claimed) = engine_on_emulated().await;
        let completions = engine.completions();

        for seqnum in 1..=3 {
            engine.submit(submit(seqnum, DIR_IN, 1)).unwrap();
        }
        assert_eq!(engine.inflight_count(), 3);

        engine.cancel_all();
        assert_eq!(engine.inflight_count(), 0);

        let leak = tokio::time::timeout(Duration::from_millis(300), completions.recv()).await;
        assert!(leak.is_err(), "cancelled urb leaked a completion: {leak:?}");
    }

    #[tokio::test]
    async fn out_completion_echoes_length_only() {
        let (_host, engine, _claimed) = engine_on_emulated().await;
        let completions = engine.completions();

        let mut cmd = submit(11, DIR_OUT, 2);
        cmd.data = vec![0x55; 32];
        cmd.transfer_buffer_length = 32;
        engine.submit(cmd).unwrap();

        let c = completions.recv().await.unwrap();
        assert_eq!(c.actual_length, 32);
        assert!(c.data.is_empty());
    }
}
