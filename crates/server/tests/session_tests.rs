//! End-to-end session tests over in-memory streams
//!
//! Each test runs a real `Session` against the emulated capture driver and
//! speaks the USB/IP wire protocol from the client side of a duplex pipe,
//! the way a VHCI driver would.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use protocol::cmd::{
    CMD_SUBMIT, CMD_UNLINK, CmdHeader, CmdSubmit, CmdUnlink, DIR_IN, DIR_OUT, ISO_PACKETS_NONE,
    RET_SUBMIT, RET_UNLINK, Reply,
};
use protocol::op::{OP_STATUS_OK, OpReply, OpRequest};
use protocol::status;
use protocol::types::{BusId, ExportedDevice, UsbInterface, UsbSpeed};
use server::driver::emulated::EmulatedHost;
use server::registry::{MemoryStore, ShareRegistry};
use server::session::{Session, SessionContext};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn hid_device(bus_id: &str, bus: u32, port: u32) -> ExportedDevice {
    ExportedDevice {
        bus_id: BusId::new(bus_id).unwrap(),
        path: format!(r"USB\VID_1234&PID_5678\{bus_id}"),
        bus_num: bus,
        dev_num: port,
        speed: UsbSpeed::High,
        vendor_id: 0x1234,
        product_id: 0x5678,
        bcd_device: 0x0200,
        device_class: 0x03,
        sub_class: 0x00,
        protocol: 0x00,
        configuration_value: 1,
        num_configurations: 1,
        num_interfaces: 1,
        interfaces: vec![UsbInterface {
            class: 0x03,
            sub_class: 0x00,
            protocol: 0x00,
        }],
    }
}

struct Harness {
    host: Arc<EmulatedHost>,
    ctx: Arc<SessionContext>,
    token: CancellationToken,
}

impl Harness {
    fn new(devices: Vec<ExportedDevice>) -> Self {
        let host = EmulatedHost::new(devices);
        let registry = Arc::new(ShareRegistry::open(Box::new(MemoryStore::default())).unwrap());
        let ctx = Arc::new(SessionContext {
            enumerator: host.clone(),
            monitor: host.clone(),
            registry,
        });
        Self {
            host,
            ctx,
            token: CancellationToken::new(),
        }
    }

    fn share(&self, bus_id: &str) {
        self.ctx
            .registry
            .bind(BusId::new(bus_id).unwrap(), String::new())
            .unwrap();
    }

    /// Spawn a session and return the client side of its connection
    fn connect(
        &self,
        peer: SocketAddr,
    ) -> (
        ReadHalf<DuplexStream>,
        WriteHalf<DuplexStream>,
        JoinHandle<common::Result<()>>,
    ) {
        let (client, server_end) = tokio::io::duplex(64 * 1024);
        let session = Session::new(Arc::clone(&self.ctx), peer, self.token.child_token());
        let task = tokio::spawn(session.run(server_end));
        let (read, write) = tokio::io::split(client);
        (read, write, task)
    }
}

fn peer(port: u16) -> SocketAddr {
    format!("192.0.2.1:{port}").parse().unwrap()
}

async fn import(
    harness: &Harness,
    bus_id: &str,
    port: u16,
) -> (
    ReadHalf<DuplexStream>,
    WriteHalf<DuplexStream>,
    JoinHandle<common::Result<()>>,
    OpReply,
) {
    let (mut read, mut write, task) = harness.connect(peer(port));
    write
        .write_all(
            &OpRequest::Import {
                bus_id: BusId::new(bus_id).unwrap(),
            }
            .to_bytes(),
        )
        .await
        .unwrap();
    let reply = OpReply::read_from(&mut read).await.unwrap();
    (read, write, task, reply)
}

fn get_descriptor_submit(seqnum: u32, devid: u32) -> CmdSubmit {
    CmdSubmit {
        header: CmdHeader {
            command: CMD_SUBMIT,
            seqnum,
            devid,
            direction: DIR_IN,
            ep: 0,
        },
        transfer_flags: 0,
        transfer_buffer_length: 18,
        start_frame: 0,
        number_of_packets: ISO_PACKETS_NONE,
        interval: 0,
        setup: [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00],
        data: vec![],
        iso_packets: vec![],
    }
}

fn bulk_in_submit(seqnum: u32, devid: u32, ep: u32) -> CmdSubmit {
    CmdSubmit {
        header: CmdHeader {
            command: CMD_SUBMIT,
            seqnum,
            devid,
            direction: DIR_IN,
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

fn unlink_cmd(seqnum: u32, devid: u32, victim: u32) -> CmdUnlink {
    CmdUnlink {
        header: CmdHeader {
            command: CMD_UNLINK,
            seqnum,
            devid,
            direction: DIR_OUT,
            ep: 0,
        },
        unlink_seqnum: victim,
    }
}

// S1: no shared devices, the list reply is empty and the session closes.
#[tokio::test]
async fn devlist_with_nothing_shared() {
    let harness = Harness::new(vec![hid_device("1-2", 1, 2)]);
    let (mut read, mut write, task) = harness.connect(peer(1));

    write.write_all(&OpRequest::DevList.to_bytes()).await.unwrap();
    let reply = OpReply::read_from(&mut read).await.unwrap();
    assert_eq!(reply, OpReply::DevList { devices: vec![] });

    assert_eq!(read.read(&mut [0u8; 1]).await.unwrap(), 0);
    task.await.unwrap().unwrap();
}

// S2: a shared device shows up as one full record; unshared ones do not.
#[tokio::test]
async fn devlist_lists_only_shared_devices() {
    let harness = Harness::new(vec![hid_device("1-2", 1, 2), hid_device("2-1", 2, 1)]);
    harness.share("1-2");
    let (mut read, mut write, _task) = harness.connect(peer(2));

    write.write_all(&OpRequest::DevList.to_bytes()).await.unwrap();
    let OpReply::DevList { devices } = OpReply::read_from(&mut read).await.unwrap() else {
        panic!("expected devlist");
    };
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].bus_id.as_str(), "1-2");
    assert_eq!(devices[0].vendor_id, 0x1234);
    assert_eq!(devices[0].speed, UsbSpeed::High);
    assert_eq!(devices[0].interfaces.len(), 1);
}

// S3: import, then fetch the device descriptor through the URB engine.
#[tokio::test]
async fn import_and_fetch_descriptor() {
    let harness = Harness::new(vec![hid_device("1-2", 1, 2)]);
    harness.share("1-2");

    let (mut read, mut write, task, reply) = import(&harness, "1-2", 3).await;
    let OpReply::Import {
        status: OP_STATUS_OK,
        device: Some(device),
    } = reply
    else {
        panic!("import failed: {reply:?}");
    };
    let devid = device.devid();
    assert_eq!(devid, 0x0001_0002);
    assert_eq!(
        harness.ctx.registry.attached_to(&BusId::new("1-2").unwrap()),
        Some(peer(3))
    );

    write
        .write_all(&get_descriptor_submit(1, devid).to_bytes())
        .await
        .unwrap();

    let Reply::Submit(ret) = Reply::read_from(&mut read).await.unwrap() else {
        panic!("expected RET_SUBMIT");
    };
    assert_eq!(ret.header.command, RET_SUBMIT);
    assert_eq!(ret.header.seqnum, 1);
    assert_eq!(ret.status, 0);
    assert_eq!(ret.actual_length, 18);
    assert_eq!(ret.data.len(), 18);
    assert_eq!(ret.data[0], 18, "bLength");
    assert_eq!(ret.data[1], 1, "bDescriptorType");

    // Disconnect; teardown must release the device and the filter.
    drop(write);
    drop(read);
    task.await.unwrap().unwrap();
    assert_eq!(harness.host.filter_count(), 0);
    assert_eq!(
        harness.ctx.registry.attached_to(&BusId::new("1-2").unwrap()),
        None
    );
}

// S4, unlink wins: the urb is parked, so the unlink cancels it and the
// client sees RET_UNLINK(0) and never a RET_SUBMIT for that seqnum.
#[tokio::test]
async fn unlink_of_parked_urb_cancels_it() {
    let harness = Harness::new(vec![hid_device("1-2", 1, 2)]);
    harness.share("1-2");
    let (mut read, mut write, _task, reply) = import(&harness, "1-2", 4).await;
    let OpReply::Import { device: Some(device), .. } = reply else {
        panic!("import failed");
    };
    let devid = device.devid();

    write
        .write_all(&bulk_in_submit(7, devid, 1).to_bytes())
        .await
        .unwrap();
    write
        .write_all(&unlink_cmd(8, devid, 7).to_bytes())
        .await
        .unwrap();

    let Reply::Unlink(ret) = Reply::read_from(&mut read).await.unwrap() else {
        panic!("expected RET_UNLINK, got a submit reply");
    };
    assert_eq!(ret.header.command, RET_UNLINK);
    assert_eq!(ret.header.seqnum, 8);
    assert_eq!(ret.status, status::SUCCESS);

    // Property 3: no RET_SUBMIT(7) may ever follow.
    let mut byte = [0u8; 1];
    let extra = tokio::time::timeout(Duration::from_millis(300), read.read(&mut byte)).await;
    assert!(extra.is_err(), "unexpected frame after successful unlink");
}

// S4, completion wins: the urb finishes first, the unlink reports
// already-completed, and exactly one RET_SUBMIT(7) is seen.
#[tokio::test]
async fn unlink_after_completion_reports_reset() {
    let harness = Harness::new(vec![hid_device("1-2", 1, 2)]);
    harness.share("1-2");
    harness.host.queue_in(&BusId::new("1-2").unwrap(), vec![0xAB; 4]);

    let (mut read, mut write, _task, reply) = import(&harness, "1-2", 5).await;
    let OpReply::Import { device: Some(device), .. } = reply else {
        panic!("import failed");
    };
    let devid = device.devid();

    write
        .write_all(&bulk_in_submit(7, devid, 1).to_bytes())
        .await
        .unwrap();
    let Reply::Submit(ret) = Reply::read_from(&mut read).await.unwrap() else {
        panic!("expected RET_SUBMIT");
    };
    assert_eq!(ret.header.seqnum, 7);
    assert_eq!(ret.actual_length, 4);

    write
        .write_all(&unlink_cmd(8, devid, 7).to_bytes())
        .await
        .unwrap();
    let Reply::Unlink(ret) = Reply::read_from(&mut read).await.unwrap() else {
        panic!("expected RET_UNLINK");
    };
    assert_eq!(ret.status, status::ECONNRESET);
}

// S5: server shutdown with urbs in flight; nothing is replied, the filter
// is gone and the share is detached.
#[tokio::test]
async fn shutdown_mid_attachment_releases_everything() {
    let harness = Harness::new(vec![hid_device("1-2", 1, 2)]);
    harness.share("1-2");
    let (mut read, mut write, task, reply) = import(&harness, "1-2", 6).await;
    let OpReply::Import { device: Some(device), .. } = reply else {
        panic!("import failed");
    };
    let devid = device.devid();

    for seqnum in 1..=3 {
        write
            .write_all(&bulk_in_submit(seqnum, devid, 1).to_bytes())
            .await
            .unwrap();
    }
    // Let the submits reach the engine before pulling the plug.
    tokio::time::sleep(Duration::from_millis(100)).await;

    harness.token.cancel();
    task.await.unwrap().unwrap();

    // None of the three urbs got a reply.
    let mut trailing = Vec::new();
    read.read_to_end(&mut trailing).await.unwrap();
    assert!(
        trailing.is_empty(),
        "expected silence after shutdown, got {} bytes",
        trailing.len()
    );
    assert_eq!(harness.host.filter_count(), 0);
    assert_eq!(harness.host.captured_count(), 0);
    assert_eq!(
        harness.ctx.registry.attached_to(&BusId::new("1-2").unwrap()),
        None
    );
}

// S6: two clients race to import the same bus id.
#[tokio::test]
async fn double_import_has_exactly_one_winner() {
    let harness = Harness::new(vec![hid_device("1-2", 1, 2)]);
    harness.share("1-2");

    let first = import(&harness, "1-2", 7);
    let second = import(&harness, "1-2", 8);
    let ((_r1, w1, t1, reply1), (_r2, w2, t2, reply2)) = tokio::join!(first, second);

    let ok = |r: &OpReply| matches!(r, OpReply::Import { status: 0, device: Some(_) });
    let failed = |r: &OpReply| matches!(r, OpReply::Import { status, device: None } if *status != 0);
    assert!(
        (ok(&reply1) && failed(&reply2)) || (ok(&reply2) && failed(&reply1)),
        "expected one winner and one loser: {reply1:?} / {reply2:?}"
    );

    // Drop both connections; after the winner detaches no filter remains.
    drop((w1, w2));
    t1.await.unwrap().unwrap();
    t2.await.unwrap().unwrap();
    assert_eq!(harness.host.filter_count(), 0);

    // The slot is free again.
    let (_r3, _w3, _t3, reply3) = import(&harness, "1-2", 9).await;
    assert!(ok(&reply3), "re-import after detach failed: {reply3:?}");
}

// A malformed frame in CMD mode tears the session down but leaves the
// server reusable.
#[tokio::test]
async fn protocol_error_closes_only_that_session() {
    let harness = Harness::new(vec![hid_device("1-2", 1, 2)]);
    harness.share("1-2");
    let (mut read, mut write, task, reply) = import(&harness, "1-2", 10).await;
    assert!(matches!(reply, OpReply::Import { status: 0, .. }));

    // Unknown command code in the 48-byte header.
    let mut bogus = [0u8; 48];
    bogus[3] = 0x7F;
    write.write_all(&bogus).await.unwrap();

    assert!(task.await.unwrap().is_err());
    let mut trailing = Vec::new();
    read.read_to_end(&mut trailing).await.unwrap();
    assert_eq!(harness.host.filter_count(), 0);

    // The device can be imported again afterwards.
    let (_r, _w, _t, reply) = import(&harness, "1-2", 11).await;
    assert!(matches!(reply, OpReply::Import { status: 0, .. }));
}
