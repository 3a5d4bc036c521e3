//! Wire-format tests against byte layouts a Linux VHCI client produces
//!
//! These pin the exact frames exchanged during the devlist and attach
//! handshakes so codec refactors cannot drift from the protocol.

use protocol::cmd::{
    CMD_SUBMIT, CmdHeader, CmdSubmit, Command, DIR_IN, HEADER_SIZE, ISO_PACKETS_NONE,
};
use protocol::op::{DEVICE_RECORD_SIZE, OpReply, OpRequest};
use protocol::types::{BusId, ExportedDevice, UsbInterface, UsbSpeed};

fn shared_device() -> ExportedDevice {
    ExportedDevice {
        bus_id: BusId::new("1-2").unwrap(),
        path: r"\\?\usb#vid_1234&pid_5678".to_owned(),
        bus_num: 1,
        dev_num: 2,
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

#[tokio::test]
async fn devlist_handshake_with_no_devices() {
    // Client header for OP_REQ_DEVLIST, then the 12-byte empty reply.
    let request: [u8; 8] = [0x01, 0x11, 0x80, 0x05, 0, 0, 0, 0];
    let decoded = OpRequest::read_from(&mut &request[..]).await.unwrap();
    assert_eq!(decoded, OpRequest::DevList);

    let reply = OpReply::devlist(vec![]).to_bytes();
    assert_eq!(&reply[..4], [0x01, 0x11, 0x00, 0x05]);
    assert_eq!(&reply[4..8], [0, 0, 0, 0], "status ok");
    assert_eq!(&reply[8..12], [0, 0, 0, 0], "n_devices = 0");
    assert_eq!(reply.len(), 12);
}

#[tokio::test]
async fn devlist_reply_with_one_shared_device() {
    let reply = OpReply::devlist(vec![shared_device()]).to_bytes();
    assert_eq!(reply.len(), 12 + DEVICE_RECORD_SIZE + 4);

    let record = &reply[12..];
    // bus_id is ASCII "1-2" NUL-padded to 32 bytes
    assert_eq!(&record[256..259], b"1-2");
    assert!(record[259..288].iter().all(|&b| b == 0));
    // speed high = 0x00000003
    assert_eq!(&record[296..300], [0, 0, 0, 3]);
    // idVendor
    assert_eq!(&record[300..302], [0x12, 0x34]);

    // A client must be able to parse its own reply back.
    let parsed = OpReply::read_from(&mut &reply[..]).await.unwrap();
    assert_eq!(parsed, OpReply::devlist(vec![shared_device()]));
}

#[tokio::test]
async fn import_handshake_for_shared_bus_id() {
    let request = OpRequest::Import {
        bus_id: BusId::new("1-2").unwrap(),
    }
    .to_bytes();
    assert_eq!(request.len(), 40);

    let decoded = OpRequest::read_from(&mut &request[..]).await.unwrap();
    let OpRequest::Import { bus_id } = decoded else {
        panic!("expected import request");
    };
    assert_eq!(bus_id.as_str(), "1-2");

    let reply = OpReply::import_success(shared_device()).to_bytes();
    assert_eq!(reply.len(), 8 + DEVICE_RECORD_SIZE);
    assert_eq!(&reply[4..8], [0, 0, 0, 0], "status ok");
}

#[tokio::test]
async fn get_descriptor_submit_frame() {
    // First URB a client sends after import: GET_DESCRIPTOR(DEVICE), 18 bytes.
    let cmd = CmdSubmit {
        header: CmdHeader {
            command: CMD_SUBMIT,
            seqnum: 1,
            devid: 0x0001_0002,
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
    };
    let bytes = cmd.to_bytes();
    assert_eq!(bytes.len(), HEADER_SIZE, "IN submit carries no payload");

    let Command::Submit(parsed) = Command::read_from(&mut &bytes[..]).await.unwrap() else {
        panic!("expected submit");
    };
    assert_eq!(parsed.setup[0], 0x80);
    assert_eq!(parsed.transfer_buffer_length, 18);
    assert_eq!(parsed.header.seqnum, 1);
}

#[tokio::test]
async fn truncated_frames_error_instead_of_hanging() {
    let full = OpRequest::Import {
        bus_id: BusId::new("1-2").unwrap(),
    }
    .to_bytes();
    // Every prefix short of the full frame must fail with an I/O error.
    for cut in [1, 7, 8, 20, 39] {
        let err = OpRequest::read_from(&mut &full[..cut]).await.unwrap_err();
        assert!(matches!(err, protocol::ProtocolError::Io(_)), "cut at {cut}");
    }
}
