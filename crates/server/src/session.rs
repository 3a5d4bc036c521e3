//! Per-connection USB/IP session
//!
//! Drives one TCP connection through the protocol's two phases. A session
//! starts in the OP phase; a devlist request is answered and the connection
//! closed (list sessions are one-shot), an import request runs the attach
//! pipeline and, on success, switches the connection into CMD mode for the
//! rest of its life.
//!
//! CMD mode splits into the three tasks of an attachment: this function's
//! reader loop, a writer task draining the engine's FIFO completion queue,
//! and the engine's completion pump on the blocking pool. Teardown runs the
//! same sequence on every exit path: cancel outstanding urbs, suppress
//! their completions, drop the claimed device (which closes the stub handle
//! and removes the capture filter), then mark the share detached.

use std::net::SocketAddr;
use std::sync::Arc;

use common::{Error, Result};
use protocol::cmd::{self, CmdHeader, CmdSubmit, Command, RetSubmit, RetUnlink};
use protocol::op::{OpReply, OpRequest};
use protocol::status;
use protocol::types::{BusId, ExportedDevice};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::driver::{CaptureShim, ClaimedDevice, MonitorApi};
use crate::enumerator::{self, DeviceEnumerator};
use crate::registry::ShareRegistry;
use crate::urb::{Completion, UnlinkOutcome, UrbEngine};

/// Queue depth for unlink replies and synthesized submit failures
const REPLY_QUEUE_DEPTH: usize = 64;

/// Shared services a session operates against
pub struct SessionContext {
    pub enumerator: Arc<dyn DeviceEnumerator>,
    pub monitor: Arc<dyn MonitorApi>,
    pub registry: Arc<ShareRegistry>,
}

pub struct Session {
    ctx: Arc<SessionContext>,
    peer: SocketAddr,
    token: CancellationToken,
}

impl Session {
    pub fn new(ctx: Arc<SessionContext>, peer: SocketAddr, token: CancellationToken) -> Self {
        Self { ctx, peer, token }
    }

    /// Drive the connection until it closes
    pub async fn run<S>(self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);

        let request = tokio::select! {
            r = OpRequest::read_from(&mut reader) => r?,
            _ = self.token.cancelled() => return Ok(()),
        };

        match request {
            OpRequest::DevList => {
                let devices = self.shared_devices()?;
                debug!(peer = %self.peer, count = devices.len(), "device list requested");
                writer
                    .write_all(&OpReply::devlist(devices).to_bytes())
                    .await?;
                // List sessions are one-shot; the client reconnects to import.
                Ok(())
            }
            OpRequest::Import { bus_id } => self.import(bus_id, reader, writer).await,
        }
    }

    /// Present devices that are marked shared
    fn shared_devices(&self) -> Result<Vec<ExportedDevice>> {
        Ok(self
            .ctx
            .enumerator
            .enumerate()?
            .into_iter()
            .filter(|d| self.ctx.registry.is_shared(&d.bus_id))
            .collect())
    }

    async fn import<R, W>(self, bus_id: BusId, reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (device, claimed) = match self.attach(&bus_id).await {
            Ok(attached) => attached,
            Err(e) => {
                warn!(peer = %self.peer, %bus_id, error = %e, "import refused");
                // Best effort: the client may already be gone.
                let _ = writer.write_all(&OpReply::import_failure().to_bytes()).await;
                return Ok(());
            }
        };

        if let Err(e) = writer
            .write_all(&OpReply::import_success(device.clone()).to_bytes())
            .await
        {
            drop(claimed);
            self.ctx.registry.mark_detached(&bus_id);
            return Err(e.into());
        }

        info!(peer = %self.peer, %bus_id, "device imported");
        self.cmd_phase(&device, claimed, reader, writer).await
    }

    /// The attach pipeline: share check, attach slot, filter, claim
    async fn attach(&self, bus_id: &BusId) -> Result<(ExportedDevice, ClaimedDevice)> {
        if !self.ctx.registry.is_shared(bus_id) {
            return Err(Error::NotShared(bus_id.to_string()));
        }
        let device = enumerator::find_device(self.ctx.enumerator.as_ref(), bus_id)?
            .ok_or(Error::DeviceGone)?;

        // The attach slot is the exclusivity point: losing this race is the
        // only thing that stops two imports of the same bus id.
        self.ctx.registry.mark_attached(bus_id, self.peer)?;

        match self.claim_device(&device).await {
            Ok(claimed) => Ok((device, claimed)),
            Err(e) => {
                self.ctx.registry.mark_detached(bus_id);
                Err(e)
            }
        }
    }

    async fn claim_device(&self, device: &ExportedDevice) -> Result<ClaimedDevice> {
        let shim = CaptureShim::new(Arc::clone(&self.ctx.monitor));
        // A failure after this point drops the guard, removing the filter.
        let filter = shim.install_filter(device)?;
        shim.run_filters()?;
        shim.claim(device, filter).await
    }

    async fn cmd_phase<R, W>(
        &self,
        device: &ExportedDevice,
        claimed: ClaimedDevice,
        mut reader: R,
        writer: W,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let engine = UrbEngine::new(claimed.stub(), device.devid());
        let completions = engine.completions();
        let (reply_tx, reply_rx) = mpsc::channel(REPLY_QUEUE_DEPTH);
        let writer_task = tokio::spawn(write_frames(writer, completions, reply_rx));

        let outcome = self.cmd_loop(&engine, &reply_tx, &mut reader).await;

        // Teardown, in order, regardless of why the loop ended.
        engine.cancel_all();
        engine.close();
        writer_task.abort();
        let _ = writer_task.await;
        // The engine holds the last stub reference; drop it before the
        // claim so the device handle closes ahead of the filter removal.
        drop(engine);
        drop(claimed);
        self.ctx.registry.mark_detached(&device.bus_id);
        info!(peer = %self.peer, bus_id = %device.bus_id, "attachment closed");

        outcome
    }

    async fn cmd_loop<R>(
        &self,
        engine: &UrbEngine,
        reply_tx: &mpsc::Sender<Vec<u8>>,
        reader: &mut R,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        loop {
            let command = tokio::select! {
                c = Command::read_from(reader) => c,
                _ = self.token.cancelled() => {
                    debug!(peer = %self.peer, "session cancelled");
                    return Ok(());
                }
            };

            let command = match command {
                Ok(command) => command,
                Err(protocol::ProtocolError::Io(e)) => {
                    debug!(peer = %self.peer, "client disconnected: {}", e);
                    return Ok(());
                }
                Err(e) => {
                    warn!(peer = %self.peer, "protocol error: {}", e);
                    return Err(e.into());
                }
            };

            match command {
                Command::Submit(submit) => {
                    self.handle_submit(engine, reply_tx, submit).await?;
                }
                Command::Unlink(unlink) => {
                    let verdict = engine.unlink(unlink.unlink_seqnum);
                    debug!(
                        peer = %self.peer,
                        seqnum = unlink.unlink_seqnum,
                        ?verdict,
                        "unlink"
                    );
                    let ret = RetUnlink {
                        header: unlink.header.reply(cmd::RET_UNLINK),
                        status: match verdict {
                            UnlinkOutcome::Cancelled => status::SUCCESS,
                            UnlinkOutcome::AlreadyCompleted => status::ECONNRESET,
                        },
                    };
                    if reply_tx.send(ret.to_bytes()).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle_submit(
        &self,
        engine: &UrbEngine,
        reply_tx: &mpsc::Sender<Vec<u8>>,
        submit: CmdSubmit,
    ) -> Result<()> {
        let header = submit.header;
        match engine.submit(submit) {
            Ok(()) => Ok(()),
            // A seqnum collision is a protocol violation, not an urb failure.
            Err(Error::Protocol(e)) => Err(e.into()),
            Err(e) => {
                // The urb was never registered: answer it right away.
                debug!(peer = %self.peer, seqnum = header.seqnum, error = %e, "submit refused");
                let ret = RetSubmit {
                    header: header.reply(cmd::RET_SUBMIT),
                    status: e.urb_status(),
                    actual_length: 0,
                    start_frame: 0,
                    number_of_packets: 0,
                    error_count: 0,
                    data: Vec::new(),
                    iso_packets: Vec::new(),
                };
                let _ = reply_tx.send(ret.to_bytes()).await;
                Ok(())
            }
        }
    }
}

/// Writer task: the only owner of the socket's send side
///
/// Completions drain in queue order, which preserves per-endpoint
/// completion order on the wire. Unlink replies and synthesized failures
/// arrive on their own queue and may interleave between completions.
async fn write_frames<W>(
    mut writer: W,
    completions: async_channel::Receiver<Completion>,
    mut replies: mpsc::Receiver<Vec<u8>>,
) where
    W: AsyncWrite + Unpin + Send,
{
    loop {
        tokio::select! {
            completion = completions.recv() => match completion {
                Ok(completion) => {
                    let frame = encode_completion(completion);
                    if writer.write_all(&frame).await.is_err() {
                        return;
                    }
                }
                Err(_) => return,
            },
            reply = replies.recv() => match reply {
                Some(frame) => {
                    if writer.write_all(&frame).await.is_err() {
                        return;
                    }
                }
                None => return,
            },
        }
    }
}

fn encode_completion(c: Completion) -> Vec<u8> {
    RetSubmit {
        header: CmdHeader {
            command: cmd::RET_SUBMIT,
            seqnum: c.seqnum,
            devid: c.devid,
            direction: c.direction,
            ep: c.ep,
        },
        status: c.status,
        actual_length: c.actual_length,
        start_frame: c.start_frame,
        number_of_packets: c.number_of_packets,
        error_count: c.error_count,
        data: c.data,
        iso_packets: c.iso_packets,
    }
    .to_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::emulated::EmulatedHost;
    use crate::registry::{MemoryStore, ShareRegistry};
    use protocol::UsbSpeed;
    use tokio::io::AsyncReadExt;

    fn device(bus_id: &str, bus: u32, port: u32) -> ExportedDevice {
        ExportedDevice {
            bus_id: BusId::new(bus_id).unwrap(),
            path: String::new(),
            bus_num: bus,
            dev_num: port,
            speed: UsbSpeed::High,
            vendor_id: 0x1234,
            product_id: 0x5678,
            bcd_device: 0x0200,
            device_class: 3,
            sub_class: 0,
            protocol: 0,
            configuration_value: 1,
            num_configurations: 1,
            num_interfaces: 0,
            interfaces: vec![],
        }
    }

    fn context(devices: Vec<ExportedDevice>) -> (Arc<EmulatedHost>, Arc<SessionContext>) {
        let host = EmulatedHost::new(devices);
        let ctx = Arc::new(SessionContext {
            enumerator: host.clone(),
            monitor: host.clone(),
            registry: Arc::new(ShareRegistry::open(Box::new(MemoryStore::default())).unwrap()),
        });
        (host, ctx)
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:54321".parse().unwrap()
    }

    #[tokio::test]
    async fn devlist_session_is_one_shot() {
        let (_host, ctx) = context(vec![device("1-2", 1, 2)]);
        ctx.registry
            .bind(BusId::new("1-2").unwrap(), String::new())
            .unwrap();

        let (client, server) = tokio::io::duplex(4096);
        let session = Session::new(ctx, peer(), CancellationToken::new());
        let task = tokio::spawn(session.run(server));

        let (mut read, mut write) = tokio::io::split(client);
        write.write_all(&OpRequest::DevList.to_bytes()).await.unwrap();

        let reply = OpReply::read_from(&mut read).await.unwrap();
        let OpReply::DevList { devices } = reply else {
            panic!("expected devlist reply");
        };
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].bus_id.as_str(), "1-2");

        // The server closes after the reply.
        assert_eq!(read.read(&mut [0u8; 1]).await.unwrap(), 0);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn import_of_unshared_device_fails_cleanly() {
        let (host, ctx) = context(vec![device("1-2", 1, 2)]);

        let (client, server) = tokio::io::duplex(4096);
        let session = Session::new(ctx, peer(), CancellationToken::new());
        let task = tokio::spawn(session.run(server));

        let (mut read, mut write) = tokio::io::split(client);
        write
            .write_all(
                &OpRequest::Import {
                    bus_id: BusId::new("1-2").unwrap(),
                }
                .to_bytes(),
            )
            .await
            .unwrap();

        let reply = OpReply::read_from(&mut read).await.unwrap();
        assert_eq!(
            reply,
            OpReply::Import {
                status: protocol::OP_STATUS_ERROR,
                device: None
            }
        );
        assert_eq!(host.filter_count(), 0);
        task.await.unwrap().unwrap();
    }
}
