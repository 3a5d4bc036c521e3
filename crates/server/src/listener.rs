//! TCP listener for the USB/IP port
//!
//! Accepts connections and runs one [`Session`] task per client. A session
//! failing never affects its siblings. Shutdown cancels the parent token,
//! which fans out to every session's child token, then awaits their orderly
//! detach before returning.

use std::net::SocketAddr;
use std::sync::Arc;

use common::Result;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::driver::CaptureShim;
use crate::session::{Session, SessionContext};

/// Default USB/IP TCP port
pub const USBIP_PORT: u16 = 3240;

pub struct Listener {
    ctx: Arc<SessionContext>,
    listener: TcpListener,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("listener", &self.listener)
            .finish_non_exhaustive()
    }
}

impl Listener {
    /// Bind the server socket
    ///
    /// Refuses to start when the installed capture driver does not speak
    /// our interface version; per-attachment errors never kill the
    /// listener, but a wrong driver is fatal before the first accept.
    pub async fn bind(addr: SocketAddr, ctx: Arc<SessionContext>) -> Result<Self> {
        CaptureShim::new(Arc::clone(&ctx.monitor)).check_version()?;
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "usbipd listening");
        Ok(Self { ctx, listener })
    }

    /// The actually bound address (useful with port 0)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the token fires, then drain sessions
    pub async fn run(self, token: CancellationToken) -> Result<()> {
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "connection accepted");
                            stream.set_nodelay(true).ok();
                            let session = Session::new(
                                Arc::clone(&self.ctx),
                                peer,
                                token.child_token(),
                            );
                            sessions.spawn(async move {
                                if let Err(e) = session.run(stream).await {
                                    warn!(%peer, "session ended with error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("accept failed: {}", e);
                        }
                    }
                }
                _ = token.cancelled() => break,
            }

            // Reap finished sessions so the set does not grow unbounded.
            while let Some(finished) = sessions.try_join_next() {
                if let Err(e) = finished {
                    warn!("session task panicked: {}", e);
                }
            }
        }

        info!("listener stopping, waiting for {} active session(s)", sessions.len());
        while let Some(finished) = sessions.join_next().await {
            if let Err(e) = finished {
                warn!("session task panicked during shutdown: {}", e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::api::{DRIVER_MAJOR, DriverVersion};
    use crate::driver::emulated::EmulatedHost;
    use crate::registry::{MemoryStore, ShareRegistry};
    use common::Error;

    #[tokio::test]
    async fn refuses_to_start_on_driver_mismatch() {
        let host = EmulatedHost::with_version(
            vec![],
            DriverVersion {
                major: DRIVER_MAJOR + 1,
                minor: 0,
            },
        );
        let ctx = Arc::new(SessionContext {
            enumerator: host.clone(),
            monitor: host,
            registry: Arc::new(ShareRegistry::open(Box::new(MemoryStore::default())).unwrap()),
        });

        let err = Listener::bind("127.0.0.1:0".parse().unwrap(), ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedDriver { .. }));
    }
}
