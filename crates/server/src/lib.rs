//! usbipd server
//!
//! Exports locally attached USB devices to remote USB/IP clients. A device
//! is shared via the CLI, claimed away from the host USB stack through the
//! kernel capture driver when a client imports it, and driven by the
//! per-attachment URB engine from then on.
//!
//! Module map:
//! - [`enumerator`] — present-device discovery
//! - [`driver`] — capture-driver surface, attach shim, emulation
//! - [`urb`] — per-attachment URB engine
//! - [`session`] — per-connection protocol state machine
//! - [`registry`] — persisted share table with transient attach state
//! - [`listener`] — TCP accept loop on the USB/IP port
//! - `windows` — Win32 transports for all of the above

pub mod config;
pub mod driver;
pub mod enumerator;
pub mod listener;
pub mod registry;
pub mod session;
pub mod urb;
#[cfg(windows)]
pub mod windows;

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::listener::Listener;
use crate::registry::{FileStore, ShareRegistry};
use crate::session::SessionContext;

/// Open the persisted share registry for this configuration
pub fn open_registry(config: &ServerConfig) -> anyhow::Result<Arc<ShareRegistry>> {
    let store = FileStore::new(config.share_file());
    Ok(Arc::new(
        ShareRegistry::open(Box::new(store)).context("loading the share table")?,
    ))
}

/// Run the USB/IP server until the token fires
pub async fn serve(config: ServerConfig, token: CancellationToken) -> anyhow::Result<()> {
    let ctx = platform_context(&config)?;
    let listener = Listener::bind(config.listen_addr()?, ctx)
        .await
        .context("starting the USB/IP listener")?;
    listener.run(token).await?;
    Ok(())
}

#[cfg(windows)]
fn platform_context(config: &ServerConfig) -> anyhow::Result<Arc<SessionContext>> {
    let monitor =
        windows::WinMonitor::open().context("opening the capture driver monitor device")?;
    Ok(Arc::new(SessionContext {
        enumerator: windows::WinEnumerator::new(),
        monitor,
        registry: open_registry(config)?,
    }))
}

#[cfg(not(windows))]
fn platform_context(_config: &ServerConfig) -> anyhow::Result<Arc<SessionContext>> {
    anyhow::bail!(
        "device capture requires the Windows kernel driver; \
         this host can only run the test suite and the emulated harness"
    )
}
