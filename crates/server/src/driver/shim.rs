//! Capture driver shim: filter installation and device claiming
//!
//! Attaching a device is a two-phase dance with the kernel driver. First a
//! capture filter is installed and the filter set re-run, which diverts the
//! matched device to the capture stack and physically re-enumerates it.
//! Only after that re-enumeration finishes does a stub device interface
//! appear that user mode can open, hence the bounded claim retry below.

use std::sync::Arc;
use std::time::Duration;

use common::{Error, Result};
use protocol::types::ExportedDevice;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::api::{DeviceToken, FilterId, FilterSpec, MonitorApi, StubApi};

/// How long a captured device gets to re-enumerate
pub const CLAIM_TIMEOUT: Duration = Duration::from_secs(5);
/// Poll interval while waiting for the stub interface
pub const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// An installed capture filter, removed on drop
pub struct FilterGuard {
    monitor: Arc<dyn MonitorApi>,
    id: Option<FilterId>,
}

impl FilterGuard {
    pub fn id(&self) -> Option<FilterId> {
        self.id
    }

    /// Remove the filter now and surface the driver's verdict
    pub fn release(mut self) -> Result<()> {
        match self.id.take() {
            Some(id) => self.monitor.remove_filter(id),
            None => Ok(()),
        }
    }
}

impl Drop for FilterGuard {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            if let Err(e) = self.monitor.remove_filter(id) {
                warn!("failed to remove capture filter {:?}: {}", id, e);
            }
        }
    }
}

/// A device exclusively owned by this process
///
/// Groups the stub handle with its sibling capture filter so teardown is a
/// single drop: the stub handle closes, then the filter is removed and the
/// device returns to the regular USB stack.
pub struct ClaimedDevice {
    stub: Arc<dyn StubApi>,
    token: DeviceToken,
    // field order matters: the stub handle must close before the filter goes
    _filter: FilterGuard,
}

impl std::fmt::Debug for ClaimedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimedDevice")
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

impl ClaimedDevice {
    pub fn stub(&self) -> Arc<dyn StubApi> {
        Arc::clone(&self.stub)
    }

    pub fn token(&self) -> DeviceToken {
        self.token
    }
}

/// User-mode shim over the capture driver's monitor device
#[derive(Clone)]
pub struct CaptureShim {
    monitor: Arc<dyn MonitorApi>,
}

impl CaptureShim {
    pub fn new(monitor: Arc<dyn MonitorApi>) -> Self {
        Self { monitor }
    }

    /// Verify the installed driver speaks our interface version
    pub fn check_version(&self) -> Result<()> {
        let version = self.monitor.version()?;
        if !version.is_compatible() {
            return Err(Error::UnsupportedDriver {
                found_major: version.major,
                found_minor: version.minor,
                expected_major: super::api::DRIVER_MAJOR,
                expected_minor: super::api::DRIVER_MINOR,
            });
        }
        Ok(())
    }

    /// Install the capture filter for `dev`
    pub fn install_filter(&self, dev: &ExportedDevice) -> Result<FilterGuard> {
        let spec = FilterSpec::for_device(dev);
        let id = self.monitor.add_filter(&spec)?;
        debug!(bus_id = %dev.bus_id, filter = id.0, "capture filter installed");
        Ok(FilterGuard {
            monitor: Arc::clone(&self.monitor),
            id: Some(id),
        })
    }

    /// Re-evaluate the filter set against present devices
    pub fn run_filters(&self) -> Result<()> {
        self.monitor.run_filters()
    }

    /// Wait for the captured device to re-enumerate and claim it
    ///
    /// Polls the stub device-interface class every 100 ms for up to 5 s,
    /// looking for a stub whose `(hub, port)` matches the device. A missing
    /// stub is retried; every other driver error aborts the claim
    /// immediately and is surfaced to the caller.
    pub async fn claim(&self, dev: &ExportedDevice, filter: FilterGuard) -> Result<ClaimedDevice> {
        let deadline = Instant::now() + CLAIM_TIMEOUT;
        loop {
            if let Some((stub, token)) = self.try_claim(dev)? {
                debug!(bus_id = %dev.bus_id, token = token.0, "device claimed");
                return Ok(ClaimedDevice {
                    stub,
                    token,
                    _filter: filter,
                });
            }
            if Instant::now() >= deadline {
                return Err(Error::ClaimTimeout);
            }
            tokio::time::sleep(CLAIM_POLL_INTERVAL).await;
        }
    }

    /// One claim attempt; `Ok(None)` means the stub has not appeared yet
    fn try_claim(&self, dev: &ExportedDevice) -> Result<Option<(Arc<dyn StubApi>, DeviceToken)>> {
        let candidate = self
            .monitor
            .scan_stubs()?
            .into_iter()
            .find(|c| c.hub == dev.bus_num && c.port == dev.dev_num);
        let Some(candidate) = candidate else {
            return Ok(None);
        };

        let stub = self.monitor.open_stub(&candidate)?;

        let version = stub.version()?;
        if !version.is_compatible() {
            return Err(Error::UnsupportedDriver {
                found_major: version.major,
                found_minor: version.minor,
                expected_major: super::api::DRIVER_MAJOR,
                expected_minor: super::api::DRIVER_MINOR,
            });
        }

        let state = stub.state()?;
        if !state.operational {
            return Err(Error::DeviceGone);
        }

        let token = stub.token()?;
        if !self.monitor.owns_device(token)? {
            // The stub at this address belongs to someone else's filter.
            return Err(Error::NotClaimable);
        }

        if !stub.claim(token)? {
            return Err(Error::NotClaimable);
        }
        let state = stub.state()?;
        if !state.claimed {
            return Err(Error::NotClaimable);
        }

        Ok(Some((stub, token)))
    }
}
