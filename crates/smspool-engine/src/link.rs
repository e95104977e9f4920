//! A single managed link and the exclusive lease that grants its use.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smspool_models::{
    Capability, DeviceIdentity, Imei, LinkId, LinkRole, LinkStatus, OutboundSms, PhoneNumber,
    ReceivedMessage,
};
use tracing::{debug, warn};

use crate::classifier::{self, DriverCode, DriverError};
use crate::driver::{LinkDriver, LinkHandle};

/// Code reported by [`Link::probe`] when the probe itself could not run.
pub const PROBE_ABORTED: DriverCode = -1;

/// Run a blocking driver call off the async workers.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, DriverError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DriverError::Aborted(e.to_string()))
}

/// One open device connection owned by the registry.
pub struct Link {
    id: LinkId,
    port: String,
    identity: DeviceIdentity,
    capability: Capability,
    opened_at: DateTime<Utc>,
    handle: LinkHandle,
    driver: Arc<dyn LinkDriver>,
    status: Mutex<LinkStatus>,
}

/// Serializable view of a link at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSnapshot {
    pub id: LinkId,
    pub port: String,
    pub identity: DeviceIdentity,
    pub capability: Capability,
    pub status: LinkStatus,
    pub opened_at: DateTime<Utc>,
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id)
            .field("port", &self.port)
            .field("imei", &self.identity.imei)
            .field("capability", &self.capability)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Link {
    pub(crate) fn new(
        id: LinkId,
        port: String,
        identity: DeviceIdentity,
        capability: Capability,
        handle: LinkHandle,
        driver: Arc<dyn LinkDriver>,
    ) -> Self {
        Self {
            id,
            port,
            identity,
            capability,
            opened_at: Utc::now(),
            handle,
            driver,
            status: Mutex::new(LinkStatus::Available),
        }
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn imei(&self) -> &Imei {
        &self.identity.imei
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    pub fn status(&self) -> LinkStatus {
        *self.lock_status()
    }

    pub fn is_disabled(&self) -> bool {
        self.status() == LinkStatus::Disabled
    }

    /// Whether a lease for `role` could be taken right now.
    pub fn is_eligible(&self, role: LinkRole) -> bool {
        self.capability.allows(role) && self.status() == LinkStatus::Available
    }

    /// Whether `role` work can run on the link now or once its current job
    /// of the same role ends.
    pub fn accepts(&self, role: LinkRole) -> bool {
        let status = self.status();
        self.capability.allows(role)
            && (status == LinkStatus::Available || status == LinkStatus::from(role))
    }

    pub fn snapshot(&self) -> LinkSnapshot {
        LinkSnapshot {
            id: self.id,
            port: self.port.clone(),
            identity: self.identity.clone(),
            capability: self.capability,
            status: self.status(),
            opened_at: self.opened_at,
        }
    }

    /// Atomically claim the link for `role`.
    ///
    /// Succeeds only when the capability covers the role and the link is
    /// `available`; the status check and the claim happen under one lock.
    pub fn try_lease(self: &Arc<Self>, role: LinkRole) -> Option<LinkLease> {
        if !self.capability.allows(role) {
            return None;
        }
        let mut status = self.lock_status();
        if *status != LinkStatus::Available {
            return None;
        }
        let held = LinkStatus::from(role);
        *status = held;
        debug!(link = %self.id, %role, "link leased");
        Some(LinkLease {
            link: Arc::clone(self),
            held,
        })
    }

    /// Permanently take the link out of rotation.
    pub fn disable(&self) {
        *self.lock_status() = LinkStatus::Disabled;
    }

    /// Ask the driver whether the device still answers.
    pub async fn probe(&self) -> DriverCode {
        let driver = Arc::clone(&self.driver);
        let handle = self.handle;
        match blocking(move || driver.probe(handle)).await {
            Ok(code) => code,
            Err(e) => {
                warn!(link = %self.id, error = %e, "probe aborted");
                PROBE_ABORTED
            }
        }
    }

    pub(crate) async fn close(&self) {
        let driver = Arc::clone(&self.driver);
        let handle = self.handle;
        if let Err(e) = blocking(move || driver.close(handle)).await {
            warn!(link = %self.id, error = %e, "close aborted");
        }
    }

    fn lock_status(&self) -> MutexGuard<'_, LinkStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive right to use a link for one role.
///
/// Dropping the lease puts the link back to `available`, whatever way the
/// holder exits (return, error, task abort, panic). A link disabled while
/// leased stays disabled.
pub struct LinkLease {
    link: Arc<Link>,
    held: LinkStatus,
}

impl fmt::Debug for LinkLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkLease")
            .field("link", &self.link.id)
            .field("held", &self.held)
            .finish()
    }
}

impl LinkLease {
    pub fn link(&self) -> &Arc<Link> {
        &self.link
    }

    /// One delivery attempt.
    pub async fn send(
        &self,
        destination: &PhoneNumber,
        sms: &Arc<OutboundSms>,
    ) -> Result<(), DriverError> {
        let driver = Arc::clone(&self.link.driver);
        let handle = self.link.handle;
        let destination = destination.clone();
        let sms = Arc::clone(sms);
        let code = blocking(move || driver.send_message(handle, &destination, &sms)).await?;
        if code == classifier::CODE_OK {
            Ok(())
        } else {
            Err(DriverError::with_message(code, self.link.driver.describe(code)))
        }
    }

    /// One poll cycle: every intact inbox record, in device index order.
    pub async fn poll(&self) -> Result<Vec<ReceivedMessage>, DriverError> {
        let driver = Arc::clone(&self.link.driver);
        let handle = self.link.handle;
        let link = self.link.id;
        blocking(move || {
            let count = driver
                .poll_count(handle)
                .map_err(|code| DriverError::with_message(code, driver.describe(code)))?;
            let mut messages = Vec::new();
            for index in 0..count {
                match driver.fetch_message(handle, index) {
                    Ok(message) if message.is_well_formed_inbox() => messages.push(message),
                    Ok(message) => {
                        debug!(%link, index, error_code = message.error_code, "skipping non-inbox record");
                    }
                    Err(code) => {
                        debug!(%link, index, code, "skipping unreadable record");
                    }
                }
            }
            messages.sort_by_key(|m| m.index);
            Ok(messages)
        })
        .await?
    }
}

impl Drop for LinkLease {
    fn drop(&mut self) {
        let mut status = self.link.lock_status();
        if *status == self.held {
            *status = LinkStatus::Available;
        }
        debug!(link = %self.link.id, "link released");
    }
}
