//! Link registry.
//!
//! Maps [`LinkId`]s to open [`Link`]s, discovers devices on the configured
//! ports and classifies each one by capability. One registry is shared (via
//! `Arc`) by the dispatcher, the health monitor and the receive scheduler;
//! per-link coordination happens through leases, never through the map.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use smspool_models::{Capability, Imei, LinkId, LinkRole};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::classifier::{self, DriverCode, DriverError};
use crate::driver::{LinkDriver, LinkProfile};
use crate::link::{self, Link, LinkLease, LinkSnapshot};

/// A registry of links over one driver.
pub struct LinkRegistry {
    driver: Arc<dyn LinkDriver>,
    ports: Vec<String>,
    send_imeis: Vec<Imei>,
    receive_imeis: Vec<Imei>,
    links: RwLock<BTreeMap<LinkId, Arc<Link>>>,
    next_id: AtomicU32,
    discovery: Mutex<()>,
}

/// Outcome of [`LinkRegistry::refresh`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    /// Links probed.
    pub probed: usize,
    /// Links disabled by this refresh.
    pub disabled: usize,
    /// Links newly opened.
    pub opened: usize,
}

impl LinkRegistry {
    /// Create an empty registry; nothing is opened until a discovery runs.
    pub fn new(
        driver: Arc<dyn LinkDriver>,
        ports: Vec<String>,
        send_imeis: Vec<Imei>,
        receive_imeis: Vec<Imei>,
    ) -> Self {
        Self {
            driver,
            ports,
            send_imeis,
            receive_imeis,
            links: RwLock::new(BTreeMap::new()),
            next_id: AtomicU32::new(0),
            discovery: Mutex::new(()),
        }
    }

    /// The configured ports.
    pub fn ports(&self) -> &[String] {
        &self.ports
    }

    /// Open a link on every given port that has no live link yet.
    ///
    /// Returns the number of newly opened links.
    pub async fn discover(&self, ports: &[String]) -> usize {
        self.discover_links(ports).await.len()
    }

    /// Discovery over the configured ports, returning the new links.
    pub async fn discover_configured(&self) -> Vec<Arc<Link>> {
        self.discover_links(&self.ports).await
    }

    async fn discover_links(&self, ports: &[String]) -> Vec<Arc<Link>> {
        // Serialise discoveries so two callers never open the same port twice.
        let _guard = self.discovery.lock().await;
        let mut opened = Vec::new();
        for (index, port) in ports.iter().enumerate() {
            if let Some(existing) = self.link_on_port(port) {
                if !existing.is_disabled() {
                    continue;
                }
                self.retire(existing.id()).await;
            }
            let profile = LinkProfile::for_port(self.profile_index(port).unwrap_or(index), port);
            if let Some(link) = self.open_link(profile).await {
                opened.push(link);
            }
        }
        opened
    }

    async fn open_link(&self, profile: LinkProfile) -> Option<Arc<Link>> {
        let driver = Arc::clone(&self.driver);
        let probe_profile = profile.clone();
        let opened = link::blocking(move || {
            let handle = driver.open(&probe_profile)?;
            match driver.identity(handle) {
                Ok(identity) => Ok((handle, identity)),
                Err(code) => {
                    driver.close(handle);
                    Err(code)
                }
            }
        })
        .await;

        let (handle, identity) = match opened {
            Ok(Ok(pair)) => pair,
            Ok(Err(code)) => {
                self.log_open_failure(&profile, code);
                return None;
            }
            Err(e) => {
                warn!(port = %profile.port, error = %e, "opening link aborted");
                return None;
            }
        };

        let capability = Capability::classify(&identity.imei, &self.send_imeis, &self.receive_imeis);
        let id = LinkId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let link = Arc::new(Link::new(
            id,
            profile.port.clone(),
            identity,
            capability,
            handle,
            Arc::clone(&self.driver),
        ));
        info!(
            link = %id,
            port = %profile.port,
            imei = %link.imei(),
            %capability,
            "link opened"
        );
        self.write_links().insert(id, Arc::clone(&link));
        Some(link)
    }

    fn log_open_failure(&self, profile: &LinkProfile, code: DriverCode) {
        match DriverError::from_code(code) {
            // Classified failures mean "no device on this port": expected, stay quiet.
            DriverError::Link(err) => {
                debug!(port = %profile.port, kind = %err.kind, code, "no device found");
            }
            other => {
                warn!(
                    port = %profile.port,
                    error = %other,
                    detail = %self.driver.describe(code),
                    "failed to open link"
                );
            }
        }
    }

    /// Re-test a link; disables it unless the code is ok or whitelisted.
    pub async fn probe(&self, link: &Link) -> DriverCode {
        let code = link.probe().await;
        if !classifier::probe_keeps_link(code) && !link.is_disabled() {
            warn!(link = %link.id(), port = %link.port(), code, "probe failed, disabling link");
            link.disable();
        }
        code
    }

    /// Probe every link, then discover configured ports without a live link.
    pub async fn refresh(&self) -> RefreshSummary {
        let mut summary = RefreshSummary::default();
        for link in self.links() {
            if link.is_disabled() {
                continue;
            }
            summary.probed += 1;
            self.probe(&link).await;
            if link.is_disabled() {
                summary.disabled += 1;
            }
        }
        summary.opened = self.discover_configured().await.len();
        summary
    }

    /// Remove a link from the registry and close its connection.
    pub async fn retire(&self, id: LinkId) -> Option<Arc<Link>> {
        let link = self.write_links().remove(&id)?;
        link.disable();
        link.close().await;
        info!(link = %id, port = %link.port(), "link retired");
        Some(link)
    }

    /// Close every link and empty the registry.
    pub async fn close_all(&self) {
        let links: Vec<Arc<Link>> = std::mem::take(&mut *self.write_links()).into_values().collect();
        for link in links {
            link.disable();
            link.close().await;
        }
    }

    /// Links that could be leased for `role` right now.
    pub fn eligible(&self, role: LinkRole) -> Vec<Arc<Link>> {
        self.links()
            .into_iter()
            .filter(|l| l.is_eligible(role))
            .collect()
    }

    /// Links that can take `role` work now or between two jobs of that role.
    pub fn accepting(&self, role: LinkRole) -> Vec<Arc<Link>> {
        self.links()
            .into_iter()
            .filter(|l| l.accepts(role))
            .collect()
    }

    /// Lease every link available for `role`.
    pub fn lease_all(&self, role: LinkRole) -> Vec<LinkLease> {
        self.links()
            .iter()
            .filter_map(|l| l.try_lease(role))
            .collect()
    }

    pub fn get(&self, id: LinkId) -> Option<Arc<Link>> {
        self.read_links().get(&id).cloned()
    }

    /// Find the live link whose device has this IMEI.
    pub fn find_by_imei(&self, imei: &Imei) -> Option<Arc<Link>> {
        self.read_links()
            .values()
            .find(|l| l.imei() == imei && !l.is_disabled())
            .cloned()
    }

    /// All registered links, in id order.
    pub fn links(&self) -> Vec<Arc<Link>> {
        self.read_links().values().cloned().collect()
    }

    pub fn snapshot(&self) -> Vec<LinkSnapshot> {
        self.read_links().values().map(|l| l.snapshot()).collect()
    }

    pub fn len(&self) -> usize {
        self.read_links().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_links().is_empty()
    }

    fn link_on_port(&self, port: &str) -> Option<Arc<Link>> {
        self.read_links()
            .values()
            .find(|l| l.port() == port)
            .cloned()
    }

    fn profile_index(&self, port: &str) -> Option<usize> {
        self.ports.iter().position(|p| p == port)
    }

    fn read_links(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<LinkId, Arc<Link>>> {
        self.links.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_links(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<LinkId, Arc<Link>>> {
        self.links.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDriver;
    use smspool_models::LinkStatus;

    const SEND_IMEI: &str = "111111111111111";
    const RECV_IMEI: &str = "222222222222222";
    const BOTH_IMEI: &str = "333333333333333";

    fn ports(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("/dev/ttyUSB{i}")).collect()
    }

    fn registry(driver: &Arc<SimDriver>, n: usize) -> LinkRegistry {
        LinkRegistry::new(
            Arc::clone(driver) as Arc<dyn LinkDriver>,
            ports(n),
            vec![Imei::normalize(SEND_IMEI), Imei::normalize(BOTH_IMEI)],
            vec![Imei::normalize(RECV_IMEI), Imei::normalize(BOTH_IMEI)],
        )
    }

    #[tokio::test]
    async fn discover_classifies_and_skips_empty_ports() {
        let driver = Arc::new(SimDriver::new());
        driver.attach("/dev/ttyUSB0", SEND_IMEI);
        driver.attach("/dev/ttyUSB1", RECV_IMEI);
        driver.attach("/dev/ttyUSB3", BOTH_IMEI);
        let registry = registry(&driver, 4);

        let opened = registry.discover(registry.ports()).await;
        assert_eq!(opened, 3);

        let caps: Vec<Capability> = registry.links().iter().map(|l| l.capability()).collect();
        assert_eq!(
            caps,
            vec![Capability::Send, Capability::Receive, Capability::SendReceive]
        );
    }

    #[tokio::test]
    async fn unknown_imei_defaults_to_send() {
        let driver = Arc::new(SimDriver::new());
        driver.attach("/dev/ttyUSB0", "999999999999999");
        let registry = registry(&driver, 1);
        registry.discover_configured().await;
        assert_eq!(registry.links()[0].capability(), Capability::Send);
    }

    #[tokio::test]
    async fn rediscovery_skips_live_ports() {
        let driver = Arc::new(SimDriver::new());
        driver.attach("/dev/ttyUSB0", SEND_IMEI);
        let registry = registry(&driver, 2);
        assert_eq!(registry.discover_configured().await.len(), 1);
        assert_eq!(registry.discover_configured().await.len(), 0);

        driver.attach("/dev/ttyUSB1", RECV_IMEI);
        let new = registry.discover_configured().await;
        assert_eq!(new.len(), 1);
        assert_eq!(new[0].port(), "/dev/ttyUSB1");
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn probe_disables_on_hard_failure() {
        let driver = Arc::new(SimDriver::new());
        driver.attach("/dev/ttyUSB0", SEND_IMEI);
        driver.attach("/dev/ttyUSB1", SEND_IMEI);
        let registry = registry(&driver, 2);
        registry.discover_configured().await;
        let links = registry.links();

        driver.set_probe_code("/dev/ttyUSB0", 22);
        driver.set_probe_code("/dev/ttyUSB1", 5);
        assert_eq!(registry.probe(&links[0]).await, 22);
        assert_eq!(registry.probe(&links[1]).await, 5);
        assert_eq!(links[0].status(), LinkStatus::Available);
        assert_eq!(links[1].status(), LinkStatus::Disabled);
        assert_eq!(registry.eligible(LinkRole::Send).len(), 1);
    }

    #[tokio::test]
    async fn refresh_reopens_disabled_port() {
        let driver = Arc::new(SimDriver::new());
        driver.attach("/dev/ttyUSB0", SEND_IMEI);
        let registry = registry(&driver, 1);
        registry.discover_configured().await;
        let first = registry.links()[0].id();

        driver.set_probe_code("/dev/ttyUSB0", 7);
        let summary = registry.refresh().await;
        assert_eq!(summary.probed, 1);
        assert_eq!(summary.disabled, 1);
        // The device still opens, so the disabled link is replaced.
        assert_eq!(summary.opened, 1);
        let links = registry.links();
        assert_eq!(links.len(), 1);
        assert_ne!(links[0].id(), first);
        assert_eq!(driver.closed_handles(), 1);
    }

    #[tokio::test]
    async fn retire_closes_handle() {
        let driver = Arc::new(SimDriver::new());
        driver.attach("/dev/ttyUSB0", SEND_IMEI);
        let registry = registry(&driver, 1);
        registry.discover_configured().await;
        let id = registry.links()[0].id();

        let retired = registry.retire(id).await.expect("retired");
        assert!(retired.is_disabled());
        assert!(registry.is_empty());
        assert_eq!(driver.closed_handles(), 1);
        assert!(registry.retire(id).await.is_none());
    }

    #[tokio::test]
    async fn lease_all_skips_busy_links() {
        let driver = Arc::new(SimDriver::new());
        driver.attach("/dev/ttyUSB0", BOTH_IMEI);
        driver.attach("/dev/ttyUSB1", SEND_IMEI);
        let registry = registry(&driver, 2);
        registry.discover_configured().await;

        let receiving = registry.links()[0]
            .try_lease(LinkRole::Receive)
            .expect("receive lease");
        let leases = registry.lease_all(LinkRole::Send);
        assert_eq!(leases.len(), 1);
        assert_eq!(leases[0].link().port(), "/dev/ttyUSB1");

        // Mid-send still accepts send work; mid-receive does not.
        let accepting = registry.accepting(LinkRole::Send);
        assert_eq!(accepting.len(), 1);
        assert_eq!(accepting[0].port(), "/dev/ttyUSB1");
        drop(receiving);
    }

    #[tokio::test]
    async fn find_by_imei_and_close_all() {
        let driver = Arc::new(SimDriver::new());
        driver.attach("/dev/ttyUSB0", RECV_IMEI);
        let registry = registry(&driver, 1);
        registry.discover_configured().await;

        assert!(registry.find_by_imei(&Imei::normalize(RECV_IMEI)).is_some());
        assert!(registry.find_by_imei(&Imei::normalize(SEND_IMEI)).is_none());

        registry.close_all().await;
        assert!(registry.is_empty());
        assert_eq!(driver.closed_handles(), 1);
    }
}
