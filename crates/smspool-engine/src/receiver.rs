//! Inbound polling.
//!
//! [`ReceiveScheduler::receive`] starts one independent task per receiving
//! link. Each task holds a `receiving` lease for its whole life and polls
//! either once or repeatedly for a bounded duration. Every accepted message
//! goes to the caller callback first, then to the [`MessageStore`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use smspool_models::{Imei, LinkRole, ReceivedMessage};
use tokio::task::{self, JoinSet};
use tracing::{debug, info, warn};

use crate::error::ReceiveError;
use crate::link::{self, LinkLease};
use crate::monitor::run_periodic;
use crate::registry::LinkRegistry;
use crate::store::MessageStore;

/// Default pause between two poll cycles of a timed receive.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Called for every accepted message with the IMEI of the receiving device.
pub type MessageCallback = Arc<dyn Fn(&ReceivedMessage, &Imei) + Send + Sync>;

/// How long a receive task keeps polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReceiveMode {
    /// One poll cycle.
    Once,
    /// Poll every interval for `duration_secs` seconds; `0` polls until stopped.
    Timed { duration_secs: u64 },
}

impl ReceiveMode {
    /// Timed mode from a duration (`Duration::ZERO`: until stopped).
    ///
    /// Partial seconds round up, so a non-zero duration stays bounded.
    pub fn timed(duration: Duration) -> Self {
        Self::Timed {
            duration_secs: duration.as_secs() + u64::from(duration.subsec_nanos() > 0),
        }
    }
}

impl Default for ReceiveMode {
    fn default() -> Self {
        Self::Timed { duration_secs: 0 }
    }
}

/// How one receive task ended.
#[derive(Debug, Clone)]
pub struct ReceiveOutcome {
    pub imei: Imei,
    /// Messages delivered to the callback, or the error that stopped the task.
    pub result: Result<usize, ReceiveError>,
}

/// The running tasks of one [`ReceiveScheduler::receive`] call.
#[derive(Debug)]
pub struct ReceiveHandle {
    tasks: JoinSet<ReceiveOutcome>,
    imeis: Vec<Imei>,
    task_imeis: HashMap<task::Id, Imei>,
}

impl ReceiveHandle {
    /// IMEIs of the links being polled.
    pub fn imeis(&self) -> &[Imei] {
        &self.imeis
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every task to finish on its own.
    pub async fn wait(mut self) -> Vec<ReceiveOutcome> {
        let mut outcomes = Vec::with_capacity(self.tasks.len());
        while let Some(joined) = self.tasks.join_next_with_id().await {
            match joined {
                Ok((_, outcome)) => outcomes.push(outcome),
                Err(e) => {
                    let imei = self.task_imeis.remove(&e.id()).unwrap_or_else(|| Imei::normalize(""));
                    warn!(%imei, error = %e, "receive task ended abnormally");
                    outcomes.push(ReceiveOutcome {
                        imei: imei.clone(),
                        result: Err(ReceiveError::Aborted {
                            imei,
                            reason: e.to_string(),
                        }),
                    });
                }
            }
        }
        outcomes
    }

    /// Abort every task; leases are released as the tasks drop.
    pub async fn stop(mut self) {
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
    }
}

/// Starts and runs receive tasks over the links of one registry.
#[derive(Clone)]
pub struct ReceiveScheduler {
    registry: Arc<LinkRegistry>,
    store: Arc<dyn MessageStore>,
    mode: ReceiveMode,
    poll_interval: Duration,
}

impl ReceiveScheduler {
    pub fn new(registry: Arc<LinkRegistry>, store: Arc<dyn MessageStore>) -> Self {
        Self {
            registry,
            store,
            mode: ReceiveMode::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    #[must_use]
    pub fn with_mode(mut self, mode: ReceiveMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn mode(&self) -> ReceiveMode {
        self.mode
    }

    /// Start polling.
    ///
    /// With `imeis`, each IMEI whose link is receive-capable and available
    /// gets a task; the others are skipped with a warning. Without, every
    /// receive-capable available link gets one. Fails when no task starts.
    pub fn receive(
        &self,
        imeis: Option<&[Imei]>,
        on_message: MessageCallback,
    ) -> Result<ReceiveHandle, ReceiveError> {
        let leases: Vec<LinkLease> = match imeis {
            Some(imeis) => imeis
                .iter()
                .filter_map(|imei| {
                    let lease = self
                        .registry
                        .find_by_imei(imei)
                        .and_then(|l| l.try_lease(LinkRole::Receive));
                    if lease.is_none() {
                        warn!(%imei, "can't receive messages on link with this imei");
                    }
                    lease
                })
                .collect(),
            None => self.registry.lease_all(LinkRole::Receive),
        };
        if leases.is_empty() {
            return Err(ReceiveError::NoEligibleLink);
        }

        let mut tasks = JoinSet::new();
        let mut started = Vec::with_capacity(leases.len());
        let mut task_imeis = HashMap::with_capacity(leases.len());
        for lease in leases {
            let imei = lease.link().imei().clone();
            started.push(imei.clone());
            let task = PollTask {
                lease,
                imei: imei.clone(),
                store: Arc::clone(&self.store),
                on_message: Arc::clone(&on_message),
            };
            let abort = tasks.spawn(task.run(self.mode, self.poll_interval));
            task_imeis.insert(abort.id(), imei);
        }
        Ok(ReceiveHandle {
            tasks,
            imeis: started,
            task_imeis,
        })
    }
}

struct PollTask {
    lease: LinkLease,
    imei: Imei,
    store: Arc<dyn MessageStore>,
    on_message: MessageCallback,
}

impl PollTask {
    async fn run(self, mode: ReceiveMode, interval: Duration) -> ReceiveOutcome {
        info!(imei = %self.imei, link = %self.lease.link().id(), ?mode, "start receiving messages");
        let result = match mode {
            ReceiveMode::Once => self.cycle().await,
            ReceiveMode::Timed { duration_secs } => {
                let total = (duration_secs > 0).then(|| Duration::from_secs(duration_secs));
                run_periodic(interval, total, std::future::pending(), || self.cycle())
                    .await
                    .map(|stats| stats.yielded)
            }
        };
        let PollTask { lease, imei, .. } = self;
        drop(lease);
        match &result {
            Ok(count) => info!(%imei, messages = count, "receiving finished"),
            Err(e) => warn!(%imei, error = %e, "receiving stopped"),
        }
        ReceiveOutcome { imei, result }
    }

    async fn cycle(&self) -> Result<usize, ReceiveError> {
        let messages = self.lease.poll().await.map_err(|source| ReceiveError::Driver {
            imei: self.imei.clone(),
            source,
        })?;
        debug!(imei = %self.imei, count = messages.len(), "poll cycle");
        let count = messages.len();
        for message in messages {
            info!(
                imei = %self.imei,
                from = %message.source_number,
                index = message.index,
                "message received"
            );
            (self.on_message)(&message, &self.imei);
            let store = Arc::clone(&self.store);
            let imei = self.imei.clone();
            match link::blocking(move || store.store(&message, &imei)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(imei = %self.imei, error = %e, "failed to store message"),
                Err(e) => warn!(imei = %self.imei, error = %e, "store call aborted"),
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::driver::LinkDriver;
    use crate::sim::SimDriver;
    use crate::store::MemoryStore;
    use smspool_models::{LinkStatus, MessageStatus, MessageType};

    const RECV_IMEI: &str = "222222222222222";
    const SEND_IMEI: &str = "111111111111111";

    fn inbox(n: u32) -> Vec<ReceivedMessage> {
        (0..n)
            .map(|i| ReceivedMessage {
                error_code: 0,
                index: i,
                date: "2026-10-17 09:00:00".into(),
                status: MessageStatus::Unread,
                source_number: "+34123456789".into(),
                text: format!("inbound {i}"),
                message_type: MessageType::Inbox,
            })
            .collect()
    }

    async fn setup(driver: &Arc<SimDriver>) -> Arc<LinkRegistry> {
        let registry = Arc::new(LinkRegistry::new(
            Arc::clone(driver) as Arc<dyn LinkDriver>,
            vec!["/dev/ttyUSB0".into(), "/dev/ttyUSB1".into()],
            vec![Imei::normalize(SEND_IMEI)],
            vec![Imei::normalize(RECV_IMEI)],
        ));
        registry.discover_configured().await;
        registry
    }

    fn counting_callback() -> (MessageCallback, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let cb_count = Arc::clone(&count);
        let cb: MessageCallback = Arc::new(move |_: &ReceivedMessage, _: &Imei| {
            cb_count.fetch_add(1, Ordering::SeqCst);
        });
        (cb, count)
    }

    #[tokio::test(start_paused = true)]
    async fn timed_receive_polls_for_duration() {
        let driver = Arc::new(SimDriver::new());
        driver.attach("/dev/ttyUSB0", RECV_IMEI);
        driver.set_inbox("/dev/ttyUSB0", inbox(2));
        let registry = setup(&driver).await;
        let store = Arc::new(MemoryStore::new());
        let scheduler = ReceiveScheduler::new(Arc::clone(&registry), store.clone())
            .with_mode(ReceiveMode::timed(Duration::from_secs(10)))
            .with_poll_interval(Duration::from_secs(2));

        let (cb, count) = counting_callback();
        let handle = scheduler.receive(None, cb).expect("started");
        let outcomes = handle.wait().await;

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].result.as_ref().ok(), Some(&10));
        assert_eq!(count.load(Ordering::SeqCst), 10);
        assert_eq!(store.len(), 10);
        assert!(store.messages().iter().all(|m| m.message.is_well_formed_inbox()));
        assert_eq!(registry.links()[0].status(), LinkStatus::Available);
    }

    #[tokio::test]
    async fn single_pass_filters_and_orders() {
        let driver = Arc::new(SimDriver::new());
        driver.attach("/dev/ttyUSB0", RECV_IMEI);
        let mut records = inbox(4);
        records[1].message_type = MessageType::Outbox;
        records[2].error_code = 5;
        driver.set_inbox("/dev/ttyUSB0", records);
        let registry = setup(&driver).await;
        let scheduler = ReceiveScheduler::new(registry, Arc::new(MemoryStore::new()))
            .with_mode(ReceiveMode::Once);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let cb: MessageCallback = {
            let seen = Arc::clone(&seen);
            Arc::new(move |m: &ReceivedMessage, imei: &Imei| {
                assert_eq!(imei.as_str(), RECV_IMEI);
                seen.lock().unwrap().push(m.index);
            })
        };
        let outcomes = scheduler.receive(None, cb).unwrap().wait().await;
        assert_eq!(outcomes[0].result.as_ref().ok(), Some(&2));
        assert_eq!(*seen.lock().unwrap(), vec![0, 3]);
    }

    #[tokio::test]
    async fn poll_failure_surfaces_and_releases_link() {
        let driver = Arc::new(SimDriver::new());
        driver.attach("/dev/ttyUSB0", RECV_IMEI);
        driver.fail_polls("/dev/ttyUSB0", 11);
        let registry = setup(&driver).await;
        let scheduler = ReceiveScheduler::new(Arc::clone(&registry), Arc::new(MemoryStore::new()))
            .with_mode(ReceiveMode::Once);

        let (cb, count) = counting_callback();
        let outcomes = scheduler.receive(None, cb).unwrap().wait().await;
        let err = outcomes[0].result.as_ref().unwrap_err();
        assert!(matches!(err, ReceiveError::Driver { .. }));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(registry.links()[0].status(), LinkStatus::Available);
    }

    #[tokio::test]
    async fn requested_imeis_skip_send_only_links() {
        let driver = Arc::new(SimDriver::new());
        driver.attach("/dev/ttyUSB0", RECV_IMEI);
        driver.attach("/dev/ttyUSB1", SEND_IMEI);
        let registry = setup(&driver).await;
        let scheduler = ReceiveScheduler::new(registry, Arc::new(MemoryStore::new()))
            .with_mode(ReceiveMode::Once);

        let (cb, _) = counting_callback();
        let requested = [Imei::normalize(RECV_IMEI), Imei::normalize(SEND_IMEI)];
        let handle = scheduler.receive(Some(&requested), cb.clone()).unwrap();
        assert_eq!(handle.imeis(), &[Imei::normalize(RECV_IMEI)]);
        handle.wait().await;

        let only_send = [Imei::normalize(SEND_IMEI)];
        let err = scheduler.receive(Some(&only_send), cb).unwrap_err();
        assert!(matches!(err, ReceiveError::NoEligibleLink));
    }

    #[tokio::test(start_paused = true)]
    async fn sub_second_timed_receive_stays_bounded() {
        assert_eq!(ReceiveMode::timed(Duration::from_millis(500)), ReceiveMode::Timed { duration_secs: 1 });
        assert_eq!(ReceiveMode::timed(Duration::from_millis(1500)), ReceiveMode::Timed { duration_secs: 2 });
        assert_eq!(ReceiveMode::timed(Duration::ZERO), ReceiveMode::Timed { duration_secs: 0 });

        let driver = Arc::new(SimDriver::new());
        driver.attach("/dev/ttyUSB0", RECV_IMEI);
        let registry = setup(&driver).await;
        let scheduler = ReceiveScheduler::new(Arc::clone(&registry), Arc::new(MemoryStore::new()))
            .with_mode(ReceiveMode::timed(Duration::from_millis(500)))
            .with_poll_interval(Duration::from_millis(200));

        let (cb, _) = counting_callback();
        let handle = scheduler.receive(None, cb).unwrap();
        let outcomes = tokio::time::timeout(Duration::from_secs(60), handle.wait())
            .await
            .expect("bounded receive finishes");
        assert!(outcomes[0].result.is_ok());
        assert_eq!(registry.links()[0].status(), LinkStatus::Available);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_releases_unbounded_receive() {
        let driver = Arc::new(SimDriver::new());
        driver.attach("/dev/ttyUSB0", RECV_IMEI);
        let registry = setup(&driver).await;
        let scheduler = ReceiveScheduler::new(Arc::clone(&registry), Arc::new(MemoryStore::new()))
            .with_mode(ReceiveMode::timed(Duration::ZERO));

        let (cb, _) = counting_callback();
        let handle = scheduler.receive(None, cb).unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(registry.links()[0].status(), LinkStatus::Receiving);
        handle.stop().await;
        assert_eq!(registry.links()[0].status(), LinkStatus::Available);
    }
}
