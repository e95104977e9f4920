//! The caller-facing pool.
//!
//! [`SmsPool`] owns the registry and is the only thing callers need: it opens
//! the links, runs send batches, starts and stops receive tasks, and closes
//! everything at the end.

use std::sync::{Arc, Mutex, PoisonError};

use futures::stream::{self, BoxStream, StreamExt};
use smspool_models::{Imei, OutboundSms, ReceivedMessage};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::PoolConfig;
use crate::dispatcher::{DispatchReport, Dispatcher};
use crate::driver::LinkDriver;
use crate::error::PoolError;
use crate::link::LinkSnapshot;
use crate::receiver::{MessageCallback, ReceiveHandle, ReceiveOutcome, ReceiveScheduler};
use crate::registry::{LinkRegistry, RefreshSummary};
use crate::store::MessageStore;

/// Messages delivered by [`SmsPool::receive_stream`], with the receiving IMEI.
pub type MessageStream = BoxStream<'static, (ReceivedMessage, Imei)>;

/// A pool of GSM links behind one driver.
pub struct SmsPool {
    config: PoolConfig,
    registry: Arc<LinkRegistry>,
    dispatcher: Dispatcher,
    scheduler: ReceiveScheduler,
    receiving: Mutex<Vec<ReceiveHandle>>,
}

impl SmsPool {
    /// Validate `config`, open a link on every configured port that has a
    /// device, and fail when none opens.
    pub async fn open(
        config: PoolConfig,
        driver: Arc<dyn LinkDriver>,
        store: Arc<dyn MessageStore>,
    ) -> Result<Self, PoolError> {
        config.validate()?;
        let registry = Arc::new(LinkRegistry::new(
            driver,
            config.ports.clone(),
            config.send_imeis.clone(),
            config.receive_imeis.clone(),
        ));
        let opened = registry.discover_configured().await;
        if opened.is_empty() {
            return Err(PoolError::NoActiveLinks {
                ports: config.ports.join(", "),
            });
        }
        info!(links = opened.len(), "sms pool opened");

        let dispatcher =
            Dispatcher::new(Arc::clone(&registry)).with_monitor_interval(config.monitor_interval());
        let scheduler = ReceiveScheduler::new(Arc::clone(&registry), store)
            .with_mode(config.receive_mode)
            .with_poll_interval(config.poll_interval());
        Ok(Self {
            config,
            registry,
            dispatcher,
            scheduler,
            receiving: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<LinkRegistry> {
        &self.registry
    }

    /// Send `text` with the configured delivery options.
    pub async fn send<I, S>(&self, text: &str, destinations: I) -> Result<DispatchReport, PoolError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.send_with(self.config.message(text), destinations).await
    }

    /// Send a fully specified payload.
    pub async fn send_with<I, S>(
        &self,
        sms: OutboundSms,
        destinations: I,
    ) -> Result<DispatchReport, PoolError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(self.dispatcher.dispatch(destinations, sms).await?)
    }

    /// Start receiving on the given IMEIs (`None`: every receive link).
    ///
    /// Returns the IMEIs whose tasks started. The tasks keep running until
    /// their mode ends them or [`stop_receive`](Self::stop_receive) is called.
    pub fn receive<F>(&self, imeis: Option<&[Imei]>, on_message: F) -> Result<Vec<Imei>, PoolError>
    where
        F: Fn(&ReceivedMessage, &Imei) + Send + Sync + 'static,
    {
        self.start_receive(imeis, Arc::new(on_message))
    }

    /// Like [`receive`](Self::receive), delivering messages as a stream.
    ///
    /// The stream ends once every started task has finished.
    pub fn receive_stream(&self, imeis: Option<&[Imei]>) -> Result<MessageStream, PoolError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback: MessageCallback = Arc::new(move |message: &ReceivedMessage, imei: &Imei| {
            if tx.send((message.clone(), imei.clone())).is_err() {
                warn!(%imei, "message stream dropped");
            }
        });
        self.start_receive(imeis, callback)?;
        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    fn start_receive(
        &self,
        imeis: Option<&[Imei]>,
        callback: MessageCallback,
    ) -> Result<Vec<Imei>, PoolError> {
        let handle = self.scheduler.receive(imeis, callback)?;
        let started = handle.imeis().to_vec();
        self.lock_receiving().push(handle);
        Ok(started)
    }

    /// Abort every receive task.
    pub async fn stop_receive(&self) {
        let handles = std::mem::take(&mut *self.lock_receiving());
        for handle in handles {
            handle.stop().await;
        }
    }

    /// Wait for every receive task to end on its own.
    pub async fn wait_receive(&self) -> Vec<ReceiveOutcome> {
        let handles = std::mem::take(&mut *self.lock_receiving());
        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.extend(handle.wait().await);
        }
        outcomes
    }

    /// Probe every link and open newly attached devices.
    pub async fn update_connections(&self) -> RefreshSummary {
        let summary = self.registry.refresh().await;
        info!(
            probed = summary.probed,
            disabled = summary.disabled,
            opened = summary.opened,
            "connections updated"
        );
        summary
    }

    pub fn connections(&self) -> Vec<LinkSnapshot> {
        self.registry.snapshot()
    }

    /// Wait for outstanding receive tasks, then close every link.
    ///
    /// A receive started in unbounded timed mode never ends on its own; call
    /// [`stop_receive`](Self::stop_receive) first.
    pub async fn close(self) {
        self.wait_receive().await;
        self.registry.close_all().await;
        info!("sms pool closed");
    }

    fn lock_receiving(&self) -> std::sync::MutexGuard<'_, Vec<ReceiveHandle>> {
        self.receiving.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::error::{DispatchError, ReceiveError};
    use crate::receiver::ReceiveMode;
    use crate::sim::SimDriver;
    use crate::store::MemoryStore;
    use smspool_models::{LinkStatus, MessageStatus, MessageType};

    const SEND_IMEI: &str = "111111111111111";
    const RECV_IMEI: &str = "222222222222222";

    fn config(ports: usize) -> PoolConfig {
        PoolConfig {
            ports: (0..ports).map(|i| format!("/dev/ttyUSB{i}")).collect(),
            send_imeis: vec![Imei::normalize(SEND_IMEI)],
            receive_imeis: vec![Imei::normalize(RECV_IMEI)],
            receive_mode: ReceiveMode::Once,
            ..PoolConfig::default()
        }
    }

    async fn open(driver: &Arc<SimDriver>, ports: usize) -> SmsPool {
        SmsPool::open(
            config(ports),
            Arc::clone(driver) as Arc<dyn LinkDriver>,
            Arc::new(MemoryStore::new()),
        )
        .await
        .expect("pool opens")
    }

    fn message(index: u32) -> ReceivedMessage {
        ReceivedMessage {
            error_code: 0,
            index,
            date: "2026-10-17 09:00:00".into(),
            status: MessageStatus::Unread,
            source_number: "+34123456789".into(),
            text: format!("inbound {index}"),
            message_type: MessageType::Inbox,
        }
    }

    #[tokio::test]
    async fn open_without_devices_fails() {
        let driver = Arc::new(SimDriver::new());
        let err = SmsPool::open(
            config(2),
            driver as Arc<dyn LinkDriver>,
            Arc::new(MemoryStore::new()),
        )
        .await
        .err()
        .expect("no devices");
        assert!(matches!(err, PoolError::NoActiveLinks { .. }));
        assert_eq!(
            err.to_string(),
            "no active links found on ports: /dev/ttyUSB0, /dev/ttyUSB1"
        );
    }

    #[tokio::test]
    async fn send_and_report() {
        let driver = Arc::new(SimDriver::new());
        driver.attach("/dev/ttyUSB0", SEND_IMEI);
        let pool = open(&driver, 1).await;

        let report = pool
            .send("hello", ["+34123456789", "+34123456780"])
            .await
            .expect("sent");
        assert_eq!(report.delivered_count(), 2);
        assert_eq!(driver.sent()[0].text, "hello");
    }

    #[tokio::test]
    async fn send_on_receive_only_pool_fails() {
        let driver = Arc::new(SimDriver::new());
        driver.attach("/dev/ttyUSB0", RECV_IMEI);
        let pool = open(&driver, 1).await;

        let err = pool.send("hello", ["+34123456789"]).await.unwrap_err();
        assert!(matches!(
            err,
            PoolError::Dispatch(DispatchError::NoEligibleLink { .. })
        ));
    }

    #[tokio::test]
    async fn receive_stream_yields_inbox() {
        let driver = Arc::new(SimDriver::new());
        driver.attach("/dev/ttyUSB0", RECV_IMEI);
        driver.set_inbox("/dev/ttyUSB0", vec![message(0), message(1)]);
        let pool = open(&driver, 1).await;

        let stream = pool.receive_stream(None).expect("started");
        let received: Vec<(ReceivedMessage, Imei)> = stream.collect().await;
        assert_eq!(received.len(), 2);
        assert_eq!(received[1].0.text, "inbound 1");
        assert_eq!(received[0].1.as_str(), RECV_IMEI);

        let outcomes = pool.wait_receive().await;
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].result.is_ok());
    }

    #[tokio::test]
    async fn receive_without_receive_links_fails() {
        let driver = Arc::new(SimDriver::new());
        driver.attach("/dev/ttyUSB0", SEND_IMEI);
        let pool = open(&driver, 1).await;

        let err = pool.receive(None, |_, _| {}).unwrap_err();
        assert!(matches!(err, PoolError::Receive(ReceiveError::NoEligibleLink)));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_receive_frees_links() {
        let driver = Arc::new(SimDriver::new());
        driver.attach("/dev/ttyUSB0", RECV_IMEI);
        let mut cfg = config(1);
        cfg.receive_mode = ReceiveMode::timed(Duration::ZERO);
        let pool = SmsPool::open(
            cfg,
            Arc::clone(&driver) as Arc<dyn LinkDriver>,
            Arc::new(MemoryStore::new()),
        )
        .await
        .unwrap();

        let started = pool.receive(None, |_, _| {}).unwrap();
        assert_eq!(started, vec![Imei::normalize(RECV_IMEI)]);
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(pool.connections()[0].status, LinkStatus::Receiving);

        pool.stop_receive().await;
        assert_eq!(pool.connections()[0].status, LinkStatus::Available);
        pool.close().await;
        assert_eq!(driver.closed_handles(), 1);
    }

    #[tokio::test]
    async fn update_connections_opens_new_devices() {
        let driver = Arc::new(SimDriver::new());
        driver.attach("/dev/ttyUSB0", SEND_IMEI);
        let pool = open(&driver, 2).await;
        assert_eq!(pool.connections().len(), 1);

        driver.attach("/dev/ttyUSB1", RECV_IMEI);
        let summary = pool.update_connections().await;
        assert_eq!(summary.probed, 1);
        assert_eq!(summary.opened, 1);
        assert_eq!(pool.connections().len(), 2);
    }
}
