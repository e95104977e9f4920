//! Outbound batch dispatch.
//!
//! One call to [`Dispatcher::dispatch`] is one *batch*: a producer fills the
//! bounded [`DispatchQueue`], one consumer per send link drains it, and a
//! health monitor admits links attached mid-batch as extra consumers.
//! Workers lease their link for one job at a time, so concurrent batches
//! share links. Destinations a link could not deliver within its attempt
//! budget land in the [`DeadLetterQueue`], which a second wave of recovery
//! workers drains before the batch reports. A dead letter is only retried
//! on links it has not failed on yet.
//!
//! ```text
//! producer ──► DispatchQueue (10) ──► consumer/link ──► delivered
//!                                          │
//!                                          ▼ attempts exhausted
//!                                   DeadLetterQueue ──► recovery worker/link ──► delivered
//!                                          │
//!                                          ▼ no link could deliver
//!                                   DispatchError::PartialDelivery
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use smspool_models::{
    partition_destinations, LinkId, LinkRole, LinkStatus, ModelError, OutboundSms, PhoneNumber,
};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::classifier::DriverError;
use crate::error::DispatchError;
use crate::link::{Link, LinkLease};
use crate::monitor::HealthMonitor;
use crate::queue::{DeadLetterQueue, DispatchQueue, DISPATCH_QUEUE_CAPACITY};
use crate::registry::LinkRegistry;

/// Delivery attempts per destination per link, first try included.
pub const ATTEMPT_BUDGET: u32 = 2;

/// Default interval between health-monitor ticks during a batch.
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(5);

/// Pause before re-trying a link busy with another batch's job.
const LEASE_RETRY: Duration = Duration::from_millis(10);

// ---------------------------------------------------------------------------
// Counters and report
// ---------------------------------------------------------------------------

/// Monotonic batch counters.
///
/// `produced` is incremented before the destination enters the queue and
/// [`snapshot`](Self::snapshot) reads it last, so `consumed <= produced`
/// holds in every snapshot.
#[derive(Debug, Default)]
pub struct BatchCounters {
    produced: AtomicUsize,
    consumed: AtomicUsize,
    recovered: AtomicUsize,
    failed_attempts: AtomicUsize,
}

/// Point-in-time copy of [`BatchCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    /// Destinations pushed into the dispatch queue.
    pub produced: usize,
    /// Destinations delivered by primary consumers.
    pub consumed: usize,
    /// Destinations delivered by recovery workers.
    pub recovered: usize,
    /// Delivery attempts that failed, across both phases.
    pub failed_attempts: usize,
}

impl BatchCounters {
    pub fn snapshot(&self) -> CounterSnapshot {
        let consumed = self.consumed.load(Ordering::SeqCst);
        let recovered = self.recovered.load(Ordering::SeqCst);
        let failed_attempts = self.failed_attempts.load(Ordering::SeqCst);
        CounterSnapshot {
            produced: self.produced.load(Ordering::SeqCst),
            consumed,
            recovered,
            failed_attempts,
        }
    }
}

/// One successful delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Delivery {
    pub destination: PhoneNumber,
    pub link: LinkId,
    pub phase: Phase,
}

/// Aggregate outcome of a batch.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchReport {
    /// Leading characters of the message text.
    pub prefix: String,
    /// Destinations that passed validation.
    pub batch_size: usize,
    /// Destinations rejected by validation.
    #[serde(skip)]
    pub rejected: Vec<ModelError>,
    /// Successful deliveries, in completion order.
    pub delivered: Vec<Delivery>,
    /// Destinations no link could deliver.
    pub failed: Vec<PhoneNumber>,
    pub counters: CounterSnapshot,
}

impl DispatchReport {
    pub fn delivered_count(&self) -> usize {
        self.delivered.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Comma-separated failed numbers.
    pub fn failed_list(&self) -> String {
        self.failed
            .iter()
            .map(PhoneNumber::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

// ---------------------------------------------------------------------------
// Batch state and worker context
// ---------------------------------------------------------------------------

/// Which wave a worker belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Draining the bounded dispatch queue.
    Primary,
    /// Draining the dead-letter queue.
    Recovery,
}

struct Batch {
    sms: Arc<OutboundSms>,
    size: usize,
    queue: DispatchQueue<PhoneNumber>,
    dead_letters: DeadLetterQueue<PhoneNumber>,
    counters: BatchCounters,
    delivered: Mutex<Vec<Delivery>>,
}

impl Batch {
    fn new(sms: OutboundSms, size: usize) -> Self {
        Self {
            sms: Arc::new(sms),
            size,
            queue: DispatchQueue::with_capacity(DISPATCH_QUEUE_CAPACITY),
            dead_letters: DeadLetterQueue::new(),
            counters: BatchCounters::default(),
            delivered: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, destination: PhoneNumber, link: LinkId, phase: Phase) {
        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Delivery {
                destination,
                link,
                phase,
            });
    }
}

/// Everything a worker needs, passed in explicitly.
struct WorkerContext {
    link: Arc<Link>,
    batch: Arc<Batch>,
    phase: Phase,
}

impl WorkerContext {
    fn link_id(&self) -> LinkId {
        self.link.id()
    }

    /// Lease the link for one job.
    ///
    /// Waits while another job holds it for sending. Gives up when the link
    /// is disabled or receiving, or once `done` reports no work is left.
    async fn claim(&self, done: impl Fn() -> bool) -> Option<LinkLease> {
        loop {
            if let Some(lease) = self.link.try_lease(LinkRole::Send) {
                return Some(lease);
            }
            match self.link.status() {
                LinkStatus::Available if self.link.capability().allows(LinkRole::Send) => {}
                LinkStatus::Sending if !done() => time::sleep(LEASE_RETRY).await,
                status => {
                    debug!(link = %self.link_id(), %status, phase = %self.phase, "link unavailable, worker leaving");
                    return None;
                }
            }
        }
    }

    /// Deliver one destination under `lease`, honouring the attempt budget
    /// and the retry policy.
    async fn deliver(&self, lease: &LinkLease, destination: &PhoneNumber) -> Result<(), DriverError> {
        let mut attempt = 1;
        loop {
            match lease.send(destination, &self.batch.sms).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    self.batch.counters.failed_attempts.fetch_add(1, Ordering::SeqCst);
                    if e.is_retryable() && attempt < ATTEMPT_BUDGET {
                        debug!(
                            link = %self.link_id(),
                            %destination,
                            attempt,
                            error = %e,
                            "retrying delivery"
                        );
                        attempt += 1;
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn run(self) {
        match self.phase {
            Phase::Primary => self.consume().await,
            Phase::Recovery => self.recover().await,
        }
    }

    async fn consume(self) {
        let batch = Arc::clone(&self.batch);
        let drained = || batch.queue.is_closed() && batch.queue.is_empty();
        while let Some(lease) = self.claim(&drained).await {
            let Some(destination) = batch.queue.pop().await else {
                break;
            };
            let result = self.deliver(&lease, &destination).await;
            drop(lease);
            match result {
                Ok(()) => {
                    batch.counters.consumed.fetch_add(1, Ordering::SeqCst);
                    info!(
                        link = %self.link_id(),
                        imei = %self.link.imei(),
                        %destination,
                        prefix = %batch.sms.prefix(),
                        "message sent"
                    );
                    batch.record(destination, self.link_id(), Phase::Primary);
                }
                Err(e) => {
                    warn!(
                        link = %self.link_id(),
                        port = %self.link.port(),
                        %destination,
                        error = %e,
                        "delivery failed, moving destination to dead-letter queue"
                    );
                    batch.dead_letters.push(destination);
                }
            }
        }
        debug!(link = %self.link_id(), "consumer finished");
    }

    async fn recover(self) {
        let batch = Arc::clone(&self.batch);
        while let Some(letter) = batch.dead_letters.take(self.link_id()).await {
            let Some(lease) = self.claim(|| false).await else {
                batch.dead_letters.requeue(letter, self.link_id());
                break;
            };
            let result = self.deliver(&lease, &letter.item).await;
            drop(lease);
            match result {
                Ok(()) => {
                    batch.counters.recovered.fetch_add(1, Ordering::SeqCst);
                    info!(
                        link = %self.link_id(),
                        imei = %self.link.imei(),
                        destination = %letter.item,
                        prefix = %batch.sms.prefix(),
                        left = batch.dead_letters.len(),
                        "dead-lettered message sent"
                    );
                    batch.record(letter.item, self.link_id(), Phase::Recovery);
                    batch.dead_letters.resolve();
                }
                Err(e) => {
                    warn!(
                        link = %self.link_id(),
                        port = %self.link.port(),
                        destination = %letter.item,
                        error = %e,
                        "recovery failed, leaving destination to other links"
                    );
                    batch.dead_letters.requeue(letter, self.link_id());
                }
            }
        }
        debug!(link = %self.link_id(), "recovery worker finished");
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Runs outbound batches over the links of one registry.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<LinkRegistry>,
    monitor_interval: Duration,
}

impl Dispatcher {
    pub fn new(registry: Arc<LinkRegistry>) -> Self {
        Self {
            registry,
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
        }
    }

    /// Override how often the batch's health monitor ticks.
    #[must_use]
    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    /// Deliver `sms` to every valid destination.
    ///
    /// Returns the report when every valid destination was delivered.
    /// Fails before starting any task when no destination is valid or every
    /// send-capable link is disabled or receiving; fails with
    /// [`DispatchError::PartialDelivery`] (carrying the full report) when
    /// some destinations stayed undeliverable after recovery.
    pub async fn dispatch<I, S>(
        &self,
        destinations: I,
        sms: OutboundSms,
    ) -> Result<DispatchReport, DispatchError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let prefix = sms.prefix().to_string();
        let (valid, rejected) = partition_destinations(destinations);
        for err in &rejected {
            warn!(%prefix, error = %err, "rejecting destination");
        }
        if valid.is_empty() {
            warn!(%prefix, "no valid destination, nothing to send");
            return Err(DispatchError::NoDestinations { prefix, rejected });
        }

        let links = self.registry.accepting(LinkRole::Send);
        if links.is_empty() {
            warn!(%prefix, "no active or available send links");
            return Err(DispatchError::NoEligibleLink { prefix });
        }

        let batch = Arc::new(Batch::new(sms, valid.len()));
        info!(
            %prefix,
            messages = batch.size,
            links = links.len(),
            "starting send"
        );

        let producer = tokio::spawn(produce(Arc::clone(&batch), valid));
        let (admit_tx, mut admitted) = mpsc::unbounded_channel();
        let monitor = HealthMonitor::spawn(
            Arc::clone(&self.registry),
            self.monitor_interval,
            None,
            admit_tx,
        );

        run_wave(&batch, links, &mut admitted, Phase::Primary).await;
        if let Err(e) = producer.await {
            error!(%prefix, error = %e, "producer task failed");
        }

        if !batch.dead_letters.is_empty() {
            let links = self.registry.accepting(LinkRole::Send);
            info!(
                %prefix,
                pending = batch.dead_letters.len(),
                links = links.len(),
                "starting recovery"
            );
            run_wave(&batch, links, &mut admitted, Phase::Recovery).await;
        }

        monitor.stop().await;
        drop(admitted);

        let failed = batch.dead_letters.drain();
        for destination in &failed {
            error!(%prefix, %destination, "message couldn't be sent");
        }
        let report = DispatchReport {
            prefix,
            batch_size: batch.size,
            rejected,
            delivered: std::mem::take(
                &mut *batch.delivered.lock().unwrap_or_else(PoisonError::into_inner),
            ),
            failed,
            counters: batch.counters.snapshot(),
        };
        info!(
            prefix = %report.prefix,
            delivered = report.delivered_count(),
            failed = report.failed.len(),
            rejected = report.rejected.len(),
            "send finished"
        );

        if report.is_complete() {
            Ok(report)
        } else {
            Err(DispatchError::PartialDelivery(Box::new(report)))
        }
    }
}

async fn produce(batch: Arc<Batch>, destinations: Vec<PhoneNumber>) {
    for destination in destinations {
        batch.counters.produced.fetch_add(1, Ordering::SeqCst);
        if let Err(destination) = batch.queue.push(destination).await {
            batch.counters.produced.fetch_sub(1, Ordering::SeqCst);
            warn!(%destination, "dispatch queue closed early");
            break;
        }
    }
    batch.queue.close();
    debug!(produced = batch.counters.produced.load(Ordering::SeqCst), "producer finished");
}

/// Run one worker per link, admitting monitor-supplied links as they
/// arrive, until every worker of the wave has exited.
async fn run_wave(
    batch: &Arc<Batch>,
    links: Vec<Arc<Link>>,
    admitted: &mut mpsc::UnboundedReceiver<Arc<Link>>,
    phase: Phase,
) {
    let mut workers = JoinSet::new();
    let spawn = |workers: &mut JoinSet<()>, link: Arc<Link>| {
        let ctx = WorkerContext {
            link,
            batch: Arc::clone(batch),
            phase,
        };
        workers.spawn(ctx.run());
    };
    for link in links {
        spawn(&mut workers, link);
    }

    loop {
        tokio::select! {
            biased;
            Some(link) = admitted.recv() => {
                debug!(link = %link.id(), %phase, "extra worker admitted");
                spawn(&mut workers, link);
            }
            joined = workers.join_next() => match joined {
                Some(Ok(())) => {}
                Some(Err(e)) => error!(%phase, error = %e, "worker task failed"),
                None => break,
            },
        }
    }
}
