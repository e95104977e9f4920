//! Periodic execution and the link health monitor.
//!
//! [`run_periodic`] is the ticker shared by the health monitor and the timed
//! receive loop: it runs a tick immediately, then once per interval, until a
//! total duration elapses or a stop signal fires. The interval is measured
//! from tick start to tick start, so a slow tick shortens the following wait
//! instead of pushing every later tick back.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use smspool_models::LinkRole;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::link::Link;
use crate::registry::LinkRegistry;

/// Shortest interval accepted by [`run_periodic`].
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Counts gathered by [`run_periodic`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickStats {
    /// Ticks executed.
    pub ticks: usize,
    /// Sum of the values returned by the ticks.
    pub yielded: usize,
}

/// Run `on_tick` now and then every `interval` until `total` elapses
/// (`None`: forever) or `stop` resolves.
///
/// A tick already running when the deadline passes completes; no new tick
/// starts afterwards. The first tick error ends the loop.
pub async fn run_periodic<F, Fut, E>(
    interval: Duration,
    total: Option<Duration>,
    stop: impl Future<Output = ()>,
    mut on_tick: F,
) -> Result<TickStats, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<usize, E>>,
{
    let mut ticker = time::interval(interval.max(MIN_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let deadline = total.map(|t| Instant::now() + t);
    let expired = async move {
        match deadline {
            Some(at) => time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    };
    let mut stop = std::pin::pin!(stop);
    let mut expired = std::pin::pin!(expired);
    let mut stats = TickStats::default();

    loop {
        tokio::select! {
            biased;
            () = &mut stop => break,
            () = &mut expired => break,
            _ = ticker.tick() => {}
        }
        stats.yielded += on_tick().await?;
        stats.ticks += 1;
    }
    Ok(stats)
}

/// Handle to a running health monitor.
pub struct MonitorHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<TickStats>,
}

impl MonitorHandle {
    /// Signal the monitor and wait for its current tick to finish.
    pub async fn stop(self) -> TickStats {
        let _ = self.stop.send(true);
        match self.task.await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(error = %e, "health monitor task failed");
                TickStats::default()
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Re-probes idle links and admits newly attached ones while a batch runs.
pub struct HealthMonitor;

impl HealthMonitor {
    /// Spawn a monitor that ticks every `interval` for `total` (or until stopped).
    ///
    /// Each tick probes every idle link, discovers the configured ports, and
    /// forwards every new send-capable link to `admitted`. The receiving side
    /// decides what to do with the extra capacity.
    pub fn spawn(
        registry: Arc<LinkRegistry>,
        interval: Duration,
        total: Option<Duration>,
        admitted: mpsc::UnboundedSender<Arc<Link>>,
    ) -> MonitorHandle {
        Self::spawn_with(interval, total, move || {
            let registry = Arc::clone(&registry);
            let admitted = admitted.clone();
            async move { Self::tick(&registry, &admitted).await }
        })
    }

    /// Spawn a monitor running an arbitrary tick.
    pub fn spawn_with<F, Fut>(interval: Duration, total: Option<Duration>, on_tick: F) -> MonitorHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = usize> + Send + 'static,
    {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let mut on_tick = on_tick;
        let task = tokio::spawn(async move {
            let stop = async move {
                // Either an explicit stop or the handle being dropped ends the monitor.
                let _ = stop_rx.wait_for(|stopped| *stopped).await;
            };
            let result: Result<TickStats, std::convert::Infallible> =
                run_periodic(interval, total, stop, || {
                    let tick = on_tick();
                    async move { Ok(tick.await) }
                })
                .await;
            let stats = match result {
                Ok(stats) => stats,
                Err(never) => match never {},
            };
            debug!(ticks = stats.ticks, admitted = stats.yielded, "health monitor stopped");
            stats
        });
        MonitorHandle { stop: stop_tx, task }
    }

    async fn tick(registry: &LinkRegistry, admitted: &mpsc::UnboundedSender<Arc<Link>>) -> usize {
        for link in registry.links() {
            let role = if link.capability().allows(LinkRole::Send) {
                LinkRole::Send
            } else {
                LinkRole::Receive
            };
            // Busy links are skipped; the probe runs under the link's lease.
            let Some(_lease) = link.try_lease(role) else {
                continue;
            };
            registry.probe(&link).await;
        }

        let mut count = 0;
        for link in registry.discover_configured().await {
            if !link.capability().allows(LinkRole::Send) {
                debug!(link = %link.id(), capability = %link.capability(), "new link not usable for sending");
                continue;
            }
            info!(link = %link.id(), port = %link.port(), "admitting new link into running batch");
            if admitted.send(link).is_err() {
                break;
            }
            count += 1;
        }
        count
    }
}
