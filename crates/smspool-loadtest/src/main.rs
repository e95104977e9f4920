use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use clap::{Parser, ValueEnum};
use futures::StreamExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use smspool_engine::{
    CounterSnapshot, DispatchError, DispatchReport, MemoryStore, PoolConfig, PoolError,
    ReceiveMode, SimDriver, SmsPool,
};
use smspool_models::{Imei, MessageStatus, MessageType, ReceivedMessage};
use tracing::{info, warn};

/// Code injected for failing destinations (call layer busy, retryable).
const INJECTED_FAILURE: i32 = 22;

#[derive(Parser, Debug, Clone)]
#[command(name = "smspool-loadtest")]
#[command(about = "SMS link pool load test against simulated devices")]
struct Args {
    #[arg(long, value_enum, default_value_t = Scenario::Send)]
    scenario: Scenario,

    /// Send links attached before the pool opens.
    #[arg(long, default_value_t = 4)]
    links: usize,

    /// Send links attached while the first batch runs.
    #[arg(long, default_value_t = 0)]
    late_links: usize,

    #[arg(long, default_value_t = 1)]
    receive_links: usize,

    #[arg(long, default_value_t = 200)]
    batch_size: usize,

    #[arg(long, default_value_t = 1)]
    batches: usize,

    /// Probability that a destination fails on any given send link.
    #[arg(long, default_value_t = 0.05)]
    failure_rate: f64,

    #[arg(long, default_value_t = 7)]
    seed: u64,

    #[arg(long, default_value_t = 5)]
    send_latency_ms: u64,

    /// Messages stored on each simulated receive device.
    #[arg(long, default_value_t = 10)]
    inbox_size: u32,

    #[arg(long, default_value_t = 6)]
    receive_seconds: u64,

    #[arg(long, default_value_t = 2)]
    poll_interval_seconds: u64,

    #[arg(long, default_value_t = 1)]
    monitor_interval_seconds: u64,

    /// Print the aggregated counters as JSON.
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq)]
enum Scenario {
    Send,
    Receive,
    Mixed,
}

#[derive(Default)]
struct Metrics {
    batches: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    produced: AtomicU64,
    consumed: AtomicU64,
    recovered: AtomicU64,
    failed_attempts: AtomicU64,
    received: AtomicU64,
    receive_errors: AtomicU64,
    send_elapsed_ms: AtomicU64,
}

impl Metrics {
    fn record(&self, report: &DispatchReport, elapsed: Duration) {
        let add = |counter: &AtomicU64, value: usize| {
            counter.fetch_add(value as u64, Ordering::Relaxed);
        };
        add(&self.batches, 1);
        add(&self.delivered, report.delivered_count());
        add(&self.failed, report.failed.len());
        add(&self.rejected, report.rejected.len());
        add(&self.produced, report.counters.produced);
        add(&self.consumed, report.counters.consumed);
        add(&self.recovered, report.counters.recovered);
        add(&self.failed_attempts, report.counters.failed_attempts);
        self.send_elapsed_ms.fetch_add(
            u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
    }

    fn counters(&self) -> CounterSnapshot {
        let load = |counter: &AtomicU64| usize::try_from(counter.load(Ordering::Relaxed)).unwrap_or(usize::MAX);
        CounterSnapshot {
            produced: load(&self.produced),
            consumed: load(&self.consumed),
            recovered: load(&self.recovered),
            failed_attempts: load(&self.failed_attempts),
        }
    }
}

fn send_port(i: usize) -> String {
    format!("/dev/ttyUSB{i}")
}

fn receive_port(i: usize) -> String {
    format!("/dev/ttyACM{i}")
}

fn send_imei(i: usize) -> String {
    format!("35{i:013}")
}

fn receive_imei(i: usize) -> String {
    format!("86{i:013}")
}

fn inbox(size: u32) -> Vec<ReceivedMessage> {
    (0..size)
        .map(|index| ReceivedMessage {
            error_code: 0,
            index,
            date: "2026-10-17 09:00:00".to_string(),
            status: MessageStatus::Unread,
            source_number: "+34600000000".to_string(),
            text: format!("inbound load test {index}"),
            message_type: MessageType::Inbox,
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if !(0.0..=1.0).contains(&args.failure_rate) {
        bail!("failure rate must be between 0 and 1, got {}", args.failure_rate);
    }

    println!(
        "Starting load test: scenario={:?}, links={}+{} late, receive_links={}, batches={}x{}, failure_rate={}",
        args.scenario,
        args.links,
        args.late_links,
        args.receive_links,
        args.batches,
        args.batch_size,
        args.failure_rate
    );

    let send_total = args.links + args.late_links;
    let driver = Arc::new(SimDriver::new());
    driver.set_send_latency(Duration::from_millis(args.send_latency_ms));
    for i in 0..args.links {
        driver.attach(&send_port(i), &send_imei(i));
    }
    for i in 0..args.receive_links {
        driver.attach(&receive_port(i), &receive_imei(i));
        driver.set_inbox(&receive_port(i), inbox(args.inbox_size));
    }

    let config = PoolConfig {
        ports: (0..send_total)
            .map(send_port)
            .chain((0..args.receive_links).map(receive_port))
            .collect(),
        send_imeis: (0..send_total).map(|i| Imei::normalize(&send_imei(i))).collect(),
        receive_imeis: (0..args.receive_links)
            .map(|i| Imei::normalize(&receive_imei(i)))
            .collect(),
        receive_mode: ReceiveMode::timed(Duration::from_secs(args.receive_seconds)),
        poll_interval_secs: args.poll_interval_seconds.max(1),
        monitor_interval_secs: args.monitor_interval_seconds.max(1),
        ..PoolConfig::default()
    };
    let store = Arc::new(MemoryStore::new());
    let pool = SmsPool::open(config, driver.clone(), store.clone()).await?;
    println!("Pool ready: links={}", pool.connections().len());

    let metrics = Arc::new(Metrics::default());
    let started = Instant::now();

    let receiver = if args.scenario == Scenario::Send {
        None
    } else {
        let mut stream = pool.receive_stream(None)?;
        let metrics = metrics.clone();
        Some(tokio::spawn(async move {
            while stream.next().await.is_some() {
                metrics.received.fetch_add(1, Ordering::Relaxed);
            }
        }))
    };

    if args.scenario != Scenario::Receive {
        let mut rng = StdRng::seed_from_u64(args.seed);
        if args.late_links > 0 {
            let driver = driver.clone();
            let (first, count) = (args.links, args.late_links);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                for i in first..first + count {
                    driver.attach(&send_port(i), &send_imei(i));
                }
                info!(count, "late links attached");
            });
        }

        for batch in 0..args.batches {
            let destinations: Vec<String> = (0..args.batch_size)
                .map(|i| format!("+34600{:06}", batch * args.batch_size + i))
                .collect();
            for destination in &destinations {
                for port in (0..send_total).map(send_port) {
                    if rng.gen_bool(args.failure_rate) {
                        driver.fail_destination(&port, destination, INJECTED_FAILURE);
                    }
                }
            }

            let batch_started = Instant::now();
            let report = match pool.send(&format!("load test batch {batch}"), &destinations).await {
                Ok(report) => report,
                Err(PoolError::Dispatch(DispatchError::PartialDelivery(report))) => {
                    warn!(batch, failed = report.failed.len(), "batch partially delivered");
                    *report
                }
                Err(e) => return Err(e.into()),
            };
            metrics.record(&report, batch_started.elapsed());
        }
    }

    if let Some(receiver) = receiver {
        for outcome in pool.wait_receive().await {
            if let Err(e) = outcome.result {
                warn!(imei = %outcome.imei, error = %e, "receive task failed");
                metrics.receive_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
        if let Err(e) = receiver.await {
            eprintln!("receiver join error: {e}");
        }
    }

    let elapsed = started.elapsed();
    report_metrics(&metrics, elapsed, store.len(), args.json)?;

    pool.close().await;
    Ok(())
}

#[allow(clippy::cast_precision_loss)]
fn report_metrics(metrics: &Metrics, elapsed: Duration, stored: usize, json: bool) -> Result<()> {
    let delivered = metrics.delivered.load(Ordering::Relaxed);
    let send_ms = metrics.send_elapsed_ms.load(Ordering::Relaxed);
    let counters = metrics.counters();

    if json {
        println!("{}", serde_json::to_string_pretty(&counters)?);
        return Ok(());
    }

    println!("\n=== Load test report ===");
    println!(
        "batches={} delivered={} failed={} rejected={}",
        metrics.batches.load(Ordering::Relaxed),
        delivered,
        metrics.failed.load(Ordering::Relaxed),
        metrics.rejected.load(Ordering::Relaxed),
    );
    println!(
        "produced={} consumed={} recovered={} failed_attempts={}",
        counters.produced, counters.consumed, counters.recovered, counters.failed_attempts
    );
    println!(
        "received={} stored={} receive_errors={}",
        metrics.received.load(Ordering::Relaxed),
        stored,
        metrics.receive_errors.load(Ordering::Relaxed),
    );
    let send_tps = if send_ms == 0 {
        0.0
    } else {
        delivered as f64 * 1000.0 / send_ms as f64
    };
    println!(
        "elapsed={:.2}s throughput_send={:.2} msg/s",
        elapsed.as_secs_f64(),
        send_tps
    );
    Ok(())
}
