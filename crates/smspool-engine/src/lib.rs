//! # smspool engine
//!
//! Dispatches outbound SMS batches across a dynamically discovered pool of
//! serial GSM links and polls the same pool for inbound messages.
//!
//! The engine provides:
//!
//! * [`SmsPool`]: the facade callers use to send, receive and close.
//! * [`LinkRegistry`]: discovery, health probes and leasing of links.
//! * [`Dispatcher`]: bounded-queue batch delivery with a dead-letter
//!   recovery wave and a [`HealthMonitor`] admitting new links mid-batch.
//! * [`ReceiveScheduler`]: per-link polling, once or for a duration.
//! * [`LinkDriver`]: the contract a device driver implements; [`SimDriver`]
//!   is an in-process implementation.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use smspool_engine::{MemoryStore, PoolConfig, SimDriver, SmsPool};
//!
//! # async fn run() -> Result<(), smspool_engine::PoolError> {
//! let driver = Arc::new(SimDriver::new());
//! driver.attach("/dev/ttyUSB0", "358719846826017");
//!
//! let pool = SmsPool::open(PoolConfig::from_env(), driver, Arc::new(MemoryStore::new())).await?;
//! let report = pool.send("Meeting moved to 10:30", ["+34123456789"]).await?;
//! println!("delivered {}", report.delivered_count());
//! pool.close().await;
//! # Ok(())
//! # }
//! ```

pub mod classifier;
pub mod config;
pub mod dispatcher;
pub mod driver;
pub mod error;
pub mod link;
pub mod monitor;
pub mod pool;
pub mod queue;
pub mod receiver;
pub mod registry;
pub mod sim;
pub mod store;

pub use classifier::{DriverCode, DriverError, ErrorKind, LinkError};
pub use config::{MessageDefaults, PoolConfig};
pub use dispatcher::{CounterSnapshot, Delivery, DispatchReport, Dispatcher, Phase};
pub use driver::{LinkDriver, LinkHandle, LinkProfile};
pub use error::{ConfigError, DispatchError, PoolError, ReceiveError, StoreError};
pub use link::{Link, LinkLease, LinkSnapshot};
pub use monitor::{HealthMonitor, MonitorHandle, TickStats};
pub use pool::{MessageStream, SmsPool};
pub use queue::{DeadLetter, DeadLetterQueue, DispatchQueue};
pub use receiver::{MessageCallback, ReceiveHandle, ReceiveMode, ReceiveOutcome, ReceiveScheduler};
pub use registry::{LinkRegistry, RefreshSummary};
pub use sim::SimDriver;
pub use store::{JsonLinesStore, MemoryStore, MessageStore, NullStore, StoredMessage};
