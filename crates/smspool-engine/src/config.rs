//! Pool configuration.
//!
//! [`PoolConfig`] is plain serde data. It is built from environment
//! variables, from a JSON file, or by hand, and handed to
//! [`SmsPool::open`](crate::SmsPool::open).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use smspool_models::{Imei, OutboundSms};

use crate::dispatcher::DEFAULT_MONITOR_INTERVAL;
use crate::error::ConfigError;
use crate::receiver::{DEFAULT_POLL_INTERVAL, ReceiveMode};

/// Delivery options applied to every message sent with [`SmsPool::send`](crate::SmsPool::send).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageDefaults {
    /// Service-center address; `None` uses the device default.
    pub service_center: Option<String>,
    pub delivery_report: bool,
    /// Validity period in minutes (default three days).
    pub validity_minutes: u32,
}

impl Default for MessageDefaults {
    fn default() -> Self {
        let sms = OutboundSms::new("");
        Self {
            service_center: sms.service_center,
            delivery_report: sms.delivery_report,
            validity_minutes: sms.validity_minutes,
        }
    }
}

/// Everything needed to open a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Serial ports probed during discovery, in profile order.
    pub ports: Vec<String>,
    /// IMEIs of devices allowed to send.
    pub send_imeis: Vec<Imei>,
    /// IMEIs of devices allowed to receive.
    pub receive_imeis: Vec<Imei>,
    pub defaults: MessageDefaults,
    pub receive_mode: ReceiveMode,
    /// Seconds between two poll cycles of a timed receive.
    pub poll_interval_secs: u64,
    /// Seconds between two health-monitor ticks during a batch.
    pub monitor_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            ports: default_ports(),
            send_imeis: Vec::new(),
            receive_imeis: Vec::new(),
            defaults: MessageDefaults::default(),
            receive_mode: ReceiveMode::default(),
            poll_interval_secs: DEFAULT_POLL_INTERVAL.as_secs(),
            monitor_interval_secs: DEFAULT_MONITOR_INTERVAL.as_secs(),
        }
    }
}

/// `/dev/ttyUSB0-8` followed by `/dev/ttyACM0-8`.
pub fn default_ports() -> Vec<String> {
    ["/dev/ttyUSB", "/dev/ttyACM"]
        .iter()
        .flat_map(|prefix| (0..9).map(move |i| format!("{prefix}{i}")))
        .collect()
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_imeis(value: &str) -> Vec<Imei> {
    split_list(value).filter_map(|s| s.parse().ok()).collect()
}

impl PoolConfig {
    /// Build the configuration from environment variables.
    ///
    /// | Variable                 | Default                       | Description                         |
    /// |--------------------------|-------------------------------|-------------------------------------|
    /// | `SMSPOOL_PORTS`          | `/dev/ttyUSB0-8,/dev/ttyACM0-8` | Comma-separated serial ports      |
    /// | `SMSPOOL_SEND_IMEIS`     | *(empty)*                     | Comma-separated send IMEIs          |
    /// | `SMSPOOL_RECEIVE_IMEIS`  | *(empty)*                     | Comma-separated receive IMEIs       |
    /// | `SMSPOOL_SMSC`           | *(device default)*            | Service-center address              |
    /// | `SMSPOOL_POLL_INTERVAL`  | `10`                          | Seconds between receive polls       |
    /// | `SMSPOOL_MONITOR_INTERVAL` | `5`                         | Seconds between health-monitor ticks |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load a JSON configuration file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(ports) = lookup("SMSPOOL_PORTS") {
            let ports: Vec<String> = split_list(&ports).map(str::to_string).collect();
            if !ports.is_empty() {
                config.ports = ports;
            }
        }
        if let Some(imeis) = lookup("SMSPOOL_SEND_IMEIS") {
            config.send_imeis = parse_imeis(&imeis);
        }
        if let Some(imeis) = lookup("SMSPOOL_RECEIVE_IMEIS") {
            config.receive_imeis = parse_imeis(&imeis);
        }
        config.defaults.service_center = lookup("SMSPOOL_SMSC").filter(|s| !s.trim().is_empty());
        if let Some(secs) = lookup("SMSPOOL_POLL_INTERVAL").and_then(|v| v.parse().ok()) {
            config.poll_interval_secs = secs;
        }
        if let Some(secs) = lookup("SMSPOOL_MONITOR_INTERVAL").and_then(|v| v.parse().ok()) {
            config.monitor_interval_secs = secs;
        }
        config
    }

    /// Reject configurations that cannot open a single link.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ports.is_empty() {
            return Err(ConfigError::Invalid("no ports configured".into()));
        }
        if self.poll_interval_secs == 0 || self.monitor_interval_secs == 0 {
            return Err(ConfigError::Invalid("intervals must be at least one second".into()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    /// A payload carrying `text` and the configured delivery options.
    pub fn message(&self, text: impl Into<String>) -> OutboundSms {
        OutboundSms {
            service_center: self.defaults.service_center.clone(),
            delivery_report: self.defaults.delivery_report,
            validity_minutes: self.defaults.validity_minutes,
            ..OutboundSms::new(text)
        }
    }
}
