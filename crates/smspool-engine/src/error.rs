//! Engine error types.
//!
//! Each entry point returns its own enum so callers can match on exactly
//! the outcomes that entry point can produce. [`PoolError`] unifies them for
//! the [`SmsPool`](crate::SmsPool) facade.

use smspool_models::{Imei, ModelError};

use crate::classifier::DriverError;
use crate::dispatcher::DispatchReport;

/// Why a batch did not deliver every destination.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    /// No destination survived validation; nothing was started.
    #[error("message \"{prefix}...\" couldn't be sent: bad format or no destination number were specified")]
    NoDestinations {
        /// Leading characters of the message text.
        prefix: String,
        /// Why each destination was rejected.
        rejected: Vec<ModelError>,
    },

    /// Every link is disabled, receive-only, or busy; nothing was started.
    #[error("message \"{prefix}...\" couldn't be sent: there are no active or available send links")]
    NoEligibleLink {
        /// Leading characters of the message text.
        prefix: String,
    },

    /// The batch ran but some destinations stayed undeliverable.
    #[error(
        "message \"{}...\" couldn't be sent to {} of {} destination(s): {}",
        .0.prefix,
        .0.failed.len(),
        .0.batch_size,
        .0.failed_list()
    )]
    PartialDelivery(Box<DispatchReport>),
}

impl DispatchError {
    /// The batch report, when the batch actually ran.
    pub fn report(&self) -> Option<&DispatchReport> {
        match self {
            Self::PartialDelivery(report) => Some(report),
            _ => None,
        }
    }

    /// Whether nothing at all was delivered.
    pub fn is_total_failure(&self) -> bool {
        self.report().is_none_or(|r| r.delivered_count() == 0)
    }
}

/// Why a receive task could not start or stopped early.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReceiveError {
    /// No requested link is receive-capable and available.
    #[error("there are no active or available receive links")]
    NoEligibleLink,

    /// A poll cycle failed.
    #[error("failed to receive more messages from link with imei {imei}: {source}")]
    Driver {
        /// IMEI of the polled device.
        imei: Imei,
        /// The driver failure.
        #[source]
        source: DriverError,
    },

    /// The receive task panicked or was aborted.
    #[error("receive task for imei {imei} ended abnormally: {reason}")]
    Aborted {
        /// IMEI of the polled device.
        imei: Imei,
        /// Join failure text.
        reason: String,
    },
}

/// Why the persistence collaborator rejected a message.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backend could not be reached or written.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// JSON (de)serialisation error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a [`PoolConfig`](crate::PoolConfig) could not be loaded.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid JSON for the configuration schema.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// The values cannot describe a working pool.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors surfaced by the [`SmsPool`](crate::SmsPool) facade.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Discovery found no usable device on any configured port.
    #[error("no active links found on ports: {ports}")]
    NoActiveLinks {
        /// The ports that were tried, comma separated.
        ports: String,
    },

    /// A send batch failed.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// A receive request failed.
    #[error(transparent)]
    Receive(#[from] ReceiveError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::CounterSnapshot;
    use smspool_models::PhoneNumber;

    fn report(failed: &[&str], delivered: usize) -> DispatchReport {
        DispatchReport {
            prefix: "Meeting moved t".into(),
            batch_size: failed.len() + delivered,
            rejected: vec![],
            delivered: vec![],
            failed: failed.iter().map(|f| f.parse::<PhoneNumber>().unwrap()).collect(),
            counters: CounterSnapshot::default(),
        }
    }

    #[test]
    fn partial_delivery_display() {
        let err = DispatchError::PartialDelivery(Box::new(report(
            &["+34123456789", "+34123456780"],
            3,
        )));
        assert_eq!(
            err.to_string(),
            "message \"Meeting moved t...\" couldn't be sent to 2 of 5 destination(s): +34123456789, +34123456780"
        );
    }

    #[test]
    fn no_eligible_link_display() {
        let err = DispatchError::NoEligibleLink {
            prefix: "hello".into(),
        };
        assert_eq!(
            err.to_string(),
            "message \"hello...\" couldn't be sent: there are no active or available send links"
        );
        assert!(err.is_total_failure());
        assert!(err.report().is_none());
    }

    #[test]
    fn receive_error_display() {
        let err = ReceiveError::Driver {
            imei: Imei::normalize("358719846826017"),
            source: DriverError::from_code(12),
        };
        assert_eq!(
            err.to_string(),
            "failed to receive more messages from link with imei 358719846826017: statemachine error 12: device state machine busy"
        );
    }
}
