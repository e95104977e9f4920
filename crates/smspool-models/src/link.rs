//! Link identity, capability and status types.
//!
//! A *link* is one managed serial connection to a GSM device. These types
//! describe what the device is ([`DeviceIdentity`]), what it may be used for
//! ([`Capability`]) and what it is doing right now ([`LinkStatus`]).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

// ---------------------------------------------------------------------------
// LinkId
// ---------------------------------------------------------------------------

/// Registry-assigned identifier of a link, unique for the registry lifetime.
///
/// # Examples
///
/// ```
/// use smspool_models::LinkId;
///
/// let id = LinkId::new(3);
/// assert_eq!(id.to_string(), "link-3");
/// assert_eq!(id.value(), 3);
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(u32);

impl LinkId {
    /// Create a link identifier from its numeric value.
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Return the numeric value.
    pub fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Imei
// ---------------------------------------------------------------------------

/// Device IMEI, normalised to its digits.
///
/// Devices often report the IMEI with spaces or a label prefix
/// (`"IMEI: 35 871984 682601 7"`); every non-digit character is dropped so
/// that configured IMEI lists compare reliably.
///
/// # Examples
///
/// ```
/// use smspool_models::Imei;
///
/// let imei: Imei = "IMEI: 35 871984 682601 7".parse().unwrap();
/// assert_eq!(imei.as_str(), "358719846826017");
///
/// assert!("n/a".parse::<Imei>().is_err());
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(from = "String")]
pub struct Imei(String);

impl Imei {
    /// Normalise a raw IMEI string **without validation**.
    ///
    /// The result may be empty; prefer [`FromStr`] for untrusted input.
    pub fn normalize(raw: &str) -> Self {
        Self(raw.chars().filter(char::is_ascii_digit).collect())
    }

    /// Return the digits as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Imei {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Imei {
    fn from(raw: String) -> Self {
        Self::normalize(&raw)
    }
}

impl FromStr for Imei {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let imei = Self::normalize(s);
        if imei.0.is_empty() {
            return Err(ModelError::InvalidImei {
                value: s.to_string(),
                reason: "must contain at least one digit".to_string(),
            });
        }
        Ok(imei)
    }
}

// ---------------------------------------------------------------------------
// DeviceIdentity
// ---------------------------------------------------------------------------

/// What the driver reports about the device behind a link.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Device model string.
    pub model: String,
    /// Device manufacturer.
    pub manufacturer: String,
    /// Installed firmware revision.
    pub firmware_revision: String,
    /// Normalised IMEI.
    pub imei: Imei,
}

// ---------------------------------------------------------------------------
// LinkRole / Capability
// ---------------------------------------------------------------------------

/// The role a worker needs a link for.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum LinkRole {
    /// Outbound delivery.
    Send,
    /// Inbound polling.
    Receive,
}

/// What a link may be used for, assigned once at discovery time.
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Outbound only.
    #[strum(serialize = "send")]
    Send,
    /// Inbound only.
    #[strum(serialize = "receive")]
    Receive,
    /// Both directions.
    #[strum(serialize = "send+receive")]
    SendReceive,
}

impl Capability {
    /// Classify a device by testing its IMEI against the configured lists.
    ///
    /// An IMEI present in both lists yields [`Capability::SendReceive`];
    /// one absent from both defaults to [`Capability::Send`].
    pub fn classify(imei: &Imei, send_imeis: &[Imei], receive_imeis: &[Imei]) -> Self {
        let send = send_imeis.contains(imei);
        let receive = receive_imeis.contains(imei);
        match (send, receive) {
            (true, true) => Self::SendReceive,
            (false, true) => Self::Receive,
            _ => Self::Send,
        }
    }

    /// Whether this capability covers the given role.
    pub fn allows(self, role: LinkRole) -> bool {
        matches!(
            (self, role),
            (Self::SendReceive, _) | (Self::Send, LinkRole::Send) | (Self::Receive, LinkRole::Receive)
        )
    }
}

// ---------------------------------------------------------------------------
// LinkStatus
// ---------------------------------------------------------------------------

/// What a link is doing right now.
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    /// Idle and claimable.
    Available,
    /// Held by a send worker.
    Sending,
    /// Held by a receive worker.
    Receiving,
    /// Failed a health probe; never claimed again.
    Disabled,
}

impl From<LinkRole> for LinkStatus {
    fn from(role: LinkRole) -> Self {
        match role {
            LinkRole::Send => Self::Sending,
            LinkRole::Receive => Self::Receiving,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
