//! Outbound payloads and inbound message records.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// OutboundSms
// ---------------------------------------------------------------------------

/// The payload shared by every destination of one outbound batch.
///
/// Only the destination varies per job; the payload stays immutable for
/// the whole batch.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct OutboundSms {
    /// Message text.
    pub text: String,
    /// Service-center address, or `None` to let the device use its default.
    pub service_center: Option<String>,
    /// Request a delivery report.
    pub delivery_report: bool,
    /// Validity period in minutes.
    pub validity_minutes: u32,
}

impl OutboundSms {
    /// Number of characters of the text quoted in logs and error reports.
    pub const PREFIX_LEN: usize = 15;

    /// Create a payload with default delivery options.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            service_center: None,
            delivery_report: false,
            validity_minutes: 4320,
        }
    }

    /// The leading characters of the text, used to name the batch.
    ///
    /// ```
    /// use smspool_models::OutboundSms;
    ///
    /// let sms = OutboundSms::new("Meeting moved to 10:30 tomorrow");
    /// assert_eq!(sms.prefix(), "Meeting moved t");
    /// ```
    pub fn prefix(&self) -> &str {
        match self.text.char_indices().nth(Self::PREFIX_LEN) {
            Some((idx, _)) => &self.text[..idx],
            None => &self.text,
        }
    }
}

// ---------------------------------------------------------------------------
// MessageStatus / MessageType
// ---------------------------------------------------------------------------

/// Storage status the device reports for a received message.
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
pub enum MessageStatus {
    /// Read on the device.
    Read,
    /// Not yet read.
    Unread,
    /// Sent from the device.
    Sent,
    /// Stored but not sent.
    Unsent,
    /// Anything else.
    Unknown,
}

impl MessageStatus {
    /// Map the device's numeric status code.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Unread,
            1 => Self::Read,
            2 => Self::Sent,
            3 => Self::Unsent,
            _ => Self::Unknown,
        }
    }
}

/// Which folder the device filed a message under.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Incoming message.
    Inbox,
    /// Outgoing message.
    Outbox,
    /// Any other record kind, with the driver's tag.
    Other(String),
}

impl MessageType {
    /// Map the driver's textual type tag (`"Inbox Message"`, `"inbox"`, ...).
    pub fn from_tag(tag: &str) -> Self {
        let lower = tag.trim().to_ascii_lowercase();
        match lower.as_str() {
            "inbox" | "inbox message" => Self::Inbox,
            "outbox" | "outbox message" => Self::Outbox,
            _ => Self::Other(tag.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// ReceivedMessage
// ---------------------------------------------------------------------------

/// One message record fetched from a device's memory.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Driver error code for this record; `0` when the record is intact.
    pub error_code: i32,
    /// Memory index on the device.
    pub index: u32,
    /// Reception date as reported by the device.
    pub date: String,
    /// Storage status.
    pub status: MessageStatus,
    /// Sender number.
    pub source_number: String,
    /// Message text.
    pub text: String,
    /// Folder the record came from.
    pub message_type: MessageType,
}

impl ReceivedMessage {
    /// Whether this record is an intact inbox entry.
    pub fn is_well_formed_inbox(&self) -> bool {
        self.error_code == 0 && self.message_type == MessageType::Inbox
    }
}
