//! Classification of numeric Link Driver codes.
//!
//! Every driver operation reports a numeric code. `0` is success, `1..=35`
//! fall into one of seven [`ErrorKind`] ranges, anything else is an
//! unclassified failure. Whether a failed delivery is retried on the same
//! link depends only on the kind (see [`ErrorKind::is_retryable`]).

use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

/// Raw status code returned by a driver call.
pub type DriverCode = i32;

/// The success code.
pub const CODE_OK: DriverCode = 0;

/// Probe codes that keep a link enabled even though they are not [`CODE_OK`].
pub const TRANSIENT_PROBE_CODES: [DriverCode; 2] = [22, 23];

/// The seven classified failure families.
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
    strum::EnumIter,
)]
#[strum(serialize_all = "lowercase")]
pub enum ErrorKind {
    /// 1–9: generic device failures.
    General,
    /// 10–15: the device's command state machine was busy or out of step.
    Statemachine,
    /// 16–18: memory location errors (empty slot, invalid index).
    Location,
    /// 19–21: malformed data.
    Format,
    /// 22–25: call-layer contention (line busy, network congestion).
    Call,
    /// 26–29: miscellaneous.
    Other,
    /// 30–35: driver or device configuration problems.
    Config,
}

impl ErrorKind {
    /// The code range this kind covers.
    pub fn codes(self) -> RangeInclusive<DriverCode> {
        match self {
            Self::General => 1..=9,
            Self::Statemachine => 10..=15,
            Self::Location => 16..=18,
            Self::Format => 19..=21,
            Self::Call => 22..=25,
            Self::Other => 26..=29,
            Self::Config => 30..=35,
        }
    }

    /// Map a failure code to its kind; `None` for `0` and out-of-range codes.
    pub fn from_code(code: DriverCode) -> Option<Self> {
        match code {
            1..=9 => Some(Self::General),
            10..=15 => Some(Self::Statemachine),
            16..=18 => Some(Self::Location),
            19..=21 => Some(Self::Format),
            22..=25 => Some(Self::Call),
            26..=29 => Some(Self::Other),
            30..=35 => Some(Self::Config),
            _ => None,
        }
    }

    /// Only contention-type failures are worth a second attempt on the same link.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Statemachine | Self::Call)
    }

    fn summary(self) -> &'static str {
        match self {
            Self::General => "general device failure",
            Self::Statemachine => "device state machine busy",
            Self::Location => "invalid memory location",
            Self::Format => "invalid data format",
            Self::Call => "call layer busy",
            Self::Other => "unexpected device response",
            Self::Config => "device configuration error",
        }
    }
}

/// A classified driver failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} error {code}: {message}")]
pub struct LinkError {
    /// Failure family.
    pub kind: ErrorKind,
    /// Raw code.
    pub code: DriverCode,
    /// Driver-supplied description.
    pub message: String,
}

/// Any failure of a driver call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    /// A code inside one of the classified ranges.
    #[error(transparent)]
    Link(#[from] LinkError),

    /// A non-zero code outside every classified range.
    #[error("unclassified driver error {code}")]
    Unclassified {
        /// Raw code.
        code: DriverCode,
    },

    /// The blocking driver call panicked or was cancelled.
    #[error("driver call aborted: {0}")]
    Aborted(String),
}

impl DriverError {
    /// Build the error for a non-zero code, with the kind's stock description.
    pub fn from_code(code: DriverCode) -> Self {
        match ErrorKind::from_code(code) {
            Some(kind) => Self::Link(LinkError {
                kind,
                code,
                message: kind.summary().to_string(),
            }),
            None => Self::Unclassified { code },
        }
    }

    /// Build the error for a non-zero code with a driver-supplied description.
    pub fn with_message(code: DriverCode, message: impl Into<String>) -> Self {
        match Self::from_code(code) {
            Self::Link(mut err) => {
                err.message = message.into();
                Self::Link(err)
            }
            other => other,
        }
    }

    /// The classified kind, if any.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Link(err) => Some(err.kind),
            _ => None,
        }
    }

    /// The raw code, if the failure came from one.
    pub fn code(&self) -> Option<DriverCode> {
        match self {
            Self::Link(err) => Some(err.code),
            Self::Unclassified { code } => Some(*code),
            Self::Aborted(_) => None,
        }
    }

    /// Whether the retry policy allows another attempt on the same link.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_some_and(ErrorKind::is_retryable)
    }
}

/// Turn a status code into a result: `0` is `Ok`, anything else is classified.
pub fn check(code: DriverCode) -> Result<(), DriverError> {
    if code == CODE_OK {
        Ok(())
    } else {
        Err(DriverError::from_code(code))
    }
}

/// Stock description of a code, used when the driver has nothing better.
pub fn describe(code: DriverCode) -> String {
    match ErrorKind::from_code(code) {
        Some(kind) => format!("{} ({code})", kind.summary()),
        None if code == CODE_OK => "no error".to_string(),
        None => format!("unknown error ({code})"),
    }
}

/// Whether a probe result keeps a link enabled.
pub fn probe_keeps_link(code: DriverCode) -> bool {
    code == CODE_OK || TRANSIENT_PROBE_CODES.contains(&code)
}
