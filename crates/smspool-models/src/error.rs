//! Error types for the `smspool-models` crate.
//!
//! All fallible constructors and `TryFrom` implementations in this crate
//! return variants of [`ModelError`].

/// Errors produced when constructing or validating model types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    /// A destination number did not match the international or domestic format.
    #[error("invalid phone number \"{value}\": {reason}")]
    InvalidPhoneNumber {
        /// The value that failed validation.
        value: String,
        /// Human-readable explanation.
        reason: String,
    },

    /// A device IMEI contained no digits.
    #[error("invalid IMEI \"{value}\": {reason}")]
    InvalidImei {
        /// The value that failed validation.
        value: String,
        /// Human-readable explanation.
        reason: String,
    },
}
