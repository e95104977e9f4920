#![deny(missing_docs)]

//! # smspool models
//!
//! Core data types shared by the SMS link pool engine and its callers.
//!
//! ## Module layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`link`] | Link identity (`LinkId`, `Imei`, `DeviceIdentity`), `Capability`, `LinkStatus`, `LinkRole` |
//! | [`phone`] | Validated destination numbers (`PhoneNumber`) |
//! | [`message`] | Outbound payload (`OutboundSms`) and inbound records (`ReceivedMessage`) |
//! | [`error`] | Validation errors (`ModelError`) |

pub mod error;
pub mod link;
pub mod message;
pub mod phone;

// Re-export all public types at crate root for convenience.
pub use error::*;
pub use link::*;
pub use message::*;
pub use phone::*;
