//! The Link Driver contract.
//!
//! The engine never talks to a device itself. Everything below the
//! connection layer (AT commands, PDU encoding, memory reads) lives behind
//! [`LinkDriver`]. Calls are blocking; the engine runs them on the blocking
//! thread pool.

use smspool_models::{DeviceIdentity, OutboundSms, PhoneNumber, ReceivedMessage};

use crate::classifier::{self, DriverCode};

/// Opaque handle to an open device connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkHandle(pub u32);

/// The connection profile a link is opened with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkProfile {
    /// Profile name in the driver configuration (`telf0`, `telf1`, ...).
    pub name: String,
    /// Serial port the device is attached to.
    pub port: String,
}

impl LinkProfile {
    /// Profile for the port at `index` in the configured port list.
    pub fn for_port(index: usize, port: &str) -> Self {
        Self {
            name: format!("telf{index}"),
            port: port.to_string(),
        }
    }
}

/// Device access used by the engine.
///
/// Failures are reported as raw codes and classified by
/// [`classifier::check`]. Implementations must tolerate concurrent calls on
/// different handles; the engine guarantees at most one send or poll at a
/// time per handle, but probes may overlap with them.
pub trait LinkDriver: Send + Sync + 'static {
    /// Open the device described by `profile`.
    fn open(&self, profile: &LinkProfile) -> Result<LinkHandle, DriverCode>;

    /// Read model, manufacturer, firmware revision and IMEI.
    fn identity(&self, handle: LinkHandle) -> Result<DeviceIdentity, DriverCode>;

    /// Health check; `0` when the device still answers.
    fn probe(&self, handle: LinkHandle) -> DriverCode;

    /// Submit one message to one destination.
    fn send_message(
        &self,
        handle: LinkHandle,
        destination: &PhoneNumber,
        sms: &OutboundSms,
    ) -> DriverCode;

    /// Number of message records stored on the device.
    fn poll_count(&self, handle: LinkHandle) -> Result<u32, DriverCode>;

    /// Fetch the record at `index`.
    fn fetch_message(&self, handle: LinkHandle, index: u32) -> Result<ReceivedMessage, DriverCode>;

    /// Release the connection.
    fn close(&self, handle: LinkHandle);

    /// Human-readable text for a code.
    fn describe(&self, code: DriverCode) -> String {
        classifier::describe(code)
    }
}
