//! In-process [`LinkDriver`] backed by simulated devices.
//!
//! Devices are attached to and detached from port names at runtime, and every
//! failure the engine reacts to (busy sends, dead probes, unreadable inboxes)
//! can be scripted per port. Used by the engine tests and the load-test
//! binary.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use smspool_models::{DeviceIdentity, Imei, OutboundSms, PhoneNumber, ReceivedMessage};

use crate::classifier::{CODE_OK, DriverCode};
use crate::driver::{LinkDriver, LinkHandle, LinkProfile};

/// Returned by `open` on a port with no device, and by any call on a handle
/// whose device was detached.
pub const NO_DEVICE: DriverCode = 1;

/// Returned by `fetch_message` for an index past the end of the inbox.
pub const EMPTY_LOCATION: DriverCode = 16;

/// One message accepted by a simulated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentRecord {
    pub port: String,
    pub destination: PhoneNumber,
    pub text: String,
}

#[derive(Debug)]
struct SimDevice {
    identity: DeviceIdentity,
    probe_code: DriverCode,
    send_script: VecDeque<DriverCode>,
    failing_destinations: HashMap<String, DriverCode>,
    fail_all: Option<DriverCode>,
    poll_failure: Option<DriverCode>,
    inbox: Vec<ReceivedMessage>,
    send_attempts: usize,
}

impl SimDevice {
    fn new(imei: &str) -> Self {
        Self {
            identity: SimDriver::identity_for(imei),
            probe_code: CODE_OK,
            send_script: VecDeque::new(),
            failing_destinations: HashMap::new(),
            fail_all: None,
            poll_failure: None,
            inbox: Vec::new(),
            send_attempts: 0,
        }
    }

    fn next_send_code(&mut self, destination: &PhoneNumber) -> DriverCode {
        self.send_attempts += 1;
        if let Some(code) = self.send_script.pop_front() {
            return code;
        }
        if let Some(code) = self.fail_all {
            return code;
        }
        self.failing_destinations
            .get(destination.as_str())
            .copied()
            .unwrap_or(CODE_OK)
    }
}

#[derive(Debug, Default)]
struct SimState {
    devices: HashMap<String, SimDevice>,
    /// Send attempts survive device detach so tests can still inspect them.
    attempts: HashMap<String, usize>,
    handles: HashMap<u32, String>,
    sent: Vec<SentRecord>,
    closed: usize,
}

impl SimState {
    fn device(&mut self, handle: LinkHandle) -> Result<(&str, &mut SimDevice), DriverCode> {
        let port = self.handles.get(&handle.0).ok_or(NO_DEVICE)?;
        let device = self.devices.get_mut(port).ok_or(NO_DEVICE)?;
        Ok((port.as_str(), device))
    }
}

/// A pool of simulated GSM devices keyed by port name.
#[derive(Debug, Default)]
pub struct SimDriver {
    state: Mutex<SimState>,
    next_handle: AtomicU32,
    send_latency: Mutex<Duration>,
}

impl SimDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// The identity a simulated device with this IMEI reports.
    pub fn identity_for(imei: &str) -> DeviceIdentity {
        DeviceIdentity {
            model: "SIM800".to_string(),
            manufacturer: "smspool-sim".to_string(),
            firmware_revision: "1.0".to_string(),
            imei: Imei::normalize(imei),
        }
    }

    /// Plug a device into `port`, replacing any device already there.
    pub fn attach(&self, port: &str, imei: &str) {
        self.lock().devices.insert(port.to_string(), SimDevice::new(imei));
    }

    /// Unplug the device on `port`. Open handles start failing with [`NO_DEVICE`].
    pub fn detach(&self, port: &str) {
        let mut state = self.lock();
        if let Some(device) = state.devices.remove(port) {
            *state.attempts.entry(port.to_string()).or_default() += device.send_attempts;
        }
    }

    /// Codes returned by the next sends on `port`, in order; afterwards sends
    /// fall back to the per-destination and global settings.
    pub fn script_sends(&self, port: &str, codes: impl IntoIterator<Item = DriverCode>) {
        self.with_device(port, |d| d.send_script.extend(codes));
    }

    /// Every send from `port` to `destination` returns `code`.
    pub fn fail_destination(&self, port: &str, destination: &str, code: DriverCode) {
        self.with_device(port, |d| {
            d.failing_destinations.insert(destination.to_string(), code);
        });
    }

    /// Every send from `port` returns `code`; `None` clears it.
    pub fn fail_all_sends(&self, port: &str, code: Option<DriverCode>) {
        self.with_device(port, |d| d.fail_all = code);
    }

    pub fn set_probe_code(&self, port: &str, code: DriverCode) {
        self.with_device(port, |d| d.probe_code = code);
    }

    /// Replace the stored messages of the device on `port`.
    pub fn set_inbox(&self, port: &str, messages: Vec<ReceivedMessage>) {
        self.with_device(port, |d| d.inbox = messages);
    }

    /// Every poll on `port` fails with `code`.
    pub fn fail_polls(&self, port: &str, code: DriverCode) {
        self.with_device(port, |d| d.poll_failure = Some(code));
    }

    /// Block every send for `latency` before answering.
    pub fn set_send_latency(&self, latency: Duration) {
        *self
            .send_latency
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = latency;
    }

    /// Every message accepted so far, in acceptance order.
    pub fn sent(&self) -> Vec<SentRecord> {
        self.lock().sent.clone()
    }

    /// Send attempts made through `port`, successful or not.
    pub fn send_attempts(&self, port: &str) -> usize {
        let state = self.lock();
        let live = state.devices.get(port).map_or(0, |d| d.send_attempts);
        live + state.attempts.get(port).copied().unwrap_or_default()
    }

    /// Number of `close` calls on known handles.
    pub fn closed_handles(&self) -> usize {
        self.lock().closed
    }

    fn with_device(&self, port: &str, f: impl FnOnce(&mut SimDevice)) {
        if let Some(device) = self.lock().devices.get_mut(port) {
            f(device);
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl LinkDriver for SimDriver {
    fn open(&self, profile: &LinkProfile) -> Result<LinkHandle, DriverCode> {
        let mut state = self.lock();
        if !state.devices.contains_key(&profile.port) {
            return Err(NO_DEVICE);
        }
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed) + 1;
        state.handles.insert(handle, profile.port.clone());
        Ok(LinkHandle(handle))
    }

    fn identity(&self, handle: LinkHandle) -> Result<DeviceIdentity, DriverCode> {
        let mut state = self.lock();
        let (_, device) = state.device(handle)?;
        Ok(device.identity.clone())
    }

    fn probe(&self, handle: LinkHandle) -> DriverCode {
        let mut state = self.lock();
        match state.device(handle) {
            Ok((_, device)) => device.probe_code,
            Err(code) => code,
        }
    }

    fn send_message(
        &self,
        handle: LinkHandle,
        destination: &PhoneNumber,
        sms: &OutboundSms,
    ) -> DriverCode {
        let latency = *self
            .send_latency
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }

        let mut state = self.lock();
        let (port, device) = match state.device(handle) {
            Ok(found) => found,
            Err(code) => return code,
        };
        let code = device.next_send_code(destination);
        if code == CODE_OK {
            let record = SentRecord {
                port: port.to_string(),
                destination: destination.clone(),
                text: sms.text.clone(),
            };
            state.sent.push(record);
        }
        code
    }

    fn poll_count(&self, handle: LinkHandle) -> Result<u32, DriverCode> {
        let mut state = self.lock();
        let (_, device) = state.device(handle)?;
        if let Some(code) = device.poll_failure {
            return Err(code);
        }
        Ok(u32::try_from(device.inbox.len()).unwrap_or(u32::MAX))
    }

    fn fetch_message(&self, handle: LinkHandle, index: u32) -> Result<ReceivedMessage, DriverCode> {
        let mut state = self.lock();
        let (_, device) = state.device(handle)?;
        device
            .inbox
            .get(index as usize)
            .cloned()
            .ok_or(EMPTY_LOCATION)
    }

    fn close(&self, handle: LinkHandle) {
        let mut state = self.lock();
        if state.handles.remove(&handle.0).is_some() {
            state.closed += 1;
        }
    }
}
