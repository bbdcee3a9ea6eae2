//! In-memory transport for tests
//!
//! Devices are added and removed by hand. Each device can carry a responder
//! closure that receives every written report and returns the reports the
//! device answers with; reads pop those answers in order. Reports queued
//! with [`MockTransport::queue_reports`] stand for answers the device sends
//! later, such as after a button press.
//!
//! # Example
//!
//! ```
//! use daemon::usb::mock::MockTransport;
//! use daemon::usb::Transport;
//!
//! let transport = MockTransport::new();
//! transport.add_device("1-1", 0x534c, 0x0001, false);
//! transport.set_responder("1-1", |report| vec![report.to_vec()]);
//!
//! let mut handle = transport.connect("1-1", false, false).unwrap();
//! handle.write(&[1, 2, 3]).unwrap();
//! let mut buf = [0u8; 64];
//! assert_eq!(handle.read(&mut buf).unwrap(), 3);
//! ```

use super::error::{Result, SessionError};
use super::transport::{DeviceHandle, PhysicalDevice, Transport};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

/// How long a read with nothing to return blocks before timing out
const IDLE_READ: Duration = Duration::from_millis(5);

/// Device behaviour: written report in, answered reports out
pub type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

/// One recorded `connect` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectCall {
    pub path: String,
    pub debug: bool,
    pub reset: bool,
}

#[derive(Default)]
struct MockState {
    devices: Vec<PhysicalDevice>,
    responders: HashMap<String, Arc<Mutex<Responder>>>,
    connect_failures: HashMap<String, u32>,
    connects: Vec<ConnectCall>,
    closes: Vec<(String, bool)>,
    queued: HashMap<String, VecDeque<Vec<u8>>>,
    enumerations: usize,
}

/// Shared-state mock; clones observe the same devices
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_device(&self, path: &str, vendor_id: u16, product_id: u16, debug: bool) {
        self.state().devices.push(PhysicalDevice {
            path: path.to_string(),
            vendor_id,
            product_id,
            debug,
        });
    }

    /// Unplug a device; open handles start failing with `Disconnected`
    pub fn remove_device(&self, path: &str) {
        self.state().devices.retain(|d| d.path != path);
    }

    pub fn set_responder<F>(&self, path: &str, responder: F)
    where
        F: FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
    {
        self.state()
            .responders
            .insert(path.to_string(), Arc::new(Mutex::new(Box::new(responder))));
    }

    /// Reports the device at `path` sends without being asked
    pub fn queue_reports(&self, path: &str, reports: Vec<Vec<u8>>) {
        self.state()
            .queued
            .entry(path.to_string())
            .or_default()
            .extend(reports);
    }

    /// Make the next `count` connects to `path` fail
    pub fn fail_connects(&self, path: &str, count: u32) {
        self.state()
            .connect_failures
            .insert(path.to_string(), count);
    }

    pub fn connects(&self) -> Vec<ConnectCall> {
        self.state().connects.clone()
    }

    /// `(path, disconnected)` for every closed handle
    pub fn closes(&self) -> Vec<(String, bool)> {
        self.state().closes.clone()
    }

    pub fn enumerations(&self) -> usize {
        self.state().enumerations
    }
}

impl Transport for MockTransport {
    fn enumerate(&self) -> Result<Vec<PhysicalDevice>> {
        let mut state = self.state();
        state.enumerations += 1;
        Ok(state.devices.clone())
    }

    fn connect(&self, path: &str, debug: bool, reset: bool) -> Result<Box<dyn DeviceHandle>> {
        let mut state = self.state();
        state.connects.push(ConnectCall {
            path: path.to_string(),
            debug,
            reset,
        });

        if let Some(remaining) = state.connect_failures.get_mut(path)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(SessionError::Usb(rusb::Error::Busy));
        }

        if !state.devices.iter().any(|d| d.path == path) {
            return Err(SessionError::Disconnected);
        }

        Ok(Box::new(MockHandle {
            path: path.to_string(),
            pending: VecDeque::new(),
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockHandle {
    path: String,
    pending: VecDeque<Vec<u8>>,
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pop_queued(&self) -> Option<Vec<u8>> {
        self.state()
            .queued
            .get_mut(&self.path)
            .and_then(VecDeque::pop_front)
    }

    fn present(&self) -> bool {
        self.state().devices.iter().any(|d| d.path == self.path)
    }
}

impl DeviceHandle for MockHandle {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.present() {
            return Err(SessionError::Disconnected);
        }
        let report = match self.pending.pop_front() {
            Some(report) => Some(report),
            None => self.pop_queued(),
        };
        let Some(report) = report else {
            thread::sleep(IDLE_READ);
            return Err(SessionError::ReadTimeout);
        };
        let len = report.len().min(buf.len());
        buf[..len].copy_from_slice(&report[..len]);
        Ok(len)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        if !self.present() {
            return Err(SessionError::Disconnected);
        }
        let responder = self.state().responders.get(&self.path).cloned();
        if let Some(responder) = responder {
            let mut responder = responder.lock().unwrap_or_else(|e| e.into_inner());
            self.pending.extend((*responder)(data));
        }
        Ok(data.len())
    }

    fn close(&mut self, disconnected: bool) -> Result<()> {
        let path = self.path.clone();
        self.state().closes.push((path, disconnected));
        Ok(())
    }
}
