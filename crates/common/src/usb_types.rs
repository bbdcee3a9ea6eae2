//! USB types shared over the bus
//!
//! Devices are addressed by small synthetic ids handed out by the session
//! core. Physical paths never leave the daemon.

use crate::message::MessageId;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Error text of a read that saw no report before the device read timeout
pub const READ_TIMED_OUT: &str = "read timed out";

/// Synthetic device id, stable while the physical path stays visible
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DeviceId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(DeviceId)
    }
}

/// Session id, `"debug"`-prefixed when it owns the debug interface
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(counter: u64, debug: bool) -> Self {
        if debug {
            SessionId(format!("debug{}", counter))
        } else {
            SessionId(counter.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        SessionId(s.to_string())
    }
}

/// One device as reported by an enumeration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnumerateEntry {
    pub id: DeviceId,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Device exposes a debug interface
    pub debug: bool,
    pub session: Option<SessionId>,
    pub debug_session: Option<SessionId>,
}

/// Where a raw read or write goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoTarget {
    /// Reuse the device's current session or open an anonymous one
    Device { id: DeviceId, debug: bool },
    Session(SessionId),
}

/// Payloads on the `usb` topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsbPayload {
    Enumerate,
    Listen {
        known: Vec<EnumerateEntry>,
    },
    /// Cancel the listen started by request `request`
    CancelListen {
        request: MessageId,
    },
    /// `device` is the synthetic id as text; unparsable ids are rejected
    Acquire {
        device: String,
        previous: Option<SessionId>,
        debug: bool,
    },
    Release {
        session: SessionId,
        debug: bool,
    },
    Write {
        target: IoTarget,
        data: Vec<u8>,
    },
    Read {
        target: IoTarget,
    },

    Entries(Vec<EnumerateEntry>),
    Session(SessionId),
    Written(usize),
    Data(Vec<u8>),
}
