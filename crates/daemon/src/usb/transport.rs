//! Low-level transport seam
//!
//! The session core only talks to devices through these traits. The
//! production implementation lives in [`super::device`]; tests use
//! [`super::mock`].

use super::error::Result;

/// A device as seen by one enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalDevice {
    /// Stable location of the device, e.g. `"1-2.4"`
    pub path: String,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Device exposes a debug interface next to the normal one
    pub debug: bool,
}

/// An open interface
pub trait DeviceHandle: Send {
    /// Read one report into `buf`, blocking until data arrives
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write one report
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Release the interface; `disconnected` skips talking to the device
    fn close(&mut self, disconnected: bool) -> Result<()>;
}

/// Source of devices
pub trait Transport: Send + Sync {
    fn enumerate(&self) -> Result<Vec<PhysicalDevice>>;

    /// Open the normal or debug interface of the device at `path`
    fn connect(&self, path: &str, debug: bool, reset: bool) -> Result<Box<dyn DeviceHandle>>;
}
