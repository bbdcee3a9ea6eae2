//! USB subsystem
//!
//! Maps physical devices to synthetic ids, arbitrates exclusive access to
//! their interfaces, and exposes the result on the `usb` bus topic.
//!
//! All transport work is blocking. The bus-facing service moves it onto
//! Tokio's blocking pool so the async runtime never waits on libusb.

pub mod device;
pub mod error;
pub mod mock;
pub mod service;
pub mod session;
pub mod transport;

pub use device::RusbTransport;
pub use error::SessionError;
pub use service::UsbService;
pub use session::{CoreOptions, SessionCore};
pub use transport::{DeviceHandle, PhysicalDevice, Transport};
