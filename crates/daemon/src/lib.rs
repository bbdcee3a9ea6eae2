//! hwbus daemon
//!
//! Hosts the services that sit on the message bus: the USB session core and
//! its `usb` topic facade, the Trezor and Ledger signer adapters, and a
//! terminal implementation of the interactive `ui` topic.

pub mod config;
pub mod signer;
pub mod ui;
pub mod usb;

pub use config::DaemonConfig;
