//! Common building blocks for hwbus
//!
//! This crate provides the in-process message bus and the timer service it is
//! built on, the closed payload types exchanged on every topic, the USB entry
//! types shared between the session core and its callers, error handling,
//! and logging setup.

pub mod bus;
pub mod error;
pub mod logging;
pub mod message;
pub mod test_utils;
pub mod timer;
pub mod usb_types;

pub use bus::{Bus, BusConfig, PendingFetch, Subscription};
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use message::{Message, MessageId, Payload, SignerPayload, Topic, UiPayload};
pub use timer::{TimerId, TimerPayload, TimerService};
