//! Hardware wallet wire protocols for hwbus
//!
//! This crate holds the pure framing layer for the two supported device
//! families. It never touches USB itself: callers hand it logical commands and
//! get back fixed-size reports to write, then feed the reports they read back
//! into a decoder until a full reply has been reassembled.
//!
//! # Example
//!
//! ```
//! use protocol::trezor;
//!
//! // Frame a `GetFeatures` (type 55) call with an empty body
//! let reports = trezor::encode(55, &[]).unwrap();
//! assert_eq!(reports.len(), 1);
//!
//! // The device mirrors the same layout on the way back
//! let mut decoder = trezor::Decoder::new();
//! let decoded = decoder.push(&reports[0]).unwrap().unwrap();
//! assert_eq!(decoded.message_type, 55);
//! assert!(decoded.payload.is_empty());
//! ```
//!
//! # Ledger APDUs
//!
//! ```
//! use protocol::ledger::{self, Apdu};
//!
//! let apdu = Apdu::new(0x02, 0x00, 0x00, vec![0x01, 0x02]);
//! let reports = ledger::encode(&apdu.serialize().unwrap()).unwrap();
//! assert_eq!(reports[0][..5], [0x01, 0x01, 0x05, 0x00, 0x00]);
//! ```

pub mod error;
pub mod ledger;
pub mod proto;
pub mod trezor;

pub use error::{ProtocolError, Result};
pub use ledger::{Apdu, StatusWord};

/// Size of every HID / interrupt report exchanged with a device
pub const REPORT_SIZE: usize = 64;

/// One fixed-size report as written to or read from the device
pub type Report = [u8; REPORT_SIZE];
