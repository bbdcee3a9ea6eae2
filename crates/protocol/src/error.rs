//! Protocol error types

use thiserror::Error;

/// Framing errors
///
/// Every variant is fatal for the exchange that produced it: a report that
/// does not line up with the expected header cannot be resynchronised.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Report did not start with the expected report id
    #[error("Bad report id: expected {expected:#04x}, got {found:#04x}")]
    BadReportId { expected: u8, found: u8 },

    /// First report of a Trezor frame did not carry the `##` marker
    #[error("Bad frame magic: {found:02x?}")]
    BadMagic { found: [u8; 2] },

    /// Ledger report on an unexpected HID channel
    #[error("Bad channel: expected {expected:#06x}, got {found:#06x}")]
    BadChannel { expected: u16, found: u16 },

    /// Ledger report with an unexpected command tag
    #[error("Bad tag: expected {expected:#04x}, got {found:#04x}")]
    BadTag { expected: u8, found: u8 },

    /// Report arrived out of order
    #[error("Bad sequence number: expected {expected}, got {found}")]
    BadSequence { expected: u16, found: u16 },

    /// Report shorter than its own header
    #[error("Truncated report: needed {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },

    /// Frame length exceeds maximum allowed size
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Incomplete frame data
    #[error("Incomplete frame: expected {expected} bytes, got {actual}")]
    IncompleteFrame { expected: usize, actual: usize },

    /// Protobuf body could not be parsed
    #[error("Malformed protobuf: {0}")]
    Protobuf(String),

    /// I/O error while writing headers
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
