//! USB session errors

use common::usb_types::{DeviceId, READ_TIMED_OUT, SessionId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    /// The caller's idea of the current session is out of date
    #[error("wrong previous session: expected {expected:?}, found {actual:?}")]
    WrongPrevSession {
        expected: Option<SessionId>,
        actual: Option<SessionId>,
    },

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    /// Another session owns the interface and stealing is disabled
    #[error("other call in progress")]
    OtherCallInProgress,

    #[error("malformed data: {0}")]
    MalformedData(String),

    #[error("device not found: {0}")]
    DeviceNotFound(DeviceId),

    #[error("cancelled")]
    Cancelled,

    #[error("device disconnected")]
    Disconnected,

    /// The device sent nothing within the read timeout
    #[error("{}", READ_TIMED_OUT)]
    ReadTimeout,

    #[error("failed to open {path} after {attempts} attempts: {source}")]
    Connect {
        path: String,
        attempts: u32,
        #[source]
        source: Box<SessionError>,
    },

    #[error("USB error: {0}")]
    Usb(rusb::Error),

    #[error("transport error: {0}")]
    Transport(String),
}

impl SessionError {
    /// Whether the caller can retry with corrected arguments
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SessionError::WrongPrevSession { .. }
                | SessionError::SessionNotFound(_)
                | SessionError::OtherCallInProgress
                | SessionError::MalformedData(_)
                | SessionError::DeviceNotFound(_)
        )
    }
}

impl From<rusb::Error> for SessionError {
    fn from(err: rusb::Error) -> Self {
        match err {
            rusb::Error::NoDevice => SessionError::Disconnected,
            rusb::Error::Timeout => SessionError::ReadTimeout,
            other => SessionError::Usb(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
