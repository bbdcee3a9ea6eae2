//! Common error types

use crate::message::Topic;
use crate::timer::TimerId;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// No correlated response arrived before the paired timer fired
    #[error("{topic}/{kind} timed out after {after:?}")]
    Timeout {
        topic: Topic,
        kind: String,
        after: Duration,
    },

    #[error("Topic '{0}' is reserved and cannot be fetched")]
    ReservedTopic(Topic),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Timer not found: {0}")]
    TimerNotFound(TimerId),

    /// Reset refused because the timer already used its whole hard budget
    #[error("Timer {id} used {consumed:?} of its {hard_limit:?} hard limit")]
    HardLimitExceeded {
        id: TimerId,
        consumed: Duration,
        hard_limit: Duration,
    },

    #[error("Unexpected payload for '{kind}': expected {expected}")]
    UnexpectedPayload { kind: String, expected: &'static str },

    /// The responder answered with an error string
    #[error("{topic}/{kind} failed: {message}")]
    Remote {
        topic: Topic,
        kind: String,
        message: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this is a fetch timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display() {
        let err = Error::Timeout {
            topic: Topic::Signer,
            kind: "trezor_call".to_string(),
            after: Duration::from_secs(5),
        };
        assert!(err.is_timeout());
        assert_eq!(format!("{}", err), "signer/trezor_call timed out after 5s");
    }

    #[test]
    fn test_remote_display() {
        let err = Error::Remote {
            topic: Topic::Usb,
            kind: "acquire_response".to_string(),
            message: "wrong previous session".to_string(),
        };
        assert!(!err.is_timeout());
        assert!(format!("{}", err).contains("wrong previous session"));
    }
}
