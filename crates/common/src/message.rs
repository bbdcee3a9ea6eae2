//! Bus messages and the payload union
//!
//! Every message carries one [`Payload`] variant. Each topic family owns a
//! variant (`Timer`, `Usb`, `Ui`, `Signer`); collaborators that live outside
//! this workspace use the generic `Text` and `Bytes` variants.

use crate::error::{Error, Result};
use crate::timer::{TimerId, TimerPayload};
use crate::usb_types::{DeviceId, UsbPayload};
use std::fmt;

/// Monotonic message id, unique per process
///
/// Id `0` is never assigned and marks "not a response".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MessageId(pub u64);

impl MessageId {
    pub const NONE: MessageId = MessageId(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Bus topics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Timer,
    Usb,
    Signer,
    Ui,
    Wallet,
    Gui,
    Price,
    Defi,
}

impl Topic {
    pub fn as_str(self) -> &'static str {
        match self {
            Topic::Timer => "timer",
            Topic::Usb => "usb",
            Topic::Signer => "signer",
            Topic::Ui => "ui",
            Topic::Wallet => "wallet",
            Topic::Gui => "gui",
            Topic::Price => "price",
            Topic::Defi => "defi",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message kinds understood by the services in this workspace
pub mod kind {
    pub const RESPONSE_SUFFIX: &str = "_response";

    pub const INIT: &str = "init";
    pub const START: &str = "start";
    pub const PAUSE: &str = "pause";
    pub const RESET: &str = "reset";
    pub const TRIGGER: &str = "trigger";
    pub const DELETE: &str = "delete";
    pub const DONE: &str = "done";
    pub const TICK: &str = "tick";

    pub const ENUMERATE: &str = "enumerate";
    pub const LISTEN: &str = "listen";
    pub const LISTEN_CANCEL: &str = "listen_cancel";
    pub const ACQUIRE: &str = "acquire";
    pub const RELEASE: &str = "release";
    pub const WRITE: &str = "write";
    pub const READ: &str = "read";

    pub const HAIL: &str = "hail";
    pub const REMOVE_HAIL: &str = "remove-hail";
    pub const GET_PIN: &str = "get_pin";
    pub const GET_PASS: &str = "get_pass";

    pub const TREZOR_CALL: &str = "trezor_call";
    pub const LEDGER_EXCHANGE: &str = "ledger_exchange";
}

/// Requests to and answers from the interactive UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiPayload {
    /// Show a notice until `RemoveHail` or until the user dismisses it
    Hail { text: String, cancellable: bool },
    /// Close the hail published as message `hail`; other hails stay up
    RemoveHail { hail: MessageId },
    GetPin { prompt: String },
    GetPassphrase { prompt: String },

    /// The hail was closed without the user cancelling
    Dismissed,
    /// The user backed out
    Cancelled,
    Pin(String),
    Passphrase(String),
}

/// Requests to and answers from the signer service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignerPayload {
    TrezorCall {
        device: DeviceId,
        message_type: u16,
        payload: Vec<u8>,
    },
    TrezorReply {
        message_type: u16,
        payload: Vec<u8>,
    },
    LedgerExchange {
        device: DeviceId,
        apdu: Vec<u8>,
    },
    /// Response data with the status word stripped
    LedgerReply { data: Vec<u8> },
}

/// Closed set of message bodies
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Payload {
    #[default]
    Empty,
    Text(String),
    Bytes(Vec<u8>),
    Timer(TimerPayload),
    Usb(UsbPayload),
    Ui(UiPayload),
    Signer(SignerPayload),
}

/// One bus message
#[derive(Debug, Clone)]
pub struct Message {
    pub id: MessageId,
    pub topic: Topic,
    pub kind: String,
    pub payload: Payload,
    /// Timer paired with a fetch request
    pub timer_id: Option<TimerId>,
    /// Id of the request this message answers, `NONE` for requests and events
    pub respond_to: MessageId,
    pub error: Option<String>,
}

impl Message {
    /// Whether this message answers an earlier request
    pub fn is_response(&self) -> bool {
        !self.respond_to.is_none()
    }

    /// Turn a response carrying an error string into `Err`
    pub fn into_result(mut self) -> Result<Message> {
        match self.error.take() {
            Some(message) => Err(Error::Remote {
                topic: self.topic,
                kind: self.kind,
                message,
            }),
            None => Ok(self),
        }
    }
}
