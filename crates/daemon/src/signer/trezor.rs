//! Trezor call adapter
//!
//! A call writes one framed message and reads replies until the device
//! answers with something other than a PIN, passphrase or button request.
//! Those intermediate requests are answered by asking the UI and sending the
//! matching ack.

use super::{Prompter, Result, SignerError, UsbLink};
use common::UiPayload;
use common::message::kind;
use protocol::proto;
use protocol::trezor::{self, Decoded, Decoder};
use tracing::{debug, info};

pub mod message_type {
    pub const FAILURE: u16 = 3;
    pub const PIN_MATRIX_REQUEST: u16 = 18;
    pub const PIN_MATRIX_ACK: u16 = 19;
    pub const CANCEL: u16 = 20;
    pub const BUTTON_REQUEST: u16 = 26;
    pub const BUTTON_ACK: u16 = 27;
    pub const PASSPHRASE_REQUEST: u16 = 41;
    pub const PASSPHRASE_ACK: u16 = 42;
}

/// Failure codes that mean the user backed out
pub mod failure {
    pub const ACTION_CANCELLED: u64 = 4;
    pub const PIN_CANCELLED: u64 = 6;
}

pub const MAX_PIN_LENGTH: usize = 50;

/// Where a call currently stands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interaction {
    WaitingForDevice,
    WaitingForPin,
    WaitingForPassphrase,
    WaitingForButton,
    Done(Decoded),
    Cancelled,
}

impl Interaction {
    /// Classify a device reply
    pub fn after(reply: Decoded) -> Result<Self> {
        match reply.message_type {
            message_type::PIN_MATRIX_REQUEST => Ok(Interaction::WaitingForPin),
            message_type::PASSPHRASE_REQUEST => Ok(Interaction::WaitingForPassphrase),
            message_type::BUTTON_REQUEST => Ok(Interaction::WaitingForButton),
            message_type::FAILURE => {
                let fields = proto::decode_fields(&reply.payload)?;
                let code = proto::find_varint(&fields, 1).unwrap_or(0);
                match code {
                    failure::ACTION_CANCELLED | failure::PIN_CANCELLED => {
                        Ok(Interaction::Cancelled)
                    }
                    _ => Err(SignerError::DeviceFailure {
                        code,
                        message: proto::find_string(&fields, 2).unwrap_or_default(),
                    }),
                }
            }
            _ => Ok(Interaction::Done(reply)),
        }
    }
}

/// PIN digits are matrix positions 1 to 9
pub fn validate_pin(pin: &str) -> Result<()> {
    if pin.is_empty() {
        return Err(SignerError::InvalidPin("PIN is empty".to_string()));
    }
    if pin.len() > MAX_PIN_LENGTH {
        return Err(SignerError::InvalidPin(format!(
            "PIN is longer than {} digits",
            MAX_PIN_LENGTH
        )));
    }
    if let Some(c) = pin.chars().find(|c| !('1'..='9').contains(c)) {
        return Err(SignerError::InvalidPin(format!(
            "{:?} is not a matrix position",
            c
        )));
    }
    Ok(())
}

pub struct Trezor {
    link: UsbLink,
    ui: Prompter,
    require_passphrase: bool,
}

impl Trezor {
    pub fn new(link: UsbLink, ui: Prompter, require_passphrase: bool) -> Self {
        Self {
            link,
            ui,
            require_passphrase,
        }
    }

    /// Write one message and read back the next reply
    ///
    /// The reply to an ack only comes once the user has acted on the device,
    /// so its first report may take up to the interactive limit.
    pub async fn exchange(&self, message_type: u16, payload: &[u8]) -> Result<Decoded> {
        for report in trezor::encode(message_type, payload)? {
            self.link.write_report(&report).await?;
        }

        let waits_on_user = matches!(
            message_type,
            message_type::PIN_MATRIX_ACK | message_type::PASSPHRASE_ACK | message_type::BUTTON_ACK
        );
        let mut report = if waits_on_user {
            let limit = self.link.timeouts().interactive;
            self.link.await_report(limit).await?
        } else {
            self.link.read_report().await?
        };

        let mut decoder = Decoder::new();
        loop {
            if let Some(reply) = decoder.push(&report)? {
                debug!(
                    "Trezor reply type {} ({} bytes)",
                    reply.message_type,
                    reply.payload.len()
                );
                return Ok(reply);
            }
            report = self.link.read_report().await?;
        }
    }

    /// Run a call to completion, answering intermediate requests
    pub async fn call(&self, message_type: u16, payload: &[u8]) -> Result<Decoded> {
        let mut next = (message_type, payload.to_vec());
        let mut hail = None;
        let mut state = Interaction::WaitingForDevice;

        loop {
            state = match state {
                Interaction::WaitingForDevice => {
                    let reply = self.exchange(next.0, &next.1).await;
                    if let Some(hail) = hail.take() {
                        self.ui.remove_hail(hail);
                    }
                    Interaction::after(reply?)?
                }
                Interaction::WaitingForPin => match self.ask_pin().await {
                    Ok(pin) => {
                        next = (
                            message_type::PIN_MATRIX_ACK,
                            proto::encode_string_field(1, &pin),
                        );
                        Interaction::WaitingForDevice
                    }
                    Err(e) => return Err(self.abort(e).await),
                },
                Interaction::WaitingForPassphrase => match self.ask_passphrase().await {
                    Ok(passphrase) => {
                        next = (
                            message_type::PASSPHRASE_ACK,
                            proto::encode_string_field(1, &passphrase),
                        );
                        Interaction::WaitingForDevice
                    }
                    Err(e) => return Err(self.abort(e).await),
                },
                Interaction::WaitingForButton => {
                    hail = Some(self.ui.hail("Confirm the action on your Trezor")?);
                    next = (message_type::BUTTON_ACK, Vec::new());
                    Interaction::WaitingForDevice
                }
                Interaction::Done(reply) => return Ok(reply),
                Interaction::Cancelled => {
                    info!("Trezor call cancelled on the device");
                    return Err(SignerError::Cancelled);
                }
            };
        }
    }

    async fn ask_pin(&self) -> Result<String> {
        let reply = self
            .ui
            .ask(
                kind::GET_PIN,
                UiPayload::GetPin {
                    prompt: "Enter PIN using the matrix shown on your Trezor".to_string(),
                },
            )
            .await?;

        match reply {
            UiPayload::Pin(pin) => {
                validate_pin(&pin)?;
                Ok(pin)
            }
            UiPayload::Cancelled | UiPayload::Dismissed => Err(SignerError::Cancelled),
            other => Err(SignerError::UnexpectedReply(format!("{:?}", other))),
        }
    }

    async fn ask_passphrase(&self) -> Result<String> {
        let reply = self
            .ui
            .ask(
                kind::GET_PASS,
                UiPayload::GetPassphrase {
                    prompt: "Enter passphrase".to_string(),
                },
            )
            .await?;

        match reply {
            UiPayload::Passphrase(p) if p.is_empty() && self.require_passphrase => {
                Err(SignerError::EmptyPassphrase)
            }
            UiPayload::Passphrase(p) => Ok(p),
            UiPayload::Cancelled | UiPayload::Dismissed => Err(SignerError::Cancelled),
            other => Err(SignerError::UnexpectedReply(format!("{:?}", other))),
        }
    }

    /// Tell the device to drop the pending request, then hand back `err`
    async fn abort(&self, err: SignerError) -> SignerError {
        debug!("Aborting Trezor call: {}", err);
        if let Err(e) = self.exchange(message_type::CANCEL, &[]).await {
            debug!("Cancel was not acknowledged: {}", e);
        }
        err
    }
}
