//! Hardware wallet adapters
//!
//! Both adapters frame their commands with the `protocol` crate and move the
//! resulting 64-byte reports through the `usb` topic, one fetch per report.
//! They never touch the session core directly. User interaction (PIN entry,
//! passphrase, "confirm on device" notices) goes through the `ui` topic.

pub mod ledger;
pub mod trezor;

use common::message::kind;
use common::usb_types::{DeviceId, IoTarget, READ_TIMED_OUT, UsbPayload};
use common::{Bus, Message, MessageId, Payload, SignerPayload, Topic, UiPayload};
use protocol::{ProtocolError, StatusWord};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("framing error: {0}")]
    Framing(#[from] ProtocolError),

    #[error(transparent)]
    Bus(#[from] common::Error),

    /// The device answered with a Failure message
    #[error("device failure {code}: {message}")]
    DeviceFailure { code: u64, message: String },

    #[error("cancelled")]
    Cancelled,

    #[error("invalid PIN: {0}")]
    InvalidPin(String),

    #[error("passphrase must not be empty")]
    EmptyPassphrase,

    #[error("ledger returned {0}")]
    Status(StatusWord),

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}

impl SignerError {
    pub fn is_locked(&self) -> bool {
        matches!(self, SignerError::Status(sw) if sw.is_locked())
    }

    pub fn is_wrong_app(&self) -> bool {
        matches!(self, SignerError::Status(sw) if sw.is_wrong_app())
    }
}

pub type Result<T> = std::result::Result<T, SignerError>;

/// Fetch limits used by the adapters
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Per-report USB fetch limits
    pub soft: Duration,
    pub hard: Duration,
    /// How long a UI prompt may stay open, and how long a reply that waits
    /// on the user may take
    pub interactive: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            soft: Duration::from_secs(30),
            hard: Duration::from_secs(60),
            interactive: Duration::from_secs(300),
        }
    }
}

/// Raw report I/O over the `usb` topic
#[derive(Clone)]
pub struct UsbLink {
    bus: Bus,
    target: IoTarget,
    timeouts: Timeouts,
}

impl UsbLink {
    pub fn new(bus: Bus, target: IoTarget, timeouts: Timeouts) -> Self {
        Self {
            bus,
            target,
            timeouts,
        }
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    async fn fetch(&self, kind: &str, request: UsbPayload) -> Result<UsbPayload> {
        let reply = self
            .bus
            .fetch(
                Topic::Usb,
                kind,
                Payload::Usb(request),
                self.timeouts.soft,
                self.timeouts.hard,
            )
            .await?
            .into_result()?;

        match reply.payload {
            Payload::Usb(payload) => Ok(payload),
            other => Err(SignerError::UnexpectedReply(format!("{:?}", other))),
        }
    }

    pub async fn write_report(&self, report: &[u8]) -> Result<()> {
        let request = UsbPayload::Write {
            target: self.target.clone(),
            data: report.to_vec(),
        };
        match self.fetch(kind::WRITE, request).await? {
            UsbPayload::Written(_) => Ok(()),
            other => Err(SignerError::UnexpectedReply(format!("{:?}", other))),
        }
    }

    pub async fn read_report(&self) -> Result<Vec<u8>> {
        let request = UsbPayload::Read {
            target: self.target.clone(),
        };
        match self.fetch(kind::READ, request).await? {
            UsbPayload::Data(data) => Ok(data),
            other => Err(SignerError::UnexpectedReply(format!("{:?}", other))),
        }
    }

    /// Read one report the device only sends once the user acts on it
    ///
    /// Device-side read timeouts are retried until `limit` has passed, so
    /// every single read stays within the per-report fetch limits.
    pub async fn await_report(&self, limit: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + limit;
        loop {
            match self.read_report().await {
                Err(SignerError::Bus(common::Error::Remote { ref message, .. }))
                    if message == READ_TIMED_OUT && Instant::now() < deadline =>
                {
                    debug!("Device has not answered yet");
                }
                other => return other,
            }
        }
    }
}

/// Client side of the `ui` topic
#[derive(Clone)]
pub struct Prompter {
    bus: Bus,
    timeout: Duration,
}

impl Prompter {
    pub fn new(bus: Bus, timeout: Duration) -> Self {
        Self { bus, timeout }
    }

    /// Ask the UI and wait for its answer
    pub async fn ask(&self, kind: &str, request: UiPayload) -> Result<UiPayload> {
        let reply = self
            .bus
            .fetch(
                Topic::Ui,
                kind,
                Payload::Ui(request),
                self.timeout,
                self.timeout,
            )
            .await?;
        ui_answer(reply)
    }

    /// Show a notice without waiting for it to close
    ///
    /// Returns the id to hand to [`Prompter::remove_hail`].
    pub fn hail(&self, text: &str) -> Result<MessageId> {
        Ok(self.bus.send(
            Topic::Ui,
            kind::HAIL,
            Payload::Ui(UiPayload::Hail {
                text: text.to_string(),
                cancellable: false,
            }),
        )?)
    }

    /// Show a notice the user may cancel
    ///
    /// Returns the hail's id and its answer: `Cancelled` when the user backs
    /// out, `Dismissed` once [`Prompter::remove_hail`] closes it. The answer
    /// is collected whenever the returned future is first polled.
    pub fn cancellable_hail(
        &self,
        text: &str,
    ) -> Result<(
        MessageId,
        impl Future<Output = Result<UiPayload>> + Send + 'static,
    )> {
        let pending = self.bus.start_fetch(
            Topic::Ui,
            kind::HAIL,
            Payload::Ui(UiPayload::Hail {
                text: text.to_string(),
                cancellable: true,
            }),
            self.timeout,
            self.timeout,
        )?;
        let hail = pending.id();
        Ok((hail, async move { ui_answer(pending.response().await?) }))
    }

    pub fn remove_hail(&self, hail: MessageId) {
        let sent = self.bus.send(
            Topic::Ui,
            kind::REMOVE_HAIL,
            Payload::Ui(UiPayload::RemoveHail { hail }),
        );
        if let Err(e) = sent {
            debug!("Could not remove hail {}: {}", hail, e);
        }
    }
}

fn ui_answer(reply: Message) -> Result<UiPayload> {
    match reply.into_result()?.payload {
        Payload::Ui(payload) => Ok(payload),
        other => Err(SignerError::UnexpectedReply(format!("{:?}", other))),
    }
}

#[derive(Debug, Clone)]
pub struct SignerOptions {
    pub timeouts: Timeouts,
    /// Re-poll cadence while a Ledger is locked or in the wrong app
    pub ledger_poll_interval: Duration,
    /// Reject an empty answer to a passphrase request
    pub require_passphrase: bool,
}

impl Default for SignerOptions {
    fn default() -> Self {
        Self {
            timeouts: Timeouts::default(),
            ledger_poll_interval: Duration::from_secs(1),
            require_passphrase: true,
        }
    }
}

/// Serves the `signer` topic
pub struct SignerService {
    bus: Bus,
    options: SignerOptions,
    /// One conversation per device at a time
    devices: Mutex<HashMap<DeviceId, Arc<tokio::sync::Mutex<()>>>>,
}

impl SignerService {
    pub fn spawn(bus: &Bus, options: SignerOptions) -> JoinHandle<()> {
        let subscription = bus.subscribe(&[Topic::Signer]);
        let service = Arc::new(Self {
            bus: bus.clone(),
            options,
            devices: Mutex::new(HashMap::new()),
        });

        tokio::spawn(async move {
            info!("Signer service started");
            while let Ok(message) = subscription.recv().await {
                if message.is_response() {
                    continue;
                }
                let service = Arc::clone(&service);
                tokio::spawn(async move { service.handle(message).await });
            }
            info!("Signer service stopped");
        })
    }

    fn device_lock(&self, device: DeviceId) -> Arc<tokio::sync::Mutex<()>> {
        let mut devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(devices.entry(device).or_default())
    }

    fn link(&self, device: DeviceId) -> UsbLink {
        UsbLink::new(
            self.bus.clone(),
            IoTarget::Device {
                id: device,
                debug: false,
            },
            self.options.timeouts,
        )
    }

    fn prompter(&self) -> Prompter {
        Prompter::new(self.bus.clone(), self.options.timeouts.interactive)
    }

    async fn handle(&self, message: Message) {
        let result = match &message.payload {
            Payload::Signer(SignerPayload::TrezorCall {
                device,
                message_type,
                payload,
            }) => {
                let lock = self.device_lock(*device);
                let _held = lock.lock().await;
                let trezor = trezor::Trezor::new(
                    self.link(*device),
                    self.prompter(),
                    self.options.require_passphrase,
                );
                trezor
                    .call(*message_type, payload)
                    .await
                    .map(|reply| SignerPayload::TrezorReply {
                        message_type: reply.message_type,
                        payload: reply.payload,
                    })
            }
            Payload::Signer(SignerPayload::LedgerExchange { device, apdu }) => {
                let lock = self.device_lock(*device);
                let _held = lock.lock().await;
                let ledger = ledger::Ledger::new(
                    self.link(*device),
                    self.prompter(),
                    self.options.ledger_poll_interval,
                );
                ledger
                    .exchange_interactive(apdu)
                    .await
                    .map(|data| SignerPayload::LedgerReply { data })
            }
            _ => Err(SignerError::UnexpectedReply(format!(
                "{} is not a signer request",
                message.kind
            ))),
        };

        let (payload, error) = match result {
            Ok(reply) => (Payload::Signer(reply), None),
            Err(e) => {
                debug!(id = %message.id, kind = %message.kind, "Signer request failed: {}", e);
                (Payload::Empty, Some(e.to_string()))
            }
        };
        if let Err(e) = self.bus.respond(&message, payload, error) {
            warn!("Dropping signer response to {}: {}", message.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classes() {
        assert!(SignerError::Status(StatusWord(0x6982)).is_locked());
        assert!(SignerError::Status(StatusWord(0x5515)).is_locked());
        assert!(SignerError::Status(StatusWord(0x6e00)).is_wrong_app());
        assert!(SignerError::Status(StatusWord(0x6511)).is_wrong_app());

        let rejected = SignerError::Status(StatusWord(0x6985));
        assert!(!rejected.is_locked());
        assert!(!rejected.is_wrong_app());
        assert!(!SignerError::Cancelled.is_locked());
    }

    #[test]
    fn test_status_message() {
        let msg = SignerError::Status(StatusWord(0x6985)).to_string();
        assert!(msg.contains("0x6985"));
        assert!(msg.contains("rejected"));
    }
}
