//! Shared fixtures for the daemon integration tests
//!
//! Device emulators plug into [`MockTransport`] as responders: they reassemble
//! the written reports with the real framing code and answer whole messages.

#![allow(dead_code)]

use common::{Bus, BusConfig, Message, Payload, Topic, UiPayload};
use daemon::signer::{SignerOptions, SignerService, Timeouts};
use daemon::usb::mock::MockTransport;
use daemon::usb::{CoreOptions, SessionCore, UsbService};
use protocol::ledger;
use protocol::trezor::{self, Decoded};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TREZOR_VID: u16 = 0x1209;
pub const TREZOR_PID: u16 = 0x53c1;
pub const LEDGER_VID: u16 = 0x2c97;
pub const LEDGER_PID: u16 = 0x4011;

/// Options tuned for fast tests
pub fn fast_options() -> CoreOptions {
    CoreOptions {
        listen_interval: Duration::from_millis(10),
        listen_iterations: 20,
        ..CoreOptions::default()
    }
}

pub fn core_with(transport: &MockTransport, options: CoreOptions) -> Arc<SessionCore> {
    Arc::new(SessionCore::new(Box::new(transport.clone()), options))
}

/// One Trezor message as the reports a device would send
pub fn trezor_reports(message_type: u16, payload: &[u8]) -> Vec<Vec<u8>> {
    trezor::encode(message_type, payload)
        .expect("reply fits")
        .iter()
        .map(|r| r.to_vec())
        .collect()
}

/// Responder speaking the Trezor framing; `handler` maps a request to a reply
pub fn trezor_device<F>(mut handler: F) -> impl FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static
where
    F: FnMut(Decoded) -> (u16, Vec<u8>) + Send + 'static,
{
    let mut decoder = trezor::Decoder::new();
    move |report: &[u8]| match decoder.push(report) {
        Ok(Some(request)) => {
            let (message_type, payload) = handler(request);
            trezor_reports(message_type, &payload)
        }
        Ok(None) => Vec::new(),
        Err(e) => panic!("emulator got a bad report: {}", e),
    }
}

/// Responder speaking the Ledger framing; `handler` returns data and status word
pub fn ledger_device<F>(mut handler: F) -> impl FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static
where
    F: FnMut(Vec<u8>) -> (Vec<u8>, u16) + Send + 'static,
{
    let mut decoder = ledger::Decoder::new();
    move |report: &[u8]| match decoder.push(report) {
        Ok(Some(command)) => {
            let (mut data, status) = handler(command);
            data.extend_from_slice(&status.to_be_bytes());
            ledger::encode(&data)
                .expect("reply fits")
                .iter()
                .map(|r| r.to_vec())
                .collect()
        }
        Ok(None) => Vec::new(),
        Err(e) => panic!("emulator got a bad report: {}", e),
    }
}

/// A bus with the USB and signer services running over `transport`
pub struct Stack {
    pub bus: Bus,
    pub core: Arc<SessionCore>,
    /// Kinds of every `ui` request seen, in order
    pub ui_seen: Arc<Mutex<Vec<String>>>,
}

pub fn signer_options() -> SignerOptions {
    SignerOptions {
        timeouts: Timeouts {
            soft: Duration::from_secs(5),
            hard: Duration::from_secs(10),
            interactive: Duration::from_secs(5),
        },
        ledger_poll_interval: Duration::from_millis(20),
        require_passphrase: true,
    }
}

/// Start the stack; `ui` scripts the answers to `ui` requests
pub fn start_stack<F>(transport: &MockTransport, ui: F) -> Stack
where
    F: FnMut(&UiPayload) -> Option<UiPayload> + Send + 'static,
{
    start_stack_with(transport, BusConfig::default(), signer_options(), ui)
}

/// [`start_stack`] with explicit bus settings and signer options
pub fn start_stack_with<F>(
    transport: &MockTransport,
    config: BusConfig,
    options: SignerOptions,
    mut ui: F,
) -> Stack
where
    F: FnMut(&UiPayload) -> Option<UiPayload> + Send + 'static,
{
    let bus = Bus::with_config(config);
    let core = core_with(transport, fast_options());
    UsbService::spawn(&bus, Arc::clone(&core));
    SignerService::spawn(&bus, options);

    let ui_seen = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&ui_seen);
    common::test_utils::spawn_responder(&bus, Topic::Ui, move |message: &Message| {
        seen.lock().unwrap().push(message.kind.clone());
        match &message.payload {
            Payload::Ui(request) => ui(request).map(|answer| (Payload::Ui(answer), None)),
            _ => None,
        }
    });

    Stack { bus, core, ui_seen }
}
