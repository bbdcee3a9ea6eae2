//! `usb` topic service tests
//!
//! Drive the [`UsbService`] through the bus the way other services do and
//! check the payloads and error strings that come back.
//!
//! Run with: `cargo test -p daemon --test usb_service_tests`

mod support;

use common::message::kind;
use common::test_utils::{
    DEFAULT_TEST_TIMEOUT, TEST_HARD_LIMIT, TEST_SOFT_LIMIT, create_mock_entry_list, with_timeout,
};
use common::usb_types::{DeviceId, IoTarget, SessionId, UsbPayload};
use common::{Bus, Message, Payload, Topic};
use daemon::usb::mock::MockTransport;
use daemon::usb::{CoreOptions, UsbService};
use std::sync::Arc;
use support::{TREZOR_PID, TREZOR_VID, core_with, fast_options};

fn start(transport: &MockTransport, options: CoreOptions) -> Bus {
    let bus = Bus::new();
    UsbService::spawn(&bus, core_with(transport, options));
    bus
}

async fn request(bus: &Bus, kind: &str, payload: UsbPayload) -> Message {
    bus.fetch(
        Topic::Usb,
        kind,
        Payload::Usb(payload),
        TEST_SOFT_LIMIT,
        TEST_HARD_LIMIT,
    )
    .await
    .unwrap()
}

async fn acquire(bus: &Bus, device: &str, previous: Option<&str>) -> Message {
    request(
        bus,
        kind::ACQUIRE,
        UsbPayload::Acquire {
            device: device.to_string(),
            previous: previous.map(SessionId::from),
            debug: false,
        },
    )
    .await
}

#[tokio::test]
async fn test_enumerate() {
    let transport = MockTransport::new();
    transport.add_device("1-1", TREZOR_VID, TREZOR_PID, false);
    transport.add_device("1-2", TREZOR_VID, TREZOR_PID, true);
    let bus = start(&transport, fast_options());

    let reply = request(&bus, kind::ENUMERATE, UsbPayload::Enumerate).await;
    assert_eq!(reply.kind, "enumerate_response");
    assert!(reply.error.is_none());

    let Payload::Usb(UsbPayload::Entries(entries)) = reply.payload else {
        panic!("Expected entries, got {:?}", reply.payload);
    };
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].id, DeviceId(1));
    assert!(entries[1].debug);
}

#[tokio::test]
async fn test_acquire_release_round() {
    let transport = MockTransport::new();
    transport.add_device("1-1", TREZOR_VID, TREZOR_PID, false);
    let bus = start(&transport, fast_options());

    let reply = acquire(&bus, "1", None).await;
    assert_eq!(
        reply.payload,
        Payload::Usb(UsbPayload::Session(SessionId::from("1")))
    );

    let reply = acquire(&bus, "1", None).await;
    assert_eq!(reply.payload, Payload::Empty);
    assert!(reply.error.unwrap().contains("other call in progress"));

    let reply = request(
        &bus,
        kind::RELEASE,
        UsbPayload::Release {
            session: SessionId::from("1"),
            debug: false,
        },
    )
    .await;
    assert!(reply.error.is_none());
    assert_eq!(reply.payload, Payload::Empty);

    let reply = acquire(&bus, "1", None).await;
    assert_eq!(
        reply.payload,
        Payload::Usb(UsbPayload::Session(SessionId::from("2")))
    );
}

#[tokio::test]
async fn test_errors_become_strings() {
    let transport = MockTransport::new();
    transport.add_device("1-1", TREZOR_VID, TREZOR_PID, false);
    let bus = start(&transport, fast_options());

    let reply = acquire(&bus, "x", None).await;
    assert!(reply.error.unwrap().contains("malformed"));

    let reply = acquire(&bus, "8", None).await;
    assert!(reply.error.unwrap().contains("not found"));

    let reply = acquire(&bus, "1", Some("3")).await;
    assert!(reply.error.unwrap().contains("wrong previous session"));

    // The failed result surfaces through `into_result` too
    let reply = acquire(&bus, "8", None).await;
    assert!(reply.into_result().is_err());
}

#[tokio::test]
async fn test_reply_payload_rejected() {
    let transport = MockTransport::new();
    let bus = start(&transport, fast_options());

    let reply = request(&bus, kind::READ, UsbPayload::Data(vec![1])).await;
    assert!(reply.error.unwrap().contains("reply payload"));

    let reply = bus
        .fetch(
            Topic::Usb,
            kind::ENUMERATE,
            Payload::Text("enumerate".into()),
            TEST_SOFT_LIMIT,
            TEST_HARD_LIMIT,
        )
        .await
        .unwrap();
    assert!(reply.error.unwrap().contains("usb payload"));
}

#[tokio::test]
async fn test_write_and_read() {
    let transport = MockTransport::new();
    transport.add_device("1-1", TREZOR_VID, TREZOR_PID, false);
    transport.set_responder("1-1", |report| vec![report.to_vec()]);
    let bus = start(&transport, fast_options());

    let target = IoTarget::Device {
        id: DeviceId(1),
        debug: false,
    };
    let reply = request(
        &bus,
        kind::WRITE,
        UsbPayload::Write {
            target: target.clone(),
            data: b"hello".to_vec(),
        },
    )
    .await;
    assert_eq!(reply.payload, Payload::Usb(UsbPayload::Written(5)));

    let reply = request(&bus, kind::READ, UsbPayload::Read { target }).await;
    assert_eq!(
        reply.payload,
        Payload::Usb(UsbPayload::Data(b"hello".to_vec()))
    );
}

#[tokio::test]
async fn test_listen_cancel() {
    let transport = MockTransport::new();
    transport.add_device("1-1", TREZOR_VID, TREZOR_PID, false);
    let core = core_with(
        &transport,
        CoreOptions {
            listen_iterations: 10_000,
            ..fast_options()
        },
    );
    let bus = Bus::new();
    UsbService::spawn(&bus, Arc::clone(&core));
    let known = core.enumerate().unwrap();

    let responses = bus.subscribe(&[Topic::Usb]);
    let listen_id = bus
        .send(Topic::Usb, kind::LISTEN, Payload::Usb(UsbPayload::Listen { known }))
        .unwrap();

    // Sent straight after the listen, before its task has had a chance to run
    let reply = request(
        &bus,
        kind::LISTEN_CANCEL,
        UsbPayload::CancelListen { request: listen_id },
    )
    .await;
    assert!(reply.error.is_none());

    let listen_reply = with_timeout(DEFAULT_TEST_TIMEOUT, async {
        loop {
            let message = responses.recv().await.unwrap();
            if message.respond_to == listen_id {
                return message;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(listen_reply.kind, "listen_response");
    assert!(listen_reply.error.unwrap().contains("cancelled"));
}

#[tokio::test]
async fn test_listen_sees_new_device() {
    let transport = MockTransport::new();
    transport.add_device("1-1", TREZOR_VID, TREZOR_PID, false);
    let core = core_with(
        &transport,
        CoreOptions {
            listen_iterations: 500,
            ..fast_options()
        },
    );
    let bus = Bus::new();
    UsbService::spawn(&bus, Arc::clone(&core));
    let known = core.enumerate().unwrap();

    let plug = transport.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        plug.add_device("1-2", TREZOR_VID, TREZOR_PID, false);
    });

    let reply = request(&bus, kind::LISTEN, UsbPayload::Listen { known }).await;
    let Payload::Usb(UsbPayload::Entries(entries)) = reply.payload else {
        panic!("Expected entries, got {:?}", reply.payload);
    };
    assert_eq!(entries.len(), 2);
}

#[tokio::test]
async fn test_listen_with_stale_view_returns_at_once() {
    let transport = MockTransport::new();
    transport.add_device("1-1", TREZOR_VID, TREZOR_PID, false);
    let bus = start(
        &transport,
        CoreOptions {
            listen_iterations: 10_000,
            ..fast_options()
        },
    );

    let known = create_mock_entry_list(3);
    let reply = with_timeout(
        DEFAULT_TEST_TIMEOUT,
        request(&bus, kind::LISTEN, UsbPayload::Listen { known }),
    )
    .await
    .unwrap();
    let Payload::Usb(UsbPayload::Entries(entries)) = reply.payload else {
        panic!("Expected entries, got {:?}", reply.payload);
    };
    assert_eq!(entries.len(), 1);
    assert_eq!(transport.enumerations(), 1);
}

#[tokio::test]
async fn test_cancel_unknown_listen_is_harmless() {
    let transport = MockTransport::new();
    let bus = start(&transport, fast_options());

    let reply = request(
        &bus,
        kind::LISTEN_CANCEL,
        UsbPayload::CancelListen {
            request: common::MessageId(12345),
        },
    )
    .await;
    assert!(reply.error.is_none());
}
