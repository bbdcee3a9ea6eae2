//! Message Bus Integration Tests
//!
//! # Test Scenarios
//! - Publish / subscribe delivery and ordering
//! - Unsubscribe and shutdown behaviour
//! - Fetch correlation, timeouts and cleanup
//! - Backpressure from a stalled subscriber
//!
//! Run with: `cargo test -p common --test bus_tests`

use common::test_utils::{
    DEFAULT_TEST_TIMEOUT, TEST_HARD_LIMIT, TEST_SOFT_LIMIT, spawn_responder, with_timeout,
};
use common::{Bus, BusConfig, Error, Message, MessageId, Payload, Topic};
use std::time::Duration;
use tokio::time::Instant;

// ============================================================================
// Publish / Subscribe
// ============================================================================

#[tokio::test]
async fn test_send_reaches_topic_subscribers_only() {
    let bus = Bus::new();
    let gui = bus.subscribe(&[Topic::Gui]);
    let price = bus.subscribe(&[Topic::Price]);

    let id = bus
        .send(Topic::Gui, "refresh", Payload::Text("wallet".into()))
        .unwrap();

    let message = with_timeout(DEFAULT_TEST_TIMEOUT, gui.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.id, id);
    assert_eq!(message.kind, "refresh");
    assert!(!message.is_response());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(price.try_recv().is_none());
}

#[tokio::test]
async fn test_one_channel_many_topics() {
    let bus = Bus::new();
    let both = bus.subscribe(&[Topic::Gui, Topic::Defi, Topic::Gui]);

    bus.send(Topic::Gui, "a", Payload::Empty).unwrap();
    bus.send(Topic::Defi, "b", Payload::Empty).unwrap();

    let first = with_timeout(DEFAULT_TEST_TIMEOUT, both.recv()).await.unwrap().unwrap();
    let second = with_timeout(DEFAULT_TEST_TIMEOUT, both.recv()).await.unwrap().unwrap();
    assert_eq!(first.kind, "a");
    assert_eq!(second.kind, "b");

    // Duplicate topic in one call registers once
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(both.try_recv().is_none());
}

#[tokio::test]
async fn test_delivery_preserves_publish_order() {
    let bus = Bus::new();
    let subscription = bus.subscribe(&[Topic::Wallet]);

    let sent: Vec<MessageId> = (0..20)
        .map(|i| {
            bus.send(Topic::Wallet, &format!("update-{}", i), Payload::Empty)
                .unwrap()
        })
        .collect();

    for expected in sent {
        let message = with_timeout(DEFAULT_TEST_TIMEOUT, subscription.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.id, expected);
    }
}

#[tokio::test]
async fn test_unsubscribe_is_idempotent() {
    let bus = Bus::new();
    let subscription = bus.subscribe(&[Topic::Gui]);

    bus.unsubscribe(&subscription);
    bus.unsubscribe(&subscription);
    assert!(subscription.is_closed());
    assert!(subscription.recv().await.is_err());

    // Publishing to a topic nobody listens on is fine
    bus.send(Topic::Gui, "refresh", Payload::Empty).unwrap();
}

#[tokio::test]
async fn test_dropped_subscription_does_not_block_dispatch() {
    let bus = Bus::with_config(BusConfig {
        channel_capacity: 1,
    });
    let dropped = bus.subscribe(&[Topic::Price]);
    let live = bus.subscribe(&[Topic::Price]);
    drop(dropped);

    for i in 0..5 {
        bus.send(Topic::Price, &format!("quote-{}", i), Payload::Empty)
            .unwrap();
        let message = with_timeout(DEFAULT_TEST_TIMEOUT, live.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.kind, format!("quote-{}", i));
    }
}

#[tokio::test]
async fn test_stalled_subscriber_stalls_everyone() {
    let bus = Bus::with_config(BusConfig {
        channel_capacity: 1,
    });
    let stalled = bus.subscribe(&[Topic::Price]);
    let live = bus.subscribe(&[Topic::Price]);

    for i in 0..3 {
        bus.send(Topic::Price, &format!("quote-{}", i), Payload::Empty)
            .unwrap();
    }

    let first = with_timeout(DEFAULT_TEST_TIMEOUT, live.recv()).await.unwrap().unwrap();
    assert_eq!(first.kind, "quote-0");

    // The dispatcher is blocked on the full stalled channel
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(live.try_recv().is_none());

    stalled.recv().await.unwrap();
    let second = with_timeout(DEFAULT_TEST_TIMEOUT, live.recv()).await.unwrap().unwrap();
    assert_eq!(second.kind, "quote-1");
}

#[tokio::test]
async fn test_shutdown_closes_subscriptions() {
    let bus = Bus::new();
    let subscription = bus.subscribe(&[Topic::Wallet]);

    bus.send(Topic::Wallet, "last", Payload::Empty).unwrap();
    bus.shutdown();
    assert!(bus.is_shut_down());

    // Queued messages are still delivered before the channel closes
    let last = with_timeout(DEFAULT_TEST_TIMEOUT, subscription.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(last.kind, "last");
    let closed = with_timeout(DEFAULT_TEST_TIMEOUT, subscription.recv())
        .await
        .unwrap();
    assert!(matches!(closed, Err(Error::Channel(_))));

    assert!(matches!(
        bus.send(Topic::Wallet, "late", Payload::Empty),
        Err(Error::Channel(_))
    ));
}

#[tokio::test]
async fn test_dropping_last_handle_stops_dispatch() {
    let bus = Bus::new();
    let subscription = bus.subscribe(&[Topic::Wallet]);
    let second = bus.clone();

    drop(bus);
    second.send(Topic::Wallet, "still open", Payload::Empty).unwrap();
    let delivered = with_timeout(DEFAULT_TEST_TIMEOUT, subscription.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivered.kind, "still open");

    // No shutdown call: dropping the last clone ends the dispatcher
    drop(second);
    let closed = with_timeout(DEFAULT_TEST_TIMEOUT, subscription.recv())
        .await
        .unwrap();
    assert!(matches!(closed, Err(Error::Channel(_))));
}

// ============================================================================
// Respond / Fetch
// ============================================================================

#[tokio::test]
async fn test_respond_sets_correlation() {
    let bus = Bus::new();
    let subscription = bus.subscribe(&[Topic::Defi]);

    let request_id = bus.send(Topic::Defi, "quote", Payload::Empty).unwrap();
    let request = subscription.recv().await.unwrap();

    bus.respond(&request, Payload::Text("ok".into()), Some("slippage".into()))
        .unwrap();
    let response = subscription.recv().await.unwrap();

    assert_eq!(response.respond_to, request_id);
    assert_eq!(response.kind, "quote_response");
    assert_eq!(response.topic, Topic::Defi);
    assert_eq!(response.error.as_deref(), Some("slippage"));
    assert!(response.is_response());
}

#[tokio::test]
async fn test_fetch_returns_correlated_response() {
    let bus = Bus::new();
    let _responder = spawn_responder(&bus, Topic::Price, |request| {
        Some((Payload::Text(format!("{}-answer", request.kind)), None))
    });

    let reply = bus
        .fetch(
            Topic::Price,
            "quote",
            Payload::Empty,
            TEST_SOFT_LIMIT,
            TEST_HARD_LIMIT,
        )
        .await
        .unwrap();

    assert_eq!(reply.kind, "quote_response");
    assert_eq!(reply.payload, Payload::Text("quote-answer".into()));
    assert!(reply.error.is_none());

    // The paired timer is gone
    assert!(bus.timers().snapshot().is_empty());
}

#[tokio::test]
async fn test_fetch_error_becomes_remote() {
    let bus = Bus::new();
    let _responder = spawn_responder(&bus, Topic::Wallet, |_| {
        Some((Payload::Empty, Some("wallet locked".into())))
    });

    let reply = bus
        .fetch(
            Topic::Wallet,
            "balance",
            Payload::Empty,
            TEST_SOFT_LIMIT,
            TEST_HARD_LIMIT,
        )
        .await
        .unwrap();

    let result = reply.into_result();
    let Err(Error::Remote { message, kind, .. }) = result else {
        panic!("Expected Remote error, got {:?}", result);
    };
    assert_eq!(message, "wallet locked");
    assert_eq!(kind, "balance_response");
}

#[tokio::test]
async fn test_fetch_timer_topic_is_reserved() {
    let bus = Bus::new();
    let result = bus
        .fetch(
            Topic::Timer,
            "init",
            Payload::Empty,
            TEST_SOFT_LIMIT,
            TEST_HARD_LIMIT,
        )
        .await;
    assert!(matches!(result, Err(Error::ReservedTopic(Topic::Timer))));
}

#[tokio::test(start_paused = true)]
async fn test_fetch_times_out_despite_unrelated_traffic() {
    let bus = Bus::new();

    // Unrelated requests and responses keep flowing on the same topic
    let noise_bus = bus.clone();
    let noise = tokio::spawn(async move {
        let fake = Message {
            id: MessageId(999_999),
            topic: Topic::Signer,
            kind: "other".to_string(),
            payload: Payload::Empty,
            timer_id: None,
            respond_to: MessageId::NONE,
            error: None,
        };
        loop {
            if noise_bus.send(Topic::Signer, "noise", Payload::Empty).is_err() {
                break;
            }
            let _ = noise_bus.respond(&fake, Payload::Empty, None);
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    });

    let started = Instant::now();
    let result = bus
        .fetch(
            Topic::Signer,
            "sign",
            Payload::Empty,
            Duration::from_secs(2),
            Duration::from_secs(10),
        )
        .await;
    let elapsed = started.elapsed();

    let Err(Error::Timeout { topic, kind, after }) = result else {
        panic!("Expected Timeout error, got {:?}", result);
    };
    assert_eq!(topic, Topic::Signer);
    assert_eq!(kind, "sign");
    assert_eq!(after, Duration::from_secs(2));
    assert!(elapsed >= Duration::from_secs(2));
    assert!(elapsed < Duration::from_secs(3));

    noise.abort();
}

#[tokio::test]
async fn test_concurrent_fetches_resolve_out_of_order() {
    let bus = Bus::new();
    let requests = bus.subscribe(&[Topic::Signer]);

    // Answer both requests, newest first
    let responder_bus = bus.clone();
    let responder = tokio::spawn(async move {
        let mut pending = Vec::new();
        while pending.len() < 2 {
            let message = requests.recv().await.unwrap();
            if !message.is_response() {
                pending.push(message);
            }
        }
        for request in pending.iter().rev() {
            responder_bus
                .respond(request, Payload::Text(request.kind.clone()), None)
                .unwrap();
        }
    });

    let (first, second) = tokio::join!(
        bus.fetch(
            Topic::Signer,
            "first",
            Payload::Empty,
            TEST_SOFT_LIMIT,
            TEST_HARD_LIMIT
        ),
        bus.fetch(
            Topic::Signer,
            "second",
            Payload::Empty,
            TEST_SOFT_LIMIT,
            TEST_HARD_LIMIT
        ),
    );

    assert_eq!(first.unwrap().payload, Payload::Text("first".into()));
    assert_eq!(second.unwrap().payload, Payload::Text("second".into()));
    responder.await.unwrap();
}

#[tokio::test]
async fn test_abandoned_fetch_cleans_up() {
    let bus = Bus::new();

    let result = with_timeout(
        Duration::from_millis(20),
        bus.fetch(
            Topic::Gui,
            "confirm",
            Payload::Empty,
            TEST_SOFT_LIMIT,
            TEST_HARD_LIMIT,
        ),
    )
    .await;
    assert!(result.is_err());

    assert!(bus.timers().snapshot().is_empty());
}

#[tokio::test]
async fn test_started_fetch_exposes_request_id() {
    let bus = Bus::new();
    let requests = bus.subscribe(&[Topic::Gui]);

    let pending = bus
        .start_fetch(
            Topic::Gui,
            "confirm",
            Payload::Empty,
            TEST_SOFT_LIMIT,
            TEST_HARD_LIMIT,
        )
        .unwrap();
    let request = with_timeout(DEFAULT_TEST_TIMEOUT, requests.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request.id, pending.id());

    // Answered before anyone awaits the response
    bus.respond(&request, Payload::Text("yes".into()), None)
        .unwrap();
    let reply = with_timeout(DEFAULT_TEST_TIMEOUT, pending.response())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.respond_to, request.id);
    assert!(bus.timers().snapshot().is_empty());
}

#[tokio::test]
async fn test_dropped_started_fetch_deletes_timer() {
    let bus = Bus::new();
    let pending = bus
        .start_fetch(
            Topic::Gui,
            "confirm",
            Payload::Empty,
            TEST_SOFT_LIMIT,
            TEST_HARD_LIMIT,
        )
        .unwrap();
    assert_eq!(bus.timers().snapshot().len(), 1);

    drop(pending);
    assert!(bus.timers().snapshot().is_empty());
}
