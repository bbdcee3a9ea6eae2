//! Timer Service Integration Tests
//!
//! All tests run on paused Tokio time, so sleeps complete instantly and
//! elapsed times are exact.
//!
//! Run with: `cargo test -p common --test timer_tests`

use common::message::kind;
use common::test_utils::{DEFAULT_TEST_TIMEOUT, with_timeout};
use common::timer::{self, TimerRemaining};
use common::{Bus, Error, Message, Payload, Subscription, TimerId, TimerPayload, Topic};
use std::time::Duration;
use tokio::time::{Instant, sleep};

const SECOND: Duration = Duration::from_secs(1);

async fn next_done(events: &Subscription) -> TimerId {
    loop {
        let message = events.recv().await.unwrap();
        if let Payload::Timer(TimerPayload::Done(id)) = message.payload {
            return id;
        }
    }
}

async fn response_to(events: &Subscription, request: common::MessageId) -> Message {
    loop {
        let message = events.recv().await.unwrap();
        if message.respond_to == request {
            return message;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_done_within_limit_then_removed() {
    let bus = Bus::new();
    let events = bus.subscribe(&[Topic::Timer]);
    let id = TimerId::new("quote-refresh");

    let started = Instant::now();
    bus.timers()
        .init(id.clone(), 5 * SECOND, 10 * SECOND, true);

    assert_eq!(next_done(&events).await, id);
    let elapsed = started.elapsed();
    assert!(elapsed >= 5 * SECOND);
    assert!(elapsed < 6 * SECOND);
    assert!(!bus.timers().contains(&id));
}

#[tokio::test(start_paused = true)]
async fn test_limit_above_hard_limit_expires_at_hard_limit() {
    let bus = Bus::new();
    let events = bus.subscribe(&[Topic::Timer]);
    let id = TimerId::new("misconfigured");

    let started = Instant::now();
    bus.timers().init(id.clone(), 30 * SECOND, 3 * SECOND, true);

    assert_eq!(next_done(&events).await, id);
    assert_eq!(started.elapsed(), 3 * SECOND);
}

#[tokio::test(start_paused = true)]
async fn test_pause_then_start_preserves_lapsed() {
    let bus = Bus::new();
    let timers = bus.timers();
    let id = TimerId::new("pausable");

    timers.init(id.clone(), 10 * SECOND, 20 * SECOND, true);
    sleep(3 * SECOND).await;
    timers.pause(&id).unwrap();

    sleep(100 * SECOND).await;
    assert_eq!(timers.remaining(&id).unwrap(), 7 * SECOND);

    timers.start(&id).unwrap();
    sleep(2 * SECOND).await;
    assert_eq!(timers.remaining(&id).unwrap(), 5 * SECOND);
}

#[tokio::test(start_paused = true)]
async fn test_start_running_timer_is_noop() {
    let bus = Bus::new();
    let timers = bus.timers();
    let id = TimerId::new("running");

    timers.init(id.clone(), 10 * SECOND, 10 * SECOND, true);
    sleep(4 * SECOND).await;
    timers.start(&id).unwrap();

    assert_eq!(timers.remaining(&id).unwrap(), 6 * SECOND);
}

#[tokio::test(start_paused = true)]
async fn test_reset_shrinks_hard_budget() {
    let bus = Bus::new();
    let events = bus.subscribe(&[Topic::Timer]);
    let timers = bus.timers();
    let id = TimerId::new("resettable");

    timers.init(id.clone(), 5 * SECOND, 8 * SECOND, true);
    sleep(3 * SECOND).await;
    timers.reset(&id).unwrap();
    // 8 - 3 seconds of hard budget left, limit still 5
    assert_eq!(timers.remaining(&id).unwrap(), 5 * SECOND);

    sleep(4 * SECOND).await;
    timers.reset(&id).unwrap();
    // Only 1 second of hard budget remains
    assert_eq!(timers.remaining(&id).unwrap(), SECOND);

    let started = Instant::now();
    assert_eq!(next_done(&events).await, id);
    assert_eq!(started.elapsed(), SECOND);
    assert!(matches!(timers.reset(&id), Err(Error::TimerNotFound(_))));
}

#[tokio::test(start_paused = true)]
async fn test_reset_past_hard_limit_fails_without_mutation() {
    let bus = Bus::new();
    let timers = bus.timers();
    let id = TimerId::new("spent");

    timers.init(id.clone(), Duration::ZERO, Duration::ZERO, false);
    let result = timers.reset(&id);
    let Err(Error::HardLimitExceeded { hard_limit, .. }) = result else {
        panic!("Expected HardLimitExceeded, got {:?}", result);
    };
    assert_eq!(hard_limit, Duration::ZERO);

    assert!(timers.contains(&id));
    let snapshot = timers.snapshot();
    assert_eq!(
        snapshot,
        vec![TimerRemaining {
            id,
            remaining_secs: 0,
            running: false
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn test_trigger_and_delete() {
    let bus = Bus::new();
    let events = bus.subscribe(&[Topic::Timer]);
    let timers = bus.timers();

    let triggered = TimerId::new("triggered");
    let deleted = TimerId::new("deleted");
    timers.init(triggered.clone(), 60 * SECOND, 60 * SECOND, false);
    timers.init(deleted.clone(), 2 * SECOND, 60 * SECOND, true);

    timers.trigger(&triggered).unwrap();
    assert_eq!(next_done(&events).await, triggered);

    timers.delete(&deleted).unwrap();
    sleep(5 * SECOND).await;
    while let Some(message) = events.try_recv() {
        assert!(!matches!(
            message.payload,
            Payload::Timer(TimerPayload::Done(_))
        ));
    }

    assert!(matches!(
        timers.trigger(&triggered),
        Err(Error::TimerNotFound(_))
    ));
    assert!(matches!(
        timers.delete(&deleted),
        Err(Error::TimerNotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_tick_reports_running_timers() {
    let bus = Bus::new();
    let events = bus.subscribe(&[Topic::Timer]);
    let timers = bus.timers();

    timers.init(TimerId::new("a"), 10 * SECOND, 10 * SECOND, true);
    timers.init(TimerId::new("b"), 10 * SECOND, 10 * SECOND, false);

    let rows = loop {
        let message = events.recv().await.unwrap();
        if let Payload::Timer(TimerPayload::Tick(rows)) = message.payload {
            assert_eq!(message.kind, kind::TICK);
            break rows;
        }
    };

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, TimerId::new("a"));
    assert!(rows[0].running);
    assert!(rows[0].remaining_secs <= 10);
}

#[tokio::test(start_paused = true)]
async fn test_server_answers_requests() {
    let bus = Bus::new();
    let _server = timer::spawn_server(&bus);
    let events = bus.subscribe(&[Topic::Timer]);
    let id = TimerId::new("remote");

    let init = bus
        .send(
            Topic::Timer,
            kind::INIT,
            Payload::Timer(TimerPayload::Init {
                id: id.clone(),
                limit: 5 * SECOND,
                hard_limit: 5 * SECOND,
                start: false,
            }),
        )
        .unwrap();
    let response = with_timeout(DEFAULT_TEST_TIMEOUT, response_to(&events, init))
        .await
        .unwrap();
    assert_eq!(response.kind, "init_response");
    assert!(response.error.is_none());
    assert!(bus.timers().contains(&id));

    let start = bus
        .send(
            Topic::Timer,
            kind::START,
            Payload::Timer(TimerPayload::Start(TimerId::new("missing"))),
        )
        .unwrap();
    let response = with_timeout(DEFAULT_TEST_TIMEOUT, response_to(&events, start))
        .await
        .unwrap();
    assert!(response.error.unwrap().contains("missing"));

    let bogus = bus
        .send(Topic::Timer, kind::START, Payload::Text("now".into()))
        .unwrap();
    let response = with_timeout(DEFAULT_TEST_TIMEOUT, response_to(&events, bogus))
        .await
        .unwrap();
    assert!(response.error.is_some());
}
