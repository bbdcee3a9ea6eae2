//! Managed countdown timers
//!
//! A timer counts down from `min(limit, hard_limit)` while running. Pausing
//! folds the elapsed time into `lapsed`; resetting zeroes `lapsed` and shrinks
//! the hard budget by what was consumed, so repeated resets can never extend a
//! timer past its original hard limit.
//!
//! A single scheduler task sleeps until the nearest deadline across all
//! entries and is woken on every mutation. When a timer expires the service
//! publishes `done` on the `timer` topic and removes the entry. A second task
//! publishes a `tick` snapshot of running timers once per second.

use crate::bus::{Bus, Publisher};
use crate::error::{Error, Result};
use crate::message::{Message, Payload, Topic, kind};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Interval between `tick` snapshots
pub const TICK_PERIOD: Duration = Duration::from_secs(1);

/// Timer name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub String);

impl TimerId {
    pub fn new(id: impl Into<String>) -> Self {
        TimerId(id.into())
    }

    /// Name of the timer paired with a fetch request
    pub(crate) fn for_fetch(request: crate::message::MessageId) -> Self {
        TimerId(format!("fetch-{}", request.0))
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One row of a snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerRemaining {
    pub id: TimerId,
    pub remaining_secs: u64,
    pub running: bool,
}

/// Payloads on the `timer` topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerPayload {
    Init {
        id: TimerId,
        limit: Duration,
        hard_limit: Duration,
        start: bool,
    },
    Start(TimerId),
    Pause(TimerId),
    Reset(TimerId),
    Trigger(TimerId),
    Delete(TimerId),

    /// Emitted when a timer expires or is triggered
    Done(TimerId),
    /// Emitted once per second while any timer runs
    Tick(Vec<TimerRemaining>),
}

#[derive(Debug)]
struct Timer {
    limit: Duration,
    hard_limit: Duration,
    lapsed: Duration,
    started_at: Option<Instant>,
}

impl Timer {
    fn budget(&self) -> Duration {
        self.limit.min(self.hard_limit)
    }

    fn is_running(&self) -> bool {
        self.started_at.is_some()
    }

    fn consumed(&self, now: Instant) -> Duration {
        let running = self
            .started_at
            .map(|started| now.saturating_duration_since(started))
            .unwrap_or_default();
        self.lapsed + running
    }

    fn remaining(&self, now: Instant) -> Duration {
        self.budget().saturating_sub(self.consumed(now))
    }

    fn deadline(&self) -> Option<Instant> {
        self.started_at
            .map(|started| started + self.budget().saturating_sub(self.lapsed))
    }
}

/// Timer table plus its scheduler
pub struct TimerService {
    table: Mutex<HashMap<TimerId, Timer>>,
    wake: Notify,
    stopped: AtomicBool,
    publisher: Publisher,
}

impl TimerService {
    /// Create the service and spawn its scheduler and ticker tasks
    pub(crate) fn spawn(publisher: Publisher) -> Arc<Self> {
        let service = Arc::new(Self {
            table: Mutex::new(HashMap::new()),
            wake: Notify::new(),
            stopped: AtomicBool::new(false),
            publisher,
        });

        tokio::spawn(Arc::clone(&service).run_scheduler());
        tokio::spawn(Arc::clone(&service).run_ticker());

        service
    }

    fn table(&self) -> MutexGuard<'_, HashMap<TimerId, Timer>> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a paused timer, optionally starting it right away
    ///
    /// An existing timer with the same id is replaced.
    pub fn init(&self, id: TimerId, limit: Duration, hard_limit: Duration, start: bool) {
        if limit > hard_limit {
            warn!(
                timer = %id,
                ?limit,
                ?hard_limit,
                "Timer limit exceeds hard limit, it will expire at the hard limit"
            );
        }

        let timer = Timer {
            limit,
            hard_limit,
            lapsed: Duration::ZERO,
            started_at: start.then(Instant::now),
        };

        if self.table().insert(id.clone(), timer).is_some() {
            warn!(timer = %id, "Replacing existing timer");
        }
        debug!(timer = %id, ?limit, ?hard_limit, start, "Timer created");
        self.wake.notify_one();
    }

    pub fn start(&self, id: &TimerId) -> Result<()> {
        let mut table = self.table();
        let timer = table
            .get_mut(id)
            .ok_or_else(|| Error::TimerNotFound(id.clone()))?;

        if timer.is_running() {
            warn!(timer = %id, "Timer already running");
            return Ok(());
        }
        if timer.lapsed >= timer.budget() {
            warn!(timer = %id, "Timer already at its limit");
            return Ok(());
        }

        timer.started_at = Some(Instant::now());
        drop(table);
        self.wake.notify_one();
        Ok(())
    }

    /// Stop the clock, keeping the time used so far
    pub fn pause(&self, id: &TimerId) -> Result<()> {
        let now = Instant::now();
        let mut table = self.table();
        let timer = table
            .get_mut(id)
            .ok_or_else(|| Error::TimerNotFound(id.clone()))?;

        let Some(started) = timer.started_at.take() else {
            return Ok(());
        };
        timer.lapsed = (timer.lapsed + now.saturating_duration_since(started)).min(timer.budget());

        if timer.lapsed >= timer.budget() {
            table.remove(id);
            info!(timer = %id, "Timer expired while pausing");
            self.emit_done(id);
        }
        drop(table);
        self.wake.notify_one();
        Ok(())
    }

    /// Restart the clock from zero on what is left of the hard budget
    ///
    /// Fails without touching the timer once the hard budget is used up.
    pub fn reset(&self, id: &TimerId) -> Result<()> {
        let now = Instant::now();
        let mut table = self.table();
        let timer = table
            .get_mut(id)
            .ok_or_else(|| Error::TimerNotFound(id.clone()))?;

        let consumed = timer.consumed(now);
        if consumed >= timer.hard_limit {
            return Err(Error::HardLimitExceeded {
                id: id.clone(),
                consumed,
                hard_limit: timer.hard_limit,
            });
        }

        timer.hard_limit -= consumed;
        timer.lapsed = Duration::ZERO;
        timer.started_at = Some(now);
        debug!(timer = %id, hard_limit = ?timer.hard_limit, "Timer reset");

        drop(table);
        self.wake.notify_one();
        Ok(())
    }

    /// Expire a timer immediately
    pub fn trigger(&self, id: &TimerId) -> Result<()> {
        let mut table = self.table();
        table
            .remove(id)
            .ok_or_else(|| Error::TimerNotFound(id.clone()))?;
        info!(timer = %id, "Timer triggered");
        self.emit_done(id);
        drop(table);
        self.wake.notify_one();
        Ok(())
    }

    /// Remove a timer without emitting `done`
    pub fn delete(&self, id: &TimerId) -> Result<()> {
        self.table()
            .remove(id)
            .ok_or_else(|| Error::TimerNotFound(id.clone()))?;
        debug!(timer = %id, "Timer deleted");
        self.wake.notify_one();
        Ok(())
    }

    pub fn remaining(&self, id: &TimerId) -> Result<Duration> {
        self.table()
            .get(id)
            .map(|timer| timer.remaining(Instant::now()))
            .ok_or_else(|| Error::TimerNotFound(id.clone()))
    }

    pub fn contains(&self, id: &TimerId) -> bool {
        self.table().contains_key(id)
    }

    /// Seconds remaining for every timer, sorted by id
    pub fn snapshot(&self) -> Vec<TimerRemaining> {
        let now = Instant::now();
        let mut rows: Vec<TimerRemaining> = self
            .table()
            .iter()
            .map(|(id, timer)| TimerRemaining {
                id: id.clone(),
                remaining_secs: timer.remaining(now).as_secs_f64().ceil() as u64,
                running: timer.is_running(),
            })
            .collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        rows
    }

    /// Apply a request received on the bus
    pub fn handle(&self, request: &TimerPayload) -> Result<()> {
        match request {
            TimerPayload::Init {
                id,
                limit,
                hard_limit,
                start,
            } => {
                self.init(id.clone(), *limit, *hard_limit, *start);
                Ok(())
            }
            TimerPayload::Start(id) => self.start(id),
            TimerPayload::Pause(id) => self.pause(id),
            TimerPayload::Reset(id) => self.reset(id),
            TimerPayload::Trigger(id) => self.trigger(id),
            TimerPayload::Delete(id) => self.delete(id),
            TimerPayload::Done(_) | TimerPayload::Tick(_) => Err(Error::UnexpectedPayload {
                kind: "timer event".to_string(),
                expected: "timer request",
            }),
        }
    }

    /// Stop the background tasks
    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    fn emit_done(&self, id: &TimerId) {
        let mut message = self.publisher.message(
            Topic::Timer,
            kind::DONE,
            Payload::Timer(TimerPayload::Done(id.clone())),
        );
        message.timer_id = Some(id.clone());
        if let Err(e) = self.publisher.publish(message) {
            debug!(timer = %id, "Dropping done event: {}", e);
        }
    }

    /// Remove and announce every expired timer, returning the next deadline
    fn expire_due(&self, now: Instant) -> Option<Instant> {
        let mut table = self.table();

        let expired: Vec<TimerId> = table
            .iter()
            .filter(|(_, timer)| timer.deadline().is_some_and(|deadline| deadline <= now))
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            table.remove(&id);
            info!(timer = %id, "Timer expired");
            self.emit_done(&id);
        }

        table.values().filter_map(Timer::deadline).min()
    }

    async fn run_scheduler(self: Arc<Self>) {
        while !self.stopped.load(Ordering::Acquire) {
            match self.expire_due(Instant::now()) {
                Some(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {}
                        _ = self.wake.notified() => {}
                    }
                }
                None => self.wake.notified().await,
            }
        }
        debug!("Timer scheduler stopped");
    }

    async fn run_ticker(self: Arc<Self>) {
        let mut interval = tokio::time::interval(TICK_PERIOD);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            interval.tick().await;
            if self.stopped.load(Ordering::Acquire) {
                break;
            }

            let running: Vec<TimerRemaining> =
                self.snapshot().into_iter().filter(|row| row.running).collect();
            if running.is_empty() {
                continue;
            }

            let message = self.publisher.message(
                Topic::Timer,
                kind::TICK,
                Payload::Timer(TimerPayload::Tick(running)),
            );
            if self.publisher.publish(message).is_err() {
                break;
            }
        }
        debug!("Timer ticker stopped");
    }
}

/// Answer timer requests published on the bus
///
/// Every request gets a `<kind>_response` reply whose `error` is set when the
/// operation failed. Events and responses on the topic are ignored.
pub fn spawn_server(bus: &Bus) -> JoinHandle<()> {
    let subscription = bus.subscribe(&[Topic::Timer]);
    let bus = bus.clone();

    tokio::spawn(async move {
        while let Ok(message) = subscription.recv().await {
            if message.is_response() {
                continue;
            }

            let result = match &message.payload {
                Payload::Timer(TimerPayload::Done(_) | TimerPayload::Tick(_)) => continue,
                Payload::Timer(request) => bus.timers().handle(request),
                _ => Err(Error::UnexpectedPayload {
                    kind: message.kind.clone(),
                    expected: "timer request",
                }),
            };

            if let Err(e) = &result {
                debug!(kind = %message.kind, "Timer request failed: {}", e);
            }
            let error = result.err().map(|e| e.to_string());
            if let Err(e) = bus.respond(&message, Payload::Empty, error) {
                warn!("Timer server stopping: {}", e);
                break;
            }
        }
        debug!("Timer server stopped");
    })
}
