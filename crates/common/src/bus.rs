//! In-process publish/subscribe bus
//!
//! Publishers push onto one unbounded ingress queue. A single dispatcher task
//! drains it and forwards each message to every channel subscribed to the
//! message's topic, waiting on each bounded channel in turn: a subscriber
//! that stops reading stalls delivery for every other subscriber too.
//!
//! [`Bus::fetch`] layers a request/response call on top. The request carries
//! the id of a timer started for it, and the caller waits for whichever comes
//! first: a message on the same topic whose `respond_to` is the request id, or
//! the `done` event of that timer.
//!
//! # Example
//!
//! ```
//! use common::{Bus, Payload, Topic};
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> common::Result<()> {
//! let bus = Bus::new();
//!
//! let responder = bus.subscribe(&[Topic::Price]);
//! let answering = bus.clone();
//! tokio::spawn(async move {
//!     let request = responder.recv().await?;
//!     answering.respond(&request, Payload::Text("42.0".into()), None)
//! });
//!
//! let reply = bus
//!     .fetch(Topic::Price, "quote", Payload::Empty, Duration::from_secs(5), Duration::from_secs(10))
//!     .await?;
//! assert_eq!(reply.kind, "quote_response");
//! # Ok(())
//! # }
//! ```

use crate::error::{Error, Result};
use crate::message::{Message, MessageId, Payload, Topic, kind};
use crate::timer::{TimerId, TimerPayload, TimerService};
use async_channel::{Receiver, Sender, bounded, unbounded};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;
use tracing::{debug, info};

/// Default capacity of each subscriber channel
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Bus configuration
#[derive(Debug, Clone, Copy)]
pub struct BusConfig {
    /// Capacity of each subscriber channel
    pub channel_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Write side of the ingress queue, shared with the timer service
#[derive(Clone)]
pub(crate) struct Publisher {
    ingress: Sender<Message>,
    next_id: Arc<AtomicU64>,
}

impl Publisher {
    pub(crate) fn next_id(&self) -> MessageId {
        MessageId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Build a fresh request or event with a new id
    pub(crate) fn message(&self, topic: Topic, kind: &str, payload: Payload) -> Message {
        Message {
            id: self.next_id(),
            topic,
            kind: kind.to_string(),
            payload,
            timer_id: None,
            respond_to: MessageId::NONE,
            error: None,
        }
    }

    pub(crate) fn publish(&self, message: Message) -> Result<MessageId> {
        let id = message.id;
        self.ingress
            .try_send(message)
            .map_err(|_| Error::Channel("bus is shut down".to_string()))?;
        Ok(id)
    }

    fn close(&self) {
        self.ingress.close();
    }

    fn is_closed(&self) -> bool {
        self.ingress.is_closed()
    }
}

/// Topic to subscriber channel mapping
#[derive(Debug, Default)]
struct Registry {
    next_id: u64,
    channels: HashMap<u64, Sender<Message>>,
    topics: HashMap<Topic, Vec<u64>>,
}

impl Registry {
    fn subscribe(&mut self, topics: &[Topic], sender: Sender<Message>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.channels.insert(id, sender);

        for topic in topics {
            let subscribers = self.topics.entry(*topic).or_default();
            if !subscribers.contains(&id) {
                subscribers.push(id);
            }
        }
        id
    }

    fn unsubscribe(&mut self, id: u64) {
        let Some(sender) = self.channels.remove(&id) else {
            return;
        };
        for subscribers in self.topics.values_mut() {
            subscribers.retain(|&subscriber| subscriber != id);
        }
        sender.close();
    }

    fn senders(&self, topic: Topic) -> Vec<Sender<Message>> {
        self.topics
            .get(&topic)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.channels.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn close_all(&mut self) {
        for (_, sender) in self.channels.drain() {
            sender.close();
        }
        self.topics.clear();
    }
}

fn read(registry: &RwLock<Registry>) -> RwLockReadGuard<'_, Registry> {
    registry.read().unwrap_or_else(|e| e.into_inner())
}

fn write(registry: &RwLock<Registry>) -> RwLockWriteGuard<'_, Registry> {
    registry.write().unwrap_or_else(|e| e.into_inner())
}

/// A registered delivery channel
///
/// Dropping the subscription unsubscribes it.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    receiver: Receiver<Message>,
    registry: Weak<RwLock<Registry>>,
}

impl Subscription {
    /// Wait for the next message
    ///
    /// Fails once the subscription has been unsubscribed and drained, or the
    /// bus has shut down.
    pub async fn recv(&self) -> Result<Message> {
        self.receiver
            .recv()
            .await
            .map_err(|_| Error::Channel("subscription closed".to_string()))
    }

    /// Take the next message if one is already queued
    pub fn try_recv(&self) -> Option<Message> {
        self.receiver.try_recv().ok()
    }

    /// Remove this channel from every topic and close it
    ///
    /// Calling this more than once is a no-op.
    pub fn unsubscribe(&self) {
        if let Some(registry) = self.registry.upgrade() {
            write(&registry).unsubscribe(self.id);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.receiver.is_closed()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

struct Inner {
    publisher: Publisher,
    registry: Arc<RwLock<Registry>>,
    capacity: usize,
    timers: Arc<TimerService>,
}

impl Drop for Inner {
    // The timer tasks keep their own publisher, so the last handle has to
    // close the queue itself
    fn drop(&mut self) {
        self.publisher.close();
        self.timers.stop();
        debug!("Last bus handle dropped");
    }
}

/// Handle to the message bus
///
/// Cloning is cheap; every clone talks to the same dispatcher.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<Inner>,
}

impl Bus {
    /// Start a bus with default settings
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new() -> Self {
        Self::with_config(BusConfig::default())
    }

    pub fn with_config(config: BusConfig) -> Self {
        let (ingress, ingress_rx) = unbounded();
        let publisher = Publisher {
            ingress,
            next_id: Arc::new(AtomicU64::new(1)),
        };
        let registry = Arc::new(RwLock::new(Registry::default()));

        tokio::spawn(dispatch(ingress_rx, Arc::clone(&registry)));
        let timers = TimerService::spawn(publisher.clone());

        let capacity = config.channel_capacity.max(1);
        info!(capacity, "Message bus started");

        Self {
            inner: Arc::new(Inner {
                publisher,
                registry,
                capacity,
                timers,
            }),
        }
    }

    /// Publish a message without waiting for delivery
    pub fn send(&self, topic: Topic, kind: &str, payload: Payload) -> Result<MessageId> {
        let publisher = &self.inner.publisher;
        publisher.publish(publisher.message(topic, kind, payload))
    }

    /// Register one channel under each of `topics`
    pub fn subscribe(&self, topics: &[Topic]) -> Subscription {
        let (sender, receiver) = bounded(self.inner.capacity);
        let id = write(&self.inner.registry).subscribe(topics, sender);
        debug!(subscriber = id, ?topics, "Subscribed");

        Subscription {
            id,
            receiver,
            registry: Arc::downgrade(&self.inner.registry),
        }
    }

    pub fn unsubscribe(&self, subscription: &Subscription) {
        subscription.unsubscribe();
    }

    /// Answer `request` on its own topic
    pub fn respond(
        &self,
        request: &Message,
        payload: Payload,
        error: Option<String>,
    ) -> Result<MessageId> {
        let publisher = &self.inner.publisher;
        let mut message = publisher.message(
            request.topic,
            &format!("{}{}", request.kind, kind::RESPONSE_SUFFIX),
            payload,
        );
        message.respond_to = request.id;
        message.error = error;
        publisher.publish(message)
    }

    /// Publish a request and wait for its correlated response
    ///
    /// Fails with [`Error::Timeout`] once `min(soft_limit, hard_limit)` has
    /// passed without a response. The request itself is not withdrawn; a late
    /// response is simply never read.
    pub async fn fetch(
        &self,
        topic: Topic,
        kind: &str,
        payload: Payload,
        soft_limit: Duration,
        hard_limit: Duration,
    ) -> Result<Message> {
        self.start_fetch(topic, kind, payload, soft_limit, hard_limit)?
            .response()
            .await
    }

    /// Publish a request and hand back the pending half of [`Bus::fetch`]
    ///
    /// The caller learns the request id before the response arrives. The
    /// subscription is taken before publishing, so nothing is missed however
    /// late [`PendingFetch::response`] is awaited.
    pub fn start_fetch(
        &self,
        topic: Topic,
        kind: &str,
        payload: Payload,
        soft_limit: Duration,
        hard_limit: Duration,
    ) -> Result<PendingFetch> {
        if topic == Topic::Timer {
            return Err(Error::ReservedTopic(topic));
        }

        let subscription = self.subscribe(&[topic, Topic::Timer]);
        let publisher = &self.inner.publisher;

        let mut request = publisher.message(topic, kind, payload);
        let request_id = request.id;
        let timer_id = TimerId::for_fetch(request_id);
        request.timer_id = Some(timer_id.clone());

        self.inner
            .timers
            .init(timer_id.clone(), soft_limit, hard_limit, true);
        let pending = PendingFetch {
            subscription,
            timers: Arc::clone(&self.inner.timers),
            request_id,
            timer_id,
            topic,
            kind: kind.to_string(),
            after: soft_limit.min(hard_limit),
        };

        debug!(id = %request_id, %topic, kind, "Fetch");
        publisher.publish(request)?;
        Ok(pending)
    }

    pub fn timers(&self) -> &Arc<TimerService> {
        &self.inner.timers
    }

    /// Close the ingress queue
    ///
    /// The dispatcher delivers what is already queued, then closes every
    /// subscription so worker loops end.
    pub fn shutdown(&self) {
        info!("Message bus shutting down");
        self.inner.publisher.close();
        self.inner.timers.stop();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.publisher.is_closed()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

/// A published request waiting for its response
///
/// Dropping it abandons the fetch: the timer is deleted and the subscription
/// released.
pub struct PendingFetch {
    subscription: Subscription,
    timers: Arc<TimerService>,
    request_id: MessageId,
    timer_id: TimerId,
    topic: Topic,
    kind: String,
    after: Duration,
}

impl PendingFetch {
    pub fn id(&self) -> MessageId {
        self.request_id
    }

    /// Wait for the correlated response or the timer's `done`
    pub async fn response(self) -> Result<Message> {
        loop {
            let message = self.subscription.recv().await?;

            if message.topic == self.topic && message.respond_to == self.request_id {
                return Ok(message);
            }

            if let Payload::Timer(TimerPayload::Done(done)) = &message.payload
                && *done == self.timer_id
            {
                debug!(
                    id = %self.request_id,
                    topic = %self.topic,
                    kind = %self.kind,
                    "Fetch timed out"
                );
                return Err(Error::Timeout {
                    topic: self.topic,
                    kind: self.kind.clone(),
                    after: self.after,
                });
            }
        }
    }
}

impl Drop for PendingFetch {
    fn drop(&mut self) {
        // Already gone when the timer fired
        let _ = self.timers.delete(&self.timer_id);
    }
}

async fn dispatch(ingress: Receiver<Message>, registry: Arc<RwLock<Registry>>) {
    while let Ok(message) = ingress.recv().await {
        let senders = read(&registry).senders(message.topic);
        debug!(
            id = %message.id,
            topic = %message.topic,
            kind = %message.kind,
            subscribers = senders.len(),
            "Dispatching"
        );

        for sender in senders {
            // Closed means unsubscribed after the snapshot
            let _ = sender.send(message.clone()).await;
        }
    }

    write(&registry).close_all();
    debug!("Bus dispatcher stopped");
}
