//! Test utilities for hwbus
//!
//! Provides mock entries, a scripted bus responder and helper functions for
//! testing across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::create_mock_entry;
//!
//! let entry = create_mock_entry(1, 0x534c, 0x0001);
//! assert_eq!(entry.vendor_id, 0x534c);
//! assert!(entry.session.is_none());
//! ```

use crate::bus::Bus;
use crate::message::{Message, Payload, Topic};
use crate::usb_types::{DeviceId, EnumerateEntry};
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Generous fetch limits for tests that expect an answer
pub const TEST_SOFT_LIMIT: Duration = Duration::from_secs(30);
pub const TEST_HARD_LIMIT: Duration = Duration::from_secs(60);

/// Create a mock enumeration entry with no sessions bound
pub fn create_mock_entry(id: u32, vendor_id: u16, product_id: u16) -> EnumerateEntry {
    EnumerateEntry {
        id: DeviceId(id),
        vendor_id,
        product_id,
        debug: false,
        session: None,
        debug_session: None,
    }
}

/// Create a list of mock entries with ids `1..=count`
pub fn create_mock_entry_list(count: u32) -> Vec<EnumerateEntry> {
    (1..=count)
        .map(|i| create_mock_entry(i, 0x1209, 0x53c0 + (i as u16)))
        .collect()
}

/// Answer requests on `topic` with `handler`
///
/// The subscription is registered before this returns, so requests published
/// afterwards are never missed. Responses and messages for which the handler
/// returns `None` are left unanswered.
pub fn spawn_responder<F>(bus: &Bus, topic: Topic, mut handler: F) -> JoinHandle<()>
where
    F: FnMut(&Message) -> Option<(Payload, Option<String>)> + Send + 'static,
{
    let subscription = bus.subscribe(&[topic]);
    let bus = bus.clone();

    tokio::spawn(async move {
        while let Ok(message) = subscription.recv().await {
            if message.is_response() {
                continue;
            }
            if let Some((payload, error)) = handler(&message)
                && bus.respond(&message, payload, error).is_err()
            {
                break;
            }
        }
    })
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}
