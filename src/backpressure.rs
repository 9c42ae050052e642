//! In-flight admission control.
//!
//! Every request submitted on a connection holds one permit from the
//! connection's [`InFlightLimiter`] until its transaction reaches a terminal
//! response or is drained on teardown. When the limit is reached, new
//! submissions wait up to the admission timeout for a permit; if none frees
//! up, the caller gets [`StrestError::Backpressure`] and the connection is
//! closed.
//!
//! # Configuration
//!
//! - `max_in_flight`: `None` (default) means unbounded
//! - Timeout: how long admission may wait (default: 20s)

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{StrestError, Result};

/// Default admission timeout.
pub const DEFAULT_ADMISSION_TIMEOUT: Duration = Duration::from_secs(20);

/// Counting limiter over in-flight transactions.
///
/// Clones share the same permits.
#[derive(Debug, Clone)]
pub struct InFlightLimiter {
    /// `None` when unbounded.
    semaphore: Option<Arc<Semaphore>>,
    max_in_flight: Option<usize>,
    timeout: Duration,
}

impl InFlightLimiter {
    /// Create a limiter.
    ///
    /// `None` disables the bound, and so does a bound larger than the
    /// semaphore can count.
    pub fn new(max_in_flight: Option<usize>, timeout: Duration) -> Self {
        let max_in_flight = max_in_flight.filter(|&max| max <= Semaphore::MAX_PERMITS);
        Self {
            semaphore: max_in_flight.map(|max| Arc::new(Semaphore::new(max))),
            max_in_flight,
            timeout,
        }
    }

    /// The effective bound, `None` when unbounded.
    #[inline]
    pub fn max_in_flight(&self) -> Option<usize> {
        self.max_in_flight
    }

    /// Wait for an in-flight slot.
    ///
    /// Returns `Err(Backpressure)` if no slot frees up within the timeout
    /// and `Err(NotConnected)` if the limiter was closed.
    pub async fn admit(&self, addr: &str) -> Result<InFlightPermit> {
        let Some(semaphore) = &self.semaphore else {
            return Ok(InFlightPermit(None));
        };

        match tokio::time::timeout(self.timeout, semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(InFlightPermit(Some(permit))),
            Ok(Err(_closed)) => Err(StrestError::NotConnected(addr.to_string())),
            Err(_elapsed) => Err(StrestError::Backpressure(self.timeout)),
        }
    }

    /// Fail every current and future waiter.
    pub fn close(&self) {
        if let Some(semaphore) = &self.semaphore {
            semaphore.close();
        }
    }
}

/// Slot held by one in-flight transaction; released on drop.
#[derive(Debug)]
pub struct InFlightPermit(Option<OwnedSemaphorePermit>);

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    const SHORT: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn test_unbounded() {
        let limiter = InFlightLimiter::new(None, SHORT);
        assert_eq!(limiter.max_in_flight(), None);

        let mut permits = Vec::new();
        for _ in 0..10_000 {
            permits.push(limiter.admit("test").await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_oversized_bound_is_unbounded() {
        let limiter = InFlightLimiter::new(Some(usize::MAX), SHORT);
        assert_eq!(limiter.max_in_flight(), None);
        assert!(limiter.admit("test").await.is_ok());

        let limiter = InFlightLimiter::new(Some(Semaphore::MAX_PERMITS), SHORT);
        assert_eq!(limiter.max_in_flight(), Some(Semaphore::MAX_PERMITS));
    }

    #[tokio::test]
    async fn test_admit_timeout_at_capacity() {
        let limiter = InFlightLimiter::new(Some(2), SHORT);
        let _a = limiter.admit("test").await.unwrap();
        let _b = limiter.admit("test").await.unwrap();

        let start = Instant::now();
        let result = limiter.admit("test").await;

        assert!(matches!(result, Err(StrestError::Backpressure(_))));
        assert!(start.elapsed() >= SHORT);
    }

    #[tokio::test]
    async fn test_release_on_drop() {
        let limiter = InFlightLimiter::new(Some(1), SHORT);

        let permit = limiter.admit("test").await.unwrap();
        drop(permit);

        assert!(limiter.admit("test").await.is_ok());
    }

    #[tokio::test]
    async fn test_admit_waits_for_release() {
        let limiter = InFlightLimiter::new(Some(1), Duration::from_secs(2));
        let held = limiter.admit("test").await.unwrap();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(held);
        });

        assert!(limiter.admit("test").await.is_ok());
    }

    #[tokio::test]
    async fn test_close_fails_waiters() {
        let limiter = InFlightLimiter::new(Some(1), Duration::from_secs(5));
        let _held = limiter.admit("test").await.unwrap();

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.admit("peer:1").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        limiter.close();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(StrestError::NotConnected(_))));
    }
}
