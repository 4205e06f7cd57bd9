//! The shared outbound concurrency budget.

use crate::errors::TransientError;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Admission gate for external calls.
///
/// One gate is shared by every unit of a batch. A call holds a permit for
/// its whole duration, and is abandoned with [`TransientError::Timeout`]
/// once the per-call timeout elapses.
#[derive(Debug)]
pub struct AdmissionGate {
    semaphore: Semaphore,
    capacity: usize,
    call_timeout: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    admitted: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AdmissionGate {
    /// Creates a gate admitting at most `capacity` concurrent calls.
    #[must_use]
    pub fn new(capacity: usize, call_timeout: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Semaphore::new(capacity),
            capacity,
            call_timeout,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            admitted: AtomicUsize::new(0),
        }
    }

    /// Waits for a permit, then runs `call` under the per-call timeout.
    pub async fn admit<T, E, F>(&self, call: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: From<TransientError>,
    {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| TransientError::Unavailable("admission gate closed".to_string()))?;

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.peak.fetch_max(current, Ordering::SeqCst);
        self.admitted.fetch_add(1, Ordering::SeqCst);

        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(TransientError::Timeout(self.call_timeout).into()),
        }
    }

    /// Maximum concurrent calls.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Calls currently holding a permit.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous calls observed.
    #[must_use]
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Total calls admitted.
    #[must_use]
    pub fn admitted(&self) -> usize {
        self.admitted.load(Ordering::SeqCst)
    }
}
