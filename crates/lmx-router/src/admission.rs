//! Bounded-concurrency admission in front of the inference runtime
//!
//! Normal-priority requests compete for one of `capacity` slots and wait at
//! most a bounded time for one to free up. High-priority requests bypass the
//! gate but are still counted as in flight. A granted slot is represented by
//! an [`AdmissionPermit`]; dropping it is the only way to release the slot,
//! so release happens exactly once on every exit path, including task
//! cancellation when a client disconnects.
//!
//! Waiters are not served in FIFO order by contract: any waiter may take the
//! next free slot.

use lmx_core::{AdmissionConfig, Error, Priority, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::debug;

/// Process-wide in-flight counter with an idle notification
#[derive(Debug, Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

/// Fixed-capacity gate bounding concurrent generation requests
#[derive(Debug)]
pub struct AdmissionController {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    default_timeout: Duration,
    busy_retry_after_secs: u64,
    in_flight: Arc<InFlight>,
    waiting: AtomicUsize,
    closed: AtomicBool,
}

/// Proof of admission; releases its slot when dropped
#[derive(Debug)]
#[must_use = "dropping the permit releases the slot immediately"]
pub struct AdmissionPermit {
    _slot: Option<OwnedSemaphorePermit>,
    in_flight: Arc<InFlight>,
    priority: Priority,
    waited: Duration,
}

impl AdmissionPermit {
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Time spent waiting for the slot
    pub fn waited(&self) -> Duration {
        self.waited
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if self.in_flight.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.in_flight.idle.notify_waiters();
        }
    }
}

/// Decrements the waiting count however the wait ends
struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl AdmissionController {
    pub fn new(capacity: usize, default_timeout: Duration, busy_retry_after_secs: u64) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            default_timeout,
            busy_retry_after_secs,
            in_flight: Arc::new(InFlight::default()),
            waiting: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &AdmissionConfig) -> Self {
        Self::new(
            config.max_concurrent_requests,
            config.acquire_timeout(),
            config.busy_retry_after_secs,
        )
    }

    /// Acquire admission for one request
    ///
    /// Normal priority waits up to `timeout` (or the configured default) for a
    /// slot and fails with [`Error::Busy`] when none frees up; a failed wait
    /// leaves no trace in the counters. High priority is admitted immediately.
    /// After [`close`](Self::close) normal priority fails with `Unavailable`
    /// while high priority is still admitted.
    pub async fn acquire(&self, priority: Priority, timeout: Option<Duration>) -> Result<AdmissionPermit> {
        match priority {
            Priority::High => Ok(self.grant(None, priority, Duration::ZERO)),
            Priority::Normal => {
                if self.is_closed() {
                    return Err(shutting_down());
                }
                let timeout = timeout.unwrap_or(self.default_timeout);
                let start = Instant::now();
                let _waiting = WaitingGuard::enter(&self.waiting);

                match tokio::time::timeout(timeout, Arc::clone(&self.semaphore).acquire_owned()).await {
                    Ok(Ok(slot)) => Ok(self.grant(Some(slot), priority, start.elapsed())),
                    Ok(Err(_)) => Err(shutting_down()),
                    Err(_) => {
                        let waited = start.elapsed();
                        debug!(
                            waited_ms = waited.as_millis() as u64,
                            capacity = self.capacity,
                            "Admission timed out"
                        );
                        Err(Error::busy(waited.as_millis() as u64, self.busy_retry_after_secs))
                    }
                }
            }
        }
    }

    fn grant(&self, slot: Option<OwnedSemaphorePermit>, priority: Priority, waited: Duration) -> AdmissionPermit {
        self.in_flight.count.fetch_add(1, Ordering::AcqRel);
        AdmissionPermit {
            _slot: slot,
            in_flight: Arc::clone(&self.in_flight),
            priority,
            waited,
        }
    }

    /// Reject new normal-priority work; pending waiters fail with `Unavailable`
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait until nothing is in flight; returns false if `timeout` passed first
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.in_flight.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.in_flight() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.in_flight() == 0;
            }
        }
    }

    /// Requests currently admitted, high priority included
    pub fn in_flight(&self) -> usize {
        self.in_flight.count.load(Ordering::Acquire)
    }

    /// Normal-priority requests waiting for a slot
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }
}

fn shutting_down() -> Error {
    Error::unavailable("server is shutting down")
}
