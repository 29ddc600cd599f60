//! Admission control for per-key processing.
//!
//! The limiter bounds how many keys are processed at once and lets shutdown
//! wait for in-flight keys to drain.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LimiterError {
    /// `release` for an id that is not in flight (double release or a logic bug).
    #[error("id is not in flight: {0}")]
    NotInFlight(String),
    #[error("limiter lock poisoned")]
    Poisoned,
}

#[derive(Debug, Default)]
struct LimiterState {
    /// In-flight ids, in acquisition order.
    in_flight: Vec<String>,
    processed: u64,
}

/// Counting gate with capacity `N` that remembers which ids hold a permit.
#[derive(Debug)]
pub struct ProcessingLimiter {
    capacity: usize,
    state: Mutex<LimiterState>,
    changed: Condvar,
}

impl ProcessingLimiter {
    /// A limiter admitting up to `capacity` ids at once (at least one).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(LimiterState::default()),
            changed: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Block until a permit is free, then record `id` as in flight.
    ///
    /// Callers must not acquire an id that is already in flight.
    pub fn acquire(&self, id: impl Into<String>) -> Result<(), LimiterError> {
        let id = id.into();
        let mut state = self.lock()?;
        while state.in_flight.len() >= self.capacity {
            state = self
                .changed
                .wait(state)
                .map_err(|_| LimiterError::Poisoned)?;
        }
        state.in_flight.push(id);
        Ok(())
    }

    /// Free the permit held by `id`.
    pub fn release(&self, id: &str) -> Result<(), LimiterError> {
        let mut state = self.lock()?;
        let position = state
            .in_flight
            .iter()
            .position(|held| held == id)
            .ok_or_else(|| LimiterError::NotInFlight(id.to_string()))?;
        state.in_flight.remove(position);
        state.processed += 1;
        drop(state);

        self.changed.notify_all();
        Ok(())
    }

    pub fn is_in_flight(&self, id: &str) -> bool {
        self.lock()
            .map(|state| state.in_flight.iter().any(|held| held == id))
            .unwrap_or(false)
    }

    /// In-flight ids in acquisition order.
    pub fn unprocessed_ids(&self) -> Vec<String> {
        self.lock()
            .map(|state| state.in_flight.clone())
            .unwrap_or_default()
    }

    pub fn in_flight_count(&self) -> usize {
        self.lock().map(|state| state.in_flight.len()).unwrap_or(0)
    }

    /// Number of releases since construction.
    pub fn processed_count(&self) -> u64 {
        self.lock().map(|state| state.processed).unwrap_or(0)
    }

    /// Block until nothing is in flight.
    pub fn await_all(&self) -> Result<(), LimiterError> {
        let mut state = self.lock()?;
        while !state.in_flight.is_empty() {
            state = self
                .changed
                .wait(state)
                .map_err(|_| LimiterError::Poisoned)?;
        }
        Ok(())
    }

    /// Block until nothing is in flight or `timeout` elapses.
    ///
    /// Returns `true` when drained.
    pub fn await_all_timeout(&self, timeout: Duration) -> Result<bool, LimiterError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock()?;
        while !state.in_flight.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            let (next, _) = self
                .changed
                .wait_timeout(state, remaining)
                .map_err(|_| LimiterError::Poisoned)?;
            state = next;
        }
        Ok(true)
    }

    fn lock(&self) -> Result<MutexGuard<'_, LimiterState>, LimiterError> {
        self.state.lock().map_err(|_| LimiterError::Poisoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn release_of_unknown_id_fails() {
        let limiter = ProcessingLimiter::new(2);
        assert_eq!(
            limiter.release("nope"),
            Err(LimiterError::NotInFlight("nope".to_string()))
        );

        limiter.acquire("a").unwrap();
        limiter.release("a").unwrap();
        assert!(matches!(limiter.release("a"), Err(LimiterError::NotInFlight(_))));
        assert_eq!(limiter.processed_count(), 1);
    }

    #[test]
    fn unprocessed_ids_keep_acquisition_order() {
        let limiter = ProcessingLimiter::new(3);
        limiter.acquire("c").unwrap();
        limiter.acquire("a").unwrap();
        limiter.acquire("b").unwrap();
        limiter.release("a").unwrap();

        assert_eq!(limiter.unprocessed_ids(), vec!["c", "b"]);
        assert!(limiter.is_in_flight("b"));
        assert!(!limiter.is_in_flight("a"));
    }

    #[test]
    fn acquire_blocks_at_capacity() {
        let limiter = Arc::new(ProcessingLimiter::new(1));
        limiter.acquire("first").unwrap();

        let acquired = Arc::new(AtomicUsize::new(0));
        let handle = {
            let limiter = limiter.clone();
            let acquired = acquired.clone();
            thread::spawn(move || {
                limiter.acquire("second").unwrap();
                acquired.store(1, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert_eq!(acquired.load(Ordering::SeqCst), 0);

        limiter.release("first").unwrap();
        handle.join().unwrap();
        assert_eq!(acquired.load(Ordering::SeqCst), 1);
        assert_eq!(limiter.unprocessed_ids(), vec!["second"]);
    }

    #[test]
    fn concurrent_cycles_never_exceed_capacity() {
        const CAPACITY: usize = 3;
        let limiter = Arc::new(ProcessingLimiter::new(CAPACITY));
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..8)
            .map(|worker| {
                let limiter = limiter.clone();
                let current = current.clone();
                let peak = peak.clone();
                thread::spawn(move || {
                    for round in 0..50 {
                        let id = format!("w{worker}-{round}");
                        limiter.acquire(id.clone()).unwrap();
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        assert!(limiter.in_flight_count() <= CAPACITY);
                        thread::yield_now();
                        current.fetch_sub(1, Ordering::SeqCst);
                        limiter.release(&id).unwrap();
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= CAPACITY);
        assert_eq!(limiter.processed_count(), 8 * 50);
        assert!(limiter.unprocessed_ids().is_empty());
    }

    #[test]
    fn await_all_returns_once_drained() {
        let limiter = Arc::new(ProcessingLimiter::new(4));
        for id in ["a", "b", "c"] {
            limiter.acquire(id).unwrap();
        }

        let releaser = {
            let limiter = limiter.clone();
            thread::spawn(move || {
                for id in ["a", "b", "c"] {
                    thread::sleep(Duration::from_millis(10));
                    limiter.release(id).unwrap();
                }
            })
        };

        limiter.await_all().unwrap();
        assert!(limiter.unprocessed_ids().is_empty());
        releaser.join().unwrap();
    }

    #[test]
    fn await_all_timeout_gives_up() {
        let limiter = ProcessingLimiter::new(1);
        limiter.acquire("stuck").unwrap();
        assert!(!limiter.await_all_timeout(Duration::from_millis(20)).unwrap());
        assert_eq!(limiter.unprocessed_ids(), vec!["stuck"]);
    }
}
