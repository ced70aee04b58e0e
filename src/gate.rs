//! Bounded FIFO admission control for segmentation calls
//!
//! The gate caps how many segmentation calls run at once, independently of how
//! many HTTP requests the server accepts. Waiters are admitted in arrival order.
//! A permit is released when it is dropped, so every exit path (success, error,
//! panic, cancelled caller) returns its slot exactly once.

use crate::error::{BgRemovalError, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Point-in-time occupancy of the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GateStats {
    pub in_use: usize,
    pub capacity: usize,
    pub available: usize,
    pub waiting: usize,
}

/// One admitted slot; dropping it releases the slot
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

/// Counting permit pool with FIFO waiters
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    acquire_timeout: Option<Duration>,
    waiting: Arc<AtomicUsize>,
}

/// Decrements the waiter count when an acquisition attempt ends, however it ends
struct WaitingGuard<'a>(&'a AtomicUsize);

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConcurrencyGate {
    /// Create a gate with `capacity` slots (at least one)
    #[must_use]
    pub fn new(capacity: usize, acquire_timeout: Option<Duration>) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            acquire_timeout,
            waiting: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of callers currently suspended in `acquire`
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Wait for a free slot
    ///
    /// # Errors
    /// - `BackendUnavailable` when the acquisition timeout elapses
    /// - `BackendUnavailable` when the gate has been closed
    pub async fn acquire(&self) -> Result<GatePermit> {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let _waiting = WaitingGuard(&self.waiting);

        let acquire = Arc::clone(&self.semaphore).acquire_owned();
        let permit = match self.acquire_timeout {
            Some(limit) => tokio::time::timeout(limit, acquire).await.map_err(|_| {
                BgRemovalError::backend_unavailable(format!(
                    "No processing capacity available within {}s",
                    limit.as_secs_f64()
                ))
            })?,
            None => acquire.await,
        }
        .map_err(|_| BgRemovalError::backend_unavailable("Service is shutting down"))?;

        Ok(GatePermit { _permit: permit })
    }

    /// Run a CPU-bound closure on a blocking worker while holding a slot
    ///
    /// The permit travels into the worker and is released when `f` returns, so a
    /// caller that stops waiting neither frees the slot early nor leaks it.
    ///
    /// # Errors
    /// - Any error from `acquire`
    /// - `Internal` if the worker panicked
    /// - Whatever `f` returns
    pub async fn run_blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self.acquire().await?;

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        })
        .await
        .map_err(|e| BgRemovalError::internal(format!("Blocking worker failed: {e}")))?
    }

    /// Current occupancy; never waits
    #[must_use]
    pub fn stats(&self) -> GateStats {
        let available = self.semaphore.available_permits().min(self.capacity);
        GateStats {
            in_use: self.capacity - available,
            capacity: self.capacity,
            available,
            waiting: self.waiting(),
        }
    }

    /// Stop admitting new work; pending and future `acquire` calls fail
    pub fn close(&self) {
        self.semaphore.close();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicBool;

    async fn wait_for_waiters(gate: &ConcurrencyGate, count: usize) {
        while gate.waiting() < count {
            tokio::task::yield_now().await;
        }
        // The counter moves just before the waiter enqueues on the semaphore
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_capacity_floor_is_one() {
        let gate = ConcurrencyGate::new(0, None);
        assert_eq!(gate.capacity(), 1);
        assert_eq!(
            gate.stats(),
            GateStats {
                in_use: 0,
                capacity: 1,
                available: 1,
                waiting: 0
            }
        );
    }

    #[tokio::test]
    async fn test_permit_released_on_drop() {
        let gate = ConcurrencyGate::new(2, None);
        let first = gate.acquire().await.unwrap();
        let second = gate.acquire().await.unwrap();
        assert_eq!(gate.stats().in_use, 2);
        assert_eq!(gate.stats().available, 0);

        drop(first);
        assert_eq!(gate.stats().in_use, 1);
        drop(second);
        assert_eq!(gate.stats().in_use, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fifo_admission_order() {
        let gate = ConcurrencyGate::new(1, None);
        let order = Arc::new(Mutex::new(Vec::new()));
        let holder = gate.acquire().await.unwrap();

        let mut handles = Vec::new();
        for i in 0..5 {
            let gate_clone = gate.clone();
            let order_clone = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _permit = gate_clone.acquire().await.unwrap();
                order_clone.lock().push(i);
            }));
            wait_for_waiters(&gate, i + 1).await;
        }

        drop(holder);
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_never_exceeds_capacity() {
        let gate = ConcurrencyGate::new(3, None);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..24)
            .map(|_| {
                let gate = gate.clone();
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                tokio::spawn(async move {
                    gate.run_blocking(move || {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(5));
                        active.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
                })
            })
            .collect();

        for task in futures::future::join_all(tasks).await {
            task.unwrap().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 1);
        assert_eq!(gate.stats().in_use, 0);
    }

    #[tokio::test]
    async fn test_acquire_timeout_maps_to_unavailable() {
        let gate = ConcurrencyGate::new(1, Some(Duration::from_millis(20)));
        let _held = gate.acquire().await.unwrap();

        let err = gate.acquire().await.unwrap_err();
        assert!(matches!(err, BgRemovalError::BackendUnavailable(_)));
        assert_eq!(gate.waiting(), 0);
    }

    #[tokio::test]
    async fn test_closed_gate_rejects() {
        let gate = ConcurrencyGate::new(1, None);
        gate.close();
        assert!(gate.is_closed());

        let err = gate.acquire().await.unwrap_err();
        assert!(matches!(err, BgRemovalError::BackendUnavailable(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelled_caller_keeps_slot_until_work_completes() {
        let gate = ConcurrencyGate::new(1, None);
        let release = Arc::new(AtomicBool::new(false));
        let started = Arc::new(AtomicBool::new(false));

        let task = {
            let gate = gate.clone();
            let release = Arc::clone(&release);
            let started = Arc::clone(&started);
            tokio::spawn(async move {
                gate.run_blocking(move || {
                    started.store(true, Ordering::SeqCst);
                    while !release.load(Ordering::SeqCst) {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Ok(())
                })
                .await
            })
        };

        while !started.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }

        task.abort();
        let _ = task.await;
        assert_eq!(gate.stats().in_use, 1);

        release.store(true, Ordering::SeqCst);
        let _permit = gate.acquire().await.unwrap();
        assert_eq!(gate.stats().in_use, 1);
    }

    #[tokio::test]
    async fn test_errors_release_slot() {
        let gate = ConcurrencyGate::new(2, None);
        for i in 0..1000 {
            let result: Result<()> = gate
                .run_blocking(move || {
                    if i % 3 == 0 {
                        Err(BgRemovalError::inference("boom"))
                    } else {
                        Ok(())
                    }
                })
                .await;
            assert_eq!(result.is_err(), i % 3 == 0);
        }
        assert_eq!(gate.stats().in_use, 0);
        assert_eq!(gate.stats().waiting, 0);
    }

    #[tokio::test]
    async fn test_panicking_work_releases_slot() {
        let gate = ConcurrencyGate::new(1, None);
        let result: Result<()> = gate.run_blocking(|| panic!("worker panic")).await;
        assert!(matches!(result, Err(BgRemovalError::Internal(_))));
        assert_eq!(gate.stats().in_use, 0);
    }
}
