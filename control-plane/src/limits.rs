//! Resizable worker concurrency limit.
//!
//! Not a fixed semaphore captured by value: the capacity lives in a
//! single cell that every acquire reads live. Growing the limit wakes
//! waiters; shrinking it imposes acquire-debt that future releases absorb
//! until the in-use count drops under the new target.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

#[derive(Debug)]
struct LimitState {
    capacity: usize,
    in_use: usize,
}

#[derive(Debug)]
struct LimiterInner {
    state: Mutex<LimitState>,
    notify: Notify,
}

/// Live, resizable permit pool for worker dispatch.
#[derive(Debug, Clone)]
pub struct WorkerLimiter {
    inner: Arc<LimiterInner>,
}

impl WorkerLimiter {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(LimiterInner {
                state: Mutex::new(LimitState {
                    capacity,
                    in_use: 0,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Current capacity.
    pub fn capacity(&self) -> usize {
        self.inner.state.lock().expect("limiter lock").capacity
    }

    /// Permits currently held.
    pub fn in_use(&self) -> usize {
        self.inner.state.lock().expect("limiter lock").in_use
    }

    /// Grab a permit without waiting, if one is free.
    pub fn try_acquire(&self) -> Option<WorkerPermit> {
        let mut state = self.inner.state.lock().expect("limiter lock");
        if state.in_use < state.capacity {
            state.in_use += 1;
            Some(WorkerPermit {
                inner: Arc::clone(&self.inner),
            })
        } else {
            None
        }
    }

    /// Wait for a permit. Cancellation-safe: dropping the future before it
    /// resolves holds nothing.
    pub async fn acquire(&self) -> WorkerPermit {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking, so a release landing
            // between the check and the await is not lost.
            notified.as_mut().enable();
            if let Some(permit) = self.try_acquire() {
                return permit;
            }
            notified.as_mut().await;
        }
    }

    /// Wait for a permit, giving up after `timeout`.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Option<WorkerPermit> {
        tokio::time::timeout(timeout, self.acquire()).await.ok()
    }

    /// Change the live capacity.
    ///
    /// Growing wakes all waiters. Shrinking below the in-use count blocks
    /// new acquires until enough permits drain back.
    pub fn resize(&self, new_capacity: usize) {
        let grew = {
            let mut state = self.inner.state.lock().expect("limiter lock");
            let grew = new_capacity > state.capacity;
            state.capacity = new_capacity;
            grew
        };
        if grew {
            self.inner.notify.notify_waiters();
        }
    }
}

/// A held worker slot. Dropping it releases the slot.
#[derive(Debug)]
pub struct WorkerPermit {
    inner: Arc<LimiterInner>,
}

impl Drop for WorkerPermit {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock().expect("limiter lock");
            state.in_use = state.in_use.saturating_sub(1);
            if state.in_use >= state.capacity {
                // Release absorbed by shrink debt; nobody can run yet.
                return;
            }
        }
        self.inner.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_try_acquire_respects_capacity() {
        let limiter = WorkerLimiter::new(2);
        let p1 = limiter.try_acquire().unwrap();
        let _p2 = limiter.try_acquire().unwrap();
        assert!(limiter.try_acquire().is_none());
        assert_eq!(limiter.in_use(), 2);

        drop(p1);
        assert!(limiter.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let limiter = WorkerLimiter::new(1);
        let p1 = limiter.acquire().await;

        let limiter2 = limiter.clone();
        let waiter = tokio::spawn(async move { limiter2.acquire().await });

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(p1);
        let _p2 = waiter.await.unwrap();
        assert_eq!(limiter.in_use(), 1);
    }

    #[tokio::test]
    async fn test_resize_up_wakes_waiters() {
        let limiter = WorkerLimiter::new(2);
        let _held: Vec<_> = vec![limiter.acquire().await, limiter.acquire().await];

        let concurrent = Arc::new(AtomicUsize::new(0));
        let mut waiters = Vec::new();
        for _ in 0..2 {
            let limiter = limiter.clone();
            let concurrent = Arc::clone(&concurrent);
            waiters.push(tokio::spawn(async move {
                let _permit = limiter.acquire().await;
                concurrent.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }));
        }

        tokio::task::yield_now().await;
        assert_eq!(concurrent.load(Ordering::SeqCst), 0);

        // Growing from 2 to 4 admits both waiters without any release.
        limiter.resize(4);
        for w in waiters {
            w.await.unwrap();
        }
        assert_eq!(concurrent.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_resize_down_absorbs_releases() {
        let limiter = WorkerLimiter::new(3);
        let p1 = limiter.acquire().await;
        let p2 = limiter.acquire().await;
        let _p3 = limiter.acquire().await;

        limiter.resize(1);
        assert_eq!(limiter.capacity(), 1);

        // Three held against a capacity of one: the first two releases are
        // debt, only the third frees a slot.
        drop(p1);
        assert!(limiter.try_acquire().is_none());
        drop(p2);
        assert!(limiter.try_acquire().is_none());
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_live_capacity() {
        let limiter = WorkerLimiter::new(2);
        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let limiter = limiter.clone();
            let peak = Arc::clone(&peak);
            let current = Arc::clone(&current);
            tasks.push(tokio::spawn(async move {
                let _permit = limiter.acquire().await;
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_acquire_timeout() {
        let limiter = WorkerLimiter::new(1);
        let _held = limiter.acquire().await;
        let got = limiter.acquire_timeout(Duration::from_millis(20)).await;
        assert!(got.is_none());
        // The timed-out waiter holds nothing.
        assert_eq!(limiter.in_use(), 1);
    }
}
