//! Process-wide count of in-flight jobs.
//!
//! Workers bump the counter around each check execution and wake the
//! supervisor; the supervisor reads the latest value when sizing the pool.
//! A missed wakeup is harmless, the next control cycle reads the counter
//! again.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::Notify;

#[derive(Clone, Default)]
pub(crate) struct JobCounter {
    inner: Arc<CounterInner>,
}

#[derive(Default)]
struct CounterInner {
    jobs: AtomicU32,
    notify: Notify,
}

impl JobCounter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn increment(&self) {
        self.inner.jobs.fetch_add(1, Ordering::Relaxed);
        self.inner.notify.notify_waiters();
    }

    /// Never drops below zero, even if increments and decrements race
    /// with a worker restart.
    pub(crate) fn decrement(&self) {
        let _ = self
            .inner
            .jobs
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
        self.inner.notify.notify_waiters();
    }

    pub(crate) fn load(&self) -> u32 {
        self.inner.jobs.load(Ordering::Relaxed)
    }

    /// Wait until some worker touches the counter.
    pub(crate) async fn changed(&self) {
        self.inner.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_up_and_down() {
        let counter = JobCounter::new();
        counter.increment();
        counter.increment();
        assert_eq!(counter.load(), 2);
        counter.decrement();
        assert_eq!(counter.load(), 1);
    }

    #[test]
    fn never_goes_negative() {
        let counter = JobCounter::new();
        counter.decrement();
        counter.decrement();
        assert_eq!(counter.load(), 0);
    }

    #[tokio::test]
    async fn wakes_a_waiter_on_change() {
        let counter = JobCounter::new();
        let waiter = counter.clone();
        let handle = tokio::spawn(async move { waiter.changed().await });
        tokio::task::yield_now().await;
        counter.increment();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("waiter should be woken")
            .unwrap();
    }
}
