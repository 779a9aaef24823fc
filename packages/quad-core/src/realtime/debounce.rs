//! Trailing-edge debounce timer.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

struct TimerInner {
    label: &'static str,
    delay: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for TimerInner {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            handle.abort();
        }
    }
}

/// Coalesces bursts of triggers into one run after a quiet period.
///
/// Each [`schedule`](Self::schedule) cancels the previous pending run and
/// starts the delay over. Once the delay elapses the work is handed to its
/// own task, so a later trigger can no longer interrupt it.
#[derive(Clone)]
pub struct RefreshTimer {
    inner: Arc<TimerInner>,
}

impl RefreshTimer {
    /// Create a timer with the given quiet period
    pub fn new(label: &'static str, delay: Duration) -> Self {
        Self {
            inner: Arc::new(TimerInner {
                label,
                delay,
                handle: Mutex::new(None),
            }),
        }
    }

    /// The quiet period
    pub fn delay(&self) -> Duration {
        self.inner.delay
    }

    /// (Re)arm the timer to run `work` after the quiet period
    pub fn schedule<F, Fut>(&self, work: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let deadline = tokio::time::Instant::now() + self.inner.delay;
        let label = self.inner.label;

        let mut slot = self.inner.handle.lock();
        if let Some(previous) = slot.take() {
            previous.abort();
        }
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            tracing::trace!("{} timer fired", label);
            tokio::spawn(work());
        }));
    }

    /// Drop a pending run, if any
    pub fn cancel(&self) {
        if let Some(handle) = self.inner.handle.lock().take() {
            handle.abort();
        }
    }

    /// Whether a run is waiting for its quiet period to end
    pub fn is_pending(&self) -> bool {
        self.inner
            .handle
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

impl std::fmt::Debug for RefreshTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshTimer")
            .field("label", &self.inner.label)
            .field("delay", &self.inner.delay)
            .field("pending", &self.is_pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> std::pin::Pin<Box<dyn Future<Output = ()> + Send>>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let make = move || {
            let c = c.clone();
            Box::pin(async move {
                c.fetch_add(1, Ordering::SeqCst);
            }) as std::pin::Pin<Box<dyn Future<Output = ()> + Send>>
        };
        (count, make)
    }

    async fn settle() {
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_runs_once() {
        let timer = RefreshTimer::new("list", Duration::from_millis(100));
        let (count, make) = counter();

        for _ in 0..5 {
            let work = make();
            timer.schedule(move || work);
            tokio::time::advance(Duration::from_millis(30)).await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(timer.is_pending());

        tokio::time::advance(Duration::from_millis(100)).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!timer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_separate_bursts_run_separately() {
        let timer = RefreshTimer::new("conversation", Duration::from_millis(80));
        let (count, make) = counter();

        let work = make();
        timer.schedule(move || work);
        tokio::time::advance(Duration::from_millis(90)).await;
        settle().await;

        let work = make();
        timer.schedule(move || work);
        tokio::time::advance(Duration::from_millis(90)).await;
        settle().await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel() {
        let timer = RefreshTimer::new("list", Duration::from_millis(100));
        let (count, make) = counter();

        let work = make();
        timer.schedule(move || work);
        timer.cancel();
        tokio::time::advance(Duration::from_millis(200)).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels() {
        let timer = RefreshTimer::new("list", Duration::from_millis(100));
        let (count, make) = counter();

        let work = make();
        timer.schedule(move || work);
        drop(timer);
        tokio::time::advance(Duration::from_millis(200)).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
