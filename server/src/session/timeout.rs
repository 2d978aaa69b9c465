use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

/// Handle to an armed one-shot timeout.
///
/// Cancellation is sticky: a task that wakes up concurrently with `cancel`
/// observes the flag and returns without side effects, so cancel-then-fire
/// can never mutate state.
pub struct Timeout {
    cancelled: Arc<AtomicBool>,
    firing: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl Timeout {
    /// Arm a one-shot timeout that runs `fire` after `delay` unless
    /// cancelled first.
    pub fn arm<F, Fut>(delay: Duration, fire: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let firing = Arc::new(AtomicBool::new(false));
        let cancel_flag = Arc::clone(&cancelled);
        let firing_flag = Arc::clone(&firing);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            firing_flag.store(true, Ordering::SeqCst);
            fire().await;
        });
        Self {
            cancelled,
            firing,
            task,
        }
    }

    /// Cancel the timeout. Idempotent.
    ///
    /// A timer still sleeping is aborted outright. Once `fire` has started
    /// the task is left to finish: the firing closure may be the caller,
    /// reaching this handle through its own state swap, and the flag alone
    /// already rules out a re-fire.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if !self.firing.load(Ordering::SeqCst) {
            self.task.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_after_delay() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let _timeout = Timeout::arm(Duration::from_secs(10), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_fire() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let timeout = Timeout::arm(Duration::from_secs(10), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        timeout.cancel();
        assert!(timeout.is_cancelled());

        tokio::time::advance(Duration::from_secs(20)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_fire_lets_it_finish() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let timeout = Timeout::arm(Duration::from_secs(10), move || async move {
            // Suspend mid-fire, like a firing task hitting storage.
            tokio::time::sleep(Duration::from_secs(1)).await;
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::advance(Duration::from_secs(10)).await;
        // Let the task pass the cancel check and park inside `fire`.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        timeout.cancel();
        assert!(timeout.is_cancelled());

        tokio::time::advance(Duration::from_secs(1)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        // The in-flight firing work ran to completion.
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
