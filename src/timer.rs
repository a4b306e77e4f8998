/// One-shot delayed actions backed by tokio tasks.
///
/// A `Countdown` owns the task that will run its action. Canceling aborts the
/// task; canceling a countdown that already fired (or was already canceled)
/// does nothing.
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Deadline used when `delay` cannot be added to the current instant.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Identifies one scheduled countdown. Ids are allocated by the owner and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CountdownId(pub u64);

impl std::fmt::Display for CountdownId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
pub struct Countdown {
    id: CountdownId,
    deadline: Instant,
    task: JoinHandle<()>,
}

impl Countdown {
    /// Schedule `action` to run once, `delay` from now.
    ///
    /// The deadline is fixed here rather than when the task is first polled,
    /// so a busy scheduler cannot stretch the countdown. Must be called from
    /// inside a tokio runtime.
    pub fn schedule<F>(id: CountdownId, delay: Duration, action: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let now = Instant::now();
        let deadline = now.checked_add(delay).unwrap_or_else(|| now + FAR_FUTURE);
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            action();
        });
        Self { id, deadline, task }
    }

    pub fn id(&self) -> CountdownId {
        self.id
    }

    /// Time left before the action runs (zero once the deadline has passed).
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Abort the pending action. Safe on a finished or already-canceled countdown.
    pub fn cancel(self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time;

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_action_runs_after_delay() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let _countdown = Countdown::schedule(CountdownId(1), Duration::from_secs(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        time::advance(Duration::from_secs(9)).await;
        settle().await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_action() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let countdown = Countdown::schedule(CountdownId(1), Duration::from_secs(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        countdown.cancel();
        time::advance(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_fire_is_noop() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let countdown = Countdown::schedule(CountdownId(7), Duration::from_secs(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(countdown.id(), CountdownId(7));
        countdown.cancel();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fixed_at_schedule_time() {
        let countdown = Countdown::schedule(CountdownId(1), Duration::from_secs(60), || {});
        // The task has not been polled yet; the deadline must not depend on it.
        time::advance(Duration::from_secs(20)).await;
        assert_eq!(countdown.remaining(), Duration::from_secs(40));
        countdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_overflowing_delay_parks_far_out() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let countdown = Countdown::schedule(CountdownId(1), Duration::MAX, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(countdown.remaining(), FAR_FUTURE);

        time::advance(Duration::from_secs(86400 * 365)).await;
        settle().await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        countdown.cancel();
    }
}
