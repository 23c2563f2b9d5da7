//! Cancellable background tasks owned by a connection

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Kinds of work a connection schedules. At most one task per kind runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    ConnectionTimeout,
    Ping,
    FlushRetry,
    EventPump,
}

/// Registry of spawned tasks keyed by [`TimerKind`].
///
/// `cancel_all()` is terminal: nothing can be scheduled afterwards, so a
/// closed connection never leaves work behind.
#[derive(Debug, Default)]
pub struct TaskTimers {
    tasks: Mutex<HashMap<TimerKind, JoinHandle<()>>>,
    cancelled: AtomicBool,
}

impl TaskTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `task`, aborting any previous task of the same kind
    pub fn spawn<F>(&self, kind: TimerKind, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        if self.cancelled.load(Ordering::SeqCst) {
            return;
        }
        let handle = tokio::spawn(task);
        if let Some(previous) = tasks.insert(kind, handle) {
            previous.abort();
        }
    }

    /// Run `task` after `delay`
    pub fn schedule<F>(&self, kind: TimerKind, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawn(kind, async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
    }

    pub fn is_scheduled(&self, kind: TimerKind) -> bool {
        self.tasks
            .lock()
            .get(&kind)
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    pub fn cancel(&self, kind: TimerKind) {
        if let Some(handle) = self.tasks.lock().remove(&kind) {
            handle.abort();
        }
    }

    pub fn cancel_all(&self) {
        let mut tasks = self.tasks.lock();
        self.cancelled.store(true, Ordering::SeqCst);
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Drop for TaskTimers {
    fn drop(&mut self) {
        for (_, handle) in self.tasks.get_mut().drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_schedule_fires_after_delay() {
        let timers = TaskTimers::new();
        let fired = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&fired);

        timers.schedule(TimerKind::FlushRetry, Duration::from_millis(500), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timers.is_scheduled(TimerKind::FlushRetry));

        tokio::time::sleep(Duration::from_millis(499)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_previous() {
        let timers = TaskTimers::new();
        let fired = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let counter = Arc::clone(&fired);
            timers.schedule(TimerKind::FlushRetry, Duration::from_millis(100), async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_is_terminal() {
        let timers = TaskTimers::new();
        let fired = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&fired);
        timers.schedule(TimerKind::Ping, Duration::from_millis(10), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        timers.cancel_all();

        let counter = Arc::clone(&fired);
        timers.schedule(TimerKind::Ping, Duration::from_millis(10), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(timers.is_cancelled());
        assert!(!timers.is_scheduled(TimerKind::Ping));
    }
}
