//! Single scheduled task with cancel-on-reschedule semantics
//!
//! Every timer the scheduler arms goes through one [`ScheduledTask`]:
//! arming it again replaces the pending task, so at most one is ever armed.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug, Default)]
struct Slot {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct Inner {
    slot: Mutex<Slot>,
    deadline_tx: watch::Sender<Option<Instant>>,
}

impl Inner {
    /// Clear the slot if it still belongs to `generation`
    fn disarm(&self, generation: u64) {
        if let Ok(mut slot) = self.slot.lock() {
            if slot.generation == generation {
                slot.handle = None;
                self.deadline_tx.send_replace(None);
            }
        }
    }
}

/// A one-shot timer that can be re-armed or cancelled
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    inner: Arc<Inner>,
}

impl ScheduledTask {
    /// Create a disarmed task
    pub fn new() -> Self {
        let (deadline_tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(Slot::default()),
                deadline_tx,
            }),
        }
    }

    /// Run `action` after `delay`, replacing any pending task
    pub fn schedule<F>(&self, delay: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.schedule_with_wake(delay, std::future::pending::<()>(), action);
    }

    /// Like [`schedule`](Self::schedule), but `wake` completing first fires
    /// the task early. `delay` remains the upper bound.
    pub fn schedule_with_wake<W, F>(&self, delay: Duration, wake: W, action: F)
    where
        W: Future<Output = ()> + Send + 'static,
        F: Future<Output = ()> + Send + 'static,
    {
        let Ok(mut slot) = self.inner.slot.lock() else {
            return;
        };
        if let Some(previous) = slot.handle.take() {
            previous.abort();
        }
        slot.generation += 1;

        let generation = slot.generation;
        let deadline = Instant::now() + delay;
        let inner = Arc::clone(&self.inner);
        slot.handle = Some(tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => {}
                () = wake => {}
            }
            inner.disarm(generation);
            trace!("Scheduled task {} fired", generation);
            action.await;
        }));
        self.inner.deadline_tx.send_replace(Some(deadline));
    }

    /// Disarm the pending task; returns whether one was armed
    pub fn cancel(&self) -> bool {
        let Ok(mut slot) = self.inner.slot.lock() else {
            return false;
        };
        slot.generation += 1;
        let armed = slot.handle.take().map(|handle| handle.abort()).is_some();
        self.inner.deadline_tx.send_replace(None);
        armed
    }

    /// Whether a task is armed
    pub fn is_armed(&self) -> bool {
        self.deadline().is_some()
    }

    /// When the armed task fires
    pub fn deadline(&self) -> Option<Instant> {
        *self.inner.deadline_tx.borrow()
    }

    /// Observe the armed deadline
    pub fn subscribe(&self) -> watch::Receiver<Option<Instant>> {
        self.inner.deadline_tx.subscribe()
    }
}

impl Default for ScheduledTask {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> std::pin::Pin<Box<dyn Future<Output = ()> + Send>>) {
        let count = Arc::new(AtomicUsize::new(0));
        let handle = count.clone();
        let make = move || {
            let count = handle.clone();
            Box::pin(async move {
                count.fetch_add(1, Ordering::SeqCst);
            }) as std::pin::Pin<Box<dyn Future<Output = ()> + Send>>
        };
        (count, make)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_and_disarms() {
        let (count, make) = counter();
        let task = ScheduledTask::new();

        task.schedule(Duration::from_secs(5), make());
        assert!(task.is_armed());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!task.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_pending() {
        let (count, make) = counter();
        let task = ScheduledTask::new();

        task.schedule(Duration::from_secs(5), make());
        task.schedule(Duration::from_secs(10), make());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wake_fires_early() {
        let (count, make) = counter();
        let task = ScheduledTask::new();
        let (wake_tx, wake_rx) = tokio::sync::oneshot::channel::<()>();

        task.schedule_with_wake(
            Duration::from_secs(3600),
            async move {
                let _ = wake_rx.await;
            },
            make(),
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        wake_tx.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!task.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel() {
        let (count, make) = counter();
        let task = ScheduledTask::new();
        assert!(!task.cancel());

        task.schedule(Duration::from_secs(1), make());
        assert!(task.cancel());
        assert!(task.deadline().is_none());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
