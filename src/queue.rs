use std::future::Future;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// FIFO admission control bounding concurrently running tasks.
///
/// Tasks start in submission order; completion order is unconstrained.
/// A slot is returned when its task settles or when the future driving it
/// is dropped, so cancelling one request never stalls the others.
#[derive(Clone, Debug)]
pub struct RequestQueue {
    inner: Arc<QueueInner>,
}

#[derive(Debug)]
struct QueueInner {
    permits: Arc<Semaphore>,
    limits: Mutex<Limits>,
    waiting: AtomicUsize,
}

#[derive(Debug)]
struct Limits {
    max_concurrent: usize,
    /// Permits still held by running tasks that must be forgotten on
    /// release after the limit was lowered.
    to_forget: usize,
}

/// Permission to run one task. Dropping it frees the slot.
#[derive(Debug)]
struct Slot {
    permit: Option<OwnedSemaphorePermit>,
    inner: Arc<QueueInner>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        let Some(permit) = self.permit.take() else {
            return;
        };
        let mut limits = self.inner.limits();
        if limits.to_forget > 0 {
            limits.to_forget -= 1;
            permit.forget();
        }
    }
}

/// Counts a caller parked on the semaphore until it is admitted or dropped.
struct Waiting<'a>(&'a AtomicUsize);

impl<'a> Waiting<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RequestQueue {
    /// Bound used by [`RequestQueue::default`].
    pub const DEFAULT_MAX_CONCURRENT: usize = 6;

    /// Creates a queue admitting at most `max_concurrent` tasks at once.
    ///
    /// A limit of zero is raised to one.
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = clamp_limit(max_concurrent);
        Self {
            inner: Arc::new(QueueInner {
                permits: Arc::new(Semaphore::new(max_concurrent)),
                limits: Mutex::new(Limits {
                    max_concurrent,
                    to_forget: 0,
                }),
                waiting: AtomicUsize::new(0),
            }),
        }
    }

    /// Waits for a free slot, then runs `task` to completion while holding it.
    pub async fn add<F, Fut, T>(&self, task: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _slot = self.acquire().await;
        task().await
    }

    /// Changes the concurrency bound.
    ///
    /// Raising it admits queued tasks right away. Lowering it never
    /// interrupts running tasks; their slots are retired as they finish.
    pub fn set_max_concurrent(&self, max_concurrent: usize) {
        let max_concurrent = clamp_limit(max_concurrent);
        let mut limits = self.inner.limits();
        let current = limits.max_concurrent;
        limits.max_concurrent = max_concurrent;

        if max_concurrent > current {
            let mut extra = max_concurrent - current;
            let reclaimed = extra.min(limits.to_forget);
            limits.to_forget -= reclaimed;
            extra -= reclaimed;
            self.inner.permits.add_permits(extra);
        } else if max_concurrent < current {
            let surplus = current - max_concurrent;
            let forgotten = self.inner.permits.forget_permits(surplus);
            limits.to_forget += surplus - forgotten;
        }
    }

    /// Number of tasks waiting for a slot.
    pub fn queue_size(&self) -> usize {
        self.inner.waiting.load(Ordering::SeqCst)
    }

    /// Number of tasks currently holding a slot.
    pub fn running_count(&self) -> usize {
        let limits = self.inner.limits();
        (limits.max_concurrent + limits.to_forget)
            .saturating_sub(self.inner.permits.available_permits())
    }

    async fn acquire(&self) -> Slot {
        let permits = Arc::clone(&self.inner.permits);
        let permit = match Arc::clone(&permits).try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(_) => {
                let _waiting = Waiting::enter(&self.inner.waiting);
                // The semaphore is never closed.
                permits.acquire_owned().await.ok()
            }
        };
        Slot {
            permit,
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_CONCURRENT)
    }
}

impl QueueInner {
    fn limits(&self) -> MutexGuard<'_, Limits> {
        self.limits.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn clamp_limit(max_concurrent: usize) -> usize {
    max_concurrent.clamp(1, Semaphore::MAX_PERMITS)
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };
    use std::time::Duration;

    use tokio::sync::Semaphore;

    use super::RequestQueue;

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn never_exceeds_max_concurrent() {
        let queue = RequestQueue::new(2);
        let gate = Arc::new(Semaphore::new(0));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let queue = queue.clone();
            let gate = Arc::clone(&gate);
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                queue
                    .add(|| async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        gate.acquire().await.expect("gate must stay open").forget();
                        active.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await;
            }));
        }

        settle().await;
        assert_eq!(queue.running_count(), 2);
        assert_eq!(queue.queue_size(), 4);

        for _ in 0..6 {
            gate.add_permits(1);
            settle().await;
            assert!(queue.running_count() <= 2);
        }
        for handle in handles {
            handle.await.expect("task must finish");
        }

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(queue.running_count(), 0);
        assert_eq!(queue.queue_size(), 0);
    }

    #[tokio::test]
    async fn starts_tasks_in_submission_order() {
        let queue = RequestQueue::new(1);
        let started = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for id in 0..5 {
            let queue = queue.clone();
            let started = Arc::clone(&started);
            handles.push(tokio::spawn(async move {
                queue
                    .add(|| async move {
                        started.lock().expect("log mutex").push(id);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    })
                    .await;
            }));
            settle().await;
        }
        for handle in handles {
            handle.await.expect("task must finish");
        }

        assert_eq!(*started.lock().expect("log mutex"), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn failing_task_does_not_block_siblings() {
        let queue = RequestQueue::new(1);
        let failed: Result<(), &str> = queue.add(|| async { Err("boom") }).await;
        let ok: Result<u32, &str> = queue.add(|| async { Ok(7) }).await;

        assert_eq!(failed, Err("boom"));
        assert_eq!(ok, Ok(7));
        assert_eq!(queue.running_count(), 0);
    }

    #[tokio::test]
    async fn aborting_a_running_task_frees_its_slot() {
        let queue = RequestQueue::new(1);

        let stuck = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue.add(|| std::future::pending::<()>()).await;
            })
        };
        settle().await;
        assert_eq!(queue.running_count(), 1);

        let waiting = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.add(|| async { 42 }).await })
        };
        settle().await;
        assert_eq!(queue.queue_size(), 1);

        stuck.abort();
        assert_eq!(waiting.await.expect("queued task must run"), 42);
        assert_eq!(queue.running_count(), 0);
    }

    #[tokio::test]
    async fn abandoned_waiter_is_skipped() {
        let queue = RequestQueue::new(1);
        let gate = Arc::new(Semaphore::new(0));

        let holder = {
            let queue = queue.clone();
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                queue
                    .add(|| async move {
                        gate.acquire().await.expect("gate must stay open").forget();
                    })
                    .await;
            })
        };
        settle().await;

        let abandoned = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.add(|| async {}).await })
        };
        settle().await;
        abandoned.abort();
        settle().await;
        assert_eq!(queue.queue_size(), 0);

        let next = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.add(|| async { "ran" }).await })
        };
        settle().await;

        gate.add_permits(1);
        holder.await.expect("holder must finish");
        assert_eq!(next.await.expect("next must run"), "ran");
        assert_eq!(queue.running_count(), 0);
    }

    #[tokio::test]
    async fn raising_the_limit_drains_waiters() {
        let queue = RequestQueue::new(1);
        let gate = Arc::new(Semaphore::new(0));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let queue = queue.clone();
            let gate = Arc::clone(&gate);
            handles.push(tokio::spawn(async move {
                queue
                    .add(|| async move {
                        gate.acquire().await.expect("gate must stay open").forget();
                    })
                    .await;
            }));
        }
        settle().await;
        assert_eq!(queue.running_count(), 1);

        queue.set_max_concurrent(3);
        settle().await;
        assert_eq!(queue.running_count(), 3);
        assert_eq!(queue.queue_size(), 0);

        gate.add_permits(3);
        for handle in handles {
            handle.await.expect("task must finish");
        }
    }

    #[tokio::test]
    async fn lowering_the_limit_retires_slots_as_tasks_finish() {
        let queue = RequestQueue::new(3);
        let gate = Arc::new(Semaphore::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            let gate = Arc::clone(&gate);
            handles.push(tokio::spawn(async move {
                queue
                    .add(|| async move {
                        gate.acquire().await.expect("gate must stay open").forget();
                    })
                    .await;
            }));
        }
        settle().await;
        assert_eq!(queue.running_count(), 3);
        assert_eq!(queue.queue_size(), 1);

        queue.set_max_concurrent(1);
        assert_eq!(queue.running_count(), 3);

        gate.add_permits(2);
        settle().await;
        assert_eq!(queue.running_count(), 1);
        assert_eq!(queue.queue_size(), 1);

        gate.add_permits(2);
        for handle in handles {
            handle.await.expect("task must finish");
        }
        assert_eq!(queue.running_count(), 0);
        assert_eq!(queue.queue_size(), 0);
    }
}
