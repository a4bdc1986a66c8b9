//! In-memory priority queue of jobs that are ready to run.
//!
//! The durable store stays the source of truth; this queue only accelerates
//! dispatch and can be rebuilt from pending jobs at any time.

use jobforge_core::{Error, Job, Result};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::pin::pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// How long an empty `dequeue` waits before reporting empty.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_millis(100);

/// Heap entry. Pops by priority, then creation time, then insertion order.
#[derive(Debug)]
struct Entry {
    job: Job,
    seq: u64,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.job
            .priority
            .cmp(&other.job.priority)
            .then_with(|| other.job.created_at.cmp(&self.job.created_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

#[derive(Debug, Default)]
struct Inner {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

/// Thread-safe priority queue shared by the scheduler, the engine and the
/// workers.
#[derive(Debug)]
pub struct PriorityQueue {
    inner: Mutex<Inner>,
    available: Notify,
    wait_timeout: Duration,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::with_wait_timeout(DEFAULT_WAIT_TIMEOUT)
    }

    pub fn with_wait_timeout(wait_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            available: Notify::new(),
            wait_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // The heap is never left half-updated, so a poisoned lock is still usable.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a job. Never rejects.
    pub fn enqueue(&self, job: Job) {
        {
            let mut inner = self.lock();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.heap.push(Entry { job, seq });
        }
        self.available.notify_one();
    }

    /// Put a job back after a retryable failure.
    pub fn requeue(&self, job: Job) {
        self.enqueue(job);
    }

    /// Pop the highest-priority job without waiting.
    pub fn try_dequeue(&self) -> Option<Job> {
        self.lock().heap.pop().map(|entry| entry.job)
    }

    /// Pop the highest-priority job, waiting up to the queue's wait timeout
    /// when it is empty.
    ///
    /// Returns `Ok(None)` when nothing arrived in time and
    /// `Err(Error::Cancelled)` as soon as `cancel` fires.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Result<Option<Job>> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        // Register for wakeups before checking, so an enqueue racing with
        // this call is not missed.
        let mut notified = pin!(self.available.notified());
        notified.as_mut().enable();

        if let Some(job) = self.try_dequeue() {
            return Ok(Some(job));
        }

        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = &mut notified => Ok(self.try_dequeue()),
            _ = tokio::time::sleep(self.wait_timeout) => Ok(self.try_dequeue()),
        }
    }

    pub fn size(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn clear(&self) {
        self.lock().heap.clear();
    }
}

impl Default for PriorityQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration as ChronoDuration, Utc};
    use jobforge_core::{JobOptions, Payload, Priority};
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Instant;

    fn job(priority: Priority, created_at: DateTime<Utc>) -> Job {
        Job::new(
            "test",
            Payload::new(),
            &JobOptions::new().priority(priority),
            created_at,
        )
        .unwrap()
    }

    #[test]
    fn test_priority_then_fifo_order() {
        let queue = PriorityQueue::new();
        let base = Utc::now();
        let priorities = [
            Priority::Low,
            Priority::Urgent,
            Priority::Normal,
            Priority::High,
            Priority::Normal,
            Priority::Low,
            Priority::Urgent,
            Priority::High,
        ];
        for (i, priority) in priorities.iter().enumerate() {
            queue.enqueue(job(*priority, base + ChronoDuration::milliseconds(i as i64)));
        }
        assert_eq!(queue.size(), priorities.len());

        let mut popped = Vec::new();
        while let Some(job) = queue.try_dequeue() {
            popped.push(job);
        }

        for pair in popped.windows(2) {
            assert!(pair[0].priority >= pair[1].priority);
            if pair[0].priority == pair[1].priority {
                assert!(pair[0].created_at <= pair[1].created_at);
            }
        }
        assert_eq!(popped[0].priority, Priority::Urgent);
        assert_eq!(popped.last().unwrap().priority, Priority::Low);
    }

    #[test]
    fn test_older_job_wins_even_when_enqueued_later() {
        let queue = PriorityQueue::new();
        let base = Utc::now();
        let newer = job(Priority::Normal, base + ChronoDuration::seconds(5));
        let older = job(Priority::Normal, base);
        queue.enqueue(newer.clone());
        queue.enqueue(older.clone());

        assert_eq!(queue.try_dequeue().unwrap().id, older.id);
        assert_eq!(queue.try_dequeue().unwrap().id, newer.id);
    }

    #[test]
    fn test_equal_timestamps_keep_insertion_order() {
        let queue = PriorityQueue::new();
        let at = Utc::now();
        let ids: Vec<_> = (0..5)
            .map(|_| {
                let j = job(Priority::High, at);
                let id = j.id;
                queue.enqueue(j);
                id
            })
            .collect();

        let popped: Vec<_> = std::iter::from_fn(|| queue.try_dequeue())
            .map(|j| j.id)
            .collect();
        assert_eq!(popped, ids);
    }

    #[test]
    fn test_clear() {
        let queue = PriorityQueue::new();
        queue.enqueue(job(Priority::Normal, Utc::now()));
        queue.requeue(job(Priority::Normal, Utc::now()));
        assert_eq!(queue.size(), 2);
        queue.clear();
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_empty_dequeue_times_out() {
        let queue = PriorityQueue::with_wait_timeout(Duration::from_millis(20));
        let cancel = CancellationToken::new();

        let started = Instant::now();
        let result = queue.dequeue(&cancel).await.unwrap();
        assert!(result.is_none());
        assert!(started.elapsed() >= Duration::from_millis(15));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_cancelled_dequeue() {
        let queue = PriorityQueue::with_wait_timeout(Duration::from_secs(30));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            queue.dequeue(&cancel).await,
            Err(Error::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_wait() {
        let queue = Arc::new(PriorityQueue::with_wait_timeout(Duration::from_secs(30)));
        let cancel = CancellationToken::new();

        let waiter = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.dequeue(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let started = Instant::now();
        cancel.cancel();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_enqueue_wakes_waiter() {
        let queue = Arc::new(PriorityQueue::with_wait_timeout(Duration::from_secs(30)));
        let cancel = CancellationToken::new();

        let waiter = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.dequeue(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let started = Instant::now();
        let expected = job(Priority::Normal, Utc::now());
        queue.enqueue(expected.clone());

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.map(|j| j.id), Some(expected.id));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_dequeue_delivers_each_job_once() {
        const JOBS: usize = 500;
        const CONSUMERS: usize = 8;

        let queue = Arc::new(PriorityQueue::with_wait_timeout(Duration::from_millis(10)));
        let mut expected = HashSet::new();
        for _ in 0..JOBS {
            let j = job(Priority::Normal, Utc::now());
            expected.insert(j.id);
            queue.enqueue(j);
        }

        let cancel = CancellationToken::new();
        let consumers: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                let queue = queue.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let mut seen = Vec::new();
                    while let Ok(Some(job)) = queue.dequeue(&cancel).await {
                        seen.push(job.id);
                        tokio::task::yield_now().await;
                    }
                    seen
                })
            })
            .collect();

        let mut delivered = Vec::new();
        for consumer in consumers {
            delivered.extend(consumer.await.unwrap());
        }

        assert_eq!(delivered.len(), JOBS);
        let unique: HashSet<_> = delivered.into_iter().collect();
        assert_eq!(unique, expected);
        assert!(queue.is_empty());
    }
}
