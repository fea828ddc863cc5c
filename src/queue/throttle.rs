//! Producer-side backpressure on queue depth.
//!
//! The producer keeps the queue between `min_items` and `2 * min_items`
//! pending jobs. It enqueues freely while it has credit, and when the credit
//! runs out it waits for workers to drain the queue to `min_items` before
//! topping it back up to the maximum.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::queue::{JobQueue, QueueError};

/// Anything whose pending depth can be measured.
#[async_trait]
pub trait QueueDepth: Send + Sync {
    async fn depth(&self) -> Result<usize, QueueError>;
}

#[async_trait]
impl QueueDepth for JobQueue {
    async fn depth(&self) -> Result<usize, QueueError> {
        self.len().await
    }
}

/// Keeps a producer from flooding the queue.
pub struct QueueThrottle {
    queue: Arc<dyn QueueDepth>,
    poll_interval: Duration,
    min_items: usize,
    max_items: usize,
    // Jobs that may still be added before the depth is checked again.
    shortage: i64,
}

impl QueueThrottle {
    pub fn new(queue: Arc<dyn QueueDepth>, min_items: usize, poll_interval: Duration) -> Self {
        let min_items = min_items.max(1);
        Self {
            queue,
            poll_interval,
            min_items,
            max_items: min_items * 2,
            shortage: (min_items * 2) as i64,
        }
    }

    pub fn min_items(&self) -> usize {
        self.min_items
    }

    pub fn max_items(&self) -> usize {
        self.max_items
    }

    /// Call once before each enqueue. Returns immediately while credit
    /// remains, otherwise blocks until the queue has drained to `min_items`.
    pub async fn maybe_wait(&mut self) -> Result<(), QueueError> {
        self.shortage -= 1;
        if self.shortage > 0 {
            return Ok(());
        }

        loop {
            let depth = self.queue.depth().await?;
            if depth <= self.min_items {
                // This call's own job is part of the refill.
                self.shortage = (self.max_items as i64) - (depth as i64);
                debug!(depth, credit = self.shortage, "Queue drained, refilling");
                return Ok(());
            }
            debug!(
                depth,
                min_items = self.min_items,
                wait_ms = self.poll_interval.as_millis() as u64,
                "Queue above minimum, waiting"
            );
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Changes the bounds, e.g. after the set of active courts changed.
    ///
    /// Credit is recomputed against the current depth, so shrinking the
    /// bounds below the depth makes the next call wait.
    pub async fn update_min_items(&mut self, min_items: usize) -> Result<(), QueueError> {
        self.min_items = min_items.max(1);
        self.max_items = self.min_items * 2;
        let depth = self.queue.depth().await?;
        self.shortage = (self.max_items as i64) - (depth as i64);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeQueue {
        depth: AtomicUsize,
        polls: AtomicUsize,
    }

    impl FakeQueue {
        fn new(depth: usize) -> Arc<Self> {
            Arc::new(Self {
                depth: AtomicUsize::new(depth),
                polls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl QueueDepth for FakeQueue {
        async fn depth(&self) -> Result<usize, QueueError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            Ok(self.depth.load(Ordering::SeqCst))
        }
    }

    #[tokio::test]
    async fn test_initial_credit_is_max() {
        let fake = FakeQueue::new(0);
        let mut throttle = QueueThrottle::new(fake.clone(), 3, Duration::from_secs(5));
        assert_eq!(throttle.max_items(), 6);

        for _ in 0..5 {
            throttle.maybe_wait().await.unwrap();
        }
        assert_eq!(fake.polls.load(Ordering::SeqCst), 0);

        // Sixth call exhausts the credit and checks the depth.
        throttle.maybe_wait().await.unwrap();
        assert_eq!(fake.polls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_until_drained_to_min() {
        let fake = FakeQueue::new(6);
        let mut throttle = QueueThrottle::new(fake.clone(), 3, Duration::from_secs(5));
        throttle.update_min_items(3).await.unwrap();

        let drainer = {
            let fake = fake.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(12)).await;
                fake.depth.store(3, Ordering::SeqCst);
            })
        };

        let started = tokio::time::Instant::now();
        throttle.maybe_wait().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(12));
        // Polls at 0s, 5s, 10s and 15s.
        assert!(fake.polls.load(Ordering::SeqCst) >= 4);
        drainer.await.unwrap();
    }

    #[tokio::test]
    async fn test_refill_credit_tops_up_to_max() {
        let fake = FakeQueue::new(4);
        let mut throttle = QueueThrottle::new(fake.clone(), 4, Duration::from_millis(10));
        throttle.update_min_items(4).await.unwrap();
        assert_eq!(throttle.max_items(), 8);

        // Credit is 8 - 4; the last of those calls re-checks.
        for _ in 0..4 {
            throttle.maybe_wait().await.unwrap();
        }
        assert_eq!(fake.polls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_zero_min_items_is_clamped() {
        let fake = FakeQueue::new(0);
        let mut throttle = QueueThrottle::new(fake, 0, Duration::from_millis(10));
        assert_eq!(throttle.min_items(), 1);
        throttle.maybe_wait().await.unwrap();
    }
}
