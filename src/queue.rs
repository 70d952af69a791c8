//! Bounded MPMC queues between the pipeline stages.
//!
//! Each inter-stage queue has an explicit overflow policy: drop the oldest
//! item (frame-rate stages), block the producer for a bounded time and then
//! drop the newest (segment-rate stages), or block outright (the output
//! queue, where the subscriber contract caps the stall).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;

/// Point-in-time occupancy of one queue.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueDepth {
    pub len: usize,
    pub capacity: usize,
}

impl QueueDepth {
    pub fn ratio(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.len as f64 / self.capacity as f64
        }
    }

    /// Warning watermark: more than 60 % full.
    pub fn is_warning(&self) -> bool {
        self.ratio() > 0.60
    }

    /// Critical watermark: more than 90 % full.
    pub fn is_critical(&self) -> bool {
        self.ratio() > 0.90
    }
}

struct QueueInner<T> {
    items: VecDeque<T>,
    closed: bool,
}

pub struct BoundedQueue<T> {
    inner: Mutex<QueueInner<T>>,
    capacity: usize,
    item_available: Notify,
    space_available: Notify,
    dropped: AtomicU64,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            capacity: capacity.max(1),
            item_available: Notify::new(),
            space_available: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Non-blocking push. On a full queue the item is handed back.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        {
            let mut inner = self.inner.lock();
            if inner.closed || inner.items.len() >= self.capacity {
                return Err(item);
            }
            inner.items.push_back(item);
        }
        self.item_available.notify_one();
        Ok(())
    }

    /// Push that evicts the oldest item when full. Returns `true` on eviction.
    pub fn push_drop_oldest(&self, item: T) -> bool {
        let evicted = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return false;
            }
            let evicted = if inner.items.len() >= self.capacity {
                inner.items.pop_front();
                true
            } else {
                false
            };
            inner.items.push_back(item);
            evicted
        };
        if evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.item_available.notify_one();
        evicted
    }

    /// Push, waiting up to `timeout` for space. The item comes back in `Err`
    /// when the wait expires or the queue is closed.
    pub async fn push_timeout(&self, mut item: T, timeout: Duration) -> Result<(), T> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.try_push(item) {
                Ok(()) => return Ok(()),
                Err(rejected) => {
                    if self.is_closed() {
                        return Err(rejected);
                    }
                    item = rejected;
                }
            }
            if tokio::time::timeout_at(deadline, self.space_available.notified())
                .await
                .is_err()
            {
                return Err(item);
            }
        }
    }

    /// Push, waiting indefinitely for space. Fails only on a closed queue.
    pub async fn push(&self, mut item: T) -> Result<(), T> {
        loop {
            match self.try_push(item) {
                Ok(()) => return Ok(()),
                Err(rejected) => {
                    if self.is_closed() {
                        return Err(rejected);
                    }
                    item = rejected;
                }
            }
            self.space_available.notified().await;
        }
    }

    /// Pop, waiting until an item arrives or the queue is closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(item) = inner.items.pop_front() {
                    drop(inner);
                    self.space_available.notify_one();
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            self.item_available.notified().await;
        }
    }

    /// Pop with a deadline. `None` on timeout or closed-and-drained.
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(item) = inner.items.pop_front() {
                    drop(inner);
                    self.space_available.notify_one();
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            if tokio::time::timeout_at(deadline, self.item_available.notified())
                .await
                .is_err()
            {
                return None;
            }
        }
    }

    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.item_available.notify_waiters();
        self.space_available.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn depth(&self) -> QueueDepth {
        QueueDepth {
            len: self.inner.lock().items.len(),
            capacity: self.capacity,
        }
    }

    /// Items evicted by `push_drop_oldest`.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn fifo_order_is_preserved() {
        let q = BoundedQueue::new(4);
        for i in 0..4 {
            q.try_push(i).unwrap();
        }
        for i in 0..4 {
            assert_eq!(q.pop().await, Some(i));
        }
    }

    #[tokio::test]
    async fn try_push_rejects_when_full() {
        let q = BoundedQueue::new(1);
        q.try_push(1).unwrap();
        assert_eq!(q.try_push(2), Err(2));
    }

    #[tokio::test]
    async fn push_timeout_gives_item_back() {
        let q = BoundedQueue::new(1);
        q.try_push(1).unwrap();
        let rejected = q.push_timeout(2, Duration::from_millis(20)).await;
        assert_eq!(rejected, Err(2));
    }

    #[tokio::test]
    async fn blocked_push_resumes_after_pop() {
        let q = Arc::new(BoundedQueue::new(1));
        q.try_push(1).unwrap();

        let producer = {
            let q = q.clone();
            tokio::spawn(async move { q.push(2).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(q.pop().await, Some(1));
        producer.await.unwrap().unwrap();
        assert_eq!(q.pop().await, Some(2));
    }

    #[tokio::test]
    async fn watermarks() {
        let q = BoundedQueue::new(10);
        for i in 0..7 {
            q.try_push(i).unwrap();
        }
        let depth = q.depth();
        assert!(depth.is_warning());
        assert!(!depth.is_critical());
    }

    #[tokio::test]
    async fn pop_returns_none_after_close_and_drain() {
        let q = BoundedQueue::new(2);
        q.try_push(7).unwrap();
        q.close();
        assert_eq!(q.pop().await, Some(7));
        assert_eq!(q.pop().await, None);
    }
}
