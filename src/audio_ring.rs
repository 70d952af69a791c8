//! Lossless hand-off between the capture callback and the VAD task.
//!
//! The producer side must be real-time safe: `push` takes one short lock,
//! never blocks and never allocates beyond the frame it was given. When the
//! ring is full the oldest frame is evicted and counted; the capture callback
//! is never the one to wait.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;

/// A fixed-duration block of mono 16 kHz PCM. Immutable after creation;
/// segments retain frames by cloning the `Arc`'d sample storage.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: std::sync::Arc<[f32]>,
    /// Index of the first sample in the capture stream.
    pub first_sample: u64,
    /// Wall-clock capture time of the first sample.
    pub capture_time: DateTime<Utc>,
    /// Root-mean-square level, computed once at creation.
    pub rms: f32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, first_sample: u64, capture_time: DateTime<Utc>) -> Self {
        let rms = if samples.is_empty() {
            0.0
        } else {
            let energy: f32 = samples.iter().map(|s| s * s).sum();
            (energy / samples.len() as f32).sqrt()
        };
        Self {
            samples: samples.into(),
            first_sample,
            capture_time,
            rms,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_ms(&self, sample_rate: u32) -> u64 {
        (self.samples.len() as u64 * 1000) / sample_rate as u64
    }
}

/// What flows through the ring. A `Reset` marks a capture gap; the VAD and
/// segmentation stages flush the current utterance when they see one.
#[derive(Debug, Clone)]
pub enum CaptureItem {
    Frame(AudioFrame),
    Reset {
        expected_sample: u64,
        received_sample: u64,
    },
}

struct RingInner {
    items: VecDeque<CaptureItem>,
    closed: bool,
}

/// Single-producer/single-consumer bounded frame queue with drop-oldest
/// overflow.
pub struct FrameRing {
    inner: Mutex<RingInner>,
    capacity: usize,
    available: Notify,
    dropped: AtomicU64,
}

impl FrameRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(RingInner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            capacity: capacity.max(1),
            available: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Push from the capture side. Never blocks; evicts the oldest frame when
    /// full and returns `true` if an eviction happened. Reset markers are
    /// never the eviction victim.
    pub fn push(&self, item: CaptureItem) -> bool {
        let evicted = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return false;
            }
            let evicted = if inner.items.len() >= self.capacity {
                let victim = inner
                    .items
                    .iter()
                    .position(|i| matches!(i, CaptureItem::Frame(_)));
                match victim {
                    Some(index) => {
                        inner.items.remove(index);
                        true
                    }
                    None => false,
                }
            } else {
                false
            };
            inner.items.push_back(item);
            evicted
        };
        if evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.available.notify_one();
        evicted
    }

    /// Pop from the VAD side, waiting up to `timeout`. Returns `None` on
    /// timeout or when the ring is closed and drained.
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<CaptureItem> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(item) = inner.items.pop_front() {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            if tokio::time::timeout_at(deadline, self.available.notified())
                .await
                .is_err()
            {
                return None;
            }
        }
    }

    /// Close the ring; pending items remain poppable.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.available.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total frames evicted because the consumer fell behind.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
