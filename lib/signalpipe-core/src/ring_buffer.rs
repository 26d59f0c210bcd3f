use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use tokio::sync::Notify;

/// What `RingBuffer::write` does when the buffer is already at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Drop the oldest entry and always accept the new one.
    Overwrite,
    /// Wait up to a bound for room, then give up.
    Block { timeout: Duration },
}

/// Bounded FIFO mailbox shared by (possibly many) producers and a single
/// consumer (the engine's dispatcher).
///
/// Built on `crossbeam_queue::ArrayQueue` for the lock-free slot storage
/// (each individual push/pop is atomic) plus a small amount of
/// `parking_lot`-guarded cold state for the high-water callback and drop
/// counter — the same crates `lib/vector-buffers` reaches for to back its
/// own bounded channel.
pub struct RingBuffer<T> {
    queue: ArrayQueue<T>,
    policy: OverflowPolicy,
    dropped_total: AtomicU64,
    high_water_mark: usize,
    above_high_water: AtomicBool,
    on_high_water: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    not_full: Notify,
    not_empty: Notify,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Arc<Self> {
        Self::with_high_water_mark(capacity, policy, capacity)
    }

    pub fn with_high_water_mark(
        capacity: usize,
        policy: OverflowPolicy,
        high_water_mark: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue: ArrayQueue::new(capacity.max(1)),
            policy,
            dropped_total: AtomicU64::new(0),
            high_water_mark,
            above_high_water: AtomicBool::new(false),
            on_high_water: Mutex::new(None),
            not_full: Notify::new(),
            not_empty: Notify::new(),
        })
    }

    pub fn set_high_water_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.on_high_water.lock() = Some(Box::new(callback));
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    /// Synchronous write respecting the configured overflow policy.
    /// `Overwrite` always returns `true`; `Block` returns `false` if the
    /// timeout elapses without finding room. For async callers, prefer
    /// [`RingBuffer::write_async`].
    pub fn write(&self, item: T) -> bool {
        match self.policy {
            OverflowPolicy::Overwrite => {
                self.write_overwrite(item);
                true
            }
            OverflowPolicy::Block { timeout } => self.write_block_sync(item, timeout),
        }
    }

    /// Async write; only meaningfully different from [`RingBuffer::write`]
    /// under the `Block` policy, where it awaits room via a `Notify` rather
    /// than spin-waiting.
    pub async fn write_async(self: &Arc<Self>, mut item: T) -> bool {
        match self.policy {
            OverflowPolicy::Overwrite => {
                self.write_overwrite(item);
                true
            }
            OverflowPolicy::Block { timeout } => {
                let deadline = tokio::time::Instant::now() + timeout;
                loop {
                    match self.queue.push(item) {
                        Ok(()) => {
                            self.note_push();
                            return true;
                        }
                        Err(rejected) => {
                            item = rejected;
                            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                            if remaining.is_zero() {
                                return false;
                            }
                            let _ = tokio::time::timeout(remaining, self.not_full.notified()).await;
                        }
                    }
                }
            }
        }
    }

    fn write_overwrite(&self, mut item: T) {
        loop {
            match self.queue.push(item) {
                Ok(()) => {
                    self.note_push();
                    return;
                }
                Err(rejected) => {
                    item = rejected;
                    if self.queue.pop().is_some() {
                        self.dropped_total.fetch_add(1, Ordering::Relaxed);
                        metrics::counter!("signalpipe_ring_buffer_dropped_total").increment(1);
                        self.not_full.notify_one();
                    } else {
                        // Another producer drained concurrently; retry the push.
                        continue;
                    }
                }
            }
        }
    }

    fn write_block_sync(&self, mut item: T, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            match self.queue.push(item) {
                Ok(()) => {
                    self.note_push();
                    return true;
                }
                Err(rejected) => {
                    item = rejected;
                    if std::time::Instant::now() >= deadline {
                        return false;
                    }
                    std::thread::yield_now();
                }
            }
        }
    }

    fn note_push(&self) {
        self.not_empty.notify_one();
        let len = self.queue.len();
        if len >= self.high_water_mark {
            if !self.above_high_water.swap(true, Ordering::AcqRel) {
                tracing::debug!(len, high_water_mark = self.high_water_mark, "ring buffer crossed high water mark");
                if let Some(cb) = self.on_high_water.lock().as_ref() {
                    cb();
                }
            }
        } else {
            self.above_high_water.store(false, Ordering::Release);
        }
    }

    pub fn read(&self) -> Option<T> {
        let item = self.queue.pop();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    pub fn read_batch(&self, max: usize) -> Vec<T> {
        let mut out = Vec::with_capacity(max.min(self.queue.len()));
        while out.len() < max {
            match self.queue.pop() {
                Some(item) => out.push(item),
                None => break,
            }
        }
        if !out.is_empty() {
            self.not_full.notify_waiters();
        }
        out
    }
}
