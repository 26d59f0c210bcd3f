use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use signalpipe_core::LogRecord;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::backoff::Backoff;
use crate::error::Result;
use crate::sink::{Sink, SinkCommon, SinkStats};

/// Outcome of one attempt to send a batch, per the sink contract's response
/// classification hook (§4.6c).
pub enum SendOutcome {
    Ok,
    Retriable(String),
    NonRetriable(String),
}

/// The pluggable half of an `HTTPBatchSink`: everything specific to a given
/// remote service (body shape, auth, response parsing, side effects such as
/// a new CloudWatch sequence token) lives behind this trait; the batching,
/// timer, queue-capping, and backoff scaffolding is shared.
#[async_trait]
pub trait BatchTransport: Send + Sync + 'static {
    fn serialize_batch(&self, records: &[Arc<LogRecord>]) -> Result<Vec<u8>>;

    async fn send_batch(&self, body: Vec<u8>, records: &[Arc<LogRecord>]) -> SendOutcome;

    /// Per-batch byte cap; oversized bodies are split before sending.
    fn max_body_bytes(&self) -> usize {
        1_000_000
    }
}

/// Generic batching + timer + backoff + retry scaffolding shared by every
/// cloud sink (§4.6). Concrete sinks supply a [`BatchTransport`] and embed
/// this struct rather than re-implementing the state machine.
pub struct HttpBatchSink<T: BatchTransport> {
    name: String,
    transport: Arc<T>,
    common: Arc<SinkCommon>,
    pending: Arc<Mutex<VecDeque<Arc<LogRecord>>>>,
    batch_size: usize,
    queue_cap: usize,
    notify: Arc<Notify>,
    closing: Arc<AtomicBool>,
    attempt: Arc<AtomicU32>,
    backoff: Backoff,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: BatchTransport> HttpBatchSink<T> {
    pub fn new(
        name: impl Into<String>,
        transport: T,
        batch_size: usize,
        batch_interval: Duration,
        backoff: Backoff,
    ) -> Arc<Self> {
        let common = Arc::new(SinkCommon::default());
        common.mark_active();
        let pending = Arc::new(Mutex::new(VecDeque::new()));
        let notify = Arc::new(Notify::new());
        let closing = Arc::new(AtomicBool::new(false));
        let attempt = Arc::new(AtomicU32::new(0));

        let sink = Arc::new(Self {
            name: name.into(),
            transport: Arc::new(transport),
            common,
            pending,
            batch_size,
            queue_cap: batch_size * 3,
            notify,
            closing,
            attempt,
            backoff,
            worker: Mutex::new(None),
        });

        let handle = tokio::spawn(Self::worker_loop(sink.clone(), batch_interval));
        *sink.worker.lock() = Some(handle);
        sink
    }

    async fn worker_loop(sink: Arc<Self>, batch_interval: Duration) {
        loop {
            if !sink.common.is_healthy() {
                let dropped = {
                    let mut pending = sink.pending.lock();
                    let n = pending.len() as u64;
                    pending.clear();
                    n
                };
                if dropped > 0 {
                    sink.common.record_dropped(dropped);
                }
                if sink.closing.load(Ordering::Acquire) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(batch_interval) => {}
                _ = sink.notify.notified() => {}
            }

            let batch: Vec<Arc<LogRecord>> = {
                let mut pending = sink.pending.lock();
                let take = pending.len().min(sink.batch_size);
                pending.drain(..take).collect()
            };

            if batch.is_empty() {
                if sink.closing.load(Ordering::Acquire) && sink.pending.lock().is_empty() {
                    return;
                }
                continue;
            }

            if !sink.common.try_begin_send() {
                let mut pending = sink.pending.lock();
                for record in batch.into_iter().rev() {
                    pending.push_front(record);
                }
                continue;
            }

            sink.send_with_splitting(batch).await;
        }
    }

    async fn send_with_splitting(self: &Arc<Self>, batch: Vec<Arc<LogRecord>>) {
        let body = match self.transport.serialize_batch(&batch) {
            Ok(body) => body,
            Err(e) => {
                self.common.record_error(e.to_string());
                self.common.record_dropped(batch.len() as u64);
                self.common.end_send_retry();
                return;
            }
        };

        if body.len() > self.transport.max_body_bytes() && batch.len() > 1 {
            let mid = batch.len() / 2;
            let (left, right) = batch.split_at(mid);
            self.send_with_splitting(left.to_vec()).await;
            self.send_with_splitting(right.to_vec()).await;
            return;
        }

        match self.transport.send_batch(body, &batch).await {
            SendOutcome::Ok => {
                self.attempt.store(0, Ordering::Relaxed);
                self.common.end_send_ok();
            }
            SendOutcome::NonRetriable(message) => {
                self.common.record_error(message);
                self.common.record_dropped(batch.len() as u64);
                self.common.mark_dead("non-retriable transport error");
            }
            SendOutcome::Retriable(message) => {
                self.common.record_error(message);
                let attempt = self.attempt.fetch_add(1, Ordering::Relaxed) + 1;
                if self.backoff.exhausted(attempt) {
                    tracing::error!(sink = %self.name, attempt, "retries exhausted, dropping batch");
                    self.common.record_dropped(batch.len() as u64);
                    self.common.mark_dead("retries exhausted");
                    self.attempt.store(0, Ordering::Relaxed);
                    return;
                }
                let delay = self.backoff.delay(attempt);
                tracing::debug!(sink = %self.name, attempt, delay_ms = delay.as_millis() as u64, "retrying batch after backoff");
                self.requeue_head(batch);
                self.common.end_send_retry();
                tokio::time::sleep(delay).await;
            }
        }
    }

    fn requeue_head(&self, batch: Vec<Arc<LogRecord>>) {
        let mut pending = self.pending.lock();
        let remaining_capacity = self.queue_cap.saturating_sub(pending.len());
        let requeue_count = batch.len().min(500).min(remaining_capacity);
        let dropped = (batch.len() - requeue_count) as u64;
        for record in batch.into_iter().take(requeue_count).rev() {
            pending.push_front(record);
        }
        if dropped > 0 {
            self.common.record_dropped(dropped);
        }
    }
}

#[async_trait]
impl<T: BatchTransport> Sink for HttpBatchSink<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&self, record: Arc<LogRecord>) -> Result<()> {
        if !self.common.is_healthy() {
            self.common.record_dropped(1);
            return Ok(());
        }
        let mut pending = self.pending.lock();
        if pending.len() >= self.queue_cap {
            pending.pop_front();
            self.common.record_dropped(1);
        }
        pending.push_back(record);
        let reached_batch = pending.len() >= self.batch_size;
        drop(pending);
        if reached_batch {
            self.notify.notify_one();
        }
        Ok(())
    }

    fn healthy(&self) -> bool {
        self.common.is_healthy()
    }

    fn stats(&self) -> SinkStats {
        self.common.snapshot(self.pending.lock().len())
    }

    async fn close(&self) -> Result<()> {
        self.closing.store(true, Ordering::Release);
        self.notify.notify_one();
        if let Some(handle) = self.worker.lock().take() {
            let _ = tokio::time::timeout(Duration::from_secs(30), handle).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signalpipe_core::{HostMetadata, Level};
    use std::sync::atomic::AtomicUsize;

    struct CountingTransport {
        sent_batches: Arc<AtomicUsize>,
        fail_first_n: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BatchTransport for CountingTransport {
        fn serialize_batch(&self, records: &[Arc<LogRecord>]) -> Result<Vec<u8>> {
            Ok(vec![records.len() as u8])
        }

        async fn send_batch(&self, _body: Vec<u8>, _records: &[Arc<LogRecord>]) -> SendOutcome {
            if self.fail_first_n.load(Ordering::Relaxed) > 0 {
                self.fail_first_n.fetch_sub(1, Ordering::Relaxed);
                return SendOutcome::Retriable("simulated throttle".to_string());
            }
            self.sent_batches.fetch_add(1, Ordering::Relaxed);
            SendOutcome::Ok
        }
    }

    fn record() -> Arc<LogRecord> {
        Arc::new(LogRecord::new(Level::Info, 0, HostMetadata::current("test")))
    }

    #[tokio::test]
    async fn batch_flushes_on_size_threshold() {
        let sent = Arc::new(AtomicUsize::new(0));
        let transport = CountingTransport {
            sent_batches: sent.clone(),
            fail_first_n: Arc::new(AtomicUsize::new(0)),
        };
        let sink = HttpBatchSink::new(
            "test",
            transport,
            4,
            Duration::from_secs(60),
            Backoff::default(),
        );
        for _ in 0..4 {
            sink.write(record()).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sent.load(Ordering::Relaxed), 1);
        sink.close().await.unwrap();
    }

    #[tokio::test]
    async fn sink_dies_after_exhausting_retries_on_retriable_errors() {
        let sent = Arc::new(AtomicUsize::new(0));
        let transport = CountingTransport {
            sent_batches: sent.clone(),
            fail_first_n: Arc::new(AtomicUsize::new(100)),
        };
        let backoff = Backoff {
            base: Duration::from_millis(1),
            max: Duration::from_millis(5),
            max_attempts: 2,
        };
        let sink = HttpBatchSink::new("test", transport, 1, Duration::from_millis(5), backoff);
        sink.write(record()).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!sink.healthy());
        assert_eq!(sink.stats().dropped_total, 1);
        sink.close().await.unwrap();
    }
}
