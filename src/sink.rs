use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use signalpipe_core::LogRecord;

use crate::error::Result;

/// Point-in-time snapshot exposed by `Sink::stats`.
#[derive(Debug, Clone)]
pub struct SinkStats {
    pub queue_depth: usize,
    pub in_flight: bool,
    pub dropped_total: u64,
    pub batches_sent_total: u64,
    pub last_error: Option<String>,
    pub healthy: bool,
}

/// Every output implements this contract (spec §4.5). Fan-out from the
/// engine calls `write`/`write_batch`; these only enqueue onto the sink's
/// own internal batcher and must not block on network I/O, which is why
/// they are plain synchronous methods even though the sink's background
/// worker is async. `close` is the one method that genuinely waits on
/// in-flight network work, hence `async_trait`.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    fn write(&self, record: Arc<LogRecord>) -> Result<()>;

    fn write_batch(&self, records: &[Arc<LogRecord>]) -> Result<()> {
        for record in records {
            self.write(record.clone())?;
        }
        Ok(())
    }

    fn healthy(&self) -> bool;

    fn stats(&self) -> SinkStats;

    async fn close(&self) -> Result<()>;
}

/// The state machine from spec §4.5, realized as a plain enum rather than a
/// class hierarchy (DESIGN NOTES: "inheritance → interface + composition").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkPhase {
    Init,
    Active,
    Sending,
    Backoff,
    Dead,
}

/// Shared bookkeeping every concrete sink composes rather than inherits:
/// active/in-flight flags, counters, and the last observed error. Cloud and
/// file sinks embed one of these; `ConsoleSink` is simple enough to track
/// its own smaller subset directly.
pub struct SinkCommon {
    phase: Mutex<SinkPhase>,
    in_flight: AtomicBool,
    dropped_total: AtomicU64,
    batches_sent_total: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl Default for SinkCommon {
    fn default() -> Self {
        Self {
            phase: Mutex::new(SinkPhase::Init),
            in_flight: AtomicBool::new(false),
            dropped_total: AtomicU64::new(0),
            batches_sent_total: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }
}

impl SinkCommon {
    pub fn mark_active(&self) {
        *self.phase.lock() = SinkPhase::Active;
        tracing::debug!("sink transitioned to Active");
    }

    pub fn mark_dead(&self, reason: impl Into<String>) {
        let reason = reason.into();
        *self.phase.lock() = SinkPhase::Dead;
        *self.last_error.lock() = Some(reason.clone());
        tracing::error!(%reason, "sink marked dead");
        metrics::counter!("signalpipe_sink_dead_total").increment(1);
    }

    pub fn phase(&self) -> SinkPhase {
        *self.phase.lock()
    }

    pub fn is_healthy(&self) -> bool {
        !matches!(self.phase(), SinkPhase::Dead)
    }

    /// Tries to transition `Active -> Sending`, returning `false` (and
    /// leaving the state untouched) if a send is already in flight — "a
    /// send is never issued while another is in flight for the same sink".
    pub fn try_begin_send(&self) -> bool {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            return false;
        }
        *self.phase.lock() = SinkPhase::Sending;
        true
    }

    pub fn end_send_ok(&self) {
        self.batches_sent_total.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("signalpipe_sink_batches_sent_total").increment(1);
        self.in_flight.store(false, Ordering::Release);
        if self.phase() != SinkPhase::Dead {
            *self.phase.lock() = SinkPhase::Active;
        }
    }

    pub fn end_send_retry(&self) {
        self.in_flight.store(false, Ordering::Release);
        if self.phase() != SinkPhase::Dead {
            *self.phase.lock() = SinkPhase::Backoff;
        }
    }

    pub fn record_dropped(&self, count: u64) {
        if count > 0 {
            self.dropped_total.fetch_add(count, Ordering::Relaxed);
            metrics::counter!("signalpipe_sink_records_dropped_total").increment(count);
        }
    }

    pub fn record_error(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(error = %message, "sink transport error");
        *self.last_error.lock() = Some(message);
    }

    pub fn snapshot(&self, queue_depth: usize) -> SinkStats {
        metrics::gauge!("signalpipe_sink_queue_depth").set(queue_depth as f64);
        SinkStats {
            queue_depth,
            in_flight: self.in_flight.load(Ordering::Relaxed),
            dropped_total: self.dropped_total.load(Ordering::Relaxed),
            batches_sent_total: self.batches_sent_total.load(Ordering::Relaxed),
            last_error: self.last_error.lock().clone(),
            healthy: self.is_healthy(),
        }
    }
}
