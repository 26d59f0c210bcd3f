use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::RwLock;
use signalpipe_core::{Fields, HostMetadata, Level, LogRecord, OverflowPolicy, Redactor, RingBuffer};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::Config;
use crate::context;
use crate::error::{Result, SinkError};
use crate::sink::Sink;

type ErrorHook = dyn Fn(SinkError) + Send + Sync;

/// How many records one dispatch step drains from the ring buffer and
/// offers to every active sink (spec §4.1, "a batch of up to N records").
/// `Engine::from_config` scales this by the configured `PerformanceMode`.
const DISPATCH_BATCH_SIZE: usize = 256;

/// Upper bound, in milliseconds, on the dispatcher's idle-tick backoff sleep
/// when the ring buffer is empty. `Engine::from_config` derives this from
/// `performance.flush_interval_ms` instead.
const DEFAULT_IDLE_TICK_CAP_MS: u64 = 20;

struct EngineInner {
    buffer: Arc<RingBuffer<Arc<LogRecord>>>,
    sinks: RwLock<Vec<Arc<dyn Sink>>>,
    host: HostMetadata,
    min_level: AtomicU8,
    redactor: Redactor,
    max_record_bytes: usize,
    closed: AtomicBool,
    dispatcher: RwLock<Option<JoinHandle<()>>>,
    shutdown_deadline: Duration,
    dispatch_batch_size: usize,
    idle_tick_cap_ms: u64,
    on_error: RwLock<Option<Arc<ErrorHook>>>,
}

/// Logger facade (spec §4.1). Cloning via [`Engine::child`] shares the ring
/// buffer, sink list, and host identity with the parent and only forks the
/// default-fields map; there is exactly one dispatcher task per buffer, not
/// one per `Engine` value.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
    default_fields: Fields,
}

impl Engine {
    pub fn new(logger_name: impl Into<Arc<str>>, min_level: Level, buffer_capacity: usize) -> Self {
        let buffer = RingBuffer::new(buffer_capacity, OverflowPolicy::Overwrite);
        Self::with_buffer(logger_name, min_level, buffer)
    }

    pub fn with_buffer(
        logger_name: impl Into<Arc<str>>,
        min_level: Level,
        buffer: Arc<RingBuffer<Arc<LogRecord>>>,
    ) -> Self {
        Self::build(
            logger_name,
            min_level,
            buffer,
            Redactor::default(),
            DISPATCH_BATCH_SIZE,
            DEFAULT_IDLE_TICK_CAP_MS,
        )
    }

    /// Builds an engine from a validated [`Config`] (spec §6): buffer
    /// capacity from `performance.buffer_size`, the level gate from
    /// `output.level`, the redactor from `security.pii_masking`, and
    /// `performance.mode`/`flush_interval_ms` tuning the dispatcher's batch
    /// size and idle backoff cap.
    pub fn from_config(logger_name: impl Into<Arc<str>>, config: &Config) -> Result<Self> {
        config.validate()?;
        let redactor = config.security.pii_masking.build_redactor()?;
        let buffer = RingBuffer::new(config.performance.buffer_size, OverflowPolicy::Overwrite);
        let batch_size = DISPATCH_BATCH_SIZE * config.performance.mode.dispatch_batch_multiplier();
        Ok(Self::build(
            logger_name,
            config.output.level,
            buffer,
            redactor,
            batch_size,
            config.performance.flush_interval_ms,
        ))
    }

    fn build(
        logger_name: impl Into<Arc<str>>,
        min_level: Level,
        buffer: Arc<RingBuffer<Arc<LogRecord>>>,
        redactor: Redactor,
        dispatch_batch_size: usize,
        idle_tick_cap_ms: u64,
    ) -> Self {
        let inner = Arc::new(EngineInner {
            buffer,
            sinks: RwLock::new(Vec::new()),
            host: HostMetadata::current(logger_name),
            min_level: AtomicU8::new(min_level.as_u8()),
            redactor,
            max_record_bytes: signalpipe_core::DEFAULT_MAX_RECORD_BYTES,
            closed: AtomicBool::new(false),
            dispatcher: RwLock::new(None),
            shutdown_deadline: Duration::from_secs(30),
            dispatch_batch_size,
            idle_tick_cap_ms,
            on_error: RwLock::new(None),
        });
        let handle = tokio::spawn(Self::dispatch_loop(inner.clone()));
        *inner.dispatcher.write() = Some(handle);
        Self {
            inner,
            default_fields: Fields::default(),
        }
    }

    pub fn set_min_level(&self, level: Level) {
        self.inner.min_level.store(level.as_u8(), Ordering::Relaxed);
    }

    fn min_level(&self) -> Level {
        Level::from_u8(self.inner.min_level.load(Ordering::Relaxed)).unwrap_or(Level::Trace)
    }

    /// Returns a child facade sharing this engine's buffer and sink list,
    /// with `fields` merged on top of (a clone of) this engine's default
    /// fields. The parent's default-fields map is never mutated.
    pub fn child(&self, fields: Fields) -> Engine {
        let mut merged = self.default_fields.clone();
        for (k, v) in fields {
            merged.insert(k, v);
        }
        Engine {
            inner: self.inner.clone(),
            default_fields: merged,
        }
    }

    pub async fn with_context<F, Fut, T>(&self, fields: Fields, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        context::with_context(fields, f).await
    }

    /// Runs `f` with `baggage` merged into the ambient trace/span/request/
    /// user scope (spec §3: request-scope baggage "merged at log time from
    /// ambient context"), so every [`Engine::log`]/[`Engine::log_async`]
    /// call made from within `f` carries it on `LogRecord::baggage`.
    pub async fn with_baggage<F, Fut, T>(&self, baggage: signalpipe_core::Baggage, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        context::with_baggage(baggage, f).await
    }

    pub fn add_sink(&self, sink: Arc<dyn Sink>) {
        self.inner.sinks.write().push(sink);
    }

    /// Registers a callback invoked whenever a sink's `write`/`write_batch`
    /// returns an error during dispatch. There is no default global
    /// singleton (spec §7 DESIGN NOTES: "allowed but not required") — with
    /// no callback set, failures are still counted and logged via
    /// `tracing::warn!` inside the sink itself, just not surfaced to the
    /// caller. Only one callback is kept; registering a new one replaces
    /// the old.
    pub fn on_error(&self, callback: impl Fn(SinkError) + Send + Sync + 'static) {
        *self.inner.on_error.write() = Some(Arc::new(callback));
    }

    /// Removes the named sink. Per spec §4.1 this is meant to wait for
    /// in-flight writes to that sink to quiesce; since every sink owns its
    /// batcher independently, removing it from the fan-out list and letting
    /// its own `Close` drain it is sufficient — there is no shared lock for
    /// a second writer to observe mid-removal.
    pub async fn remove_sink(&self, name: &str) {
        let removed = {
            let mut sinks = self.inner.sinks.write();
            let idx = sinks.iter().position(|s| s.name() == name);
            idx.map(|i| sinks.remove(i))
        };
        if let Some(sink) = removed {
            let _ = sink.close().await;
        }
    }

    /// Fast path: level gate before any allocation.
    pub fn log(&self, level: Level, message: impl Into<Arc<str>>, fields: Fields) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        if level.as_u8() < self.min_level().as_u8() {
            metrics::counter!("signalpipe_records_gated_total").increment(1);
            return;
        }
        let record = self.build_record(level, message, fields);
        tracing::trace!(level = %level, "record enqueued");
        self.inner.buffer.write(Arc::new(record));
        if level == Level::Fatal {
            tracing::warn!("FATAL log, draining sinks synchronously before returning");
            self.drain_once_blocking();
        }
    }

    /// Async counterpart; under `OverflowPolicy::Block` this awaits room in
    /// the buffer instead of dropping. For `FATAL`, synchronously drains all
    /// sinks before returning — best-effort only, per the open question in
    /// the design notes: callers wanting guaranteed delivery must still call
    /// [`Engine::flush`] or [`Engine::close`] with a deadline.
    pub async fn log_async(&self, level: Level, message: impl Into<Arc<str>>, fields: Fields) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        if level.as_u8() < self.min_level().as_u8() {
            return;
        }
        let record = self.build_record(level, message, fields);
        self.inner.buffer.write_async(Arc::new(record)).await;
        if level == Level::Fatal {
            self.dispatch_once().await;
            self.flush(self.inner.shutdown_deadline).await;
        }
    }

    fn build_record(&self, level: Level, message: impl Into<Arc<str>>, fields: Fields) -> LogRecord {
        let time_ms = now_ms();
        let mut record = LogRecord::new(level, time_ms, self.inner.host.clone());
        record.message = Some(message.into());
        record.merge_fields(&self.default_fields);
        record.merge_fields(&context::current_fields());
        record.merge_fields(&fields);
        record.baggage = record.baggage.merged_with(&context::current_baggage());
        self.inner.redactor.redact_record(&mut record);
        record.enforce_size_cap(self.inner.max_record_bytes);
        record
    }

    fn drain_once_blocking(&self) {
        let batch = self.inner.buffer.read_batch(self.inner.dispatch_batch_size);
        if batch.is_empty() {
            return;
        }
        let sinks = self.inner.sinks.read().clone();
        for sink in &sinks {
            if let Err(error) = sink.write_batch(&batch) {
                report_sink_error(&self.inner, sink.name(), error);
            }
        }
    }

    async fn dispatch_once(&self) -> usize {
        Self::dispatch_step(&self.inner).await
    }

    async fn dispatch_step(inner: &Arc<EngineInner>) -> usize {
        let batch = inner.buffer.read_batch(inner.dispatch_batch_size);
        if batch.is_empty() {
            return 0;
        }
        let sinks = inner.sinks.read().clone();
        let writes = sinks.iter().map(|sink| {
            let sink = sink.clone();
            let batch = batch.clone();
            let inner = inner.clone();
            async move {
                if let Err(error) = sink.write_batch(&batch) {
                    report_sink_error(&inner, sink.name(), error);
                }
            }
        });
        join_all(writes).await;
        batch.len()
    }

    async fn dispatch_loop(inner: Arc<EngineInner>) {
        let mut idle_ticks = 0u32;
        loop {
            let drained = Self::dispatch_step(&inner).await;
            if drained > 0 {
                tracing::debug!(count = drained, "dispatched batch to sinks");
            }
            if drained == 0 {
                idle_ticks = (idle_ticks + 1).min(inner.idle_tick_cap_ms as u32);
                tokio::time::sleep(Duration::from_millis(idle_ticks as u64)).await;
            } else {
                idle_ticks = 0;
            }
        }
    }

    /// Drains the buffer and waits for every sink to report an empty,
    /// non-in-flight state, or gives up after `deadline`.
    pub async fn flush(&self, deadline: Duration) {
        let start = Instant::now();
        while start.elapsed() < deadline {
            let drained = self.dispatch_once().await;
            let sinks = self.inner.sinks.read().clone();
            let all_quiet = sinks.iter().all(|s| !s.stats().in_flight) && self.inner.buffer.is_empty();
            if drained == 0 && all_quiet {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub async fn close(&self) {
        tracing::info!("engine closing, draining buffer and sinks");
        self.inner.closed.store(true, Ordering::Release);
        self.flush(self.inner.shutdown_deadline).await;
        if let Some(handle) = self.inner.dispatcher.write().take() {
            handle.abort();
        }
        let sinks = self.inner.sinks.read().clone();
        for sink in &sinks {
            let _ = sink.close().await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

fn report_sink_error(inner: &Arc<EngineInner>, sink: &str, error: crate::error::Error) {
    tracing::error!(sink, %error, "sink write failed");
    if let Some(hook) = inner.on_error.read().clone() {
        hook(SinkError { sink: sink.to_string(), error });
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
