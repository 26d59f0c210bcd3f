//! `signalpipe` — a high-throughput structured-logging pipeline for server
//! processes (see `SPEC_FULL.md`).
//!
//! Application code calls [`Engine::log`] (or the level-specific helpers);
//! the engine enriches, redacts, and buffers each record before fanning it
//! out to every registered [`Sink`]. The record model, ring buffer,
//! serializer, and redactor live in the `signalpipe-core` crate and are
//! re-exported here for convenience.

pub mod backoff;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod sink;
pub mod sinks;

pub use backoff::Backoff;
pub use config::Config;
pub use context::{with_baggage, with_context};
pub use engine::Engine;
pub use error::{Error, Result, SinkError};
pub use sink::{Sink, SinkStats};

pub use signalpipe_core::{
    Baggage, Fields, Level, LogRecord, LogValue, OverflowPolicy, RingBuffer, Serializer,
    SerializerPolicy,
};
