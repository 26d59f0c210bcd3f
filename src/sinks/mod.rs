//! Concrete [`crate::sink::Sink`] implementations (spec §4.7–§4.11) plus the
//! shared batching scaffolding they're built on (§4.6).

pub mod azure;
pub mod cloudwatch;
pub mod console;
pub mod elasticsearch;
pub mod file;
pub mod http_batch;
pub mod stackdriver;
