//! Record model, ring buffer, serializer, and redactor shared by every
//! sink in the `signalpipe` logging pipeline.

pub mod error;
pub mod level;
pub mod record;
pub mod redact;
pub mod ring_buffer;
pub mod serializer;
pub mod value;

pub use error::CoreError;
pub use level::Level;
pub use record::{Baggage, HostMetadata, LogRecord, DEFAULT_MAX_RECORD_BYTES};
pub use redact::{Redactor, RedactStats};
pub use ring_buffer::{OverflowPolicy, RingBuffer};
pub use serializer::{Serializer, SerializerPolicy};
pub use value::{ErrorShape, Fields, LogValue};
