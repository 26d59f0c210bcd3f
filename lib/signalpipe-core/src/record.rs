use std::sync::{Arc, OnceLock};

use crate::error::{CoreError, EmptyFieldKeySnafu};
use crate::level::Level;
use crate::value::{ErrorShape, Fields, LogValue};
use snafu::ensure;

/// Host identity populated once per process (hostname, pid, logger name).
#[derive(Debug, Clone)]
pub struct HostMetadata {
    pub hostname: Arc<str>,
    pub pid: u32,
    pub logger_name: Arc<str>,
}

impl HostMetadata {
    /// `hostname` and `pid` are resolved once per process via a
    /// [`OnceLock`] and shared by every `Engine`; only `logger_name` varies
    /// per call.
    pub fn current(logger_name: impl Into<Arc<str>>) -> Self {
        static HOSTNAME: OnceLock<Arc<str>> = OnceLock::new();
        let hostname = HOSTNAME
            .get_or_init(|| hostname_best_effort().into())
            .clone();
        Self {
            hostname,
            pid: std::process::id(),
            logger_name: logger_name.into(),
        }
    }
}

fn hostname_best_effort() -> String {
    // Avoid pulling in a whole-crate dependency for something the OS already
    // exposes; fall back to a placeholder if the environment is unusual
    // (containers without HOSTNAME set, sandboxes, etc).
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown-host".to_string())
}

/// Request-scope baggage merged at log time from ambient context.
#[derive(Debug, Clone, Default)]
pub struct Baggage {
    pub trace_id: Option<Arc<str>>,
    pub span_id: Option<Arc<str>>,
    pub request_id: Option<Arc<str>>,
    pub user_id: Option<Arc<str>>,
}

impl Baggage {
    /// Merge-last-wins: `other`'s populated fields win over `self`'s.
    pub fn merged_with(&self, other: &Baggage) -> Baggage {
        Baggage {
            trace_id: other.trace_id.clone().or_else(|| self.trace_id.clone()),
            span_id: other.span_id.clone().or_else(|| self.span_id.clone()),
            request_id: other
                .request_id
                .clone()
                .or_else(|| self.request_id.clone()),
            user_id: other.user_id.clone().or_else(|| self.user_id.clone()),
        }
    }
}

/// Default cap on serialized record size before truncation kicks in (§3).
pub const DEFAULT_MAX_RECORD_BYTES: usize = 256 * 1024;

/// Worst-case per-byte blowup JSON string escaping can introduce (a control
/// character becomes `\uXXXX`, 1 byte -> 6). Used by `enforce_size_cap`'s
/// fast path: below this margin the real serialized form is guaranteed to
/// still fit, so no actual serialization pass is needed.
const WORST_CASE_ESCAPE_FACTOR: usize = 6;

/// The canonical in-flight log record.
///
/// Level and time are fixed at construction and never mutated afterwards;
/// `fields` is mutable only until the redactor runs, after which the record
/// is logically immutable (enforced by convention — the engine never hands
/// out a `&mut LogRecord` past that point).
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub level: Level,
    pub time_ms: u64,
    pub message: Option<Arc<str>>,
    pub fields: Fields,
    pub host: HostMetadata,
    pub baggage: Baggage,
    pub error: Option<ErrorShape>,
    pub truncated: bool,
}

impl LogRecord {
    pub fn new(level: Level, time_ms: u64, host: HostMetadata) -> Self {
        Self {
            level,
            time_ms,
            message: None,
            fields: Fields::default(),
            host,
            baggage: Baggage::default(),
            error: None,
            truncated: false,
        }
    }

    pub fn with_message(mut self, message: impl Into<Arc<str>>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Inserts a field, enforcing the non-empty-key invariant and
    /// last-write-wins-in-insertion-order semantics (`IndexMap::insert`
    /// already preserves position on overwrite).
    pub fn set_field(&mut self, key: impl Into<String>, value: LogValue) -> Result<(), CoreError> {
        let key = key.into();
        ensure!(!key.is_empty(), EmptyFieldKeySnafu);
        self.fields.insert(key, value);
        Ok(())
    }

    pub fn merge_fields(&mut self, other: &Fields) {
        for (k, v) in other {
            self.fields.insert(k.clone(), v.clone());
        }
    }

    /// Applies the oversize-record policy (spec §3: "Record size (serialized
    /// bytes) is bounded by a configurable cap"): if the record's *actual*
    /// serialized byte length exceeds `max_bytes`, drop the message and all
    /// fields and replace them with a `__truncated__:true` marker field.
    ///
    /// `approx_size` is used only as a cheap fast-path: JSON string escaping
    /// can grow a byte at most to `\uXXXX` (6 bytes), so if the approximate
    /// size times that worst-case factor already fits under the cap, the
    /// real serialized form cannot possibly exceed it either and the actual
    /// serialization pass is skipped. Anything that doesn't clear that
    /// margin is serialized for real and measured exactly before deciding.
    pub fn enforce_size_cap(&mut self, max_bytes: usize) {
        let approx = self.approx_size();
        if approx.saturating_mul(WORST_CASE_ESCAPE_FACTOR) <= max_bytes {
            return;
        }
        if self.serialized_len() <= max_bytes {
            return;
        }
        self.message = None;
        self.fields.clear();
        self.fields
            .insert("__truncated__".to_string(), LogValue::Bool(true));
        self.truncated = true;
    }

    fn serialized_len(&self) -> usize {
        crate::serializer::Serializer::default()
            .serialize(self, &crate::serializer::SerializerPolicy::default())
            .len()
    }

    /// Conservative upper bound on the record's *unescaped* content length —
    /// used only to decide whether `enforce_size_cap`'s fast path is safe to
    /// take. Must account for everything the serializer emits besides
    /// `fields`/`message`: the envelope (`level`, `levelLabel`, `time`,
    /// `hostname`, `pid`, `name`, plus their JSON punctuation) and baggage,
    /// or a record with few/no custom fields but a small cap would wrongly
    /// skip the real size check.
    fn approx_size(&self) -> usize {
        const ENVELOPE_OVERHEAD: usize = 96;
        let msg_len = self.message.as_ref().map_or(0, |m| m.len());
        let fields_len: usize = self
            .fields
            .iter()
            .map(|(k, v)| k.len() + Self::approx_value_size(v))
            .sum();
        let baggage_len: usize = [
            &self.baggage.trace_id,
            &self.baggage.span_id,
            &self.baggage.request_id,
            &self.baggage.user_id,
        ]
        .iter()
        .filter_map(|id| id.as_ref().map(|s| s.len()))
        .sum();
        ENVELOPE_OVERHEAD + self.host.hostname.len() + self.host.logger_name.len() + baggage_len + msg_len + fields_len
    }

    fn approx_value_size(value: &LogValue) -> usize {
        match value {
            LogValue::Null | LogValue::Bool(_) | LogValue::Int(_) | LogValue::Float(_) => 8,
            LogValue::Str(s) => s.len(),
            LogValue::Bytes(b) => b.len(),
            LogValue::List(items) => items.iter().map(Self::approx_value_size).sum(),
            LogValue::Map(map) => map
                .iter()
                .map(|(k, v)| k.len() + Self::approx_value_size(v))
                .sum(),
            LogValue::Error(e) => e.message.len() + e.kind.len(),
        }
    }
}
