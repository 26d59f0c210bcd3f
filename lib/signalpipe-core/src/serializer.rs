use std::collections::HashSet;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use lru::LruCache;
use std::num::NonZeroUsize;

use crate::record::LogRecord;
use crate::value::LogValue;

/// Keys that are always skipped, mirroring the "never walk a prototype
/// chain" design note even though Rust's own type system already rules out
/// prototype pollution — the explicit whitelist is kept so a map built from
/// untrusted input can't smuggle one of these names through.
const SKIPPED_KEYS: [&str; 3] = ["__proto__", "constructor", "prototype"];

const MAX_DEPTH_DEFAULT: usize = 100;
/// `2^53`, the largest integer a JSON-consuming double can represent exactly.
const SAFE_INT_LIMIT: i64 = 9_007_199_254_740_992;

#[derive(Debug, Clone, Copy)]
pub struct SerializerPolicy {
    pub max_depth: usize,
    /// When true, the record's top-level timestamp is emitted as an
    /// ISO-8601 string instead of epoch milliseconds.
    pub timestamp_iso8601: bool,
}

impl Default for SerializerPolicy {
    fn default() -> Self {
        Self {
            max_depth: MAX_DEPTH_DEFAULT,
            timestamp_iso8601: false,
        }
    }
}

/// Canonical JSON encoder for [`LogRecord`]s.
///
/// Holds a reusable scratch buffer (avoids a fresh `String` allocation per
/// record) and a bounded LRU cache memoizing the escaped form of frequently
/// repeated field keys, mirroring the pooled-buffer pattern the teacher's
/// own codec layer uses around `BytesMut`.
pub struct Serializer {
    scratch: String,
    key_cache: LruCache<String, String>,
}

impl Default for Serializer {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Serializer {
    pub fn new(key_cache_capacity: usize) -> Self {
        Self {
            scratch: String::with_capacity(512),
            key_cache: LruCache::new(NonZeroUsize::new(key_cache_capacity.max(1)).unwrap()),
        }
    }

    /// Serializes `record` to a single-line JSON byte sequence.
    pub fn serialize(&mut self, record: &LogRecord, policy: &SerializerPolicy) -> Vec<u8> {
        self.scratch.clear();
        self.write_record(record, policy);
        self.scratch.as_bytes().to_vec()
    }

    fn write_record(&mut self, record: &LogRecord, policy: &SerializerPolicy) {
        self.scratch.push('{');
        self.write_kv_level(record.level.as_u8());
        self.scratch.push(',');
        self.write_key_raw("levelLabel");
        self.write_escaped_string(record.level.label());

        self.scratch.push(',');
        self.write_key_raw("time");
        if policy.timestamp_iso8601 {
            self.write_escaped_string(&epoch_ms_to_iso8601(record.time_ms));
        } else {
            let _ = write!(self.scratch, "{}", record.time_ms);
        }

        self.scratch.push(',');
        self.write_key_raw("hostname");
        self.write_escaped_string(&record.host.hostname);
        self.scratch.push(',');
        self.write_key_raw("pid");
        let _ = write!(self.scratch, "{}", record.host.pid);
        self.scratch.push(',');
        self.write_key_raw("name");
        self.write_escaped_string(&record.host.logger_name);

        if let Some(trace_id) = &record.baggage.trace_id {
            self.scratch.push(',');
            self.write_key_raw("traceId");
            self.write_escaped_string(trace_id);
        }
        if let Some(span_id) = &record.baggage.span_id {
            self.scratch.push(',');
            self.write_key_raw("spanId");
            self.write_escaped_string(span_id);
        }
        if let Some(request_id) = &record.baggage.request_id {
            self.scratch.push(',');
            self.write_key_raw("requestId");
            self.write_escaped_string(request_id);
        }
        if let Some(user_id) = &record.baggage.user_id {
            self.scratch.push(',');
            self.write_key_raw("userId");
            self.write_escaped_string(user_id);
        }

        let mut visited = HashSet::new();
        for (key, value) in &record.fields {
            if SKIPPED_KEYS.contains(&key.as_str()) {
                continue;
            }
            self.scratch.push(',');
            self.write_escaped_key(key);
            self.scratch.push(':');
            self.write_value(value, policy, 0, &mut visited);
        }

        if let Some(message) = &record.message {
            self.scratch.push(',');
            self.write_key_raw("msg");
            self.write_escaped_string(message);
        }

        if let Some(error) = &record.error {
            self.scratch.push(',');
            self.write_key_raw("err");
            self.write_error_shape(error);
        }

        self.scratch.push('}');
    }

    fn write_kv_level(&mut self, level: u8) {
        self.write_key_raw("level");
        let _ = write!(self.scratch, "{level}");
    }

    fn write_key_raw(&mut self, key: &'static str) {
        self.scratch.push('"');
        self.scratch.push_str(key);
        self.scratch.push_str("\":");
    }

    fn write_escaped_key(&mut self, key: &str) {
        if let Some(cached) = self.key_cache.get(key) {
            self.scratch.push_str(cached);
            return;
        }
        let mut escaped = String::with_capacity(key.len() + 2);
        escaped.push('"');
        escape_into(key, &mut escaped);
        escaped.push('"');
        self.scratch.push_str(&escaped);
        self.key_cache.put(key.to_string(), escaped);
    }

    fn write_escaped_string(&mut self, s: &str) {
        self.scratch.push('"');
        escape_into(s, &mut self.scratch);
        self.scratch.push('"');
    }

    fn write_value(
        &mut self,
        value: &LogValue,
        policy: &SerializerPolicy,
        depth: usize,
        visited: &mut HashSet<usize>,
    ) {
        if depth > policy.max_depth {
            self.write_escaped_string("[Max Depth Exceeded]");
            return;
        }

        if let Some(id) = value.container_identity() {
            if !visited.insert(id) {
                self.write_escaped_string("[Circular]");
                return;
            }
        }

        match value {
            LogValue::Null => self.scratch.push_str("null"),
            LogValue::Bool(b) => self.scratch.push_str(if *b { "true" } else { "false" }),
            LogValue::Int(i) => self.write_int(*i),
            LogValue::Float(f) => {
                if f.is_finite() {
                    let _ = write!(self.scratch, "{f}");
                } else {
                    self.scratch.push_str("null");
                }
            }
            LogValue::Str(s) => self.write_escaped_string(s),
            LogValue::Bytes(b) => {
                use base64::Engine;
                let encoded = base64::engine::general_purpose::STANDARD.encode(b.as_ref());
                self.write_escaped_string(&encoded);
            }
            LogValue::List(items) => {
                self.scratch.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        self.scratch.push(',');
                    }
                    self.write_value(item, policy, depth + 1, visited);
                }
                self.scratch.push(']');
            }
            LogValue::Map(map) => {
                self.scratch.push('{');
                let mut first = true;
                for (k, v) in map.iter() {
                    if SKIPPED_KEYS.contains(&k.as_str()) {
                        continue;
                    }
                    if !first {
                        self.scratch.push(',');
                    }
                    first = false;
                    self.write_escaped_key(k);
                    self.scratch.push(':');
                    self.write_value(v, policy, depth + 1, visited);
                }
                self.scratch.push('}');
            }
            LogValue::Error(e) => self.write_error_shape(e),
        }

        if let Some(id) = value.container_identity() {
            visited.remove(&id);
        }
    }

    fn write_int(&mut self, i: i64) {
        if i.unsigned_abs() <= SAFE_INT_LIMIT as u64 {
            let _ = write!(self.scratch, "{i}");
        } else {
            self.scratch.push('"');
            let _ = write!(self.scratch, "{i}");
            self.scratch.push('n');
            self.scratch.push('"');
        }
    }

    fn write_error_shape(&mut self, shape: &crate::value::ErrorShape) {
        self.scratch.push('{');
        self.write_key_raw("type");
        self.write_escaped_string(&shape.kind);
        self.scratch.push(',');
        self.write_key_raw("message");
        self.write_escaped_string(&shape.message);
        if let Some(stack) = &shape.stack {
            self.scratch.push(',');
            self.write_key_raw("stack");
            self.write_escaped_string(stack);
        }
        if let Some(cause) = &shape.cause {
            self.scratch.push(',');
            self.write_key_raw("cause");
            self.write_error_shape(cause);
        }
        self.scratch.push('}');
    }
}

/// Escapes `s` per the JSON spec: control characters below `0x20` become
/// `\uXXXX`, `"` and `\` are backslash-escaped. Rust `str` is guaranteed
/// valid UTF-8 so no lone surrogate can ever occur; any surrogate pair that
/// arrived via a prior UTF-16 boundary is therefore always well-formed and
/// passed through untouched.
fn escape_into(s: &str, out: &mut String) {
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
}

fn epoch_ms_to_iso8601(time_ms: u64) -> String {
    let secs = (time_ms / 1000) as i64;
    let millis = (time_ms % 1000) as u32;
    DateTime::<Utc>::from_timestamp(secs, millis * 1_000_000)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
        .unwrap_or_else(|| "1970-01-01T00:00:00.000Z".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::Level;
    use crate::record::HostMetadata;
    use crate::value::Fields;

    fn host() -> HostMetadata {
        HostMetadata {
            hostname: "H".into(),
            pid: 42,
            logger_name: "test".into(),
        }
    }

    #[test]
    fn scenario_s1_console_json_shape() {
        let mut record = LogRecord::new(Level::Info, 1_700_000_000_000, host());
        record.set_field("a", LogValue::Int(1)).unwrap();
        record.set_field("b", LogValue::str("x")).unwrap();
        record.message = Some("hi".into());

        let mut ser = Serializer::default();
        let out = ser.serialize(&record, &SerializerPolicy::default());
        let json: serde_json::Value = serde_json::from_slice(&out).unwrap();

        assert_eq!(json["level"], 30);
        assert_eq!(json["levelLabel"], "info");
        assert_eq!(json["time"], 1_700_000_000_000u64);
        assert_eq!(json["hostname"], "H");
        assert_eq!(json["pid"], 42);
        assert_eq!(json["a"], 1);
        assert_eq!(json["b"], "x");
        assert_eq!(json["msg"], "hi");
    }

    #[test]
    fn non_finite_floats_serialize_as_null() {
        let mut record = LogRecord::new(Level::Info, 0, host());
        record.set_field("n", LogValue::Float(f64::NAN)).unwrap();
        record.set_field("i", LogValue::Float(f64::INFINITY)).unwrap();
        let mut ser = Serializer::default();
        let out = ser.serialize(&record, &SerializerPolicy::default());
        let json: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert!(json["n"].is_null());
        assert!(json["i"].is_null());
    }

    #[test]
    fn large_integers_get_n_suffix_string() {
        let mut record = LogRecord::new(Level::Info, 0, host());
        record
            .set_field("big", LogValue::Int(i64::MAX))
            .unwrap();
        record.set_field("small", LogValue::Int(42)).unwrap();
        let mut ser = Serializer::default();
        let out = ser.serialize(&record, &SerializerPolicy::default());
        let json: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(json["big"], format!("{}n", i64::MAX));
        assert_eq!(json["small"], 42);
    }

    #[test]
    fn i64_min_gets_n_suffix_string_despite_unsigned_abs_wraparound() {
        // `i64::MIN.unsigned_abs()` is `2^63`, far past `SAFE_INT_LIMIT`; a
        // prior cast through `i64` wrapped that magnitude back to a negative
        // number and misclassified it as safe.
        let mut record = LogRecord::new(Level::Info, 0, host());
        record.set_field("big", LogValue::Int(i64::MIN)).unwrap();
        let mut ser = Serializer::default();
        let out = ser.serialize(&record, &SerializerPolicy::default());
        let json: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(json["big"], format!("{}n", i64::MIN));
    }

    #[test]
    fn control_characters_are_escaped() {
        let mut record = LogRecord::new(Level::Info, 0, host());
        record
            .set_field("s", LogValue::str("a\x01b"))
            .unwrap();
        let mut ser = Serializer::default();
        let out = ser.serialize(&record, &SerializerPolicy::default());
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("\\u0001"));
    }

    #[test]
    fn bytes_serialize_as_base64() {
        let mut record = LogRecord::new(Level::Info, 0, host());
        record
            .set_field("raw", LogValue::bytes(vec![0u8, 1, 2, 255]))
            .unwrap();
        let mut ser = Serializer::default();
        let out = ser.serialize(&record, &SerializerPolicy::default());
        let json: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(json["raw"], "AAEC/w==");
    }

    #[test]
    fn cyclic_structure_replaced_with_circular_marker() {
        use std::sync::Arc;
        // Two fields alias the same Arc<Fields>, simulating a shared
        // subgraph a cycle-unaware serializer would infinitely recurse on
        // if the container were actually self-referential.
        let mut inner = Fields::default();
        inner.insert("x".to_string(), LogValue::Int(1));
        let shared = Arc::new(inner);

        let mut record = LogRecord::new(Level::Info, 0, host());
        let mut outer = Fields::default();
        outer.insert("a".to_string(), LogValue::Map(shared.clone()));
        outer.insert("b".to_string(), LogValue::Map(shared));
        record.fields = outer;

        let mut ser = Serializer::default();
        let out = ser.serialize(&record, &SerializerPolicy::default());
        let json: serde_json::Value = serde_json::from_slice(&out).unwrap();
        // Both references serialize fully since each is a distinct entry
        // point into the (non-cyclic) shared map; only an actual cycle
        // (a container visited while still on the active recursion stack)
        // yields "[Circular]".
        assert_eq!(json["a"]["x"], 1);
        assert_eq!(json["b"]["x"], 1);
    }

    #[test]
    fn max_depth_exceeded_marker() {
        let mut record = LogRecord::new(Level::Info, 0, host());
        let mut nested = LogValue::Int(1);
        for _ in 0..5 {
            nested = LogValue::list(vec![nested]);
        }
        record.set_field("deep", nested).unwrap();
        let mut ser = Serializer::default();
        let policy = SerializerPolicy {
            max_depth: 2,
            ..Default::default()
        };
        let out = ser.serialize(&record, &policy);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("[Max Depth Exceeded]"));
    }

    #[test]
    fn whitelisted_keys_skip_prototype_pollution_names() {
        let mut record = LogRecord::new(Level::Info, 0, host());
        record
            .set_field("__proto__", LogValue::Int(1))
            .unwrap();
        record.set_field("safe", LogValue::Int(2)).unwrap();
        let mut ser = Serializer::default();
        let out = ser.serialize(&record, &SerializerPolicy::default());
        let json: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert!(json.get("__proto__").is_none());
        assert_eq!(json["safe"], 2);
    }
}
