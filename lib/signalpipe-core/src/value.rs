use std::sync::Arc;

use indexmap::IndexMap;

/// Ordered string-keyed map backing [`crate::record::LogRecord::fields`].
///
/// `IndexMap` gives last-write-wins-in-insertion-order for free: re-inserting
/// an existing key overwrites its value in place without moving it to the
/// back, which matches the duplicate-key merge rule in the data model.
pub type Fields = IndexMap<String, LogValue>;

/// The error-shape carried by `LogValue::Error` and by a record's own
/// top-level error, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorShape {
    pub kind: String,
    pub message: String,
    pub stack: Option<String>,
    pub cause: Option<Box<ErrorShape>>,
}

impl ErrorShape {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            stack: None,
            cause: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn with_cause(mut self, cause: ErrorShape) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }
}

/// A value carried by a log record field.
///
/// `List` and `Map` wrap their contents in an `Arc` rather than owning them
/// directly. This is what lets application code build shared subgraphs (and,
/// if it tries hard enough, cyclic ones) the way the source system's dynamic
/// object graphs could — which is the only way the serializer's cycle
/// detection (see `serializer.rs`) is ever exercised in a statically typed
/// language.
#[derive(Debug, Clone)]
pub enum LogValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Bytes(Arc<[u8]>),
    List(Arc<Vec<LogValue>>),
    Map(Arc<Fields>),
    Error(Arc<ErrorShape>),
}

impl LogValue {
    pub fn str(s: impl Into<Arc<str>>) -> Self {
        LogValue::Str(s.into())
    }

    pub fn bytes(b: impl Into<Arc<[u8]>>) -> Self {
        LogValue::Bytes(b.into())
    }

    pub fn list(items: Vec<LogValue>) -> Self {
        LogValue::List(Arc::new(items))
    }

    pub fn map(fields: Fields) -> Self {
        LogValue::Map(Arc::new(fields))
    }

    pub fn error(shape: ErrorShape) -> Self {
        LogValue::Error(Arc::new(shape))
    }

    /// Pointer identity for container variants, used by the serializer's
    /// visited-set cycle detector. Scalars have no meaningful identity and
    /// return `None`.
    pub fn container_identity(&self) -> Option<usize> {
        match self {
            LogValue::List(l) => Some(Arc::as_ptr(l) as usize),
            LogValue::Map(m) => Some(Arc::as_ptr(m) as usize),
            _ => None,
        }
    }

    pub fn is_string(&self) -> bool {
        matches!(self, LogValue::Str(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            LogValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for LogValue {
    fn from(s: &str) -> Self {
        LogValue::str(s)
    }
}

impl From<String> for LogValue {
    fn from(s: String) -> Self {
        LogValue::str(s)
    }
}

impl From<i64> for LogValue {
    fn from(v: i64) -> Self {
        LogValue::Int(v)
    }
}

impl From<f64> for LogValue {
    fn from(v: f64) -> Self {
        LogValue::Float(v)
    }
}

impl From<bool> for LogValue {
    fn from(v: bool) -> Self {
        LogValue::Bool(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_list_can_be_self_referential_via_aliasing() {
        // Two fields pointing at the same Arc<Vec<_>> share identity.
        let shared = LogValue::list(vec![LogValue::Int(1)]);
        let id_a = shared.container_identity();
        let cloned = shared.clone();
        let id_b = cloned.container_identity();
        assert_eq!(id_a, id_b);
    }

    #[test]
    fn scalars_have_no_container_identity() {
        assert_eq!(LogValue::Int(1).container_identity(), None);
        assert_eq!(LogValue::Null.container_identity(), None);
    }
}
