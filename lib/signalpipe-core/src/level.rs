use std::fmt;

/// Severity of a [`crate::record::LogRecord`].
///
/// Numeric values are part of the wire contract (console/file JSON output
/// embeds them verbatim) and must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum Level {
    Trace = 10,
    Debug = 20,
    Info = 30,
    Warn = 40,
    Error = 50,
    Fatal = 60,
}

impl Level {
    pub const ALL: [Level; 6] = [
        Level::Trace,
        Level::Debug,
        Level::Info,
        Level::Warn,
        Level::Error,
        Level::Fatal,
    ];

    /// Numeric severity, matching the wire value used in serialized records.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Lowercase label used in console/file output (`levelLabel`).
    pub const fn label(self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }

    /// Inverse of [`Level::as_u8`]; used to store a level in an atomic.
    pub const fn from_u8(value: u8) -> Option<Level> {
        match value {
            10 => Some(Level::Trace),
            20 => Some(Level::Debug),
            30 => Some(Level::Info),
            40 => Some(Level::Warn),
            50 => Some(Level::Error),
            60 => Some(Level::Fatal),
            _ => None,
        }
    }

    pub fn from_label(label: &str) -> Option<Level> {
        match label.to_ascii_lowercase().as_str() {
            "trace" => Some(Level::Trace),
            "debug" => Some(Level::Debug),
            "info" => Some(Level::Info),
            "warn" | "warning" => Some(Level::Warn),
            "error" => Some(Level::Error),
            "fatal" | "critical" => Some(Level::Fatal),
            _ => None,
        }
    }

    /// Google Cloud Logging severity string for this level (§4.10).
    pub const fn stackdriver_severity(self) -> &'static str {
        match self {
            Level::Fatal => "CRITICAL",
            Level::Error => "ERROR",
            Level::Warn => "WARNING",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "DEFAULT",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_matches_severity() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Debug < Level::Info);
        assert!(Level::Info < Level::Warn);
        assert!(Level::Warn < Level::Error);
        assert!(Level::Error < Level::Fatal);
    }

    #[test]
    fn numeric_values_are_stable() {
        assert_eq!(Level::Trace.as_u8(), 10);
        assert_eq!(Level::Debug.as_u8(), 20);
        assert_eq!(Level::Info.as_u8(), 30);
        assert_eq!(Level::Warn.as_u8(), 40);
        assert_eq!(Level::Error.as_u8(), 50);
        assert_eq!(Level::Fatal.as_u8(), 60);
    }

    #[test]
    fn stackdriver_severity_mapping() {
        assert_eq!(Level::Fatal.stackdriver_severity(), "CRITICAL");
        assert_eq!(Level::Error.stackdriver_severity(), "ERROR");
        assert_eq!(Level::Warn.stackdriver_severity(), "WARNING");
        assert_eq!(Level::Info.stackdriver_severity(), "INFO");
        assert_eq!(Level::Debug.stackdriver_severity(), "DEBUG");
        assert_eq!(Level::Trace.stackdriver_severity(), "DEFAULT");
    }

    #[test]
    fn from_u8_round_trips_as_u8() {
        for level in Level::ALL {
            assert_eq!(Level::from_u8(level.as_u8()), Some(level));
        }
        assert_eq!(Level::from_u8(0), None);
    }

    #[test]
    fn from_label_is_case_insensitive() {
        assert_eq!(Level::from_label("INFO"), Some(Level::Info));
        assert_eq!(Level::from_label("Warning"), Some(Level::Warn));
        assert_eq!(Level::from_label("bogus"), None);
    }
}
