use std::sync::Arc;

use regex::Regex;

use crate::record::LogRecord;
use crate::value::{ErrorShape, Fields, LogValue};

/// Default substrings (case-insensitive) that mark a field name as secret.
pub const DEFAULT_SECRET_FIELD_SUBSTRINGS: &[&str] = &[
    "password",
    "passwd",
    "token",
    "secret",
    "authorization",
    "api_key",
    "apikey",
    "private_key",
    "access_key",
    "credential",
];

/// Strings longer than this are replaced wholesale without scanning, to
/// bound the work any single record can force onto the redactor.
pub const DEFAULT_OVERSIZED_THRESHOLD: usize = 100 * 1024;

const OVERSIZED_MASK: &str = "[REDACTED_OVERSIZED_CONTENT]";
const FIELD_MASK: &str = "[REDACTED]";

/// One value-pattern rule: a name (for stats/debugging), a compiled regex,
/// and a masking function applied to each match.
///
/// `regex`'s engine is a finite automaton rather than a backtracking one, so
/// catastrophic backtracking is structurally impossible here regardless of
/// input; patterns are still written with explicit bounded repetition
/// counts (`{1,64}` rather than `+`) to keep match spans predictable and the
/// intent legible.
pub struct PatternRule {
    pub name: String,
    regex: Regex,
    mask: Arc<dyn Fn(&str) -> String + Send + Sync>,
}

impl PatternRule {
    fn new(name: &'static str, pattern: &str, mask: fn(&str) -> String) -> Self {
        Self {
            name: name.to_string(),
            regex: Regex::new(pattern).expect("built-in redaction pattern must compile"),
            mask: Arc::new(mask),
        }
    }

    /// Builds a rule from a caller-supplied pattern and a literal mask
    /// string, used for `security.pii_masking.rules` entries that set
    /// `pattern` (spec §6): every match of the compiled pattern is replaced
    /// with `mask` verbatim, unlike the built-in rules' structure-aware
    /// masking functions.
    pub fn custom(name: impl Into<String>, pattern: &str, mask: impl Into<String>) -> Result<Self, regex::Error> {
        let regex = Regex::new(pattern)?;
        let mask = mask.into();
        Ok(Self {
            name: name.into(),
            regex,
            mask: Arc::new(move |_: &str| mask.clone()),
        })
    }
}

fn mask_email(matched: &str) -> String {
    let mut parts = matched.splitn(2, '@');
    let (Some(local), Some(domain)) = (parts.next(), parts.next()) else {
        return "***@***.***".to_string();
    };
    let local_mask = mask_first_char(local);
    let mut labels = domain.splitn(2, '.');
    let (Some(first_label), Some(rest)) = (labels.next(), labels.next()) else {
        return "***@***.***".to_string();
    };
    format!("{local_mask}@{}.{rest}", mask_first_char(first_label))
}

fn mask_first_char(s: &str) -> String {
    match s.chars().next() {
        Some(c) => format!("{c}***"),
        None => "***".to_string(),
    }
}

fn mask_static(_matched: &str) -> String {
    "[REDACTED]".to_string()
}

fn mask_ip(_matched: &str) -> String {
    "***.***.***.***".to_string()
}

fn mask_last4(matched: &str) -> String {
    let digits: String = matched.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 4 {
        return "****".to_string();
    }
    format!("****-****-****-{}", &digits[digits.len() - 4..])
}

/// Builds the default set of value-pattern rules (email, SSN, credit card,
/// phone, IPv4, AWS access key, JWT).
pub fn default_patterns() -> Vec<PatternRule> {
    vec![
        PatternRule::new(
            "email",
            r"[A-Za-z0-9._%+\-]{1,64}@[A-Za-z0-9.\-]{1,255}\.[A-Za-z]{2,10}",
            mask_email,
        ),
        PatternRule::new("ssn", r"\b\d{3}-\d{2}-\d{4}\b", mask_static),
        PatternRule::new(
            "credit_card",
            r"\b\d{4}[ \-]?\d{4}[ \-]?\d{4}[ \-]?\d{1,4}\b",
            mask_last4,
        ),
        PatternRule::new(
            "phone",
            r"\b\+?\d{0,2}[ \-.]?\(?\d{3}\)?[ \-.]?\d{3}[ \-.]?\d{4}\b",
            mask_static,
        ),
        PatternRule::new(
            "ipv4",
            r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b",
            mask_ip,
        ),
        PatternRule::new("aws_access_key", r"\bAKIA[0-9A-Z]{16}\b", mask_static),
        PatternRule::new(
            "jwt",
            r"\beyJ[A-Za-z0-9_\-]{10,512}\.[A-Za-z0-9_\-]{10,512}\.[A-Za-z0-9_\-]{10,512}\b",
            mask_static,
        ),
    ]
}

pub struct Redactor {
    field_name_substrings: Vec<String>,
    patterns: Vec<PatternRule>,
    oversized_threshold: usize,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RedactStats {
    pub field_name_masks: u64,
    pub pattern_detections: u64,
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new(
            DEFAULT_SECRET_FIELD_SUBSTRINGS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            default_patterns(),
            DEFAULT_OVERSIZED_THRESHOLD,
        )
    }
}

impl Redactor {
    pub fn new(
        field_name_substrings: Vec<String>,
        patterns: Vec<PatternRule>,
        oversized_threshold: usize,
    ) -> Self {
        Self {
            field_name_substrings: field_name_substrings
                .into_iter()
                .map(|s| s.to_lowercase())
                .collect(),
            patterns,
            oversized_threshold,
        }
    }

    fn field_name_is_secret(&self, key: &str) -> bool {
        let lower = key.to_lowercase();
        self.field_name_substrings.iter().any(|s| lower.contains(s.as_str()))
    }

    /// Redacts every field and the message in place. The record's `fields`
    /// map is rebuilt since `LogValue::Map`/`List` are immutable `Arc`
    /// containers shared by value.
    pub fn redact_record(&self, record: &mut LogRecord) -> RedactStats {
        let mut stats = RedactStats::default();
        record.fields = self.redact_fields(&record.fields, &mut stats);
        if let Some(message) = record.message.clone() {
            let (masked, detections) = self.redact_string(&message);
            stats.pattern_detections += detections;
            record.message = Some(masked.into());
        }
        if let Some(error) = record.error.clone() {
            record.error = Some(self.redact_error_shape(&error, &mut stats));
        }
        stats
    }

    fn redact_fields(&self, fields: &Fields, stats: &mut RedactStats) -> Fields {
        let mut out = Fields::with_capacity(fields.len());
        for (key, value) in fields {
            if self.field_name_is_secret(key) {
                out.insert(key.clone(), LogValue::str(FIELD_MASK));
                stats.field_name_masks += 1;
            } else {
                out.insert(key.clone(), self.redact_value(value, stats));
            }
        }
        out
    }

    fn redact_value(&self, value: &LogValue, stats: &mut RedactStats) -> LogValue {
        match value {
            LogValue::Str(s) => {
                let (masked, detections) = self.redact_string(s);
                stats.pattern_detections += detections;
                LogValue::str(masked)
            }
            LogValue::List(items) => {
                let redacted: Vec<LogValue> =
                    items.iter().map(|v| self.redact_value(v, stats)).collect();
                LogValue::List(Arc::new(redacted))
            }
            LogValue::Map(map) => LogValue::Map(Arc::new(self.redact_fields(map, stats))),
            LogValue::Error(e) => LogValue::Error(Arc::new(self.redact_error_shape(e, stats))),
            other => other.clone(),
        }
    }

    fn redact_error_shape(&self, shape: &ErrorShape, stats: &mut RedactStats) -> ErrorShape {
        let (message, detections) = self.redact_string(&shape.message);
        stats.pattern_detections += detections;
        ErrorShape {
            kind: shape.kind.clone(),
            message,
            stack: shape.stack.clone(),
            cause: shape
                .cause
                .as_ref()
                .map(|c| Box::new(self.redact_error_shape(c, stats))),
        }
    }

    /// Applies the value-pattern layer to a single string leaf.
    ///
    /// Matches across all patterns are collected, overlaps resolved by
    /// "first match wins" (earliest-registered pattern keeps the span), and
    /// replacements are then applied back-to-front so earlier match offsets
    /// stay valid as later (leftward) ones are substituted.
    pub fn redact_string(&self, s: &str) -> (String, u64) {
        if s.len() > self.oversized_threshold {
            return (OVERSIZED_MASK.to_string(), 1);
        }

        let mut candidates: Vec<(usize, usize, usize)> = Vec::new(); // (start, end, pattern_idx)
        for (idx, rule) in self.patterns.iter().enumerate() {
            for m in rule.regex.find_iter(s) {
                candidates.push((m.start(), m.end(), idx));
            }
        }
        if candidates.is_empty() {
            return (s.to_string(), 0);
        }

        candidates.sort_by_key(|&(start, _, idx)| (start, idx));

        let mut kept: Vec<(usize, usize, usize)> = Vec::new();
        let mut last_end = 0usize;
        for candidate in candidates {
            if candidate.0 >= last_end {
                last_end = candidate.1;
                kept.push(candidate);
            }
        }

        kept.sort_by(|a, b| b.0.cmp(&a.0));

        let mut out = s.to_string();
        let mut detections = 0u64;
        for (start, end, pattern_idx) in kept {
            let matched = &out[start..end];
            let masked = (self.patterns[pattern_idx].mask)(matched);
            out.replace_range(start..end, &masked);
            detections += 1;
        }
        (out, detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::Level;
    use crate::record::HostMetadata;

    fn host() -> HostMetadata {
        HostMetadata {
            hostname: "H".into(),
            pid: 1,
            logger_name: "t".into(),
        }
    }

    #[test]
    fn scenario_s2_email_and_ip_redaction() {
        let redactor = Redactor::default();
        let (masked, detections) =
            redactor.redact_string("contact bob@x.co from 10.0.0.1");
        assert_eq!(masked, "contact b***@x***.co from ***.***.***.***");
        assert_eq!(detections, 2);
    }

    #[test]
    fn field_name_rule_masks_entire_value() {
        let redactor = Redactor::default();
        let mut record = LogRecord::new(Level::Info, 0, host());
        record
            .set_field("password", LogValue::str("hunter2"))
            .unwrap();
        let stats = redactor.redact_record(&mut record);
        assert_eq!(stats.field_name_masks, 1);
        assert_eq!(record.fields.get("password").unwrap().as_str(), Some("[REDACTED]"));
    }

    #[test]
    fn field_name_match_is_case_insensitive_substring() {
        let redactor = Redactor::default();
        let mut record = LogRecord::new(Level::Info, 0, host());
        record
            .set_field("X-Auth-Token", LogValue::str("abc123"))
            .unwrap();
        redactor.redact_record(&mut record);
        assert_eq!(
            record.fields.get("X-Auth-Token").unwrap().as_str(),
            Some("[REDACTED]")
        );
    }

    #[test]
    fn oversized_string_replaced_wholesale() {
        let redactor = Redactor::new(vec![], default_patterns(), 10);
        let (masked, detections) = redactor.redact_string(&"a".repeat(20));
        assert_eq!(masked, "[REDACTED_OVERSIZED_CONTENT]");
        assert_eq!(detections, 1);
    }

    #[test]
    fn redaction_is_idempotent() {
        let redactor = Redactor::default();
        let mut record = LogRecord::new(Level::Info, 0, host());
        record
            .set_field("email", LogValue::str("bob@x.co"))
            .unwrap();
        record
            .set_field("password", LogValue::str("hunter2"))
            .unwrap();
        redactor.redact_record(&mut record);
        let once = record.fields.clone();
        redactor.redact_record(&mut record);
        assert_eq!(record.fields.get("email").unwrap().as_str(), once.get("email").unwrap().as_str());
        assert_eq!(
            record.fields.get("password").unwrap().as_str(),
            once.get("password").unwrap().as_str()
        );
    }

    #[test]
    fn never_increases_non_mask_substring_occurrences() {
        let redactor = Redactor::default();
        let input = "no pii here, just plain text with the word secretive";
        let (masked, _) = redactor.redact_string(input);
        // "secretive" contains no field-name masking (that only applies to
        // keys) and matches no value pattern, so it must pass through
        // unchanged and not be duplicated.
        assert_eq!(masked, input);
    }

    #[test]
    fn overlapping_matches_resolve_first_pattern_wins_without_shifting_earlier_indices() {
        let redactor = Redactor::default();
        // A string with two independent, non-adjacent matches validates that
        // the later (by string position) match is applied first internally
        // without corrupting the earlier match's offset.
        let (masked, detections) = redactor.redact_string("ip 1.2.3.4 and mail a@b.co");
        assert!(masked.contains("***.***.***.***"));
        assert!(masked.contains("a***@b***.co"));
        assert_eq!(detections, 2);
    }
}
