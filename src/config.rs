use std::path::Path;

use serde::{Deserialize, Serialize};
use signalpipe_core::redact::{default_patterns, PatternRule, DEFAULT_OVERSIZED_THRESHOLD, DEFAULT_SECRET_FIELD_SUBSTRINGS};
use signalpipe_core::{Level, Redactor};

use crate::error::{ConfigurationSnafu, Error};
use snafu::ensure;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceMode {
    Standard,
    Fast,
    Ultra,
}

impl Default for PerformanceMode {
    fn default() -> Self {
        PerformanceMode::Standard
    }
}

impl PerformanceMode {
    /// Scales the dispatcher's per-tick batch size. `fast`/`ultra` trade
    /// latency for throughput by draining more of the ring buffer per
    /// dispatch step, the way the teacher's own topology tunes batch
    /// concurrency per performance profile rather than exposing a raw knob.
    pub fn dispatch_batch_multiplier(self) -> usize {
        match self {
            PerformanceMode::Standard => 1,
            PerformanceMode::Fast => 2,
            PerformanceMode::Ultra => 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    pub mode: PerformanceMode,
    pub buffer_size: usize,
    pub flush_interval_ms: u64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            mode: PerformanceMode::default(),
            buffer_size: 4096,
            flush_interval_ms: 100,
        }
    }
}

impl PerformanceConfig {
    pub fn validate(&self) -> Result<(), Error> {
        ensure!(
            (256..=65536).contains(&self.buffer_size),
            ConfigurationSnafu {
                message: format!(
                    "performance.buffer_size must be within 256..=65536, got {}",
                    self.buffer_size
                )
            }
        );
        ensure!(
            (10..=10_000).contains(&self.flush_interval_ms),
            ConfigurationSnafu {
                message: format!(
                    "performance.flush_interval_ms must be within 10..=10000, got {}",
                    self.flush_interval_ms
                )
            }
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Json,
    Compact,
    Pretty,
}

impl Default for OutputFormat {
    fn default() -> Self {
        OutputFormat::Json
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    #[serde(with = "level_serde")]
    pub level: Level,
    pub format: OutputFormat,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            level: Level::Info,
            format: OutputFormat::Json,
        }
    }
}

mod level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use signalpipe_core::Level;

    pub fn serialize<S: Serializer>(level: &Level, s: S) -> Result<S::Ok, S::Error> {
        level.label().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Level, D::Error> {
        let label = String::deserialize(d)?;
        Level::from_label(&label).ok_or_else(|| serde::de::Error::custom(format!("unknown level: {label}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaskRule {
    pub field: Option<String>,
    pub pattern: Option<String>,
    pub mask: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PiiMaskingConfig {
    pub enabled: bool,
    pub rules: Vec<MaskRule>,
}

impl Default for PiiMaskingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rules: Vec::new(),
        }
    }
}

impl PiiMaskingConfig {
    /// Builds the [`Redactor`] this configuration describes (spec §6,
    /// `security.pii_masking.enabled`/`rules`). `enabled: false` yields a
    /// redactor with no field or pattern rules and an unreachable oversized
    /// threshold, so it never touches a record — a disguised no-op redactor
    /// wired in behind `Engine::from_config` would otherwise silently keep
    /// masking regardless of this flag. Each rule names either `field` (a
    /// field-name substring, case-insensitive, masked with the fixed
    /// `[REDACTED]` marker like the built-in substrings) or `pattern` (a
    /// value-pattern regex masked verbatim with `mask`).
    pub fn build_redactor(&self) -> Result<Redactor, Error> {
        if !self.enabled {
            return Ok(Redactor::new(Vec::new(), Vec::new(), usize::MAX));
        }

        let mut field_substrings: Vec<String> = DEFAULT_SECRET_FIELD_SUBSTRINGS
            .iter()
            .map(|s| s.to_string())
            .collect();
        let mut patterns = default_patterns();

        for rule in &self.rules {
            match (&rule.field, &rule.pattern) {
                (Some(field), _) => field_substrings.push(field.clone()),
                (None, Some(pattern)) => {
                    let compiled = PatternRule::custom(format!("config:{pattern}"), pattern, rule.mask.clone())
                        .map_err(|e| {
                            Error::configuration(format!(
                                "security.pii_masking rule pattern {pattern:?} failed to compile: {e}"
                            ))
                        })?;
                    patterns.push(compiled);
                }
                (None, None) => {
                    return Err(Error::configuration(
                        "security.pii_masking rule must set `field` or `pattern`",
                    ));
                }
            }
        }

        Ok(Redactor::new(field_substrings, patterns, DEFAULT_OVERSIZED_THRESHOLD))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub pii_masking: PiiMaskingConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub performance: PerformanceConfig,
    pub output: OutputConfig,
    pub security: SecurityConfig,
}

impl Config {
    pub fn builder() -> Config {
        Config::default()
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.performance.validate()
    }

    /// Loads configuration from a YAML file. Not a hot-reloading watcher and
    /// not a schema registry — those belong to the out-of-scope config
    /// loader collaborator; this is a one-shot parse used at process start.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Config, Error> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::configuration(format!("failed to read {}: {e}", path.as_ref().display()))
        })?;
        let config: Config = serde_yaml::from_str(&text)
            .map_err(|e| Error::configuration(format!("failed to parse config: {e}")))?;
        if let Err(e) = config.validate() {
            tracing::warn!(error = %e, "configuration failed validation");
            return Err(e);
        }
        tracing::info!(path = %path.as_ref().display(), "loaded configuration");
        Ok(config)
    }
}

/// Reads an environment variable, returning `None` when unset or empty
/// rather than erroring — callers decide whether the variable is required.
pub fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

pub mod env_vars {
    pub const AWS_REGION: &str = "AWS_REGION";
    pub const AWS_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
    pub const AWS_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
    pub const AWS_SESSION_TOKEN: &str = "AWS_SESSION_TOKEN";
    pub const CLOUDWATCH_LOG_GROUP: &str = "CLOUDWATCH_LOG_GROUP";
    pub const GCP_PROJECT_ID: &str = "GCP_PROJECT_ID";
    pub const STACKDRIVER_LOG_NAME: &str = "STACKDRIVER_LOG_NAME";
    pub const AZURE_CONNECTION_STRING: &str = "AZURE_CONNECTION_STRING";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn buffer_size_out_of_range_is_rejected() {
        let mut config = Config::default();
        config.performance.buffer_size = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn flush_interval_out_of_range_is_rejected() {
        let mut config = Config::default();
        config.performance.flush_interval_ms = 50_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn level_round_trips_through_yaml() {
        let yaml = "output:\n  level: warn\n  format: compact\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.output.level, Level::Warn);
        assert_eq!(config.output.format, OutputFormat::Compact);
    }

    #[test]
    fn disabled_pii_masking_builds_a_redactor_that_never_touches_a_record() {
        let config = PiiMaskingConfig { enabled: false, rules: Vec::new() };
        let redactor = config.build_redactor().unwrap();
        let (masked, detections) = redactor.redact_string("contact bob@x.co from 10.0.0.1");
        assert_eq!(masked, "contact bob@x.co from 10.0.0.1");
        assert_eq!(detections, 0);
    }

    #[test]
    fn custom_field_rule_masks_the_named_field() {
        let config = PiiMaskingConfig {
            enabled: true,
            rules: vec![MaskRule { field: Some("internal_note".to_string()), pattern: None, mask: "x".to_string() }],
        };
        let redactor = config.build_redactor().unwrap();
        let mut record = signalpipe_core::LogRecord::new(
            Level::Info,
            0,
            signalpipe_core::HostMetadata::current("test"),
        );
        record
            .set_field("internal_note", signalpipe_core::LogValue::str("do not ship"))
            .unwrap();
        redactor.redact_record(&mut record);
        assert_eq!(record.fields.get("internal_note").unwrap().as_str(), Some("[REDACTED]"));
    }

    #[test]
    fn custom_pattern_rule_masks_matches_with_the_literal_mask_text() {
        let config = PiiMaskingConfig {
            enabled: true,
            rules: vec![MaskRule {
                field: None,
                pattern: Some(r"\bINTERNAL-\d{4}\b".to_string()),
                mask: "[TICKET]".to_string(),
            }],
        };
        let redactor = config.build_redactor().unwrap();
        let (masked, detections) = redactor.redact_string("see INTERNAL-1234 for details");
        assert_eq!(masked, "see [TICKET] for details");
        assert_eq!(detections, 1);
    }

    #[test]
    fn rule_missing_both_field_and_pattern_is_rejected() {
        let config = PiiMaskingConfig {
            enabled: true,
            rules: vec![MaskRule { field: None, pattern: None, mask: "x".to_string() }],
        };
        assert!(config.build_redactor().is_err());
    }
}
