use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use signalpipe_core::{Level, LogRecord, Serializer, SerializerPolicy};

use crate::config::OutputFormat;
use crate::error::Result;
use crate::sink::{Sink, SinkCommon, SinkStats};

/// Stdout/stderr writer (§4.7's sibling, the simplest sink in the system).
/// Records at `ERROR`/`FATAL` go to stderr; everything else goes to
/// stdout, matching how the teacher's own CLI separates operator-facing
/// error output from the regular stream.
pub struct ConsoleSink {
    common: SinkCommon,
    format: OutputFormat,
    serializer: Mutex<Serializer>,
    policy: SerializerPolicy,
}

impl ConsoleSink {
    pub fn new(format: OutputFormat) -> Arc<Self> {
        let sink = Arc::new(Self {
            common: SinkCommon::default(),
            format,
            serializer: Mutex::new(Serializer::default()),
            policy: SerializerPolicy::default(),
        });
        sink.common.mark_active();
        sink
    }

    fn render(&self, record: &LogRecord) -> String {
        let json_bytes = self.serializer.lock().serialize(record, &self.policy);
        match self.format {
            OutputFormat::Json => String::from_utf8_lossy(&json_bytes).into_owned(),
            OutputFormat::Pretty => match serde_json::from_slice::<serde_json::Value>(&json_bytes) {
                Ok(value) => serde_json::to_string_pretty(&value)
                    .unwrap_or_else(|_| String::from_utf8_lossy(&json_bytes).into_owned()),
                Err(_) => String::from_utf8_lossy(&json_bytes).into_owned(),
            },
            OutputFormat::Compact => self.render_compact(record),
        }
    }

    fn render_compact(&self, record: &LogRecord) -> String {
        let mut line = format!(
            "{} {} {}",
            record.time_ms,
            record.level.label().to_ascii_uppercase(),
            record.message.as_deref().unwrap_or(""),
        );
        for (key, value) in &record.fields {
            line.push(' ');
            line.push_str(key);
            line.push('=');
            if let Some(s) = value.as_str() {
                line.push_str(s);
            } else {
                line.push_str(&format!("{value:?}"));
            }
        }
        line
    }
}

#[async_trait]
impl Sink for ConsoleSink {
    fn name(&self) -> &str {
        "console"
    }

    fn write(&self, record: Arc<LogRecord>) -> Result<()> {
        let line = self.render(&record);
        if record.level >= Level::Error {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{line}");
        } else {
            let mut stdout = std::io::stdout().lock();
            let _ = writeln!(stdout, "{line}");
        }
        Ok(())
    }

    fn healthy(&self) -> bool {
        self.common.is_healthy()
    }

    fn stats(&self) -> SinkStats {
        self.common.snapshot(0)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
