use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression as GzCompression;
use reqwest::Client;
use serde_json::{json, Value};
use signalpipe_core::{LogRecord, LogValue};

use crate::backoff::Backoff;
use crate::error::{classify_status, Error, Result, Retriability};
use crate::sink::Sink;
use crate::sinks::http_batch::{BatchTransport, HttpBatchSink, SendOutcome};

const DEFAULT_ENDPOINT: &str = "https://dc.services.visualstudio.com/v2/track";

/// Application Insights envelope transport (§4.11). The instrumentation key
/// is parsed out of the connection string the same way the Azure Monitor
/// exporters across the corpus do it: `Key=Value;Key=Value` pairs, case
/// preserved, `;`-separated.
pub struct AzureMonitorTransport {
    instrumentation_key: String,
    endpoint: String,
    client: Client,
}

impl AzureMonitorTransport {
    pub fn new(connection_string: &str) -> Result<Self> {
        let parsed = parse_connection_string(connection_string);
        let instrumentation_key = parsed
            .get("InstrumentationKey")
            .cloned()
            .ok_or_else(|| Error::configuration("connection string missing InstrumentationKey"))?;
        let endpoint = parsed
            .get("IngestionEndpoint")
            .map(|e| format!("{}/v2/track", e.trim_end_matches('/')))
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());

        tracing::debug!(endpoint = %endpoint, "configured azure monitor transport");
        Ok(Self {
            instrumentation_key,
            endpoint,
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client with default TLS config"),
        })
    }

    fn envelope_for(&self, record: &LogRecord) -> Value {
        let telemetry_type = infer_telemetry_type(record);
        let name = format!(
            "Microsoft.ApplicationInsights.{}.{telemetry_type}",
            self.instrumentation_key
        );
        json!({
            "ver": 1,
            "name": name,
            "time": iso8601(record.time_ms),
            "sampleRate": 100.0,
            "iKey": self.instrumentation_key,
            "tags": {
                "ai.cloud.role": record.host.logger_name.as_ref(),
            },
            "data": {
                "baseType": format!("{telemetry_type}Data"),
                "baseData": base_data_for(record, telemetry_type),
            }
        })
    }
}

/// `Key=Value;Key=Value` connection-string parsing; unknown keys are kept
/// but ignored by callers (matching how `AZURE_CONNECTION_STRING` may carry
/// additional fields such as `EndpointSuffix`).
fn parse_connection_string(raw: &str) -> std::collections::HashMap<String, String> {
    raw.split(';')
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?.trim();
            let value = parts.next()?.trim();
            if key.is_empty() || value.is_empty() {
                None
            } else {
                Some((key.to_string(), value.to_string()))
            }
        })
        .collect()
}

/// Telemetry type inferred from record shape (§4.11): request-like and
/// dependency-like records are recognized by a `duration`/`responseCode` or
/// `target`/`dependencyType` field respectively; a numeric `value` field
/// without those markers is a `Metric`; an attached error shape is an
/// `Exception`; anything else is a plain `Message`.
fn infer_telemetry_type(record: &LogRecord) -> &'static str {
    let has = |key: &str| record.fields.contains_key(key);
    if record.error.is_some() {
        "Exception"
    } else if has("responseCode") || (has("duration") && has("url")) {
        "Request"
    } else if has("dependencyType") || has("target") {
        "RemoteDependency"
    } else if matches!(record.fields.get("value"), Some(LogValue::Int(_)) | Some(LogValue::Float(_))) {
        "Metric"
    } else {
        "Message"
    }
}

fn base_data_for(record: &LogRecord, telemetry_type: &'static str) -> Value {
    let mut properties = serde_json::Map::new();
    for (key, value) in &record.fields {
        properties.insert(key.clone(), log_value_to_json(value));
    }

    match telemetry_type {
        "Exception" => {
            let error = record.error.as_ref();
            json!({
                "ver": 2,
                "exceptions": [{
                    "typeName": error.map(|e| e.kind.clone()).unwrap_or_default(),
                    "message": error.map(|e| e.message.clone())
                        .or_else(|| record.message.as_deref().map(str::to_string))
                        .unwrap_or_default(),
                    "hasFullStack": error.and_then(|e| e.stack.as_ref()).is_some(),
                }],
                "properties": properties,
            })
        }
        "Metric" => {
            let value = match record.fields.get("value") {
                Some(LogValue::Int(i)) => *i as f64,
                Some(LogValue::Float(f)) => *f,
                _ => 0.0,
            };
            json!({
                "ver": 2,
                "metrics": [{
                    "name": record.message.as_deref().unwrap_or("metric"),
                    "value": value,
                }],
                "properties": properties,
            })
        }
        "Request" | "RemoteDependency" => {
            json!({
                "ver": 2,
                "name": record.message.as_deref().unwrap_or_default(),
                "success": !matches!(record.level, signalpipe_core::Level::Error | signalpipe_core::Level::Fatal),
                "properties": properties,
            })
        }
        _ => json!({
            "ver": 2,
            "message": record.message.as_deref().unwrap_or_default(),
            "severityLevel": severity_level(record.level),
            "properties": properties,
        }),
    }
}

fn severity_level(level: signalpipe_core::Level) -> u8 {
    use signalpipe_core::Level;
    match level {
        Level::Trace | Level::Debug => 0,
        Level::Info => 1,
        Level::Warn => 2,
        Level::Error => 3,
        Level::Fatal => 4,
    }
}

fn log_value_to_json(value: &LogValue) -> Value {
    match value {
        LogValue::Null => Value::Null,
        LogValue::Bool(b) => json!(b),
        LogValue::Int(i) => json!(i),
        LogValue::Float(f) => serde_json::Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
        LogValue::Str(s) => json!(s.as_ref()),
        LogValue::Bytes(b) => json!(base64::engine::general_purpose::STANDARD.encode(b.as_ref())),
        LogValue::List(items) => Value::Array(items.iter().map(log_value_to_json).collect()),
        LogValue::Map(map) => {
            let mut obj = serde_json::Map::new();
            for (k, v) in map.iter() {
                obj.insert(k.clone(), log_value_to_json(v));
            }
            Value::Object(obj)
        }
        LogValue::Error(e) => json!({"type": e.kind, "message": e.message}),
    }
}

fn iso8601(time_ms: u64) -> String {
    DateTime::<Utc>::from_timestamp_millis(time_ms as i64)
        .unwrap_or_else(Utc::now)
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

fn gzip(body: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), GzCompression::default());
    encoder
        .write_all(body)
        .and_then(|_| encoder.finish())
        .map_err(|e| Error::transport("azure_monitor", format!("gzip failed: {e}")))
}

#[async_trait]
impl BatchTransport for AzureMonitorTransport {
    fn serialize_batch(&self, records: &[Arc<LogRecord>]) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        for record in records {
            body.extend_from_slice(self.envelope_for(record).to_string().as_bytes());
            body.push(b'\n');
        }
        gzip(&body)
    }

    async fn send_batch(&self, body: Vec<u8>, _records: &[Arc<LogRecord>]) -> SendOutcome {
        let response = match self
            .client
            .post(&self.endpoint)
            .header("content-type", "application/x-json-stream")
            .header("content-encoding", "gzip")
            .body(body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) if e.is_timeout() || e.is_connect() => {
                return SendOutcome::Retriable(format!("network error: {e}"))
            }
            Err(e) => return SendOutcome::NonRetriable(e.to_string()),
        };

        let status = response.status().as_u16();
        match classify_status(status) {
            Retriability::Retriable => SendOutcome::Retriable(format!("track endpoint returned {status}")),
            Retriability::NonRetriable if status >= 400 => {
                SendOutcome::NonRetriable(format!("track endpoint returned {status}"))
            }
            _ => {
                metrics::counter!("signalpipe_azure_monitor_envelopes_sent_total").increment(1);
                SendOutcome::Ok
            }
        }
    }
}

pub fn build(
    connection_string: &str,
    batch_size: usize,
    batch_interval: Duration,
) -> Result<Arc<dyn Sink>> {
    let transport = AzureMonitorTransport::new(connection_string)?;
    Ok(HttpBatchSink::new(
        "azure_monitor",
        transport,
        batch_size,
        batch_interval,
        Backoff::default(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use signalpipe_core::{ErrorShape, HostMetadata, Level};

    fn transport() -> AzureMonitorTransport {
        AzureMonitorTransport::new(
            "InstrumentationKey=11111111-2222-3333-4444-555555555555;IngestionEndpoint=https://westus-0.in.applicationinsights.azure.com/",
        )
        .unwrap()
    }

    #[test]
    fn parses_instrumentation_key_and_endpoint() {
        let t = transport();
        assert_eq!(t.instrumentation_key, "11111111-2222-3333-4444-555555555555");
        assert_eq!(
            t.endpoint,
            "https://westus-0.in.applicationinsights.azure.com/v2/track"
        );
    }

    #[test]
    fn missing_instrumentation_key_is_a_configuration_error() {
        assert!(AzureMonitorTransport::new("IngestionEndpoint=https://x/").is_err());
    }

    #[test]
    fn falls_back_to_default_endpoint_when_unspecified() {
        let t = AzureMonitorTransport::new("InstrumentationKey=abc").unwrap();
        assert_eq!(t.endpoint, DEFAULT_ENDPOINT);
    }

    #[test]
    fn envelope_name_embeds_instrumentation_key_and_type() {
        let t = transport();
        let record = LogRecord::new(Level::Info, 1_700_000_000_000, HostMetadata::current("svc"))
            .with_message("hello");
        let envelope = t.envelope_for(&record);
        assert_eq!(
            envelope["name"],
            "Microsoft.ApplicationInsights.11111111-2222-3333-4444-555555555555.Message"
        );
        assert_eq!(envelope["data"]["baseType"], "MessageData");
    }

    #[test]
    fn exception_shaped_record_maps_to_exception_telemetry() {
        let t = transport();
        let mut record = LogRecord::new(Level::Error, 0, HostMetadata::current("svc"));
        record.error = Some(ErrorShape::new("IoError", "disk full"));
        let envelope = t.envelope_for(&record);
        assert_eq!(envelope["data"]["baseType"], "ExceptionData");
        assert_eq!(
            envelope["data"]["baseData"]["exceptions"][0]["typeName"],
            "IoError"
        );
    }

    #[test]
    fn metric_shaped_record_maps_to_metric_telemetry() {
        let t = transport();
        let mut record = LogRecord::new(Level::Info, 0, HostMetadata::current("svc"))
            .with_message("queue_depth");
        record.set_field("value", LogValue::Float(42.5)).unwrap();
        let envelope = t.envelope_for(&record);
        assert_eq!(envelope["data"]["baseType"], "MetricData");
        assert_eq!(envelope["data"]["baseData"]["metrics"][0]["value"], 42.5);
    }

    #[test]
    fn serialized_batch_is_gzip_compressed_ndjson() {
        let t = transport();
        let record = Arc::new(
            LogRecord::new(Level::Info, 0, HostMetadata::current("svc")).with_message("hi"),
        );
        let body = t.serialize_batch(&[record]).unwrap();
        // gzip member header magic bytes.
        assert_eq!(&body[0..2], &[0x1f, 0x8b]);
    }
}
