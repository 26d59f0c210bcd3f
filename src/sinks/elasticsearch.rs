use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use reqwest::Client;
use serde_json::Value;
use signalpipe_core::{LogRecord, LogValue, Serializer, SerializerPolicy};

use crate::backoff::Backoff;
use crate::error::{classify_status, Result, Retriability};
use crate::sink::Sink;
use crate::sinks::http_batch::{BatchTransport, HttpBatchSink, SendOutcome};

/// Bulk NDJSON transport for Elasticsearch (§4.8). The index-name pattern
/// resolves `{YYYY}`, `{MM}`, `{DD}`, `{YYYY.MM.DD}` tokens against each
/// record's own timestamp, so a single batch can straddle a day boundary
/// and still land in the right daily index.
pub struct ElasticsearchTransport {
    endpoint: String,
    index_pattern: String,
    client: Client,
    serializer: Mutex<Serializer>,
    policy: SerializerPolicy,
    basic_auth: Option<(String, String)>,
}

impl ElasticsearchTransport {
    pub fn new(endpoint: impl Into<String>, index_pattern: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            index_pattern: index_pattern.into(),
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client with default TLS config"),
            serializer: Mutex::new(Serializer::default()),
            policy: SerializerPolicy::default(),
            basic_auth: None,
        }
    }

    pub fn with_basic_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.basic_auth = Some((user.into(), password.into()));
        self
    }

    fn resolve_index(&self, time_ms: u64) -> String {
        let dt = Utc
            .timestamp_millis_opt(time_ms as i64)
            .single()
            .unwrap_or_else(Utc::now);
        self.index_pattern
            .replace("{YYYY.MM.DD}", &dt.format("%Y.%m.%d").to_string())
            .replace("{YYYY}", &dt.format("%Y").to_string())
            .replace("{MM}", &dt.format("%m").to_string())
            .replace("{DD}", &dt.format("%d").to_string())
    }

    fn record_id(record: &LogRecord) -> Option<String> {
        record
            .fields
            .get("_id")
            .or_else(|| record.fields.get("id"))
            .and_then(LogValue::as_str)
            .map(str::to_string)
    }
}

#[async_trait]
impl BatchTransport for ElasticsearchTransport {
    fn serialize_batch(&self, records: &[Arc<LogRecord>]) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        let mut serializer = self.serializer.lock();
        for record in records {
            let index = self.resolve_index(record.time_ms);
            let action = match Self::record_id(record) {
                Some(id) => serde_json::json!({"index": {"_index": index, "_id": id}}),
                None => serde_json::json!({"index": {"_index": index}}),
            };
            body.extend_from_slice(action.to_string().as_bytes());
            body.push(b'\n');
            body.extend_from_slice(&serializer.serialize(record, &self.policy));
            body.push(b'\n');
        }
        Ok(body)
    }

    async fn send_batch(&self, body: Vec<u8>, records: &[Arc<LogRecord>]) -> SendOutcome {
        let mut request = self
            .client
            .post(format!("{}/_bulk", self.endpoint))
            .header("content-type", "application/x-ndjson")
            .body(body);
        if let Some((user, pass)) = &self.basic_auth {
            request = request.basic_auth(user, Some(pass));
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() || e.is_connect() => {
                return SendOutcome::Retriable(format!("network error: {e}"))
            }
            Err(e) => return SendOutcome::NonRetriable(format!("request build error: {e}")),
        };

        let status = response.status().as_u16();
        if classify_status(status) == Retriability::Retriable {
            return SendOutcome::Retriable(format!("bulk request returned {status}"));
        }
        if status >= 400 {
            return SendOutcome::NonRetriable(format!("bulk request returned {status}"));
        }

        let parsed: Value = match response.json().await {
            Ok(v) => v,
            Err(e) => return SendOutcome::NonRetriable(format!("malformed bulk response: {e}")),
        };

        if parsed.get("errors").and_then(Value::as_bool) == Some(true) {
            // The bulk response can report more items than the batch it
            // answers (a quirk of some ES-compatible backends under
            // concurrent writers); only the first `records.len()` entries
            // correspond to this batch, the rest are ignored.
            let any_retriable = parsed["items"]
                .as_array()
                .map(|items| items.iter().take(records.len()).any(item_error_is_retriable))
                .unwrap_or(false);
            tracing::warn!(any_retriable, "bulk response contained per-item errors");
            return if any_retriable {
                SendOutcome::Retriable("bulk response contained retriable per-item errors".into())
            } else {
                SendOutcome::NonRetriable("bulk response contained non-retriable per-item errors".into())
            };
        }

        SendOutcome::Ok
    }
}

fn item_error_is_retriable(item: &Value) -> bool {
    item["index"]["status"]
        .as_u64()
        .map(|status| classify_status(status as u16) == Retriability::Retriable)
        .unwrap_or(false)
}

pub fn build(
    endpoint: impl Into<String>,
    index_pattern: impl Into<String>,
    batch_size: usize,
    batch_interval: Duration,
) -> Arc<dyn Sink> {
    HttpBatchSink::new(
        "elasticsearch",
        ElasticsearchTransport::new(endpoint, index_pattern),
        batch_size,
        batch_interval,
        Backoff::default(),
    )
}
