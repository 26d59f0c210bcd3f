use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use rand::RngCore;
use reqwest::Client;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use signalpipe_core::{LogRecord, Serializer, SerializerPolicy};

use crate::backoff::Backoff;
use crate::error::{Result, Retriability};
use crate::sink::Sink;
use crate::sinks::http_batch::{BatchTransport, HttpBatchSink, SendOutcome};

type HmacSha256 = Hmac<Sha256>;

/// AWS SigV4-signed PutLogEvents transport (§4.9). Threads a sequence token
/// between calls the way the wire protocol requires, and treats
/// `ResourceAlreadyExistsException` during init as success rather than an
/// error — the two replicas racing to create the same stream is the
/// expected case, not a fault.
pub struct CloudWatchTransport {
    region: String,
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
    log_group: String,
    log_stream: String,
    endpoint: String,
    client: Client,
    serializer: Mutex<Serializer>,
    policy: SerializerPolicy,
    sequence_token: Mutex<Option<String>>,
    resources_ready: AtomicBool,
}

impl CloudWatchTransport {
    pub fn new(
        region: impl Into<String>,
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        session_token: Option<String>,
        log_group: impl Into<String>,
        hostname: &str,
    ) -> Self {
        let region = region.into();
        let mut random_bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut random_bytes);
        let random_hex: String = random_bytes.iter().map(|b| format!("{b:02x}")).collect();
        let log_stream = format!(
            "{}-{}-{}",
            hostname,
            Utc::now().format("%Y-%m-%d"),
            random_hex
        );

        Self {
            endpoint: format!("https://logs.{region}.amazonaws.com"),
            region,
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token,
            log_group: log_group.into(),
            log_stream,
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client with default TLS config"),
            serializer: Mutex::new(Serializer::default()),
            policy: SerializerPolicy::default(),
            sequence_token: Mutex::new(None),
            resources_ready: AtomicBool::new(false),
        }
    }

    /// Overrides the default `logs.{region}.amazonaws.com` endpoint —
    /// VPC endpoints, LocalStack, and tests all need to point elsewhere.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn signing_key(&self, date_stamp: &str) -> Vec<u8> {
        let k_secret = format!("AWS4{}", self.secret_access_key);
        let k_date = hmac_sha256(k_secret.as_bytes(), date_stamp.as_bytes());
        let k_region = hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = hmac_sha256(&k_region, b"logs");
        hmac_sha256(&k_service, b"aws4_request")
    }

    /// Signs `body` for `target` (e.g. `Logs_20140328.PutLogEvents`) and
    /// returns the full header set to attach to the request.
    fn sign_request(&self, target: &str, body: &[u8]) -> Vec<(String, String)> {
        let now = Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = now.format("%Y%m%d").to_string();
        let host = format!("logs.{}.amazonaws.com", self.region);

        let payload_hash = hex_digest(body);
        let mut signed_headers = vec![
            ("content-type".to_string(), "application/x-amz-json-1.1".to_string()),
            ("host".to_string(), host.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
            ("x-amz-target".to_string(), target.to_string()),
        ];
        if let Some(token) = &self.session_token {
            signed_headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        signed_headers.sort_by(|a, b| a.0.cmp(&b.0));

        let canonical_headers: String = signed_headers
            .iter()
            .map(|(k, v)| format!("{k}:{v}\n"))
            .collect();
        let signed_header_names = signed_headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");

        let canonical_request = format!(
            "POST\n/\n\n{canonical_headers}\n{signed_header_names}\n{payload_hash}"
        );
        let credential_scope = format!("{date_stamp}/{}/logs/aws4_request", self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{credential_scope}\n{}",
            hex_digest(canonical_request.as_bytes())
        );

        let signing_key = self.signing_key(&date_stamp);
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{credential_scope}, SignedHeaders={signed_header_names}, Signature={signature}",
            self.access_key_id
        );

        let mut headers = signed_headers;
        headers.push(("authorization".to_string(), authorization));
        headers
    }

    async fn post(&self, target: &str, body: Vec<u8>) -> Result<(u16, Value)> {
        let headers = self.sign_request(target, &body);
        let mut request = self.client.post(&self.endpoint).body(body);
        for (name, value) in headers {
            if name == "host" {
                continue;
            }
            request = request.header(name, value);
        }
        let response = request
            .send()
            .await
            .map_err(|e| crate::error::Error::transport("cloudwatch", e.to_string()))?;
        let status = response.status().as_u16();
        let parsed: Value = response.json().await.unwrap_or(Value::Null);
        Ok((status, parsed))
    }

    async fn ensure_resources(&self) {
        if self.resources_ready.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(log_group = %self.log_group, log_stream = %self.log_stream, "creating cloudwatch log group/stream");
        let group_body = json!({ "logGroupName": self.log_group }).to_string().into_bytes();
        let _ = self.post("Logs_20140328.CreateLogGroup", group_body).await;
        let stream_body = json!({
            "logGroupName": self.log_group,
            "logStreamName": self.log_stream,
        })
        .to_string()
        .into_bytes();
        let _ = self.post("Logs_20140328.CreateLogStream", stream_body).await;
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[async_trait]
impl BatchTransport for CloudWatchTransport {
    fn serialize_batch(&self, records: &[Arc<LogRecord>]) -> Result<Vec<u8>> {
        let mut sorted: Vec<&Arc<LogRecord>> = records.iter().collect();
        sorted.sort_by_key(|r| r.time_ms);

        let mut serializer = self.serializer.lock();
        let events: Vec<Value> = sorted
            .iter()
            .map(|record| {
                let message = serializer.serialize(record, &self.policy);
                json!({
                    "timestamp": record.time_ms,
                    "message": String::from_utf8_lossy(&message),
                })
            })
            .collect();

        let mut body = json!({
            "logGroupName": self.log_group,
            "logStreamName": self.log_stream,
            "logEvents": events,
        });
        if let Some(token) = self.sequence_token.lock().clone() {
            body["sequenceToken"] = Value::String(token);
        }
        Ok(body.to_string().into_bytes())
    }

    async fn send_batch(&self, body: Vec<u8>, _records: &[Arc<LogRecord>]) -> SendOutcome {
        self.ensure_resources().await;

        let (status, parsed) = match self.post("Logs_20140328.PutLogEvents", body).await {
            Ok(r) => r,
            Err(e) => return SendOutcome::Retriable(e.to_string()),
        };

        let exception_type = parsed
            .get("__type")
            .and_then(Value::as_str)
            .unwrap_or_default();

        if status == 200 && exception_type.is_empty() {
            if let Some(token) = parsed.get("nextSequenceToken").and_then(Value::as_str) {
                *self.sequence_token.lock() = Some(token.to_string());
            }
            return SendOutcome::Ok;
        }

        if exception_type.contains("InvalidSequenceTokenException") {
            if let Some(expected) = parsed
                .get("expectedSequenceToken")
                .and_then(Value::as_str)
            {
                *self.sequence_token.lock() = Some(expected.to_string());
            }
            tracing::debug!(log_stream = %self.log_stream, "sequence token stale, resubmitting with refreshed token");
            metrics::counter!("signalpipe_cloudwatch_sequence_token_retries_total").increment(1);
            return SendOutcome::Retriable("sequence token out of date, resubmitting".to_string());
        }

        if exception_type.contains("ResourceAlreadyExistsException") {
            return SendOutcome::Ok;
        }

        match crate::error::classify_status(status) {
            Retriability::Retriable => SendOutcome::Retriable(format!("cloudwatch status {status}")),
            Retriability::NonRetriable => {
                SendOutcome::NonRetriable(format!("cloudwatch error {exception_type} ({status})"))
            }
        }
    }

    fn max_body_bytes(&self) -> usize {
        1_048_576
    }
}

pub fn build(
    region: impl Into<String>,
    access_key_id: impl Into<String>,
    secret_access_key: impl Into<String>,
    session_token: Option<String>,
    log_group: impl Into<String>,
    hostname: &str,
    batch_size: usize,
    batch_interval: Duration,
) -> Arc<dyn Sink> {
    HttpBatchSink::new(
        "cloudwatch",
        CloudWatchTransport::new(
            region,
            access_key_id,
            secret_access_key,
            session_token,
            log_group,
            hostname,
        ),
        batch_size,
        batch_interval,
        Backoff::default(),
    )
}
