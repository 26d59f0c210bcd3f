use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::sign::Signer;
use parking_lot::Mutex;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::Client;
use serde_json::{json, Value};
use signalpipe_core::{Level, LogRecord};

use crate::backoff::Backoff;
use crate::error::{classify_status, Error, Result, Retriability};
use crate::sink::Sink;
use crate::sinks::http_batch::{BatchTransport, HttpBatchSink, SendOutcome};

const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
const ENTRIES_WRITE_ENDPOINT: &str = "https://logging.googleapis.com/v2/entries:write";
const SCOPE: &str = "https://www.googleapis.com/auth/logging.write";
const TOKEN_REFRESH_SKEW: Duration = Duration::from_secs(60);

struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

/// Google Cloud Logging transport (§4.10). Exchanges a service-account JWT
/// for a short-lived OAuth2 access token and caches it, refreshing once
/// within 60 s of expiry rather than on every batch.
pub struct StackdriverTransport {
    client_email: String,
    private_key_pem: String,
    project_id: String,
    log_name: String,
    client: Client,
    token: Mutex<Option<CachedToken>>,
    token_endpoint: String,
    entries_endpoint: String,
}

impl StackdriverTransport {
    pub fn new(
        client_email: impl Into<String>,
        private_key_pem: impl Into<String>,
        project_id: impl Into<String>,
        log_name: impl Into<String>,
    ) -> Self {
        Self {
            client_email: client_email.into(),
            private_key_pem: private_key_pem.into(),
            project_id: project_id.into(),
            log_name: log_name.into(),
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client with default TLS config"),
            token: Mutex::new(None),
            token_endpoint: TOKEN_ENDPOINT.to_string(),
            entries_endpoint: ENTRIES_WRITE_ENDPOINT.to_string(),
        }
    }

    /// Overrides the OAuth2 token endpoint and `entries:write` endpoint —
    /// tests point these at a mock server instead of Google's real hosts.
    pub fn with_endpoints(mut self, token_endpoint: impl Into<String>, entries_endpoint: impl Into<String>) -> Self {
        self.token_endpoint = token_endpoint.into();
        self.entries_endpoint = entries_endpoint.into();
        self
    }

    fn build_jwt(&self) -> Result<String> {
        let now = Utc::now();
        let header = json!({"alg": "RS256", "typ": "JWT"});
        let claims = json!({
            "iss": self.client_email,
            "scope": SCOPE,
            "aud": self.token_endpoint,
            "iat": now.timestamp(),
            "exp": now.timestamp() + 3600,
        });
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header.to_string()),
            URL_SAFE_NO_PAD.encode(claims.to_string())
        );

        let pkey = PKey::private_key_from_pem(self.private_key_pem.as_bytes())
            .map_err(|e| Error::security(format!("invalid service-account private key: {e}")))?;
        let mut signer = Signer::new(MessageDigest::sha256(), &pkey)
            .map_err(|e| Error::security(format!("failed to initialize RSA signer: {e}")))?;
        signer
            .update(signing_input.as_bytes())
            .map_err(|e| Error::security(e.to_string()))?;
        let signature = signer
            .sign_to_vec()
            .map_err(|e| Error::security(e.to_string()))?;

        Ok(format!(
            "{signing_input}.{}",
            URL_SAFE_NO_PAD.encode(signature)
        ))
    }

    async fn fetch_token(&self) -> std::result::Result<CachedToken, SendOutcome> {
        let jwt = self
            .build_jwt()
            .map_err(|e| SendOutcome::NonRetriable(e.to_string()))?;

        let response = self
            .client
            .post(&self.token_endpoint)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", &jwt),
            ])
            .send()
            .await
            .map_err(|e| SendOutcome::Retriable(format!("token exchange failed: {e}")))?;

        let status = response.status().as_u16();
        if classify_status(status) == Retriability::Retriable {
            return Err(SendOutcome::Retriable(format!("token endpoint returned {status}")));
        }
        if status >= 400 {
            return Err(SendOutcome::NonRetriable(format!(
                "token endpoint returned {status}"
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| SendOutcome::NonRetriable(format!("malformed token response: {e}")))?;
        let access_token = body["access_token"]
            .as_str()
            .ok_or_else(|| SendOutcome::NonRetriable("token response missing access_token".into()))?
            .to_string();
        let expires_in = body["expires_in"].as_i64().unwrap_or(3600);

        Ok(CachedToken {
            value: access_token,
            expires_at: Utc::now() + chrono::Duration::seconds(expires_in),
        })
    }

    async fn valid_token(&self) -> std::result::Result<String, SendOutcome> {
        {
            let cached = self.token.lock();
            if let Some(token) = cached.as_ref() {
                let remaining = token.expires_at - Utc::now();
                if remaining > chrono::Duration::from_std(TOKEN_REFRESH_SKEW).unwrap() {
                    return Ok(token.value.clone());
                }
            }
        }
        tracing::debug!("refreshing stackdriver oauth2 access token");
        let fresh = self.fetch_token().await?;
        metrics::counter!("signalpipe_stackdriver_token_refreshes_total").increment(1);
        let value = fresh.value.clone();
        *self.token.lock() = Some(fresh);
        Ok(value)
    }

    fn log_name_path(&self) -> String {
        format!(
            "projects/{}/logs/{}",
            self.project_id,
            utf8_percent_encode(&self.log_name, NON_ALPHANUMERIC)
        )
    }

    fn entry_for(&self, record: &LogRecord) -> Value {
        let timestamp = iso8601(record.time_ms);
        let mut entry = json!({
            "logName": self.log_name_path(),
            "severity": record.level.stackdriver_severity(),
            "timestamp": timestamp,
        });
        if record.fields.is_empty() {
            entry["textPayload"] = json!(record.message.as_deref().unwrap_or_default());
        } else {
            let mut payload = serde_json::Map::new();
            if let Some(message) = &record.message {
                payload.insert("msg".to_string(), json!(message.as_ref()));
            }
            for (key, value) in &record.fields {
                payload.insert(key.clone(), log_value_to_json(value));
            }
            entry["jsonPayload"] = Value::Object(payload);
        }
        entry
    }
}

fn iso8601(time_ms: u64) -> String {
    DateTime::<Utc>::from_timestamp_millis(time_ms as i64)
        .unwrap_or_else(Utc::now)
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

fn log_value_to_json(value: &signalpipe_core::LogValue) -> Value {
    use signalpipe_core::LogValue as LV;
    match value {
        LV::Null => Value::Null,
        LV::Bool(b) => json!(b),
        LV::Int(i) => json!(i),
        LV::Float(f) => serde_json::Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
        LV::Str(s) => json!(s.as_ref()),
        LV::Bytes(b) => json!(base64::engine::general_purpose::STANDARD.encode(b.as_ref())),
        LV::List(items) => Value::Array(items.iter().map(log_value_to_json).collect()),
        LV::Map(map) => {
            let mut obj = serde_json::Map::new();
            for (k, v) in map.iter() {
                obj.insert(k.clone(), log_value_to_json(v));
            }
            Value::Object(obj)
        }
        LV::Error(e) => json!({"type": e.kind, "message": e.message}),
    }
}

#[async_trait]
impl BatchTransport for StackdriverTransport {
    fn serialize_batch(&self, records: &[Arc<LogRecord>]) -> Result<Vec<u8>> {
        let entries: Vec<Value> = records.iter().map(|r| self.entry_for(r)).collect();
        let body = json!({ "entries": entries, "partialSuccess": true });
        Ok(body.to_string().into_bytes())
    }

    async fn send_batch(&self, body: Vec<u8>, _records: &[Arc<LogRecord>]) -> SendOutcome {
        let token = match self.valid_token().await {
            Ok(t) => t,
            Err(outcome) => return outcome,
        };

        let response = match self
            .client
            .post(&self.entries_endpoint)
            .bearer_auth(token)
            .header("content-type", "application/json")
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
            Retriability::Retriable => SendOutcome::Retriable(format!("entries:write returned {status}")),
            Retriability::NonRetriable if status >= 400 => {
                SendOutcome::NonRetriable(format!("entries:write returned {status}"))
            }
            _ => SendOutcome::Ok,
        }
    }
}

pub fn build(
    client_email: impl Into<String>,
    private_key_pem: impl Into<String>,
    project_id: impl Into<String>,
    log_name: impl Into<String>,
    batch_size: usize,
    batch_interval: Duration,
) -> Arc<dyn Sink> {
    HttpBatchSink::new(
        "stackdriver",
        StackdriverTransport::new(client_email, private_key_pem, project_id, log_name),
        batch_size,
        batch_interval,
        Backoff::default(),
    )
}
