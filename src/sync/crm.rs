//! External CRM sync endpoint client.
//!
//! One logical operation: create a pipeline record from a flat
//! key-value payload plus an idempotency key, returning the provider's
//! reference id or a structured error the retry policy can classify.

use std::time::Duration;

use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::instrument;

use crate::config::CrmConfig;
use crate::matching::models::MatchCandidate;

#[derive(Debug, Error)]
pub enum CrmError {
    #[error("network error: {0}")]
    Network(String),
    #[error("server error ({status})")]
    Server { status: u16 },
    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },
    #[error("rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl CrmError {
    /// Everything except an explicit rejection is worth retrying.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Flat payload for the CRM's create-record call.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRecord {
    pub watch_id: i64,
    pub listing_id: String,
    pub address: Option<String>,
    pub location: String,
    pub price: Option<Decimal>,
    pub score: u8,
    /// Ordered reasons joined into one field; the CRM wants flat
    /// key-value pairs, not nested structures.
    pub reasons: String,
    pub strategy: Option<String>,
    pub url: Option<String>,
}

impl PipelineRecord {
    pub fn from_candidate(candidate: &MatchCandidate, strategy: Option<&str>) -> Self {
        Self {
            watch_id: candidate.watch_id,
            listing_id: candidate.listing.id.clone(),
            address: candidate.listing.address.clone(),
            location: candidate.listing.location.clone(),
            price: candidate.listing.price,
            score: candidate.score,
            reasons: candidate.reasons.join("; "),
            strategy: strategy.map(str::to_string),
            url: candidate.listing.url.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreateRecordResponse {
    id: String,
}

pub struct CrmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl CrmClient {
    pub fn new(config: &CrmConfig, api_key: Option<SecretString>) -> Result<Self, CrmError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| CrmError::Network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    /// Create one pipeline record. Safe to retry with the same
    /// idempotency key: the provider deduplicates on it.
    #[instrument(skip(self, record), fields(listing_id = %record.listing_id, watch_id = record.watch_id))]
    pub async fn create_pipeline_record(
        &self,
        record: &PipelineRecord,
        idempotency_key: &str,
    ) -> Result<String, CrmError> {
        let url = format!("{}/records", self.base_url);

        let mut request = self
            .http
            .post(&url)
            .header("Idempotency-Key", idempotency_key)
            .json(record);

        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        let resp = request
            .send()
            .await
            .map_err(|e| CrmError::Network(format!("HTTP error: {e}")))?;

        let status = resp.status();

        if status.is_success() {
            let body: CreateRecordResponse = resp
                .json()
                .await
                .map_err(|e| CrmError::Network(format!("Malformed CRM response: {e}")))?;
            return Ok(body.id);
        }

        if status.as_u16() == 429 {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(CrmError::RateLimited { retry_after });
        }

        if status.is_server_error() {
            return Err(CrmError::Server {
                status: status.as_u16(),
            });
        }

        let message = resp.text().await.unwrap_or_default();
        Err(CrmError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}

/// Deterministic idempotency key for one (watch, listing) pair. The
/// same pair always produces the same key, so a retried create can
/// never duplicate the external record.
pub fn idempotency_key(watch_id: i64, listing_id: &str) -> String {
    let digest = Sha256::digest(format!("watch:{watch_id}:listing:{listing_id}").as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_record() -> PipelineRecord {
        PipelineRecord {
            watch_id: 7,
            listing_id: "L1".to_string(),
            address: Some("12 Oak Ln".to_string()),
            location: "austin-tx".to_string(),
            price: Some(dec!(875000)),
            score: 100,
            reasons: "Located in austin-tx; Price in budget".to_string(),
            strategy: Some("buy-and-hold".to_string()),
            url: None,
        }
    }

    async fn client_for(server: &MockServer) -> CrmClient {
        let config = CrmConfig {
            base_url: server.uri(),
            request_timeout_seconds: 5,
        };
        CrmClient::new(&config, None).unwrap()
    }

    #[test]
    fn test_idempotency_key_is_deterministic() {
        let a = idempotency_key(7, "L1");
        let b = idempotency_key(7, "L1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        assert_ne!(idempotency_key(7, "L2"), a);
        assert_ne!(idempotency_key(8, "L1"), a);
    }

    #[tokio::test]
    async fn test_create_record_success() {
        let server = MockServer::start().await;
        let key = idempotency_key(7, "L1");

        Mock::given(method("POST"))
            .and(path("/records"))
            .and(header("Idempotency-Key", key.as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "crm-555"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let reference = client
            .create_pipeline_record(&test_record(), &key)
            .await
            .unwrap();
        assert_eq!(reference, "crm-555");
    }

    #[tokio::test]
    async fn test_rate_limited_with_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7"))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client
            .create_pipeline_record(&test_record(), "key")
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client
            .create_pipeline_record(&test_record(), "key")
            .await
            .unwrap_err();

        assert!(matches!(err, CrmError::Server { status: 503 }));
        assert!(err.is_transient());
        assert!(err.retry_after().is_none());
    }

    #[tokio::test]
    async fn test_validation_error_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(422).set_body_string("missing field"))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client
            .create_pipeline_record(&test_record(), "key")
            .await
            .unwrap_err();

        assert!(!err.is_transient());
        assert!(matches!(
            err,
            CrmError::Rejected { status: 422, ref message } if message == "missing field"
        ));
    }
}
