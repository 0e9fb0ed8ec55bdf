//! HTTP transport for processing jobs.

use async_trait::async_trait;
use docflow_core::models::WebhookConfig;
use hmac::{Hmac, Mac};
use reqwest::Client;
use sha2::Sha256;
use std::time::Duration;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying `v1={hex hmac}` of the request body.
pub const SIGNATURE_HEADER: &str = "X-Docflow-Signature";

const USER_AGENT: &str = "Docflow-Dispatcher/1.0";
const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Processing endpoint timed out after {0:?}")]
    Timeout(Duration),

    #[error("Could not reach processing endpoint: {0}")]
    Connect(String),

    #[error("Processing endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid processing request: {0}")]
    Request(String),
}

impl TransportError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            TransportError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Sends one job request. Implementations make exactly one attempt; the
/// dispatcher owns retries and the overall per-attempt timeout.
#[async_trait]
pub trait JobTransport: Send + Sync {
    /// Returns the 2xx status code on success.
    async fn send(
        &self,
        config: &WebhookConfig,
        body: &str,
        timeout: Duration,
    ) -> Result<u16, TransportError>;
}

/// `reqwest`-backed transport.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> anyhow::Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client for dispatch: {}", e))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

/// Hex HMAC-SHA256 of `body` under `secret`.
pub fn sign_body(body: &str, secret: &str) -> Result<String, TransportError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| TransportError::Request(format!("Invalid signing secret: {}", e)))?;
    mac.update(body.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[async_trait]
impl JobTransport for ReqwestTransport {
    async fn send(
        &self,
        config: &WebhookConfig,
        body: &str,
        timeout: Duration,
    ) -> Result<u16, TransportError> {
        let mut request = self
            .client
            .post(&config.url)
            .timeout(timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::USER_AGENT, USER_AGENT);

        for (name, value) in &config.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        if let Some(secret) = config.signing_secret.as_deref() {
            let signature = sign_body(body, secret)?;
            request = request.header(SIGNATURE_HEADER, format!("v1={}", signature));
        }

        let response = request.body(body.to_string()).send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(timeout)
            } else if e.is_builder() {
                TransportError::Request(e.to_string())
            } else {
                TransportError::Connect(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(status.as_u16());
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("Failed to read response body"));
        Err(TransportError::Status {
            status: status.as_u16(),
            body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
        })
    }
}
