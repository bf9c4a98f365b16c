use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;

use gradeline_generator::{SIGNATURE_HEADER, SignedPayload};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("endpoint responded with status {0}")]
    Status(u16),

    #[error("request timed out")]
    Timeout,
}

/// Carries a signed task payload to a recipient endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, endpoint: &str, payload: &SignedPayload) -> Result<(), TransportError>;
}

/// JSON over HTTP POST, signature in [`SIGNATURE_HEADER`].
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, endpoint: &str, payload: &SignedPayload) -> Result<(), TransportError> {
        let response = self
            .client
            .post(endpoint)
            .header(CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, &payload.signature)
            .body(payload.body.clone())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::Request(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(TransportError::Status(status.as_u16()))
        }
    }
}
