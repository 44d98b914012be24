//! HTTP transport (reqwest).

use super::Transport;
use crate::error::TransportError;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;

const MSGPACK: &str = "application/msgpack";

/// POSTs MessagePack to `<base_url>/sync`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpTransport {
    /// Transport for the reactor at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))?;
        Ok(Self {
            client,
            url: sync_url(base_url),
        })
    }
}

fn sync_url(base_url: &str) -> String {
    format!("{}/sync", base_url.trim_end_matches('/'))
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, body: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, MSGPACK)
            .body(body)
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
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    fn endpoint(&self) -> &str {
        &self.url
    }
}
