//! [`HttpTransport`] backed by `reqwest`.

use std::time::Duration;

use async_trait::async_trait;

use super::{HttpMethod, HttpRequest, HttpResponse, HttpTransport, TransportError};

/// Sends requests with a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Creates a transport with a per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Other` if the TLS backend cannot be set up.
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Other(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Wraps an existing client.
    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn map_error(err: reqwest::Error) -> TransportError {
    if err.is_connect() || err.is_timeout() {
        TransportError::Connectivity(err.to_string())
    } else if err.is_decode() {
        TransportError::Decode(err.to_string())
    } else if err.is_request() && err.status().is_none() {
        // Requests that never got a response (reset connections, DNS).
        TransportError::Connectivity(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(request.url.clone()),
            HttpMethod::Post => self.client.post(request.url.clone()),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        tracing::trace!(method = %request.method, url = %request.url.path(), "Sending request");

        let response = builder.send().await.map_err(map_error)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(map_error)?;

        if !(200..300).contains(&status) {
            tracing::debug!(status, url = %request.url.path(), "Request returned error status");
            return Err(TransportError::Status { status, body });
        }

        Ok(HttpResponse { status, body })
    }
}
