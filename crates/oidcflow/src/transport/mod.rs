//! HTTP transport abstraction.
//!
//! The engine never talks to the network directly. It builds an
//! [`HttpRequest`] and hands it to an [`HttpTransport`], which either returns
//! a successful (2xx) [`HttpResponse`] or a [`TransportError`] saying whether
//! the server was unreachable or answered with an error status.

mod reqwest_transport;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use url::Url;

pub use reqwest_transport::ReqwestTransport;

/// Errors raised by a transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The server could not be reached (DNS, connect, timeout, offline).
    #[error("connectivity failure: {0}")]
    Connectivity(String),

    /// The server answered with a non-success status.
    #[error("HTTP {status}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, usually an OAuth error document.
        body: String,
    },

    /// The response body could not be decoded.
    #[error("failed to decode response: {0}")]
    Decode(String),

    /// Anything else (invalid request, TLS setup).
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Returns `true` for connectivity-class failures.
    #[must_use]
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity(_))
    }

    /// The HTTP status, if the server answered.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Parses the OAuth error document (`error`, `error_description`) from a
    /// status error body.
    #[must_use]
    pub fn oauth_error(&self) -> Option<OAuthErrorBody> {
        match self {
            Self::Status { body, .. } => serde_json::from_str(body).ok(),
            _ => None,
        }
    }
}

/// The error document of RFC 6749 section 5.2.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct OAuthErrorBody {
    /// Error code.
    pub error: String,
    /// Optional description.
    pub error_description: Option<String>,
}

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    /// GET
    Get,
    /// POST
    Post,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Get => f.write_str("GET"),
            Self::Post => f.write_str("POST"),
        }
    }
}

/// An outgoing request.
#[derive(Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Method.
    pub method: HttpMethod,
    /// Target URL.
    pub url: Url,
    /// Header name/value pairs.
    pub headers: Vec<(String, String)>,
    /// Optional body.
    pub body: Option<String>,
}

impl fmt::Debug for HttpRequest {
    // Bodies and headers may carry tokens and verifiers.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRequest")
            .field("method", &self.method)
            .field("url", &self.url.path())
            .finish_non_exhaustive()
    }
}

impl HttpRequest {
    /// A GET expecting JSON.
    #[must_use]
    pub fn get(url: Url) -> Self {
        Self {
            method: HttpMethod::Get,
            url,
            headers: vec![("Accept".into(), "application/json".into())],
            body: None,
        }
    }

    /// A POST with a form-urlencoded body, expecting JSON.
    #[must_use]
    pub fn post_form<K, V>(url: Url, params: &[(K, V)]) -> Self
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params.iter().map(|(k, v)| (k.as_ref(), v.as_ref())))
            .finish();
        Self {
            method: HttpMethod::Post,
            url,
            headers: vec![
                ("Accept".into(), "application/json".into()),
                (
                    "Content-Type".into(),
                    "application/x-www-form-urlencoded".into(),
                ),
            ],
            body: Some(body),
        }
    }

    /// Adds an `Authorization: Bearer` header.
    #[must_use]
    pub fn with_bearer(mut self, token: &str) -> Self {
        self.headers
            .push(("Authorization".into(), format!("Bearer {token}")));
        self
    }

    /// Returns the value of the first header named `name` (case-insensitive).
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Decodes a form body into pairs.
    #[must_use]
    pub fn form_params(&self) -> Vec<(String, String)> {
        self.body
            .as_deref()
            .map(|body| {
                url::form_urlencoded::parse(body.as_bytes())
                    .into_owned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// A successful response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status (2xx).
    pub status: u16,
    /// Response body.
    pub body: String,
}

impl HttpResponse {
    /// Creates a response.
    #[must_use]
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Decodes the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Decode` if the body is not the expected JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, TransportError> {
        serde_json::from_str(&self.body).map_err(|e| TransportError::Decode(e.to_string()))
    }
}

/// Sends HTTP requests on behalf of the engine.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Sends `request`.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Connectivity` if the server cannot be
    /// reached and `TransportError::Status` for non-2xx answers.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

#[async_trait]
impl<T: HttpTransport + ?Sized> HttpTransport for Arc<T> {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        (**self).send(request).await
    }
}

/// Sends `request`, retrying up to `retries` more times on any failure.
pub(crate) async fn send_with_retries(
    transport: &dyn HttpTransport,
    request: HttpRequest,
    retries: u32,
) -> Result<HttpResponse, TransportError> {
    let mut attempt = 0;
    loop {
        match transport.send(request.clone()).await {
            Ok(response) => return Ok(response),
            Err(err) if attempt < retries => {
                attempt += 1;
                tracing::debug!(
                    url = %request.url.path(),
                    attempt,
                    error = %err,
                    "Request failed, retrying"
                );
            }
            Err(err) => return Err(err),
        }
    }
}
