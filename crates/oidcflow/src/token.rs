//! Token response and ID token claim types, plus helpers that read tokens
//! without verifying them.
//!
//! Nothing in this module establishes trust. Signature and claim checks
//! live in [`crate::validation`].

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

/// Errors raised when a compact JWT cannot be read.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenDecodeError {
    /// The token does not have three dot-separated segments.
    #[error("token is not a compact JWS")]
    Malformed,

    /// The payload segment is not base64url.
    #[error("token payload is not base64url: {0}")]
    Base64(String),

    /// The payload is not the expected JSON.
    #[error("token payload is not valid JSON: {0}")]
    Json(String),
}

/// The `aud` claim: a single string or an array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    /// `"aud": "client"`
    One(String),
    /// `"aud": ["client", "api"]`
    Many(Vec<String>),
}

impl Audience {
    /// Returns `true` if `client_id` is among the audiences.
    #[must_use]
    pub fn contains(&self, client_id: &str) -> bool {
        match self {
            Self::One(aud) => aud == client_id,
            Self::Many(auds) => auds.iter().any(|a| a == client_id),
        }
    }

    /// Number of audiences.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::One(_) => 1,
            Self::Many(auds) => auds.len(),
        }
    }

    /// Returns `true` for an empty array.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Claims of an ID token.
///
/// Every claim is optional here so that a token missing a required claim is
/// reported by the validator rather than by the deserializer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdTokenClaims {
    /// Issuer identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,

    /// Subject identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,

    /// Audience.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<Audience>,

    /// Expiration time (Unix timestamp).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,

    /// Issued at time (Unix timestamp).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,

    /// Nonce echoed from the authorize request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,

    /// Time of authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_time: Option<i64>,

    /// Access token hash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at_hash: Option<String>,

    /// Authorized party.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azp: Option<String>,

    /// Session id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,

    /// Everything else (profile claims, custom claims).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A token endpoint response, or the fragment of an implicit-flow callback.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenResponse {
    /// The access token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,

    /// Token type, usually `Bearer`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,

    /// Access token lifetime in seconds.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_expires_in"
    )]
    pub expires_in: Option<u64>,

    /// Refresh token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// ID token (compact JWS).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,

    /// Granted scopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    /// Session state for check-session polling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_state: Option<String>,
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResponse")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("has_access_token", &self.access_token.is_some())
            .field("has_id_token", &self.id_token.is_some())
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("scope", &self.scope)
            .finish()
    }
}

/// `expires_in` arrives as a number from token endpoints and as a string
/// from implicit-flow fragments.
fn deserialize_expires_in<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(u64),
        String(String),
    }

    match Option::<NumberOrString>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumberOrString::Number(n)) => Ok(Some(n)),
        Some(NumberOrString::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Decodes the payload of a compact JWT without verifying it.
///
/// # Errors
///
/// Returns an error if the token is not three segments or the payload is
/// not base64url JSON of the requested shape.
pub fn decode_payload<T: DeserializeOwned>(token: &str) -> Result<T, TokenDecodeError> {
    let mut segments = token.split('.');
    let (Some(_header), Some(payload), Some(_signature), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(TokenDecodeError::Malformed);
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| TokenDecodeError::Base64(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| TokenDecodeError::Json(e.to_string()))
}

/// Decodes the claims of an ID token without verifying it.
///
/// # Errors
///
/// See [`decode_payload`].
pub fn decode_claims(id_token: &str) -> Result<IdTokenClaims, TokenDecodeError> {
    decode_payload(id_token)
}

/// Returns `true` when a token expiring at `exp` (Unix seconds) must be
/// treated as expired at `now`, given that it has to stay valid for at least
/// `offset_seconds` more.
#[must_use]
pub fn expires_within(exp: i64, offset_seconds: u64, now: OffsetDateTime) -> bool {
    let offset = i64::try_from(offset_seconds).unwrap_or(i64::MAX);
    exp <= now.unix_timestamp().saturating_add(offset)
}

/// Computes `at_hash`: base64url of the left half of SHA-256 over the ASCII
/// access token.
#[must_use]
pub fn at_hash(access_token: &str) -> String {
    let hash = Sha256::digest(access_token.as_bytes());
    URL_SAFE_NO_PAD.encode(&hash[..hash.len() / 2])
}

/// A 256-bit random value, base64url encoded, for `state` and `nonce`.
#[must_use]
pub fn random_token() -> String {
    use rand::Rng;
    let bytes: [u8; 32] = rand::thread_rng().r#gen();
    URL_SAFE_NO_PAD.encode(bytes)
}
