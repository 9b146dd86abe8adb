//! Redirect callback parsing.
//!
//! The authorization server sends the browser back to the redirect URI
//! with the result in the query string (code flow) or the fragment
//! (implicit flow). [`CallbackParser`] turns that URL into
//! [`CallbackParams`], rejecting callbacks that cannot belong to a flow.
//!
//! Parameter order is irrelevant; query and fragment are both read.

use std::collections::BTreeMap;

use url::Url;

use crate::config::ResponseType;
use crate::jwks::JwtKeySet;
use crate::token::TokenResponse;
use crate::validation::ValidationOutcome;

/// Reasons a callback is rejected before any network call.
///
/// All of them are terminal for the callback and never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallbackError {
    /// The callback carries no `state`.
    #[error("callback is missing the state parameter")]
    MissingState,

    /// A code-flow callback carries no `code`.
    #[error("callback is missing the code parameter")]
    MissingCode,

    /// An implicit-flow callback carries no `id_token`.
    #[error("callback is missing the id_token parameter")]
    MissingIdToken,

    /// The authorization server reported an error (e.g. `login_required`).
    #[error("authorization server returned {error}")]
    AuthorizationServer {
        /// OAuth error code.
        error: String,
        /// Optional description.
        description: Option<String>,
    },
}

/// Parameters of a redirect callback.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CallbackParams {
    /// Authorization code.
    pub code: Option<String>,
    /// Echoed state.
    pub state: Option<String>,
    /// Session state for check-session polling.
    pub session_state: Option<String>,
    /// OAuth error code.
    pub error: Option<String>,
    /// OAuth error description.
    pub error_description: Option<String>,
    /// ID token (implicit flow).
    pub id_token: Option<String>,
    /// Access token (implicit flow).
    pub access_token: Option<String>,
    /// Every parameter, including the ones above.
    pub raw: BTreeMap<String, String>,
}

impl std::fmt::Debug for CallbackParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackParams")
            .field("has_code", &self.code.is_some())
            .field("has_state", &self.state.is_some())
            .field("error", &self.error)
            .field("has_id_token", &self.id_token.is_some())
            .finish_non_exhaustive()
    }
}

impl CallbackParams {
    fn from_pairs(raw: BTreeMap<String, String>) -> Self {
        let get = |key: &str| raw.get(key).filter(|v| !v.is_empty()).cloned();
        Self {
            code: get("code"),
            state: get("state"),
            session_state: get("session_state"),
            error: get("error"),
            error_description: get("error_description"),
            id_token: get("id_token"),
            access_token: get("access_token"),
            raw,
        }
    }

    /// The tokens carried by an implicit-flow callback.
    #[must_use]
    pub fn token_response(&self) -> TokenResponse {
        let get = |key: &str| self.raw.get(key).filter(|v| !v.is_empty()).cloned();
        TokenResponse {
            access_token: self.access_token.clone(),
            token_type: get("token_type"),
            expires_in: get("expires_in").and_then(|v| v.parse().ok()),
            refresh_token: None,
            id_token: self.id_token.clone(),
            scope: get("scope"),
            session_state: self.session_state.clone(),
        }
    }
}

/// Parses redirect callbacks.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallbackParser;

impl CallbackParser {
    /// Collects the parameters of `url` without judging them.
    ///
    /// `url` may be absolute, or a bare `?query` / `#fragment` /
    /// `key=value&...` string.
    #[must_use]
    pub fn parse_params(url: &str) -> CallbackParams {
        let mut raw = BTreeMap::new();
        match Url::parse(url) {
            Ok(parsed) => {
                raw.extend(parsed.query_pairs().into_owned());
                if let Some(fragment) = parsed.fragment() {
                    raw.extend(url::form_urlencoded::parse(fragment.as_bytes()).into_owned());
                }
            }
            Err(_) => {
                let (query, fragment) = match url.split_once('#') {
                    Some((before, after)) => (before, Some(after)),
                    None => (url, None),
                };
                let query = query.rsplit_once('?').map_or(query, |(_, q)| q);
                raw.extend(url::form_urlencoded::parse(query.as_bytes()).into_owned());
                if let Some(fragment) = fragment {
                    raw.extend(url::form_urlencoded::parse(fragment.as_bytes()).into_owned());
                }
            }
        }
        CallbackParams::from_pairs(raw)
    }

    /// Parses and checks a callback for the flow selected by
    /// `response_type`.
    ///
    /// # Errors
    ///
    /// - `AuthorizationServer` if the callback carries `error`
    /// - `MissingState` if `state` is absent
    /// - `MissingCode` in the code flow without `code`
    /// - `MissingIdToken` in the implicit flow without `id_token`
    pub fn parse(url: &str, response_type: ResponseType) -> Result<CallbackParams, CallbackError> {
        let params = Self::parse_params(url);

        if let Some(error) = &params.error {
            return Err(CallbackError::AuthorizationServer {
                error: error.clone(),
                description: params.error_description.clone(),
            });
        }
        if params.state.is_none() {
            return Err(CallbackError::MissingState);
        }
        if response_type.is_code_flow() {
            if params.code.is_none() {
                return Err(CallbackError::MissingCode);
            }
        } else if params.id_token.is_none() {
            return Err(CallbackError::MissingIdToken);
        }
        Ok(params)
    }

    /// Returns `true` if `url` looks like a redirect callback.
    #[must_use]
    pub fn is_callback(url: &str) -> bool {
        let params = Self::parse_params(url);
        params.code.is_some()
            || params.state.is_some()
            || params.error.is_some()
            || params.id_token.is_some()
    }
}

/// Working state of one callback or renewal, threaded through the
/// orchestrator's pipeline and dropped when the flow ends.
#[derive(Clone, Default)]
pub struct CallbackContext {
    /// Authorization code (code flow).
    pub code: Option<String>,
    /// Echoed state.
    pub state: Option<String>,
    /// Session state for check-session polling.
    pub session_state: Option<String>,
    /// The nonce issued for this flow.
    pub nonce: Option<String>,
    /// Refresh token, when the flow is a refresh grant.
    pub refresh_token: Option<String>,
    /// Raw token response.
    pub auth_result: Option<TokenResponse>,
    /// Decided before validation; controls what a failure resets.
    pub is_renew_process: bool,
    /// Keys used for validation.
    pub jwt_keys: Option<JwtKeySet>,
    /// Outcome of validation.
    pub validation_result: Option<ValidationOutcome>,
    /// ID token held before a refresh.
    pub existing_id_token: Option<String>,
}

impl std::fmt::Debug for CallbackContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackContext")
            .field("is_renew_process", &self.is_renew_process)
            .field("session_state", &self.session_state)
            .field("validation_result", &self.validation_result)
            .finish_non_exhaustive()
    }
}

impl CallbackContext {
    /// A context for a redirect callback.
    #[must_use]
    pub fn from_callback(params: &CallbackParams, is_renew_process: bool) -> Self {
        Self {
            code: params.code.clone(),
            state: params.state.clone(),
            session_state: params.session_state.clone(),
            is_renew_process,
            ..Self::default()
        }
    }

    /// A context for a refresh token grant.
    #[must_use]
    pub fn for_refresh(refresh_token: String, existing_id_token: Option<String>) -> Self {
        Self {
            refresh_token: Some(refresh_token),
            existing_id_token,
            is_renew_process: true,
            ..Self::default()
        }
    }
}
