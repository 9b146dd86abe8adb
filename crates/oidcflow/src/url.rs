//! Request builders: authorize URLs, PAR bodies, token and revocation
//! bodies, end-session URLs.

use std::collections::BTreeMap;
use std::sync::Arc;

use url::Url;

use crate::config::OpenIdConfiguration;
use crate::discovery::AuthWellKnownEndpoints;
use crate::error::{OidcError, OidcResult};
use crate::pkce::{CHALLENGE_METHOD, PkceChallenge};

/// Parameters of one authorize request.
#[derive(Debug, Clone, Copy)]
pub struct AuthorizeRequest<'a> {
    /// Anti-CSRF value.
    pub state: &'a str,
    /// Anti-replay value.
    pub nonce: &'a str,
    /// PKCE challenge (code flow only).
    pub code_challenge: Option<&'a PkceChallenge>,
    /// Redirect URI of the producing flow.
    pub redirect_uri: &'a str,
    /// `prompt`, e.g. `none` for silent renew.
    pub prompt: Option<&'a str>,
    /// Per-call extra parameters, merged over the configured ones.
    pub extra_params: &'a BTreeMap<String, String>,
}

/// Parses an optional endpoint, naming it in the error.
pub(crate) fn endpoint_url(value: Option<&str>, endpoint: &'static str) -> OidcResult<Url> {
    let value = value.ok_or(OidcError::MissingEndpoint { endpoint })?;
    Ok(Url::parse(value)?)
}

/// Builds protocol requests for one configuration.
#[derive(Debug, Clone)]
pub struct UrlBuilder {
    config: Arc<OpenIdConfiguration>,
}

impl UrlBuilder {
    /// Creates a builder.
    #[must_use]
    pub fn new(config: Arc<OpenIdConfiguration>) -> Self {
        Self { config }
    }

    /// Query parameters of an authorize request.
    #[must_use]
    pub fn authorize_params(&self, request: &AuthorizeRequest<'_>) -> Vec<(String, String)> {
        let mut params = vec![
            ("client_id".to_string(), self.config.client_id.clone()),
            ("redirect_uri".to_string(), request.redirect_uri.to_string()),
            (
                "response_type".to_string(),
                self.config.response_type.as_str().to_string(),
            ),
            ("scope".to_string(), self.config.scope.clone()),
            ("nonce".to_string(), request.nonce.to_string()),
            ("state".to_string(), request.state.to_string()),
        ];
        if let Some(challenge) = request.code_challenge {
            params.push(("code_challenge".into(), challenge.as_str().to_string()));
            params.push(("code_challenge_method".into(), CHALLENGE_METHOD.into()));
        }
        if let Some(prompt) = request.prompt {
            params.push(("prompt".into(), prompt.to_string()));
        }

        let mut custom = self.config.custom_params_auth_request.clone();
        custom.extend(
            request
                .extra_params
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        for (key, value) in custom {
            if let Some(existing) = params.iter_mut().find(|(k, _)| *k == key) {
                existing.1 = value;
            } else {
                params.push((key, value));
            }
        }
        params
    }

    /// The authorize URL carrying every parameter in its query.
    ///
    /// # Errors
    ///
    /// Returns an error if the authorization endpoint is not a URL.
    pub fn authorize_url(
        &self,
        endpoints: &AuthWellKnownEndpoints,
        request: &AuthorizeRequest<'_>,
    ) -> OidcResult<Url> {
        let mut url = Url::parse(&endpoints.authorization_endpoint)?;
        url.query_pairs_mut()
            .extend_pairs(self.authorize_params(request));
        Ok(url)
    }

    /// The authorize URL after a pushed authorization request: only
    /// `client_id` and the returned `request_uri`.
    ///
    /// # Errors
    ///
    /// Returns an error if the authorization endpoint is not a URL.
    pub fn authorize_url_from_par(
        &self,
        endpoints: &AuthWellKnownEndpoints,
        request_uri: &str,
    ) -> OidcResult<Url> {
        let mut url = Url::parse(&endpoints.authorization_endpoint)?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
            .append_pair("request_uri", request_uri);
        Ok(url)
    }

    /// Body of the `authorization_code` grant.
    #[must_use]
    pub fn code_exchange_params(
        &self,
        code: &str,
        code_verifier: Option<&str>,
        redirect_uri: &str,
    ) -> Vec<(String, String)> {
        let mut params = vec![
            ("grant_type".to_string(), "authorization_code".to_string()),
            ("client_id".to_string(), self.config.client_id.clone()),
            ("code".to_string(), code.to_string()),
            ("redirect_uri".to_string(), redirect_uri.to_string()),
        ];
        if let Some(verifier) = code_verifier {
            params.push(("code_verifier".into(), verifier.to_string()));
        }
        params
    }

    /// Body of the `refresh_token` grant.
    #[must_use]
    pub fn refresh_params(&self, refresh_token: &str) -> Vec<(String, String)> {
        let mut params = vec![
            ("grant_type".to_string(), "refresh_token".to_string()),
            ("client_id".to_string(), self.config.client_id.clone()),
            ("refresh_token".to_string(), refresh_token.to_string()),
        ];
        params.extend(
            self.config
                .custom_params_refresh_request
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        params
    }

    /// Body of a revocation request (RFC 7009).
    #[must_use]
    pub fn revocation_params(&self, token: &str, token_type_hint: &str) -> Vec<(String, String)> {
        vec![
            ("client_id".to_string(), self.config.client_id.clone()),
            ("token".to_string(), token.to_string()),
            ("token_type_hint".to_string(), token_type_hint.to_string()),
        ]
    }

    /// Parameters of an end-session request.
    #[must_use]
    pub fn end_session_params(&self, id_token_hint: Option<&str>) -> Vec<(String, String)> {
        let mut params = Vec::new();
        if let Some(hint) = id_token_hint {
            params.push(("id_token_hint".to_string(), hint.to_string()));
        }
        if let Some(uri) = &self.config.post_logout_redirect_uri {
            params.push(("post_logout_redirect_uri".to_string(), uri.clone()));
        }
        params.extend(
            self.config
                .custom_params_end_session_request
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        params
    }

    /// The end-session URL, or `None` when the server has no end-session
    /// endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is not a URL.
    pub fn end_session_url(
        &self,
        endpoints: &AuthWellKnownEndpoints,
        id_token_hint: Option<&str>,
    ) -> OidcResult<Option<Url>> {
        let Some(endpoint) = &endpoints.end_session_endpoint else {
            return Ok(None);
        };
        let mut url = Url::parse(endpoint)?;
        let params = self.end_session_params(id_token_hint);
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params);
        }
        Ok(Some(url))
    }
}
