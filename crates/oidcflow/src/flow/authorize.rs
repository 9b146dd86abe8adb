//! Beginning redirect flows: interactive login and hidden-frame renewal.

use std::collections::BTreeMap;

use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use super::complete::endpoint_error;
use super::state::{FlowIntent, IntentKind, LoginOptions, now_ms};
use super::{FlowOrchestrator, FlowState};
use crate::discovery::AuthWellKnownEndpoints;
use crate::error::{OidcError, OidcResult};
use crate::events::EventKind;
use crate::nonce::TokenKind;
use crate::pkce::PkceVerifier;
use crate::transport::{HttpRequest, send_with_retries};
use crate::url::{AuthorizeRequest, endpoint_url};

/// Retries of a pushed authorization request after the first attempt.
const PAR_RETRIES: u32 = 2;

#[derive(Debug, Deserialize)]
struct ParResponse {
    request_uri: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

struct PreparedRequest {
    state: String,
    nonce: String,
    verifier: Option<PkceVerifier>,
}

impl FlowOrchestrator {
    /// Starts an interactive login and sends the user agent to the
    /// authorization server.
    ///
    /// Prior authentication data is reset first. Returns the URL handed to
    /// the navigator.
    ///
    /// # Errors
    ///
    /// Returns `FlowInProgress` while another transition runs, or an error
    /// if discovery, storage or the pushed authorization request fails.
    pub async fn login(&self, options: LoginOptions) -> OidcResult<Url> {
        let _guard = self.begin_transition()?;
        self.set_flow_state(FlowState::AuthorizeRequested);
        self.reset_authorization_data();

        let result = self
            .authorize_url(
                IntentKind::Login,
                &self.config.redirect_url,
                options.prompt.as_deref(),
                &options.custom_params,
            )
            .await;
        let url = match result {
            Ok(url) => url,
            Err(err) => {
                self.set_flow_state(FlowState::Unauthorized);
                return Err(err);
            }
        };

        info!(
            config_id = %self.config_id(),
            endpoint = %redacted(&url),
            "Redirecting to authorization endpoint"
        );
        self.navigator.navigate(&url);
        self.set_flow_state(FlowState::AwaitingCallback);
        Ok(url)
    }

    /// Starts a renewal in a hidden frame with `prompt=none`.
    ///
    /// The resulting callback is processed as a renewal: a failure keeps the
    /// tokens held before it.
    ///
    /// # Errors
    ///
    /// Returns `FlowInProgress` while another transition runs, a
    /// configuration error without a `silent_renew_url`, or an error if
    /// discovery or storage fails.
    pub async fn begin_silent_renew(&self) -> OidcResult<Url> {
        let _guard = self.begin_transition()?;
        let redirect_uri = self
            .config
            .silent_renew_url
            .clone()
            .ok_or(crate::config::ConfigError::MissingSilentRenewUrl)?;

        self.set_renewal_running(true);
        self.publish(EventKind::SilentRenewStarted);

        let url = match self
            .authorize_url(
                IntentKind::SilentRenew,
                &redirect_uri,
                Some("none"),
                &BTreeMap::new(),
            )
            .await
        {
            Ok(url) => url,
            Err(err) => {
                self.set_renewal_running(false);
                self.publish(EventKind::SilentRenewFailed);
                return Err(err);
            }
        };

        debug!(
            config_id = %self.config_id(),
            endpoint = %redacted(&url),
            "Loading silent renew frame"
        );
        self.navigator.open_silent_renew_frame(&url);
        self.set_flow_state(FlowState::AwaitingCallback);
        Ok(url)
    }

    async fn authorize_url(
        &self,
        kind: IntentKind,
        redirect_uri: &str,
        prompt: Option<&str>,
        extra_params: &BTreeMap<String, String>,
    ) -> OidcResult<Url> {
        let endpoints = self.endpoints().await?;
        let prepared = self.prepare_request(kind, redirect_uri)?;
        let challenge = prepared.verifier.as_ref().map(PkceVerifier::challenge);

        let request = AuthorizeRequest {
            state: &prepared.state,
            nonce: &prepared.nonce,
            code_challenge: challenge.as_ref(),
            redirect_uri,
            prompt,
            extra_params,
        };

        if self.config.use_pushed_authorization_requests {
            let request_uri = self.push_authorization_request(&endpoints, &request).await?;
            self.urls.authorize_url_from_par(&endpoints, &request_uri)
        } else {
            self.urls.authorize_url(&endpoints, &request)
        }
    }

    /// Issues `state` and `nonce` (plus a PKCE verifier in the code flow)
    /// and persists the intent.
    fn prepare_request(&self, kind: IntentKind, redirect_uri: &str) -> OidcResult<PreparedRequest> {
        let state = self.nonces.issue(TokenKind::State)?;
        let nonce = self.nonces.issue(TokenKind::Nonce)?;
        let verifier = self
            .config
            .response_type
            .is_code_flow()
            .then(PkceVerifier::generate);

        self.intents.save(
            &state,
            FlowIntent {
                kind,
                nonce: nonce.clone(),
                code_verifier: verifier.as_ref().map(|v| v.as_str().to_string()),
                redirect_uri: redirect_uri.to_string(),
                created_at: now_ms(),
            },
        )?;

        Ok(PreparedRequest {
            state,
            nonce,
            verifier,
        })
    }

    async fn push_authorization_request(
        &self,
        endpoints: &AuthWellKnownEndpoints,
        request: &AuthorizeRequest<'_>,
    ) -> OidcResult<String> {
        let par_url = endpoint_url(
            endpoints.par_endpoint.as_deref(),
            "pushed_authorization_request_endpoint",
        )?;
        let params = self.urls.authorize_params(request);
        let response = send_with_retries(
            self.transport.as_ref(),
            HttpRequest::post_form(par_url, &params),
            PAR_RETRIES,
        )
        .await
        .map_err(endpoint_error)?;

        let par: ParResponse = response
            .json()
            .map_err(|e| OidcError::invalid_token_response(format!("PAR response: {e}")))?;
        debug!(
            config_id = %self.config_id(),
            expires_in = ?par.expires_in,
            "Pushed authorization request accepted"
        );
        Ok(par.request_uri)
    }
}

/// `url` without its query, for logs.
pub(super) fn redacted(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.set_fragment(None);
    url.to_string()
}
