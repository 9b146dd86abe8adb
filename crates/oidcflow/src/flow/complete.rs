//! Completing flows: redirect callbacks, the refresh token grant and user
//! info.

use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use super::{AuthOutcome, AuthorizedState, FlowOrchestrator, FlowState};
use crate::callback::{CallbackContext, CallbackError, CallbackParser};
use crate::discovery::AuthWellKnownEndpoints;
use crate::error::{OidcError, OidcResult};
use crate::events::EventKind;
use crate::nonce::TokenKind;
use crate::pkce::PkceVerifier;
use crate::storage::StorageKey;
use crate::token::{IdTokenClaims, TokenResponse, decode_claims, expires_within};
use crate::transport::{HttpRequest, HttpResponse, TransportError};
use crate::url::endpoint_url;
use crate::validation::{FailedCheck, NonceExpectation, ValidationInput};

impl FlowOrchestrator {
    /// Completes a redirect flow from its callback URL.
    ///
    /// The callback's `state` is consumed, the code is exchanged (code flow)
    /// and the ID token validated before `Authorized` is entered. A callback
    /// without `state` is rejected before any request is sent.
    ///
    /// # Errors
    ///
    /// - `Callback` for a malformed or error callback
    /// - `AuthenticationFailed` for any validation failure; the failed check
    ///   is logged
    /// - `AuthorizationServer` / `Unavailable` / `Transport` if the token
    ///   endpoint fails (not retried)
    pub async fn handle_callback(&self, url: &str) -> OidcResult<AuthOutcome> {
        let _guard = self.begin_transition()?;
        let mut ctx = CallbackContext {
            is_renew_process: self.renewal_running(),
            ..CallbackContext::default()
        };
        let result = self.process_callback(url, &mut ctx).await;
        self.finish(&ctx, result)
    }

    /// Renews the held tokens with the refresh token grant.
    ///
    /// Connectivity failures are retried every
    /// `refresh_token_retry_interval_seconds` until the server answers or
    /// the renewal is cancelled by a logoff. A grant the server rejects
    /// resets all authentication data; any other failure keeps the held
    /// tokens.
    ///
    /// # Errors
    ///
    /// Returns `MissingRefreshToken` when none is held, `FlowInProgress`
    /// while another transition runs, `RenewalCancelled` when a logoff ran
    /// meanwhile, or the error that ended the renewal.
    pub async fn refresh(&self) -> OidcResult<AuthOutcome> {
        let _guard = self.begin_transition()?;
        let refresh_token = self.refresh_token().ok_or(OidcError::MissingRefreshToken)?;

        let mut ctx = CallbackContext::for_refresh(refresh_token, self.id_token());
        ctx.session_state = self.read_storage(StorageKey::SessionState);
        let generation = self.generation();
        self.set_renewal_running(true);
        self.publish(EventKind::SilentRenewStarted);

        let result = self.process_refresh(&mut ctx, generation).await;
        self.finish(&ctx, result)
    }

    /// Fetches user info with the held access token and stores it.
    ///
    /// # Errors
    ///
    /// Returns `AuthenticationFailed` (and resets all authentication data)
    /// when the `sub` of the response differs from the ID token's.
    pub async fn fetch_user_info(&self) -> OidcResult<Value> {
        let endpoints = self.endpoints().await?;
        let claims = self.id_token_claims();
        self.load_user_info(&endpoints, claims.as_ref()).await
    }

    async fn process_callback(&self, url: &str, ctx: &mut CallbackContext) -> OidcResult<AuthOutcome> {
        let params = CallbackParser::parse(url, self.config.response_type)?;
        *ctx = CallbackContext::from_callback(&params, ctx.is_renew_process);

        let state = params.state.as_deref().ok_or(CallbackError::MissingState)?;
        if !self.nonces.consume(TokenKind::State, state)? {
            return Err(self.check_failed(FailedCheck::State));
        }
        let Some(intent) = self.intents.take(state)? else {
            return Err(self.check_failed(FailedCheck::State));
        };
        ctx.is_renew_process = intent.is_renew();
        if ctx.is_renew_process && !self.renewal_running() {
            return Err(OidcError::renewal_cancelled(self.config_id()));
        }
        if self.nonces.consume(TokenKind::Nonce, &intent.nonce)? {
            ctx.nonce = Some(intent.nonce.clone());
        }
        let verifier = intent
            .code_verifier
            .clone()
            .map(PkceVerifier::new)
            .transpose()?;

        let endpoints = self.endpoints().await?;
        let response = match params.code.as_deref() {
            Some(code) if self.config.response_type.is_code_flow() => {
                self.set_flow_state(FlowState::Exchanging);
                let token_url = endpoint_url(endpoints.token_endpoint.as_deref(), "token_endpoint")?;
                let body = self.urls.code_exchange_params(
                    code,
                    verifier.as_ref().map(PkceVerifier::as_str),
                    &intent.redirect_uri,
                );
                let response = self
                    .transport
                    .send(HttpRequest::post_form(token_url, &body))
                    .await
                    .map_err(endpoint_error)?;
                parse_token_response(&response)?
            }
            _ => params.token_response(),
        };
        ctx.auth_result = Some(response);

        let claims = self.validate_context(ctx, &endpoints).await?;
        self.authorize(ctx, &endpoints, Some(claims)).await
    }

    async fn process_refresh(
        &self,
        ctx: &mut CallbackContext,
        generation: u64,
    ) -> OidcResult<AuthOutcome> {
        let refresh_token = ctx.refresh_token.clone().unwrap_or_default();
        let (endpoints, response) = loop {
            self.ensure_not_reset(generation)?;
            match self.request_refresh(&refresh_token).await {
                Ok(result) => break result,
                Err(err) if err.is_retryable() => {
                    if !self.renewal_running() {
                        debug!(config_id = %self.config_id(), "Refresh cancelled");
                        return Err(err);
                    }
                    let retry_in = self.config.refresh_retry_interval();
                    warn!(
                        config_id = %self.config_id(),
                        error = %err,
                        retry_in_secs = retry_in.as_secs(),
                        "Authorization server unreachable, retrying refresh"
                    );
                    tokio::time::sleep(retry_in).await;
                }
                Err(err) => return Err(err),
            }
        };

        let has_id_token = response.id_token.is_some();
        ctx.auth_result = Some(response);
        let claims = if has_id_token {
            Some(self.validate_context(ctx, &endpoints).await?)
        } else {
            Some(self.held_id_token_claims(ctx)?)
        };
        self.ensure_not_reset(generation)?;
        self.authorize(ctx, &endpoints, claims).await
    }

    /// Claims of the ID token kept across a refresh that returned none.
    ///
    /// Only a configuration that is still authorized with an unexpired ID
    /// token may keep it; otherwise it stays unauthorized.
    fn held_id_token_claims(&self, ctx: &CallbackContext) -> OidcResult<IdTokenClaims> {
        let claims = ctx
            .existing_id_token
            .as_deref()
            .and_then(|t| decode_claims(t).ok());
        let now = OffsetDateTime::now_utc();
        let unexpired = claims
            .as_ref()
            .and_then(|c| c.exp)
            .is_some_and(|exp| !expires_within(exp, 0, now));

        match claims {
            Some(claims) if unexpired && self.is_authenticated() => {
                debug!(config_id = %self.config_id(), "Refresh response without id_token, keeping the held one");
                Ok(claims)
            }
            _ => {
                self.set_authorized_state(AuthorizedState::Unauthorized);
                Err(self.check_failed(FailedCheck::Expiry))
            }
        }
    }

    async fn request_refresh(
        &self,
        refresh_token: &str,
    ) -> OidcResult<(AuthWellKnownEndpoints, TokenResponse)> {
        let endpoints = self.endpoints().await?;
        self.set_flow_state(FlowState::Exchanging);
        let token_url = endpoint_url(endpoints.token_endpoint.as_deref(), "token_endpoint")?;
        let body = self.urls.refresh_params(refresh_token);
        let response = self
            .transport
            .send(HttpRequest::post_form(token_url, &body))
            .await
            .map_err(endpoint_error)?;
        Ok((endpoints, parse_token_response(&response)?))
    }

    /// Validates the ID token of `ctx.auth_result` and records the outcome
    /// in `ctx`.
    async fn validate_context(
        &self,
        ctx: &mut CallbackContext,
        endpoints: &AuthWellKnownEndpoints,
    ) -> OidcResult<IdTokenClaims> {
        self.set_flow_state(FlowState::Validating);
        let response = ctx
            .auth_result
            .as_ref()
            .ok_or_else(|| OidcError::invalid_token_response("no token response"))?;
        let id_token = response
            .id_token
            .as_deref()
            .ok_or_else(|| OidcError::invalid_token_response("missing id_token"))?;

        let claims = decode_claims(id_token).map_err(|err| {
            debug!(config_id = %self.config_id(), error = %err, "ID token is not decodable");
            self.check_failed(FailedCheck::RequiredClaimMissing)
        })?;
        let kid = jsonwebtoken::decode_header(id_token)
            .ok()
            .and_then(|header| header.kid);
        let key_set = self
            .jwks
            .key_set_for(&endpoints.jwks_uri, kid.as_deref())
            .await?;

        let nonce = if ctx.refresh_token.is_some() {
            NonceExpectation::RefreshGrant
        } else {
            NonceExpectation::Issued(ctx.nonce.as_deref().unwrap_or_default())
        };
        let mut outcome = self.validator.validate(&ValidationInput {
            id_token,
            access_token: response.access_token.as_deref(),
            claims: &claims,
            endpoints,
            key_set: &key_set,
            nonce,
        });
        if outcome.is_valid
            && let Some(existing) = ctx
                .existing_id_token
                .as_deref()
                .and_then(|t| decode_claims(t).ok())
        {
            outcome = self.validator.validate_refreshed(&existing, &claims);
        }

        ctx.jwt_keys = Some(key_set);
        ctx.validation_result = Some(outcome);
        match outcome.failed_check {
            Some(check) => Err(self.check_failed(check)),
            None => Ok(claims),
        }
    }

    /// Persists a validated result, enters `Authorized`, loads user info and
    /// starts background tasks.
    async fn authorize(
        &self,
        ctx: &mut CallbackContext,
        endpoints: &AuthWellKnownEndpoints,
        claims: Option<IdTokenClaims>,
    ) -> OidcResult<AuthOutcome> {
        let response = ctx
            .auth_result
            .take()
            .ok_or_else(|| OidcError::invalid_token_response("no token response"))?;
        self.persist(ctx, response)?;
        self.set_renewal_running(false);
        self.set_authorized_state(AuthorizedState::Authorized);
        self.publish(EventKind::NewAuthenticationResult {
            is_authenticated: true,
            is_renew_process: ctx.is_renew_process,
        });
        info!(
            config_id = %self.config_id(),
            renew = ctx.is_renew_process,
            "Authentication succeeded"
        );

        if self.config.auto_user_info && (!ctx.is_renew_process || self.user_data().is_none()) {
            self.set_flow_state(FlowState::FetchingUserInfo);
            match self.load_user_info(endpoints, claims.as_ref()).await {
                Ok(_) => {}
                Err(OidcError::AuthenticationFailed) => return Err(OidcError::AuthenticationFailed),
                Err(err) => {
                    warn!(config_id = %self.config_id(), error = %err, "User info unavailable");
                }
            }
        }

        self.set_flow_state(FlowState::Authorized);
        self.start_background_tasks().await;
        Ok(AuthOutcome {
            is_authenticated: true,
            is_renew_process: ctx.is_renew_process,
        })
    }

    fn persist(&self, ctx: &CallbackContext, mut response: TokenResponse) -> OidcResult<()> {
        if ctx.refresh_token.is_some() {
            if response.refresh_token.is_none() {
                response.refresh_token.clone_from(&ctx.refresh_token);
            }
            if response.id_token.is_none() {
                response.id_token.clone_from(&ctx.existing_id_token);
            }
        }

        match &response.access_token {
            Some(token) => self.storage.write(StorageKey::AuthzData, token)?,
            None => self.storage.remove(StorageKey::AuthzData)?,
        }
        match response.expires_in {
            Some(seconds) => {
                let expires_at = OffsetDateTime::now_utc()
                    .unix_timestamp()
                    .saturating_add(i64::try_from(seconds).unwrap_or(i64::MAX));
                self.storage
                    .write(StorageKey::AccessTokenExpiresAt, &expires_at.to_string())?;
            }
            None => self.storage.remove(StorageKey::AccessTokenExpiresAt)?,
        }
        if let Some(session_state) = ctx
            .session_state
            .as_deref()
            .or(response.session_state.as_deref())
        {
            self.storage.write(StorageKey::SessionState, session_state)?;
        }
        self.storage.write_json(StorageKey::AuthnResult, &response)?;
        Ok(())
    }

    async fn load_user_info(
        &self,
        endpoints: &AuthWellKnownEndpoints,
        claims: Option<&IdTokenClaims>,
    ) -> OidcResult<Value> {
        let url = endpoint_url(endpoints.userinfo_endpoint.as_deref(), "userinfo_endpoint")?;
        let access_token = self
            .access_token()
            .ok_or_else(|| OidcError::invalid_token_response("no access token for user info"))?;
        let response = self
            .transport
            .send(HttpRequest::get(url).with_bearer(&access_token))
            .await
            .map_err(endpoint_error)?;
        let user_data: Value = response
            .json()
            .map_err(|e| OidcError::invalid_token_response(format!("user info: {e}")))?;

        let expected = claims.and_then(|c| c.sub.as_deref());
        let actual = user_data.get("sub").and_then(Value::as_str);
        if expected.is_none() || expected != actual {
            warn!(config_id = %self.config_id(), check = "user_info_sub", "User info rejected");
            self.reset_authorization_data();
            self.set_flow_state(FlowState::Unauthorized);
            return Err(OidcError::AuthenticationFailed);
        }

        self.storage.write_json(StorageKey::UserData, &user_data)?;
        self.publish(EventKind::UserDataChanged);
        Ok(user_data)
    }

    /// Logs a failed check and returns the generic error.
    fn check_failed(&self, check: FailedCheck) -> OidcError {
        warn!(config_id = %self.config_id(), check = %check, "Token validation failed");
        OidcError::AuthenticationFailed
    }

    fn finish(&self, ctx: &CallbackContext, result: OidcResult<AuthOutcome>) -> OidcResult<AuthOutcome> {
        result.map_err(|err| self.abandon(ctx, err))
    }

    /// Ends a failed flow. A renewal keeps the held tokens unless the
    /// server rejected the grant; anything else resets all auth data.
    fn abandon(&self, ctx: &CallbackContext, err: OidcError) -> OidcError {
        warn!(
            config_id = %self.config_id(),
            renew = ctx.is_renew_process,
            category = %err.category(),
            error = %err,
            "Flow failed"
        );

        if ctx.is_renew_process && !is_rejected_grant(&err) {
            self.set_renewal_running(false);
            self.set_flow_state(if self.is_authenticated() {
                FlowState::Authorized
            } else {
                FlowState::Unauthorized
            });
            self.publish(EventKind::SilentRenewFailed);
        } else {
            if ctx.is_renew_process {
                self.publish(EventKind::SilentRenewFailed);
            }
            self.reset_authorization_data();
            self.set_flow_state(FlowState::Unauthorized);
        }

        self.publish(EventKind::NewAuthenticationResult {
            is_authenticated: false,
            is_renew_process: ctx.is_renew_process,
        });
        err
    }
}

/// The server no longer accepts the grant or session behind the renewal.
fn is_rejected_grant(err: &OidcError) -> bool {
    match err {
        OidcError::AuthorizationServer { .. }
        | OidcError::Callback(CallbackError::AuthorizationServer { .. }) => true,
        OidcError::Transport(err) => matches!(err.status(), Some(400 | 401)),
        _ => false,
    }
}

/// Maps a token/user info endpoint failure, surfacing OAuth error bodies.
pub(super) fn endpoint_error(err: TransportError) -> OidcError {
    match err.oauth_error() {
        Some(body) => OidcError::authorization_server(body.error, body.error_description),
        None => err.into(),
    }
}

fn parse_token_response(response: &HttpResponse) -> OidcResult<TokenResponse> {
    response
        .json()
        .map_err(|e| OidcError::invalid_token_response(e.to_string()))
}
