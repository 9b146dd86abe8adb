//! Logoff and token revocation.

use tracing::{debug, info, warn};

use super::complete::endpoint_error;
use super::{FlowOrchestrator, FlowState, LogoffOutcome};
use crate::config::LogoffMethod;
use crate::error::{OidcError, OidcResult};
use crate::transport::{HttpRequest, send_with_retries};
use crate::url::endpoint_url;

/// Retries of a revocation request after the first attempt.
const REVOCATION_RETRIES: u32 = 2;

impl FlowOrchestrator {
    /// Logs off at the authorization server, then locally.
    ///
    /// When the session monitor saw the server-side session change, only
    /// local data is cleared. Otherwise the end-session endpoint is called
    /// by redirect or background POST, and local data is cleared whatever
    /// the outcome.
    ///
    /// # Errors
    ///
    /// Returns an error only if the end-session URL cannot be built.
    pub async fn logoff(&self) -> OidcResult<LogoffOutcome> {
        if self
            .monitor
            .as_ref()
            .is_some_and(|m| m.server_state_changed())
        {
            info!(config_id = %self.config_id(), "Session already ended at the server, logging off locally");
            self.logoff_local();
            return Ok(LogoffOutcome::LocalOnly);
        }

        let id_token_hint = self.id_token();
        let endpoints = match self.endpoints().await {
            Ok(endpoints) => endpoints,
            Err(err) => {
                warn!(config_id = %self.config_id(), error = %err, "End-session endpoint unknown");
                self.logoff_local();
                return Ok(LogoffOutcome::LocalOnly);
            }
        };

        let outcome = match self.config.logoff_method {
            LogoffMethod::Redirect => {
                match self.urls.end_session_url(&endpoints, id_token_hint.as_deref()) {
                    Ok(Some(url)) => {
                        self.navigator.navigate(&url);
                        LogoffOutcome::Redirected(url)
                    }
                    Ok(None) => LogoffOutcome::LocalOnly,
                    Err(err) => {
                        self.logoff_local();
                        return Err(err);
                    }
                }
            }
            LogoffMethod::Post => match endpoints.end_session_endpoint.as_deref() {
                Some(endpoint) => {
                    let url = match url::Url::parse(endpoint) {
                        Ok(url) => url,
                        Err(err) => {
                            self.logoff_local();
                            return Err(err.into());
                        }
                    };
                    let params = self.urls.end_session_params(id_token_hint.as_deref());
                    if let Err(err) = self
                        .transport
                        .send(HttpRequest::post_form(url, &params))
                        .await
                    {
                        warn!(config_id = %self.config_id(), error = %err, "End-session request failed");
                    }
                    LogoffOutcome::Posted
                }
                None => LogoffOutcome::LocalOnly,
            },
        };

        self.logoff_local();
        Ok(outcome)
    }

    /// Clears all local authentication data and stops background tasks.
    /// Completes synchronously.
    pub fn logoff_local(&self) {
        self.reset_authorization_data();
        self.set_flow_state(FlowState::Idle);
        info!(config_id = %self.config_id(), "Logged off locally");
    }

    /// Revokes the held refresh token (if any) and access token, then logs
    /// off.
    ///
    /// A failed revocation still logs off.
    ///
    /// # Errors
    ///
    /// Returns the revocation error after logging off.
    pub async fn logoff_and_revoke_tokens(&self) -> OidcResult<LogoffOutcome> {
        let revoked = async {
            if self.refresh_token().is_some() {
                self.revoke_refresh_token(None).await?;
            }
            if self.access_token().is_some() {
                self.revoke_access_token(None).await?;
            }
            Ok::<_, OidcError>(())
        }
        .await;

        match revoked {
            Ok(()) => self.logoff().await,
            Err(err) => {
                warn!(config_id = %self.config_id(), error = %err, "Revocation failed, logging off anyway");
                self.logoff().await?;
                Err(err)
            }
        }
    }

    /// Revokes `token`, or the held access token.
    ///
    /// # Errors
    ///
    /// Returns an error if there is no token, no revocation endpoint, or
    /// the request fails three times.
    pub async fn revoke_access_token(&self, token: Option<String>) -> OidcResult<()> {
        let token = token
            .or_else(|| self.access_token())
            .ok_or_else(|| OidcError::invalid_token_response("no access token to revoke"))?;
        self.revoke(&token, "access_token").await
    }

    /// Revokes `token`, or the held refresh token.
    ///
    /// # Errors
    ///
    /// Returns `MissingRefreshToken` if none is held, or an error if there
    /// is no revocation endpoint or the request fails three times.
    pub async fn revoke_refresh_token(&self, token: Option<String>) -> OidcResult<()> {
        let token = token
            .or_else(|| self.refresh_token())
            .ok_or(OidcError::MissingRefreshToken)?;
        self.revoke(&token, "refresh_token").await
    }

    async fn revoke(&self, token: &str, token_type_hint: &str) -> OidcResult<()> {
        let endpoints = self.endpoints().await?;
        let url = endpoint_url(endpoints.revocation_endpoint.as_deref(), "revocation_endpoint")?;
        let params = self.urls.revocation_params(token, token_type_hint);
        send_with_retries(
            self.transport.as_ref(),
            HttpRequest::post_form(url, &params),
            REVOCATION_RETRIES,
        )
        .await
        .map_err(endpoint_error)?;
        debug!(config_id = %self.config_id(), token_type_hint, "Token revoked");
        Ok(())
    }
}
