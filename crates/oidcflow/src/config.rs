//! Client configuration.
//!
//! One [`OpenIdConfiguration`] describes one relying party registration at
//! one authority. Configurations are created once at setup and are read-only
//! afterwards; several of them may coexist, each driving its own engine.
//!
//! # Example (TOML)
//!
//! ```toml
//! [logging]
//! level = "info"
//!
//! [[clients]]
//! config_id = "spa"
//! authority = "https://login.example.com"
//! client_id = "spa-client"
//! redirect_url = "https://app.example.com/callback"
//! use_refresh_token = true
//! silent_renew = true
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::discovery::AuthWellKnownEndpoints;

/// Errors raised while loading or validating a configuration.
///
/// These are fatal and synchronous: an engine is never built from a
/// configuration that fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// `authority` is empty.
    #[error("authority must be set")]
    MissingAuthority,

    /// `client_id` is empty.
    #[error("client_id must be set")]
    MissingClientId,

    /// `redirect_url` is empty.
    #[error("redirect_url must be set")]
    MissingRedirectUrl,

    /// Silent renew is enabled without a way to perform it.
    #[error("silent_renew requires silent_renew_url or use_refresh_token")]
    MissingSilentRenewUrl,

    /// `response_type` is not one of the supported flows.
    #[error("unsupported response_type: {0}")]
    UnsupportedResponseType(String),

    /// A URL-valued field does not parse.
    #[error("{field} is not a valid URL: {message}")]
    InvalidUrl {
        /// Name of the offending field.
        field: &'static str,
        /// Parser message.
        message: String,
    },

    /// The authority must use https unless `allow_http` is set.
    #[error("authority must use https: {0}")]
    InsecureAuthority(String),

    /// An interval that drives a timer is zero.
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),

    /// The configuration source could not be read or deserialized.
    #[error("failed to load configuration: {0}")]
    Load(String),
}

/// The OAuth response type, which selects the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ResponseType {
    /// Authorization code flow with PKCE.
    Code,
    /// Implicit flow returning an ID token and an access token.
    IdTokenToken,
    /// Implicit flow returning only an ID token.
    IdToken,
}

impl ResponseType {
    /// The value sent as `response_type`.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::IdTokenToken => "id_token token",
            Self::IdToken => "id_token",
        }
    }

    /// Returns `true` for the authorization code flow.
    #[must_use]
    pub fn is_code_flow(&self) -> bool {
        matches!(self, Self::Code)
    }
}

impl FromStr for ResponseType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "code" => Ok(Self::Code),
            "id_token token" => Ok(Self::IdTokenToken),
            "id_token" => Ok(Self::IdToken),
            other => Err(ConfigError::UnsupportedResponseType(other.to_string())),
        }
    }
}

impl TryFrom<String> for ResponseType {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ResponseType> for String {
    fn from(value: ResponseType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for ResponseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the end-session endpoint is called on logoff.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogoffMethod {
    /// Navigate the browser to the end-session URL.
    #[default]
    Redirect,
    /// POST the end-session parameters in the background.
    Post,
}

/// Configuration of one relying party at one authority.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenIdConfiguration {
    /// Identifier of this configuration. Defaults to `client_id`.
    pub config_id: String,

    /// Issuer base URL of the authorization server.
    pub authority: String,

    /// OAuth client identifier.
    pub client_id: String,

    /// Space separated scopes.
    pub scope: String,

    /// Flow selector.
    pub response_type: ResponseType,

    /// Redirect URI of the interactive login.
    pub redirect_url: String,

    /// Redirect URI loaded in the hidden silent renew frame.
    pub silent_renew_url: Option<String>,

    /// Where the authorization server sends the user after logoff.
    pub post_logout_redirect_uri: Option<String>,

    /// Renew with the refresh token grant instead of a hidden frame.
    pub use_refresh_token: bool,

    /// Keep tokens fresh in the background.
    pub silent_renew: bool,

    /// Poll the check-session frame after login.
    pub start_check_session: bool,

    /// Tokens expiring within this many seconds count as expired.
    pub silent_renew_offset_seconds: u64,

    /// Maximum distance between the ID token `iat` and now.
    pub max_id_token_iat_offset_seconds: u64,

    /// Skip the `iat` distance check.
    pub disable_iat_offset_validation: bool,

    /// Delay between refresh attempts after a connectivity failure.
    pub refresh_token_retry_interval_seconds: u64,

    /// Period of the background token expiry check.
    pub token_refresh_interval_seconds: u64,

    /// Period of the check-session heartbeat.
    pub check_session_interval_ms: u64,

    /// The check-session frame is reloaded after this long.
    pub check_session_reinit_ms: u64,

    /// Send authorization parameters with a pushed authorization request.
    pub use_pushed_authorization_requests: bool,

    /// Fetch user info after a successful login.
    pub auto_user_info: bool,

    /// Accept a `nonce` claim in a refreshed ID token.
    pub ignore_nonce_after_refresh: bool,

    /// Renew when the ID token expires, not only the access token.
    pub trigger_refresh_when_id_token_expired: bool,

    /// How the end-session endpoint is called.
    pub logoff_method: LogoffMethod,

    /// Extra parameters on the authorize request.
    pub custom_params_auth_request: BTreeMap<String, String>,

    /// Extra parameters on the refresh token request.
    pub custom_params_refresh_request: BTreeMap<String, String>,

    /// Extra parameters on the end-session request.
    pub custom_params_end_session_request: BTreeMap<String, String>,

    /// Static endpoints. When set, discovery is skipped.
    pub auth_well_known_endpoints: Option<AuthWellKnownEndpoints>,

    /// Allow a plain http authority (development only).
    pub allow_http: bool,

    /// Timeout applied to every HTTP request.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for OpenIdConfiguration {
    fn default() -> Self {
        Self {
            config_id: String::new(),
            authority: String::new(),
            client_id: String::new(),
            scope: "openid profile email".to_string(),
            response_type: ResponseType::Code,
            redirect_url: String::new(),
            silent_renew_url: None,
            post_logout_redirect_uri: None,
            use_refresh_token: false,
            silent_renew: false,
            start_check_session: false,
            silent_renew_offset_seconds: 0,
            max_id_token_iat_offset_seconds: 120,
            disable_iat_offset_validation: false,
            refresh_token_retry_interval_seconds: 3,
            token_refresh_interval_seconds: 4,
            check_session_interval_ms: 3_000,
            check_session_reinit_ms: 60_000,
            use_pushed_authorization_requests: false,
            auto_user_info: true,
            ignore_nonce_after_refresh: false,
            trigger_refresh_when_id_token_expired: true,
            logoff_method: LogoffMethod::Redirect,
            custom_params_auth_request: BTreeMap::new(),
            custom_params_refresh_request: BTreeMap::new(),
            custom_params_end_session_request: BTreeMap::new(),
            auth_well_known_endpoints: None,
            allow_http: false,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl OpenIdConfiguration {
    /// Creates a configuration for the code flow.
    #[must_use]
    pub fn new(
        authority: impl Into<String>,
        client_id: impl Into<String>,
        redirect_url: impl Into<String>,
    ) -> Self {
        Self {
            authority: authority.into(),
            client_id: client_id.into(),
            redirect_url: redirect_url.into(),
            ..Self::default()
        }
    }

    /// The effective configuration id, falling back to the client id.
    #[must_use]
    pub fn config_id(&self) -> &str {
        if self.config_id.is_empty() {
            &self.client_id
        } else {
            &self.config_id
        }
    }

    /// Sets the configuration id.
    #[must_use]
    pub fn with_config_id(mut self, config_id: impl Into<String>) -> Self {
        self.config_id = config_id.into();
        self
    }

    /// Sets the scope.
    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    /// Sets the response type.
    #[must_use]
    pub fn with_response_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = response_type;
        self
    }

    /// Enables silent renew through a hidden frame at `url`.
    #[must_use]
    pub fn with_silent_renew_url(mut self, url: impl Into<String>) -> Self {
        self.silent_renew = true;
        self.silent_renew_url = Some(url.into());
        self
    }

    /// Enables or disables renewal through the refresh token grant.
    #[must_use]
    pub fn with_refresh_tokens(mut self, enabled: bool) -> Self {
        self.use_refresh_token = enabled;
        if enabled {
            self.silent_renew = true;
        }
        self
    }

    /// Enables or disables check-session polling.
    #[must_use]
    pub fn with_check_session(mut self, enabled: bool) -> Self {
        self.start_check_session = enabled;
        self
    }

    /// Enables or disables pushed authorization requests.
    #[must_use]
    pub fn with_pushed_authorization_requests(mut self, enabled: bool) -> Self {
        self.use_pushed_authorization_requests = enabled;
        self
    }

    /// Enables or disables user info retrieval after login.
    #[must_use]
    pub fn with_auto_user_info(mut self, enabled: bool) -> Self {
        self.auto_user_info = enabled;
        self
    }

    /// Sets the post logout redirect URI.
    #[must_use]
    pub fn with_post_logout_redirect_uri(mut self, uri: impl Into<String>) -> Self {
        self.post_logout_redirect_uri = Some(uri.into());
        self
    }

    /// Sets the logoff method.
    #[must_use]
    pub fn with_logoff_method(mut self, method: LogoffMethod) -> Self {
        self.logoff_method = method;
        self
    }

    /// Uses static endpoints instead of discovery.
    #[must_use]
    pub fn with_endpoints(mut self, endpoints: AuthWellKnownEndpoints) -> Self {
        self.auth_well_known_endpoints = Some(endpoints);
        self
    }

    /// Allows a plain http authority.
    #[must_use]
    pub fn with_allow_http(mut self, allow: bool) -> Self {
        self.allow_http = allow;
        self
    }

    /// Sets the connectivity retry interval of the refresh grant.
    #[must_use]
    pub fn with_refresh_retry_interval(mut self, seconds: u64) -> Self {
        self.refresh_token_retry_interval_seconds = seconds;
        self
    }

    /// Delay between refresh attempts after a connectivity failure.
    #[must_use]
    pub fn refresh_retry_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_token_retry_interval_seconds)
    }

    /// Period of the background token check.
    #[must_use]
    pub fn token_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.token_refresh_interval_seconds)
    }

    /// Period of the check-session heartbeat.
    #[must_use]
    pub fn check_session_interval(&self) -> Duration {
        Duration::from_millis(self.check_session_interval_ms)
    }

    /// Age after which the check-session frame is reloaded.
    #[must_use]
    pub fn check_session_reinit(&self) -> Duration {
        Duration::from_millis(self.check_session_reinit_ms)
    }

    /// Parsed authority URL.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidUrl` if the authority does not parse.
    pub fn authority_url(&self) -> Result<Url, ConfigError> {
        parse_url("authority", &self.authority)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.authority.trim().is_empty() {
            return Err(ConfigError::MissingAuthority);
        }
        if self.client_id.trim().is_empty() {
            return Err(ConfigError::MissingClientId);
        }
        if self.redirect_url.trim().is_empty() {
            return Err(ConfigError::MissingRedirectUrl);
        }

        let authority = self.authority_url()?;
        if authority.scheme() != "https" && !self.allow_http {
            return Err(ConfigError::InsecureAuthority(self.authority.clone()));
        }
        parse_url("redirect_url", &self.redirect_url)?;
        if let Some(url) = &self.silent_renew_url {
            parse_url("silent_renew_url", url)?;
        }
        if let Some(url) = &self.post_logout_redirect_uri {
            parse_url("post_logout_redirect_uri", url)?;
        }

        if self.silent_renew && !self.use_refresh_token && self.silent_renew_url.is_none() {
            return Err(ConfigError::MissingSilentRenewUrl);
        }

        if self.token_refresh_interval_seconds == 0 {
            return Err(ConfigError::ZeroInterval("token_refresh_interval_seconds"));
        }
        if self.refresh_token_retry_interval_seconds == 0 {
            return Err(ConfigError::ZeroInterval(
                "refresh_token_retry_interval_seconds",
            ));
        }
        if self.check_session_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval("check_session_interval_ms"));
        }

        Ok(())
    }
}

fn parse_url(field: &'static str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|e| ConfigError::InvalidUrl {
        field,
        message: e.to_string(),
    })
}

/// Logging settings shared by hosts of the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default level when `RUST_LOG` is not set.
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// A configuration file: logging plus one or more client configurations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OidcSettings {
    /// Logging settings.
    pub logging: LoggingSettings,
    /// Client configurations.
    pub clients: Vec<OpenIdConfiguration>,
}

impl OidcSettings {
    /// Validates every client and rejects duplicate configuration ids.
    ///
    /// # Errors
    ///
    /// Returns the first invalid configuration's error.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for client in &self.clients {
            client.validate()?;
            if !seen.insert(client.config_id().to_string()) {
                return Err(ConfigError::Load(format!(
                    "duplicate config_id: {}",
                    client.config_id()
                )));
            }
        }
        Ok(())
    }

    /// Looks up a client configuration by id.
    #[must_use]
    pub fn client(&self, config_id: &str) -> Option<&OpenIdConfiguration> {
        self.clients.iter().find(|c| c.config_id() == config_id)
    }
}

pub mod loader {
    //! Layered configuration loading: TOML file, then `OIDCFLOW__*`
    //! environment overrides.

    use std::path::Path;

    use config::{Config, Environment, File};

    use super::{ConfigError, OidcSettings};

    /// Loads and validates the settings at `path`.
    ///
    /// Environment variables override file values, e.g.
    /// `OIDCFLOW__LOGGING__LEVEL=debug`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Load` if the file cannot be read or
    /// deserialized, or the validation error of the first invalid client.
    pub fn load_configurations(path: impl AsRef<Path>) -> Result<OidcSettings, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::Load(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }

        let cfg = Config::builder()
            .add_source(File::from(path))
            .add_source(
                Environment::with_prefix("OIDCFLOW")
                    .try_parsing(true)
                    .separator("__"),
            )
            .build()
            .map_err(|e| ConfigError::Load(format!("config build error: {e}")))?;

        let settings: OidcSettings = cfg
            .try_deserialize()
            .map_err(|e| ConfigError::Load(format!("config deserialize error: {e}")))?;

        settings.validate()?;
        Ok(settings)
    }
}
