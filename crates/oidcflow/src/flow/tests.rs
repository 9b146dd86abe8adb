//! Unit tests for the flow orchestrator.
//!
//! The authorization server is a `ScriptedTransport`; discovery and JWKS
//! answer by default, token responses are queued per test.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::{Value, json};
use time::OffsetDateTime;
use tokio::sync::broadcast;

use super::*;
use crate::callback::CallbackError;
use crate::config::{LogoffMethod, ResponseType};
use crate::events::OidcEvent;
use crate::pkce::PkceError;
use crate::storage::MemoryStorage;
use crate::testing::{
    FakeChannel, ISSUER, RecordingNavigator, ScriptedTransport, discovery_json, test_keys,
};
use crate::token::at_hash;
use crate::transport::TransportError;

const REDIRECT: &str = "https://app.example.com/callback";
const DISCOVERY_PATH: &str = "/.well-known/openid-configuration";
const JWKS_PATH: &str = "/.well-known/jwks.json";
const TOKEN_PATH: &str = "/connect/token";
const USERINFO_PATH: &str = "/connect/userinfo";
const REVOCATION_PATH: &str = "/connect/revocation";
const END_SESSION_PATH: &str = "/connect/endsession";
const PAR_PATH: &str = "/connect/par";

struct Harness {
    orchestrator: Arc<FlowOrchestrator>,
    transport: Arc<ScriptedTransport>,
    navigator: Arc<RecordingNavigator>,
    channel: Arc<FakeChannel>,
    events: broadcast::Receiver<OidcEvent>,
}

impl Harness {
    fn new(config: OpenIdConfiguration) -> Self {
        let transport = Arc::new(ScriptedTransport::new());
        transport.set_default(DISCOVERY_PATH, 200, &discovery_json(ISSUER));
        transport.set_default(JWKS_PATH, 200, &test_keys().jwks().to_string());

        let navigator = Arc::new(RecordingNavigator::default());
        let channel = FakeChannel::new();
        let bus = EventBus::new();
        let events = bus.subscribe();
        let orchestrator = FlowOrchestrator::builder(config, navigator.clone())
            .transport(transport.clone())
            .storage(Arc::new(MemoryStorage::new()))
            .check_session_channel(channel.clone())
            .events(bus)
            .build()
            .unwrap();

        Self {
            orchestrator,
            transport,
            navigator,
            channel,
            events,
        }
    }

    fn drain_events(&mut self) -> Vec<EventKind> {
        let mut kinds = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            kinds.push(event.kind);
        }
        kinds
    }

    /// Runs `login` and returns the query of the authorize URL.
    async fn login(&self) -> BTreeMap<String, String> {
        let url = self.orchestrator.login(LoginOptions::default()).await.unwrap();
        url.query_pairs().into_owned().collect()
    }

    /// Logs in and completes the callback with a valid signed ID token.
    async fn authorize(&self) -> String {
        let query = self.login().await;
        let state = query["state"].clone();
        self.transport.push_ok(
            TOKEN_PATH,
            200,
            &token_response(&id_token(&query["nonce"]), "at-1", Some("rt-1")).to_string(),
        );
        self.orchestrator
            .handle_callback(&callback_url(&state))
            .await
            .unwrap();
        state
    }
}

fn config() -> OpenIdConfiguration {
    OpenIdConfiguration::new(ISSUER, "spa", REDIRECT).with_auto_user_info(false)
}

fn now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

fn claims(nonce: Option<&str>) -> Value {
    let mut claims = json!({
        "iss": ISSUER,
        "sub": "user-1",
        "aud": "spa",
        "exp": now() + 3600,
        "iat": now(),
    });
    if let Some(nonce) = nonce {
        claims["nonce"] = json!(nonce);
    }
    claims
}

fn id_token(nonce: &str) -> String {
    test_keys().sign(&claims(Some(nonce)))
}

fn token_response(id_token: &str, access_token: &str, refresh_token: Option<&str>) -> Value {
    let mut body = json!({
        "access_token": access_token,
        "token_type": "Bearer",
        "expires_in": 3600,
        "id_token": id_token,
    });
    if let Some(refresh_token) = refresh_token {
        body["refresh_token"] = json!(refresh_token);
    }
    body
}

fn callback_url(state: &str) -> String {
    format!("{REDIRECT}?code=abc123&state={state}&session_state=ss-1")
}

#[tokio::test]
async fn test_login_builds_pkce_authorize_url() {
    let h = Harness::new(config());
    let query = h.login().await;

    assert_eq!(query["response_type"], "code");
    assert_eq!(query["redirect_uri"], REDIRECT);
    assert_eq!(query["code_challenge_method"], "S256");
    assert!(!query["state"].is_empty());
    assert!(!query["nonce"].is_empty());
    assert_eq!(
        h.navigator.last_navigation().unwrap().path(),
        "/connect/authorize"
    );
    assert_eq!(h.orchestrator.flow_state(), FlowState::AwaitingCallback);
}

#[tokio::test]
async fn test_code_flow_end_to_end() {
    let mut h = Harness::new(config());
    let query = h.login().await;
    let state = query["state"].clone();
    h.transport.push_ok(
        TOKEN_PATH,
        200,
        &token_response(&id_token(&query["nonce"]), "at-1", Some("rt-1")).to_string(),
    );

    let outcome = h
        .orchestrator
        .handle_callback(&callback_url(&state))
        .await
        .unwrap();

    assert!(outcome.is_authenticated);
    assert!(!outcome.is_renew_process);
    assert_eq!(h.orchestrator.authorized_state(), AuthorizedState::Authorized);
    assert_eq!(h.orchestrator.flow_state(), FlowState::Authorized);
    assert_eq!(h.orchestrator.access_token().as_deref(), Some("at-1"));
    assert_eq!(h.orchestrator.refresh_token().as_deref(), Some("rt-1"));
    assert!(h.orchestrator.access_token_expires_at().is_some());

    let exchange = &h.transport.requests_to(TOKEN_PATH)[0];
    let form: BTreeMap<_, _> = exchange.form_params().into_iter().collect();
    assert_eq!(form["grant_type"], "authorization_code");
    assert_eq!(form["code"], "abc123");
    assert_eq!(form["redirect_uri"], REDIRECT);
    assert_eq!(form["code_verifier"].len(), 43);

    let events = h.drain_events();
    assert!(events.contains(&EventKind::AuthorizedStateChanged(AuthorizedState::Authorized)));
    assert!(events.contains(&EventKind::NewAuthenticationResult {
        is_authenticated: true,
        is_renew_process: false,
    }));

    // The state was consumed: replaying the callback fails without a token call.
    let replay = h.orchestrator.handle_callback(&callback_url(&state)).await;
    assert!(matches!(replay, Err(OidcError::AuthenticationFailed)));
    assert_eq!(h.transport.calls_to(TOKEN_PATH), 1);
    assert_eq!(h.orchestrator.authorized_state(), AuthorizedState::Unauthorized);
}

#[tokio::test]
async fn test_callback_without_state_is_terminal() {
    let h = Harness::new(config());
    h.login().await;

    let result = h
        .orchestrator
        .handle_callback(&format!("{REDIRECT}?code=abc123"))
        .await;

    assert!(matches!(
        result,
        Err(OidcError::Callback(CallbackError::MissingState))
    ));
    assert_eq!(h.transport.calls_to(TOKEN_PATH), 0);
    assert_eq!(h.orchestrator.authorized_state(), AuthorizedState::Unauthorized);
}

#[tokio::test]
async fn test_unknown_state_rejected() {
    let h = Harness::new(config());
    h.login().await;

    let result = h.orchestrator.handle_callback(&callback_url("forged")).await;

    assert!(matches!(result, Err(OidcError::AuthenticationFailed)));
    assert_eq!(h.transport.calls_to(TOKEN_PATH), 0);
}

#[tokio::test]
async fn test_corrupted_code_verifier_rejected() {
    let h = Harness::new(config());
    let query = h.login().await;
    let storage = &h.orchestrator.storage;
    let mut intents: BTreeMap<String, FlowIntent> =
        storage.read_json(StorageKey::FlowIntents).unwrap().unwrap();
    intents.get_mut(&query["state"]).unwrap().code_verifier = Some("short".into());
    storage.write_json(StorageKey::FlowIntents, &intents).unwrap();

    let result = h
        .orchestrator
        .handle_callback(&callback_url(&query["state"]))
        .await;

    assert!(matches!(
        result,
        Err(OidcError::Pkce(PkceError::InvalidVerifierLength(5)))
    ));
    assert_eq!(h.transport.calls_to(TOKEN_PATH), 0);
    assert_eq!(h.orchestrator.authorized_state(), AuthorizedState::Unauthorized);
}

#[tokio::test]
async fn test_error_callback() {
    let h = Harness::new(config());
    h.login().await;

    let result = h
        .orchestrator
        .handle_callback(&format!("{REDIRECT}?error=access_denied&state=S1"))
        .await;

    assert!(matches!(
        result,
        Err(OidcError::Callback(CallbackError::AuthorizationServer { .. }))
    ));
    assert!(result.unwrap_err().is_protocol_error());
}

#[tokio::test]
async fn test_wrong_nonce_fails_validation() {
    let h = Harness::new(config());
    let query = h.login().await;
    h.transport.push_ok(
        TOKEN_PATH,
        200,
        &token_response(&id_token("other-nonce"), "at-1", None).to_string(),
    );

    let result = h
        .orchestrator
        .handle_callback(&callback_url(&query["state"]))
        .await;

    assert!(matches!(result, Err(OidcError::AuthenticationFailed)));
    assert_eq!(h.orchestrator.authorized_state(), AuthorizedState::Unauthorized);
    assert!(h.orchestrator.access_token().is_none());
    assert_eq!(h.orchestrator.flow_state(), FlowState::Unauthorized);
}

#[tokio::test]
async fn test_token_endpoint_error_not_retried() {
    let h = Harness::new(config());
    let query = h.login().await;
    h.transport.push_err(
        TOKEN_PATH,
        TransportError::Status {
            status: 400,
            body: r#"{"error":"invalid_grant"}"#.into(),
        },
    );

    let result = h
        .orchestrator
        .handle_callback(&callback_url(&query["state"]))
        .await;

    assert!(matches!(
        result,
        Err(OidcError::AuthorizationServer { ref error, .. }) if error == "invalid_grant"
    ));
    assert_eq!(h.transport.calls_to(TOKEN_PATH), 1);
}

#[tokio::test]
async fn test_concurrent_transition_rejected() {
    let h = Harness::new(config());
    let _guard = h.orchestrator.begin_transition().unwrap();

    assert!(matches!(
        h.orchestrator.login(LoginOptions::default()).await,
        Err(OidcError::FlowInProgress { .. })
    ));
    assert!(matches!(
        h.orchestrator.handle_callback(&callback_url("S1")).await,
        Err(OidcError::FlowInProgress { .. })
    ));
}

#[tokio::test]
async fn test_login_custom_params_and_prompt() {
    let h = Harness::new(config());
    let url = h
        .orchestrator
        .login(
            LoginOptions::default()
                .with_prompt("login")
                .with_param("ui_locales", "de"),
        )
        .await
        .unwrap();
    let query: BTreeMap<String, String> = url.query_pairs().into_owned().collect();

    assert_eq!(query["prompt"], "login");
    assert_eq!(query["ui_locales"], "de");
}

#[tokio::test]
async fn test_pushed_authorization_request() {
    let h = Harness::new(config().with_pushed_authorization_requests(true));
    h.transport.push_err(PAR_PATH, TransportError::Connectivity("reset".into()));
    h.transport.push_ok(
        PAR_PATH,
        201,
        r#"{"request_uri":"urn:ietf:params:oauth:request_uri:abc","expires_in":60}"#,
    );

    let url = h.orchestrator.login(LoginOptions::default()).await.unwrap();
    let query: BTreeMap<String, String> = url.query_pairs().into_owned().collect();

    assert_eq!(h.transport.calls_to(PAR_PATH), 2);
    assert_eq!(query["request_uri"], "urn:ietf:params:oauth:request_uri:abc");
    assert!(!query.contains_key("state"));

    let pushed: BTreeMap<_, _> = h.transport.requests_to(PAR_PATH)[1]
        .form_params()
        .into_iter()
        .collect();
    assert_eq!(pushed["response_type"], "code");
    assert_eq!(pushed["code_challenge_method"], "S256");
}

#[tokio::test]
async fn test_par_gives_up_after_two_retries() {
    let h = Harness::new(config().with_pushed_authorization_requests(true));
    for _ in 0..3 {
        h.transport
            .push_err(PAR_PATH, TransportError::Connectivity("down".into()));
    }

    let result = h.orchestrator.login(LoginOptions::default()).await;

    assert!(result.unwrap_err().is_retryable());
    assert_eq!(h.transport.calls_to(PAR_PATH), 3);
    assert!(h.navigator.last_navigation().is_none());
}

#[tokio::test]
async fn test_implicit_flow() {
    let h = Harness::new(config().with_response_type(ResponseType::IdTokenToken));
    let query = h.login().await;
    assert_eq!(query["response_type"], "id_token token");
    assert!(!query.contains_key("code_challenge"));

    let mut claims = claims(Some(&query["nonce"]));
    claims["at_hash"] = json!(at_hash("at-implicit"));
    let id_token = test_keys().sign(&claims);
    let callback = format!(
        "{REDIRECT}#id_token={id_token}&access_token=at-implicit&token_type=Bearer&expires_in=3600&state={}",
        query["state"]
    );

    h.orchestrator.handle_callback(&callback).await.unwrap();

    assert!(h.orchestrator.is_authenticated());
    assert_eq!(h.orchestrator.access_token().as_deref(), Some("at-implicit"));
    assert_eq!(h.transport.calls_to(TOKEN_PATH), 0);
}

#[tokio::test]
async fn test_implicit_flow_rejects_mismatched_at_hash() {
    let h = Harness::new(config().with_response_type(ResponseType::IdTokenToken));
    let query = h.login().await;

    let mut claims = claims(Some(&query["nonce"]));
    claims["at_hash"] = json!(at_hash("at-other"));
    let id_token = test_keys().sign(&claims);
    let callback = format!(
        "{REDIRECT}#id_token={id_token}&access_token=at-implicit&state={}",
        query["state"]
    );

    assert!(matches!(
        h.orchestrator.handle_callback(&callback).await,
        Err(OidcError::AuthenticationFailed)
    ));
}

#[tokio::test]
async fn test_refresh_keeps_refresh_token_and_id_token() {
    let mut h = Harness::new(config().with_refresh_tokens(true));
    h.authorize().await;
    let id_token_before = h.orchestrator.id_token();
    h.drain_events();

    h.transport.push_ok(
        TOKEN_PATH,
        200,
        r#"{"access_token":"at-2","token_type":"Bearer","expires_in":3600}"#,
    );
    let outcome = h.orchestrator.refresh().await.unwrap();

    assert!(outcome.is_renew_process);
    assert_eq!(h.orchestrator.access_token().as_deref(), Some("at-2"));
    assert_eq!(h.orchestrator.refresh_token().as_deref(), Some("rt-1"));
    assert_eq!(h.orchestrator.id_token(), id_token_before);

    let form: BTreeMap<_, _> = h.transport.requests_to(TOKEN_PATH)[1]
        .form_params()
        .into_iter()
        .collect();
    assert_eq!(form["grant_type"], "refresh_token");
    assert_eq!(form["refresh_token"], "rt-1");

    let events = h.drain_events();
    assert!(events.contains(&EventKind::SilentRenewStarted));
    assert!(events.contains(&EventKind::NewAuthenticationResult {
        is_authenticated: true,
        is_renew_process: true,
    }));
}

#[tokio::test]
async fn test_refresh_with_new_id_token() {
    let h = Harness::new(config().with_refresh_tokens(true));
    h.authorize().await;

    let refreshed = test_keys().sign(&claims(None));
    h.transport.push_ok(
        TOKEN_PATH,
        200,
        &token_response(&refreshed, "at-2", Some("rt-2")).to_string(),
    );
    h.orchestrator.refresh().await.unwrap();

    assert_eq!(h.orchestrator.id_token().as_deref(), Some(refreshed.as_str()));
    assert_eq!(h.orchestrator.refresh_token().as_deref(), Some("rt-2"));
}

#[tokio::test]
async fn test_refreshed_id_token_for_other_subject_rejected() {
    let mut h = Harness::new(config().with_refresh_tokens(true));
    h.authorize().await;
    h.drain_events();

    let mut other = claims(None);
    other["sub"] = json!("user-2");
    h.transport.push_ok(
        TOKEN_PATH,
        200,
        &token_response(&test_keys().sign(&other), "at-2", None).to_string(),
    );

    let result = h.orchestrator.refresh().await;

    assert!(matches!(result, Err(OidcError::AuthenticationFailed)));
    // A failed renewal keeps the held tokens.
    assert_eq!(h.orchestrator.access_token().as_deref(), Some("at-1"));
    assert!(h.orchestrator.is_authenticated());
    assert!(h.drain_events().contains(&EventKind::SilentRenewFailed));
}

#[tokio::test(start_paused = true)]
async fn test_refresh_retries_connectivity_failures() {
    let h = Harness::new(config().with_refresh_tokens(true));
    h.authorize().await;

    h.transport
        .push_err(TOKEN_PATH, TransportError::Connectivity("offline".into()));
    h.transport
        .push_err(TOKEN_PATH, TransportError::Connectivity("offline".into()));
    h.transport.push_ok(
        TOKEN_PATH,
        200,
        r#"{"access_token":"at-2","expires_in":3600}"#,
    );

    let started = tokio::time::Instant::now();
    h.orchestrator.refresh().await.unwrap();

    assert_eq!(h.transport.calls_to(TOKEN_PATH), 4);
    assert!(started.elapsed() >= Duration::from_secs(6));
    assert_eq!(h.orchestrator.access_token().as_deref(), Some("at-2"));
}

#[tokio::test(start_paused = true)]
async fn test_logoff_during_refresh_retry_cancels_renewal() {
    let h = Harness::new(config().with_refresh_tokens(true));
    h.authorize().await;
    h.transport
        .push_err(TOKEN_PATH, TransportError::Connectivity("offline".into()));
    h.transport.push_ok(
        TOKEN_PATH,
        200,
        r#"{"access_token":"at-2","expires_in":3600}"#,
    );

    let orchestrator = h.orchestrator.clone();
    let refresh = tokio::spawn(async move { orchestrator.refresh().await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.orchestrator.logoff_local();
    assert_eq!(h.orchestrator.authorized_state(), AuthorizedState::Unauthorized);

    let result = refresh.await.unwrap();

    assert!(matches!(result, Err(OidcError::RenewalCancelled { .. })));
    assert_eq!(h.transport.calls_to(TOKEN_PATH), 2);
    assert_eq!(h.orchestrator.authorized_state(), AuthorizedState::Unauthorized);
    assert!(h.orchestrator.access_token().is_none());
    assert!(h.orchestrator.refresh_token().is_none());
}

#[tokio::test]
async fn test_refresh_without_id_token_keeps_expired_session_unauthorized() {
    let h = Harness::new(config().with_refresh_tokens(true));
    let mut expired = claims(None);
    expired["exp"] = json!(now() - 60);
    expired["iat"] = json!(now() - 3_660);
    let storage = &h.orchestrator.storage;
    storage.write(StorageKey::AuthzData, "at-1").unwrap();
    storage
        .write_json(
            StorageKey::AuthnResult,
            &json!({
                "access_token": "at-1",
                "id_token": test_keys().sign(&expired),
                "refresh_token": "rt-1",
            }),
        )
        .unwrap();
    assert_eq!(
        h.orchestrator.check_auth(None).await.unwrap(),
        AuthorizedState::Unauthorized
    );

    h.transport.push_ok(
        TOKEN_PATH,
        200,
        r#"{"access_token":"at-2","expires_in":3600}"#,
    );
    let result = h.orchestrator.refresh().await;

    assert!(matches!(result, Err(OidcError::AuthenticationFailed)));
    assert_eq!(h.orchestrator.authorized_state(), AuthorizedState::Unauthorized);
    assert_eq!(h.orchestrator.access_token().as_deref(), Some("at-1"));
    assert!(!h.orchestrator.renewal_running());
}

#[tokio::test]
async fn test_refresh_without_id_token_requires_authorized_state() {
    let h = Harness::new(config().with_refresh_tokens(true));
    h.orchestrator
        .storage
        .write_json(
            StorageKey::AuthnResult,
            &json!({ "id_token": id_token("n-1"), "refresh_token": "rt-1" }),
        )
        .unwrap();
    h.transport.push_ok(
        TOKEN_PATH,
        200,
        r#"{"access_token":"at-2","expires_in":3600}"#,
    );

    assert!(h.orchestrator.refresh().await.is_err());
    assert_eq!(h.orchestrator.authorized_state(), AuthorizedState::Unauthorized);
}

#[tokio::test]
async fn test_rejected_refresh_grant_resets() {
    let h = Harness::new(config().with_refresh_tokens(true));
    h.authorize().await;
    h.transport.push_err(
        TOKEN_PATH,
        TransportError::Status {
            status: 400,
            body: r#"{"error":"invalid_grant","error_description":"expired"}"#.into(),
        },
    );

    let result = h.orchestrator.refresh().await;

    assert!(matches!(result, Err(OidcError::AuthorizationServer { .. })));
    assert_eq!(h.orchestrator.authorized_state(), AuthorizedState::Unauthorized);
    assert!(h.orchestrator.refresh_token().is_none());
}

#[tokio::test]
async fn test_refresh_server_error_keeps_tokens() {
    let h = Harness::new(config().with_refresh_tokens(true));
    h.authorize().await;
    h.transport.push_err(
        TOKEN_PATH,
        TransportError::Status {
            status: 503,
            body: String::new(),
        },
    );

    assert!(h.orchestrator.refresh().await.is_err());
    assert!(h.orchestrator.is_authenticated());
    assert_eq!(h.orchestrator.refresh_token().as_deref(), Some("rt-1"));
    assert!(!h.orchestrator.renewal_running());
}

#[tokio::test]
async fn test_refresh_without_refresh_token() {
    let h = Harness::new(config());
    assert!(matches!(
        h.orchestrator.refresh().await,
        Err(OidcError::MissingRefreshToken)
    ));
}

#[tokio::test]
async fn test_silent_renew_round_trip() {
    let h = Harness::new(
        config().with_silent_renew_url("https://app.example.com/silent-renew.html"),
    );
    h.authorize().await;

    let url = h.orchestrator.begin_silent_renew().await.unwrap();
    assert_eq!(h.navigator.last_silent_renew(), Some(url.clone()));
    let query: BTreeMap<String, String> = url.query_pairs().into_owned().collect();
    assert_eq!(query["prompt"], "none");
    assert_eq!(query["redirect_uri"], "https://app.example.com/silent-renew.html");
    assert!(h.orchestrator.renewal_running());

    h.transport.push_ok(
        TOKEN_PATH,
        200,
        &token_response(&id_token(&query["nonce"]), "at-renewed", None).to_string(),
    );
    let outcome = h
        .orchestrator
        .handle_callback(&format!(
            "https://app.example.com/silent-renew.html?code=def456&state={}",
            query["state"]
        ))
        .await
        .unwrap();

    assert!(outcome.is_renew_process);
    assert_eq!(h.orchestrator.access_token().as_deref(), Some("at-renewed"));
    assert!(!h.orchestrator.renewal_running());

    let form: BTreeMap<_, _> = h.transport.requests_to(TOKEN_PATH)[1]
        .form_params()
        .into_iter()
        .collect();
    assert_eq!(form["redirect_uri"], "https://app.example.com/silent-renew.html");
}

#[tokio::test]
async fn test_failed_silent_renew_keeps_tokens() {
    let h = Harness::new(
        config().with_silent_renew_url("https://app.example.com/silent-renew.html"),
    );
    h.authorize().await;

    let url = h.orchestrator.begin_silent_renew().await.unwrap();
    let query: BTreeMap<String, String> = url.query_pairs().into_owned().collect();
    h.transport.push_ok(
        TOKEN_PATH,
        200,
        &token_response(&id_token("wrong"), "at-renewed", None).to_string(),
    );

    let result = h
        .orchestrator
        .handle_callback(&format!(
            "https://app.example.com/silent-renew.html?code=def456&state={}",
            query["state"]
        ))
        .await;

    assert!(matches!(result, Err(OidcError::AuthenticationFailed)));
    assert!(h.orchestrator.is_authenticated());
    assert_eq!(h.orchestrator.access_token().as_deref(), Some("at-1"));
}

#[tokio::test]
async fn test_silent_renew_callback_after_logoff_discarded() {
    let h = Harness::new(
        config().with_silent_renew_url("https://app.example.com/silent-renew.html"),
    );
    h.authorize().await;
    let url = h.orchestrator.begin_silent_renew().await.unwrap();
    let query: BTreeMap<String, String> = url.query_pairs().into_owned().collect();
    h.orchestrator.logoff_local();

    let result = h
        .orchestrator
        .handle_callback(&format!(
            "https://app.example.com/silent-renew.html?code=def456&state={}",
            query["state"]
        ))
        .await;

    assert!(matches!(result, Err(OidcError::RenewalCancelled { .. })));
    assert_eq!(h.transport.calls_to(TOKEN_PATH), 1);
    assert!(!h.orchestrator.is_authenticated());
    assert!(h.orchestrator.access_token().is_none());
}

#[tokio::test]
async fn test_silent_renew_requires_url() {
    let h = Harness::new(config());
    assert!(
        h.orchestrator
            .begin_silent_renew()
            .await
            .unwrap_err()
            .is_configuration_error()
    );
}

#[tokio::test]
async fn test_user_info_loaded_after_login() {
    let mut h = Harness::new(config().with_auto_user_info(true));
    h.transport.push_ok(
        USERINFO_PATH,
        200,
        r#"{"sub":"user-1","name":"Ada"}"#,
    );

    h.authorize().await;

    assert_eq!(h.orchestrator.user_data().unwrap()["name"], "Ada");
    let request = &h.transport.requests_to(USERINFO_PATH)[0];
    assert_eq!(request.header("Authorization"), Some("Bearer at-1"));
    assert!(h.drain_events().contains(&EventKind::UserDataChanged));
}

#[tokio::test]
async fn test_user_info_subject_mismatch_resets() {
    let h = Harness::new(config().with_auto_user_info(true));
    h.transport
        .push_ok(USERINFO_PATH, 200, r#"{"sub":"someone-else"}"#);
    let query = h.login().await;
    h.transport.push_ok(
        TOKEN_PATH,
        200,
        &token_response(&id_token(&query["nonce"]), "at-1", None).to_string(),
    );

    let result = h
        .orchestrator
        .handle_callback(&callback_url(&query["state"]))
        .await;

    assert!(matches!(result, Err(OidcError::AuthenticationFailed)));
    assert_eq!(h.orchestrator.authorized_state(), AuthorizedState::Unauthorized);
    assert!(h.orchestrator.access_token().is_none());
    assert!(h.orchestrator.user_data().is_none());
}

#[tokio::test]
async fn test_logoff_redirects_to_end_session() {
    let h = Harness::new(config().with_post_logout_redirect_uri("https://app.example.com/"));
    h.authorize().await;
    let id_token = h.orchestrator.id_token().unwrap();

    let outcome = h.orchestrator.logoff().await.unwrap();

    let LogoffOutcome::Redirected(url) = outcome else {
        panic!("expected redirect, got {outcome:?}");
    };
    assert_eq!(url.path(), END_SESSION_PATH);
    let query: BTreeMap<String, String> = url.query_pairs().into_owned().collect();
    assert_eq!(query["id_token_hint"], id_token);
    assert_eq!(query["post_logout_redirect_uri"], "https://app.example.com/");
    assert_eq!(h.navigator.last_navigation(), Some(url));
    assert_eq!(h.orchestrator.authorized_state(), AuthorizedState::Unauthorized);
    assert!(h.orchestrator.id_token().is_none());
}

#[tokio::test]
async fn test_logoff_post_ignores_network_failure() {
    let h = Harness::new(config().with_logoff_method(LogoffMethod::Post));
    h.authorize().await;
    h.transport
        .push_err(END_SESSION_PATH, TransportError::Connectivity("offline".into()));

    let outcome = h.orchestrator.logoff().await.unwrap();

    assert_eq!(outcome, LogoffOutcome::Posted);
    let form: BTreeMap<_, _> = h.transport.requests_to(END_SESSION_PATH)[0]
        .form_params()
        .into_iter()
        .collect();
    assert!(form.contains_key("id_token_hint"));
    assert!(!h.orchestrator.is_authenticated());
}

#[tokio::test(start_paused = true)]
async fn test_logoff_after_server_side_change_is_local() {
    let h = Harness::new(config().with_check_session(true));
    h.authorize().await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.channel.post_count(), 1);
    h.channel.reply("https://login.example.com", "changed");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let outcome = h.orchestrator.logoff().await.unwrap();

    assert_eq!(outcome, LogoffOutcome::LocalOnly);
    assert!(h.navigator.last_navigation().unwrap().path() != END_SESSION_PATH);
    assert!(!h.orchestrator.session_monitor().unwrap().is_running());
    assert!(!h.orchestrator.is_authenticated());
}

#[tokio::test(start_paused = true)]
async fn test_local_logoff_stops_monitor() {
    let h = Harness::new(config().with_check_session(true));
    h.authorize().await;
    tokio::time::sleep(Duration::from_millis(3_100)).await;
    let posted = h.channel.post_count();

    h.orchestrator.logoff_local();
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(h.channel.post_count(), posted);
    assert_eq!(h.orchestrator.flow_state(), FlowState::Idle);
}

#[tokio::test]
async fn test_logoff_and_revoke_tokens() {
    let h = Harness::new(config());
    h.authorize().await;
    h.transport.set_default(REVOCATION_PATH, 200, "");

    h.orchestrator.logoff_and_revoke_tokens().await.unwrap();

    let hints: Vec<String> = h
        .transport
        .requests_to(REVOCATION_PATH)
        .iter()
        .map(|r| {
            r.form_params()
                .into_iter()
                .find(|(k, _)| k == "token_type_hint")
                .map(|(_, v)| v)
                .unwrap()
        })
        .collect();
    assert_eq!(hints, vec!["refresh_token", "access_token"]);
    assert!(!h.orchestrator.is_authenticated());
}

#[tokio::test]
async fn test_failed_revocation_still_logs_off() {
    let h = Harness::new(config());
    h.authorize().await;
    for _ in 0..3 {
        h.transport
            .push_err(REVOCATION_PATH, TransportError::Connectivity("down".into()));
    }

    let result = h.orchestrator.logoff_and_revoke_tokens().await;

    assert!(result.is_err());
    assert_eq!(h.transport.calls_to(REVOCATION_PATH), 3);
    assert!(!h.orchestrator.is_authenticated());
    assert!(h.orchestrator.refresh_token().is_none());
}

#[tokio::test]
async fn test_check_auth_completes_callback() {
    let mut h = Harness::new(config());
    let query = h.login().await;
    h.transport.push_ok(
        TOKEN_PATH,
        200,
        &token_response(&id_token(&query["nonce"]), "at-1", None).to_string(),
    );
    h.drain_events();

    let state = h
        .orchestrator
        .check_auth(Some(&callback_url(&query["state"])))
        .await
        .unwrap();

    assert_eq!(state, AuthorizedState::Authorized);
    let events = h.drain_events();
    assert_eq!(events.first(), Some(&EventKind::CheckingAuth));
    assert_eq!(events.last(), Some(&EventKind::CheckingAuthFinished));
}

#[tokio::test]
async fn test_check_auth_restores_from_storage() {
    let backend: Arc<dyn StoragePersistence> = Arc::new(MemoryStorage::new());
    let transport = Arc::new(ScriptedTransport::new());
    transport.set_default(DISCOVERY_PATH, 200, &discovery_json(ISSUER));
    transport.set_default(JWKS_PATH, 200, &test_keys().jwks().to_string());

    let build = || {
        FlowOrchestrator::builder(config(), Arc::new(RecordingNavigator::default()))
            .transport(transport.clone())
            .storage(backend.clone())
            .build()
            .unwrap()
    };

    // First process begins the flow.
    let first = build();
    let url = first.login(LoginOptions::default()).await.unwrap();
    let query: BTreeMap<String, String> = url.query_pairs().into_owned().collect();
    drop(first);

    // Second process completes it.
    transport.push_ok(
        TOKEN_PATH,
        200,
        &token_response(&id_token(&query["nonce"]), "at-1", None).to_string(),
    );
    let second = build();
    second.handle_callback(&callback_url(&query["state"])).await.unwrap();
    drop(second);

    // Third process restores it.
    let third = build();
    assert_eq!(third.authorized_state(), AuthorizedState::Unknown);
    assert_eq!(
        third.check_auth(Some("https://app.example.com/home")).await.unwrap(),
        AuthorizedState::Authorized
    );
}

#[tokio::test]
async fn test_check_auth_without_tokens() {
    let h = Harness::new(config());
    assert_eq!(
        h.orchestrator.check_auth(None).await.unwrap(),
        AuthorizedState::Unauthorized
    );
}

#[tokio::test(start_paused = true)]
async fn test_periodic_check_refreshes_expiring_token() {
    let mut config = config().with_refresh_tokens(true);
    config.silent_renew_offset_seconds = 3_600;
    let mut h = Harness::new(config);

    let query = h.login().await;
    let mut claims = claims(Some(&query["nonce"]));
    claims["exp"] = json!(now() + 7_200);
    h.transport.push_ok(
        TOKEN_PATH,
        200,
        &token_response(&test_keys().sign(&claims), "at-1", Some("rt-1")).to_string(),
    );
    h.orchestrator
        .handle_callback(&callback_url(&query["state"]))
        .await
        .unwrap();
    h.transport.push_ok(
        TOKEN_PATH,
        200,
        r#"{"access_token":"at-2","expires_in":7200}"#,
    );
    h.drain_events();

    tokio::time::sleep(Duration::from_millis(4_100)).await;

    assert_eq!(h.transport.calls_to(TOKEN_PATH), 2);
    assert_eq!(h.orchestrator.access_token().as_deref(), Some("at-2"));
    assert!(h.drain_events().contains(&EventKind::TokenExpired));
}

#[test]
fn test_invalid_configuration_rejected() {
    let result = FlowOrchestrator::builder(
        OpenIdConfiguration::new("", "spa", REDIRECT),
        Arc::new(RecordingNavigator::default()),
    )
    .transport(Arc::new(ScriptedTransport::new()))
    .build();

    assert!(result.unwrap_err().is_configuration_error());
}
