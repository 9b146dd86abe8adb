//! Shared fixtures: a wiremock authorization server and RS256 signing keys.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use oidcflow::{
    FlowOrchestrator, MemoryStorage, Navigator, OpenIdConfiguration, ReqwestTransport,
};
use rsa::RsaPrivateKey;
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use serde_json::{Value, json};
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const CLIENT_ID: &str = "spa";
pub const REDIRECT: &str = "https://app.example.com/callback";
pub const KID: &str = "integration-key";

struct Keys {
    encoding_key: EncodingKey,
    n: String,
    e: String,
}

fn keys() -> &'static Keys {
    static KEYS: OnceLock<Keys> = OnceLock::new();
    KEYS.get_or_init(|| {
        let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).expect("rsa key");
        let pem = private_key.to_pkcs8_pem(LineEnding::LF).expect("pem");
        let public_key = private_key.to_public_key();
        Keys {
            encoding_key: EncodingKey::from_rsa_pem(pem.as_bytes()).expect("encoding key"),
            n: URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be()),
            e: URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be()),
        }
    })
}

pub fn sign(claims: &Value) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(KID.to_string());
    encode(&header, claims, &keys().encoding_key).expect("sign")
}

pub fn jwks() -> Value {
    json!({
        "keys": [{
            "kty": "RSA",
            "kid": KID,
            "alg": "RS256",
            "use": "sig",
            "n": keys().n,
            "e": keys().e,
        }]
    })
}

pub fn now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

/// Navigator that remembers where it was sent.
#[derive(Default)]
pub struct TestNavigator {
    visited: Mutex<Vec<Url>>,
}

impl TestNavigator {
    pub fn last(&self) -> Option<Url> {
        self.visited.lock().unwrap().last().cloned()
    }
}

impl Navigator for TestNavigator {
    fn navigate(&self, url: &Url) {
        self.visited.lock().unwrap().push(url.clone());
    }

    fn open_silent_renew_frame(&self, url: &Url) {
        self.visited.lock().unwrap().push(url.clone());
    }
}

/// A fake authorization server with discovery and JWKS mounted.
pub struct AuthServer {
    pub server: MockServer,
}

impl AuthServer {
    pub async fn start() -> Self {
        let server = MockServer::start().await;
        let issuer = server.uri();

        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "issuer": issuer,
                "authorization_endpoint": format!("{issuer}/authorize"),
                "token_endpoint": format!("{issuer}/token"),
                "userinfo_endpoint": format!("{issuer}/userinfo"),
                "end_session_endpoint": format!("{issuer}/logout"),
                "revocation_endpoint": format!("{issuer}/revoke"),
                "pushed_authorization_request_endpoint": format!("{issuer}/par"),
                "jwks_uri": format!("{issuer}/jwks"),
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(jwks()))
            .mount(&server)
            .await;

        Self { server }
    }

    pub fn issuer(&self) -> String {
        self.server.uri()
    }

    pub fn config(&self) -> OpenIdConfiguration {
        OpenIdConfiguration::new(self.issuer(), CLIENT_ID, REDIRECT)
            .with_allow_http(true)
            .with_auto_user_info(false)
    }

    pub fn id_token(&self, nonce: Option<&str>) -> String {
        let mut claims = json!({
            "iss": self.issuer(),
            "sub": "alice",
            "aud": CLIENT_ID,
            "exp": now() + 3600,
            "iat": now(),
        });
        if let Some(nonce) = nonce {
            claims["nonce"] = json!(nonce);
        }
        sign(&claims)
    }

    pub fn orchestrator(
        &self,
        config: OpenIdConfiguration,
    ) -> (Arc<FlowOrchestrator>, Arc<TestNavigator>) {
        let navigator = Arc::new(TestNavigator::default());
        let transport = ReqwestTransport::new(Duration::from_secs(5)).expect("transport");
        let orchestrator = FlowOrchestrator::builder(config, navigator.clone())
            .transport(Arc::new(transport))
            .storage(Arc::new(MemoryStorage::new()))
            .build()
            .expect("orchestrator");
        (orchestrator, navigator)
    }
}

pub fn query(url: &Url) -> BTreeMap<String, String> {
    url.query_pairs().into_owned().collect()
}
