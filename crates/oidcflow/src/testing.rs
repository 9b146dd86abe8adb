//! Test doubles shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use rsa::RsaPrivateKey;
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use url::Url;

use crate::flow::Navigator;
use crate::session::{ChannelError, CheckSessionChannel, FrameId, FrameMessage, OpenedFrame};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport, TransportError};

pub const ISSUER: &str = "https://login.example.com";

pub fn discovery_json(issuer: &str) -> String {
    json!({
        "issuer": issuer,
        "jwks_uri": format!("{issuer}/.well-known/jwks.json"),
        "authorization_endpoint": format!("{issuer}/connect/authorize"),
        "token_endpoint": format!("{issuer}/connect/token"),
        "userinfo_endpoint": format!("{issuer}/connect/userinfo"),
        "end_session_endpoint": format!("{issuer}/connect/endsession"),
        "check_session_iframe": format!("{issuer}/connect/checksession"),
        "revocation_endpoint": format!("{issuer}/connect/revocation"),
        "pushed_authorization_request_endpoint": format!("{issuer}/connect/par"),
    })
    .to_string()
}

pub struct TestKeys {
    pub kid: String,
    encoding_key: EncodingKey,
    n: String,
    e: String,
}

impl TestKeys {
    pub fn sign(&self, claims: &Value) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.kid.clone());
        encode(&header, claims, &self.encoding_key).unwrap()
    }

    pub fn jwks(&self) -> Value {
        json!({
            "keys": [{
                "kty": "RSA",
                "kid": self.kid,
                "alg": "RS256",
                "use": "sig",
                "n": self.n,
                "e": self.e,
            }]
        })
    }
}

/// RSA generation is slow in debug builds, so one key serves all tests.
pub fn test_keys() -> &'static TestKeys {
    static KEYS: OnceLock<TestKeys> = OnceLock::new();
    KEYS.get_or_init(|| {
        let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let public_key = private_key.to_public_key();
        let pem = private_key.to_pkcs8_pem(LineEnding::LF).unwrap();
        TestKeys {
            kid: "test-key-1".to_string(),
            encoding_key: EncodingKey::from_rsa_pem(pem.as_bytes()).unwrap(),
            n: URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be()),
            e: URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be()),
        }
    })
}

/// A transport answering from per-path queues, falling back to a sticky
/// default per path.
#[derive(Default)]
pub struct ScriptedTransport {
    queued: Mutex<HashMap<String, VecDeque<Result<HttpResponse, TransportError>>>>,
    defaults: Mutex<HashMap<String, HttpResponse>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_ok(&self, path: &str, status: u16, body: &str) {
        self.push(path, Ok(HttpResponse::new(status, body)));
    }

    pub fn push_err(&self, path: &str, err: TransportError) {
        self.push(path, Err(err));
    }

    pub fn set_default(&self, path: &str, status: u16, body: &str) {
        self.defaults
            .lock()
            .unwrap()
            .insert(path.to_string(), HttpResponse::new(status, body));
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_to(&self, path: &str) -> Vec<HttpRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.url.path() == path)
            .collect()
    }

    pub fn calls_to(&self, path: &str) -> usize {
        self.requests_to(path).len()
    }

    fn push(&self, path: &str, result: Result<HttpResponse, TransportError>) {
        self.queued
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push_back(result);
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let path = request.url.path().to_string();
        self.requests.lock().unwrap().push(request);

        if let Some(result) = self
            .queued
            .lock()
            .unwrap()
            .get_mut(&path)
            .and_then(VecDeque::pop_front)
        {
            return result;
        }
        if let Some(response) = self.defaults.lock().unwrap().get(&path) {
            return Ok(response.clone());
        }
        Err(TransportError::Other(format!("no scripted response for {path}")))
    }
}

#[derive(Default)]
pub struct RecordingNavigator {
    pub navigations: Mutex<Vec<Url>>,
    pub silent_renew_frames: Mutex<Vec<Url>>,
}

impl RecordingNavigator {
    pub fn last_navigation(&self) -> Option<Url> {
        self.navigations.lock().unwrap().last().cloned()
    }

    pub fn last_silent_renew(&self) -> Option<Url> {
        self.silent_renew_frames.lock().unwrap().last().cloned()
    }
}

impl Navigator for RecordingNavigator {
    fn navigate(&self, url: &Url) {
        self.navigations.lock().unwrap().push(url.clone());
    }

    fn open_silent_renew_frame(&self, url: &Url) {
        self.silent_renew_frames.lock().unwrap().push(url.clone());
    }
}

/// A check-session channel that records posts and lets tests reply.
#[derive(Default)]
pub struct FakeChannel {
    sender: Mutex<Option<mpsc::UnboundedSender<FrameMessage>>>,
    pub posts: Mutex<Vec<(String, String)>>,
    pub opens: Mutex<usize>,
    pub closes: Mutex<usize>,
}

impl FakeChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn post_count(&self) -> usize {
        self.posts.lock().unwrap().len()
    }

    pub fn open_count(&self) -> usize {
        *self.opens.lock().unwrap()
    }

    /// Replies as the frame opened last.
    pub fn reply(&self, origin: &str, data: &str) {
        let source = FrameId(*self.opens.lock().unwrap() as u64);
        self.reply_from(source, origin, data);
    }

    pub fn reply_from(&self, source: FrameId, origin: &str, data: &str) {
        if let Some(sender) = self.sender.lock().unwrap().as_ref() {
            let _ = sender.send(FrameMessage {
                origin: origin.to_string(),
                source,
                data: data.to_string(),
            });
        }
    }
}

#[async_trait]
impl CheckSessionChannel for FakeChannel {
    async fn open(&self, _url: &Url) -> Result<OpenedFrame, ChannelError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.sender.lock().unwrap() = Some(tx);
        let mut opens = self.opens.lock().unwrap();
        *opens += 1;
        Ok(OpenedFrame {
            id: FrameId(*opens as u64),
            messages: rx,
        })
    }

    fn post(&self, message: &str, target_origin: &str) -> Result<(), ChannelError> {
        self.posts
            .lock()
            .unwrap()
            .push((message.to_string(), target_origin.to_string()));
        Ok(())
    }

    fn close(&self) {
        *self.closes.lock().unwrap() += 1;
    }
}
