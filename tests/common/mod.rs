//! Shared test harness: a doorman instance wired to a static-key token
//! service, plus recording and raw mock upstreams.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::Router;
use jsonwebtoken::{encode, Algorithm, DecodingKey, EncodingKey, Header};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use doorman::config::model::Config;
use doorman::oidc::{self, DiscoveryDocument, TokenService};
use doorman::server::{self, AppState};

pub const TEST_SECRET: &[u8] = b"doorman-test-secret";
pub const TEST_KID: &str = "test-kid";
pub const TEST_ISSUER: &str = "https://idp.test/realms/doorman";
pub const TEST_AUTHORIZE_ENDPOINT: &str = "https://idp.test/realms/doorman/auth";

/// Parse a config from YAML, defaulting the cookie Secure attribute off
/// so plain-HTTP test clients can round-trip cookies.
pub fn config_from_yaml(yaml: &str) -> Config {
    serde_yml::from_str(yaml).expect("test config must parse")
}

pub fn base_config(upstream: &str, resources_yaml: &str) -> Config {
    config_from_yaml(&format!(
        r"
upstream: {upstream}
oidc:
  discovery_url: {TEST_ISSUER}
  client_id: doorman
  client_secret: secret
cookies:
  secure: false
resources:
{resources_yaml}
"
    ))
}

pub fn test_discovery(token_endpoint: &str) -> DiscoveryDocument {
    serde_json::from_value(json!({
        "issuer": TEST_ISSUER,
        "authorization_endpoint": TEST_AUTHORIZE_ENDPOINT,
        "token_endpoint": token_endpoint,
        "jwks_uri": "https://idp.test/realms/doorman/jwks",
    }))
    .expect("static discovery document")
}

pub fn test_token_service(config: &Config, token_endpoint: &str) -> TokenService {
    TokenService::with_static_key(
        test_discovery(token_endpoint),
        &config.oidc,
        TEST_KID,
        DecodingKey::from_secret(TEST_SECRET),
        Algorithm::HS256,
    )
}

/// Sign a test token the proxy's static-key service accepts.
pub fn mint_token(claims: &Value) -> String {
    let mut header = Header::new(Algorithm::HS256);
    header.kid = Some(TEST_KID.to_string());
    encode(&header, claims, &EncodingKey::from_secret(TEST_SECRET)).expect("token signs")
}

/// Claims that pass issuer/audience/expiry validation.
pub fn standard_claims() -> Value {
    json!({
        "sub": "user-1",
        "email": "alice@corp.example",
        "preferred_username": "alice",
        "iss": TEST_ISSUER,
        "aud": "doorman",
        "exp": oidc::unix_now() + 3600,
        "realm_access": {"roles": ["user"]},
        "groups": ["eng"],
    })
}

pub fn expired_claims() -> Value {
    let mut claims = standard_claims();
    claims["exp"] = json!(oidc::unix_now().saturating_sub(7200));
    claims
}

/// Spawn a doorman instance and return its address.
pub async fn start_proxy(config: Config) -> SocketAddr {
    start_proxy_with_idp(config, "http://127.0.0.1:9/token").await
}

pub async fn start_proxy_with_idp(config: Config, token_endpoint: &str) -> SocketAddr {
    let tokens = test_token_service(&config, token_endpoint);
    let state = Arc::new(
        AppState::assemble(config, "test-version".into(), tokens).expect("state assembles"),
    );
    let router = server::build_router(state, 1_048_576);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

/// One request the mock upstream saw.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

#[derive(Clone)]
pub struct MockUpstream {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl MockUpstream {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn hits(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

/// An upstream that records every request and answers 200.
pub async fn start_upstream() -> MockUpstream {
    let requests: Arc<Mutex<Vec<RecordedRequest>>> = Arc::new(Mutex::new(Vec::new()));

    async fn record(
        State(requests): State<Arc<Mutex<Vec<RecordedRequest>>>>,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
    ) -> impl IntoResponse {
        requests.lock().unwrap().push(RecordedRequest {
            method: method.to_string(),
            uri: uri.to_string(),
            headers,
            body: body.to_vec(),
        });
        (StatusCode::OK, [("x-upstream", "hit")], "upstream-response")
    }

    let router = Router::new()
        .fallback(record)
        .with_state(requests.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    MockUpstream { addr, requests }
}

/// A raw TCP upstream that accepts an HTTP upgrade and then echoes
/// "pong" for every "ping".
pub async fn start_upgrade_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                let mut head = Vec::new();
                loop {
                    let n = match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    head.extend_from_slice(&buf[..n]);
                    if head.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }

                let response = "HTTP/1.1 101 Switching Protocols\r\n\
                                Connection: Upgrade\r\n\
                                Upgrade: websocket\r\n\r\n";
                if stream.write_all(response.as_bytes()).await.is_err() {
                    return;
                }

                loop {
                    let n = match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    if &buf[..n] == b"ping" {
                        let _ = stream.write_all(b"pong").await;
                    }
                }
            });
        }
    });

    addr
}

/// A reqwest client that neither follows redirects nor stores cookies.
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

/// Pull a cookie value out of the Set-Cookie response headers.
pub fn response_cookie(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get_all(reqwest::header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(|cookie| {
            let pair = cookie.split(';').next()?;
            let (cookie_name, value) = pair.split_once('=')?;
            (cookie_name == name).then(|| value.to_string())
        })
}
