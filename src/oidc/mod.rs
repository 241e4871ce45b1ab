//! OpenID Connect collaborators: provider discovery and the token
//! service.
//!
//! The [`TokenService`] owns everything that talks to the identity
//! provider: the discovery document fetched at startup, the JWKS key
//! cache (refreshed with single-flight semantics so concurrent
//! validators observe at most one fetch), token validation, and the
//! token-endpoint grants (authorization code, refresh, resource-owner
//! password). Handlers for the proxy's own `/oauth` endpoints live in
//! [`handlers`].

pub mod handlers;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use rand::Rng;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::model::OidcConfig;
use crate::error::DoormanError;

/// Subset of the provider discovery document Doorman consumes. All IdP
/// URLs are derived from here; none are configured directly.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryDocument {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub jwks_uri: String,
    #[serde(default)]
    pub end_session_endpoint: Option<String>,
}

/// Response from the token endpoint for every grant type.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct Jwks {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    #[serde(default)]
    kid: Option<String>,
    kty: String,
    #[serde(default)]
    alg: Option<String>,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token has expired")]
    Expired,

    #[error("invalid token: {0}")]
    Invalid(String),

    #[error("identity provider request failed: {0}")]
    Provider(String),
}

/// The identity extracted from a validated access token. Immutable once
/// created; owned by the request scope.
#[derive(Debug, Clone)]
pub struct Identity {
    pub subject: String,
    pub email: String,
    pub preferred_username: String,
    pub roles: Vec<String>,
    pub groups: Vec<String>,
    pub expires_at: u64,
    pub claims: Value,
    pub token: String,
}

impl Identity {
    #[must_use]
    pub fn from_claims(token: String, claims: Value) -> Self {
        let subject = string_claim(&claims, "sub");
        let email = string_claim(&claims, "email");
        let preferred_username = string_claim(&claims, "preferred_username");
        let expires_at = claims.get("exp").and_then(Value::as_u64).unwrap_or(0);

        let mut roles = list_claim(claims.get("roles"));
        if let Some(realm) = claims.get("realm_access") {
            roles.extend(list_claim(realm.get("roles")));
        }
        // Client roles are namespaced "<client>:<role>".
        if let Some(Value::Object(clients)) = claims.get("resource_access") {
            for (client, access) in clients {
                for role in list_claim(access.get("roles")) {
                    roles.push(format!("{client}:{role}"));
                }
            }
        }

        let groups = list_claim(claims.get("groups"));

        Self {
            subject,
            email,
            preferred_username,
            roles,
            groups,
            expires_at,
            claims,
            token,
        }
    }

    /// Seconds until expiry, clamped at zero.
    #[must_use]
    pub fn expires_in(&self) -> u64 {
        self.expires_at.saturating_sub(unix_now())
    }
}

fn string_claim(claims: &Value, name: &str) -> String {
    claims
        .get(name)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn list_claim(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(ToString::to_string)
            .collect(),
        Some(Value::String(s)) if !s.is_empty() => {
            s.split(',').map(|v| v.trim().to_string()).collect()
        }
        _ => Vec::new(),
    }
}

#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

struct ServiceInner {
    http: reqwest::Client,
    discovery: DiscoveryDocument,
    client_id: String,
    client_secret: String,
    scopes: Vec<String>,
    audience: String,
    keys: RwLock<HashMap<String, (Algorithm, DecodingKey)>>,
    /// Single-flight gate: holds the instant of the last JWKS fetch.
    refresh_gate: Mutex<Option<Instant>>,
    cache_ttl: Duration,
    /// Static keys installed at construction are never re-fetched.
    static_keys: bool,
}

/// Cheap to clone; all state is shared behind an `Arc`.
#[derive(Clone)]
pub struct TokenService {
    inner: Arc<ServiceInner>,
}

impl TokenService {
    /// Discover the provider and build the service. Fails fast when the
    /// IdP is unreachable; the proxy refuses to start without it.
    pub async fn discover(http: reqwest::Client, oidc: &OidcConfig) -> Result<Self, DoormanError> {
        let url = discovery_url(&oidc.discovery_url);
        let discovery: DiscoveryDocument = http
            .get(&url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| DoormanError::Discovery {
                url: url.clone(),
                source: Box::new(e),
            })?
            .json()
            .await
            .map_err(|e| DoormanError::Discovery {
                url: url.clone(),
                source: Box::new(e),
            })?;

        info!(issuer = %discovery.issuer, jwks = %discovery.jwks_uri, "discovered identity provider");

        let service = Self::assemble(http, discovery, oidc, false);
        if let Err(e) = service.refresh_jwks().await {
            warn!(error = %e, "initial JWKS fetch failed, retrying on first request");
        }
        Ok(service)
    }

    /// Build a service around a fixed discovery document and signing key.
    /// The JWKS endpoint is never contacted. Intended for tests and for
    /// providers without key rotation.
    #[must_use]
    pub fn with_static_key(
        discovery: DiscoveryDocument,
        oidc: &OidcConfig,
        kid: &str,
        key: DecodingKey,
        algorithm: Algorithm,
    ) -> Self {
        let mut keys = HashMap::new();
        keys.insert(kid.to_string(), (algorithm, key));
        Self::assemble_with_keys(reqwest::Client::new(), discovery, oidc, true, keys)
    }

    fn assemble(
        http: reqwest::Client,
        discovery: DiscoveryDocument,
        oidc: &OidcConfig,
        static_keys: bool,
    ) -> Self {
        Self::assemble_with_keys(http, discovery, oidc, static_keys, HashMap::new())
    }

    fn assemble_with_keys(
        http: reqwest::Client,
        discovery: DiscoveryDocument,
        oidc: &OidcConfig,
        static_keys: bool,
        keys: HashMap<String, (Algorithm, DecodingKey)>,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                http,
                discovery,
                client_id: oidc.client_id.clone(),
                client_secret: oidc.client_secret.clone(),
                scopes: oidc.scopes.clone(),
                audience: oidc
                    .audience
                    .clone()
                    .unwrap_or_else(|| oidc.client_id.clone()),
                keys: RwLock::new(keys),
                refresh_gate: Mutex::new(None),
                cache_ttl: Duration::from_secs(oidc.jwks_cache_secs),
                static_keys,
            }),
        }
    }

    /// Validate signature, expiry, issuer, and audience; return the raw
    /// claim set. Unknown signing keys trigger one JWKS re-fetch before
    /// the token is rejected.
    pub async fn verify(&self, token: &str) -> Result<Value, TokenError> {
        let header =
            decode_header(token).map_err(|e| TokenError::Invalid(format!("bad header: {e}")))?;
        let kid = header.kid.unwrap_or_default();

        if let Some(claims) = self.try_decode(token, &kid).await? {
            return Ok(claims);
        }

        if !self.inner.static_keys {
            self.refresh_jwks()
                .await
                .map_err(|e| TokenError::Invalid(format!("signing key refresh failed: {e}")))?;
            if let Some(claims) = self.try_decode(token, &kid).await? {
                return Ok(claims);
            }
        }

        Err(TokenError::Invalid(format!("unknown signing key '{kid}'")))
    }

    /// Decode against the cached key set; `Ok(None)` means the key id is
    /// not (yet) known.
    async fn try_decode(&self, token: &str, kid: &str) -> Result<Option<Value>, TokenError> {
        let keys = self.inner.keys.read().await;
        let entry = match keys.get(kid) {
            Some(entry) => Some(entry),
            // Tolerate tokens without a kid when exactly one key is known.
            None if kid.is_empty() && keys.len() == 1 => keys.values().next(),
            None => None,
        };
        let Some((algorithm, key)) = entry else {
            return Ok(None);
        };
        let mut validation = Validation::new(*algorithm);
        validation.set_issuer(&[&self.inner.discovery.issuer]);
        validation.set_audience(&[&self.inner.audience]);

        match decode::<Value>(token, key, &validation) {
            Ok(data) => Ok(Some(data.claims)),
            Err(e) if matches!(e.kind(), jsonwebtoken::errors::ErrorKind::ExpiredSignature) => {
                Err(TokenError::Expired)
            }
            Err(e) => Err(TokenError::Invalid(e.to_string())),
        }
    }

    /// Fetch the JWKS document and swap the key cache. Concurrent
    /// callers collapse onto one fetch: whoever holds the gate checks
    /// whether a refresh just happened before issuing another.
    async fn refresh_jwks(&self) -> Result<(), TokenError> {
        let mut gate = self.inner.refresh_gate.lock().await;
        if let Some(last) = *gate {
            if last.elapsed() < Duration::from_secs(10) {
                return Ok(());
            }
        }

        let jwks: Jwks = self
            .inner
            .http
            .get(&self.inner.discovery.jwks_uri)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| TokenError::Provider(format!("JWKS fetch: {e}")))?
            .json()
            .await
            .map_err(|e| TokenError::Provider(format!("JWKS decode: {e}")))?;

        let mut keys = HashMap::new();
        for jwk in &jwks.keys {
            match build_key(jwk) {
                Ok(Some((kid, entry))) => {
                    keys.insert(kid, entry);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(kid = jwk.kid.as_deref().unwrap_or(""), error = %e, "skipping JWKS key");
                }
            }
        }

        debug!(keys = keys.len(), "JWKS cache refreshed");
        *self.inner.keys.write().await = keys;
        *gate = Some(Instant::now());
        Ok(())
    }

    /// Background poll loop keeping the key cache warm. Runs for the
    /// life of the process.
    pub async fn jwks_poll_loop(self) {
        if self.inner.static_keys {
            return;
        }
        let mut interval = tokio::time::interval(self.inner.cache_ttl);
        interval.tick().await; // the startup fetch already happened
        loop {
            interval.tick().await;
            if let Err(e) = self.refresh_jwks().await {
                warn!(error = %e, "periodic JWKS refresh failed");
            }
        }
    }

    /// Build the IdP authorization URL for the code flow.
    #[must_use]
    pub fn authorization_url(
        &self,
        redirect_uri: &str,
        state: &str,
        code_challenge: Option<&str>,
    ) -> String {
        let mut auth_url = match url::Url::parse(&self.inner.discovery.authorization_endpoint) {
            Ok(u) => u,
            // The endpoint came from a validated discovery document.
            Err(_) => return self.inner.discovery.authorization_endpoint.clone(),
        };

        {
            let mut params = auth_url.query_pairs_mut();
            params.append_pair("response_type", "code");
            params.append_pair("client_id", &self.inner.client_id);
            params.append_pair("redirect_uri", redirect_uri);
            params.append_pair("state", state);
            if !self.inner.scopes.is_empty() {
                params.append_pair("scope", &self.inner.scopes.join(" "));
            }
            if let Some(challenge) = code_challenge {
                params.append_pair("code_challenge", challenge);
                params.append_pair("code_challenge_method", "S256");
            }
        }

        auth_url.to_string()
    }

    /// Provider logout URL, when the provider advertises one.
    #[must_use]
    pub fn end_session_url(&self, post_logout_redirect: &str) -> Option<String> {
        let endpoint = self.inner.discovery.end_session_endpoint.as_ref()?;
        let mut logout_url = url::Url::parse(endpoint).ok()?;
        logout_url
            .query_pairs_mut()
            .append_pair("client_id", &self.inner.client_id)
            .append_pair("post_logout_redirect_uri", post_logout_redirect);
        Some(logout_url.to_string())
    }

    /// Exchange an authorization code for tokens.
    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        code_verifier: Option<&str>,
    ) -> Result<TokenResponse, TokenError> {
        let mut params = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", &self.inner.client_id),
            ("client_secret", &self.inner.client_secret),
        ];
        if let Some(verifier) = code_verifier {
            params.push(("code_verifier", verifier));
        }
        self.token_request(&params).await
    }

    /// Refresh an access token out-of-band.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, TokenError> {
        self.token_request(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", &self.inner.client_id),
            ("client_secret", &self.inner.client_secret),
        ])
        .await
    }

    /// Resource-owner password grant, used by the optional login handler.
    pub async fn password_grant(
        &self,
        username: &str,
        password: &str,
    ) -> Result<TokenResponse, TokenError> {
        let scope = self.inner.scopes.join(" ");
        self.token_request(&[
            ("grant_type", "password"),
            ("username", username),
            ("password", password),
            ("client_id", &self.inner.client_id),
            ("client_secret", &self.inner.client_secret),
            ("scope", &scope),
        ])
        .await
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> Result<TokenResponse, TokenError> {
        let response = self
            .inner
            .http
            .post(&self.inner.discovery.token_endpoint)
            .form(params)
            .send()
            .await
            .map_err(|e| TokenError::Provider(format!("token request: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TokenError::Provider(format!(
                "token endpoint returned {status}: {body}"
            )));
        }

        response
            .json()
            .await
            .map_err(|e| TokenError::Provider(format!("token response decode: {e}")))
    }
}

fn discovery_url(configured: &str) -> String {
    if configured.contains("/.well-known/") {
        configured.to_string()
    } else {
        format!(
            "{}/.well-known/openid-configuration",
            configured.trim_end_matches('/')
        )
    }
}

fn build_key(jwk: &Jwk) -> Result<Option<(String, (Algorithm, DecodingKey))>, String> {
    if jwk.kty != "RSA" {
        // Signature keys other than RSA are not in use with the
        // supported providers.
        return Ok(None);
    }
    let (Some(n), Some(e)) = (&jwk.n, &jwk.e) else {
        return Err("RSA key missing n/e components".into());
    };
    let algorithm = match jwk.alg.as_deref() {
        None | Some("RS256") => Algorithm::RS256,
        Some("RS384") => Algorithm::RS384,
        Some("RS512") => Algorithm::RS512,
        Some(other) => return Err(format!("unsupported algorithm '{other}'")),
    };
    let key = DecodingKey::from_rsa_components(n, e).map_err(|e| e.to_string())?;
    let kid = jwk.kid.clone().unwrap_or_default();
    Ok(Some((kid, (algorithm, key))))
}

/// Generate a cryptographically random state nonce.
#[must_use]
pub fn generate_state() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Generate a PKCE code verifier and its S256 challenge.
#[must_use]
pub fn generate_pkce() -> (String, String) {
    let verifier_bytes: [u8; 32] = rand::rng().random();
    let verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);

    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    let challenge = URL_SAFE_NO_PAD.encode(hasher.finalize());

    (verifier, challenge)
}
