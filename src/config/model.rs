//! Serde data structures for the Doorman configuration file.
//!
//! Contains [`Config`] (the root), [`Resource`] (a protected routing
//! rule), and the grouped sub-configs for the identity provider,
//! cookies, CSRF, CORS, and upstream connection tuning. All types derive
//! `Serialize` and `Deserialize` with `deny_unknown_fields` for strict
//! parsing. The model is immutable after startup; it is shared through
//! an `Arc` and never written to by the request path.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The literal catch-all pattern.
pub const ALL_ROUTES: &str = "/*";

const fn default_true() -> bool {
    true
}

fn default_oauth_uri() -> String {
    "/oauth".to_string()
}

fn default_scopes() -> Vec<String> {
    vec![
        "openid".to_string(),
        "email".to_string(),
        "profile".to_string(),
    ]
}

fn default_access_cookie() -> String {
    "kc-access".to_string()
}

fn default_refresh_cookie() -> String {
    "kc-state".to_string()
}

fn default_csrf_cookie() -> String {
    "kc-csrf".to_string()
}

fn default_csrf_header() -> String {
    "X-CSRF-Token".to_string()
}

fn default_same_site() -> String {
    "lax".to_string()
}

const fn default_connect_timeout_ms() -> u64 {
    5_000
}

const fn default_response_header_timeout_ms() -> u64 {
    30_000
}

const fn default_keepalive_secs() -> u64 {
    30
}

const fn default_max_idle_per_host() -> usize {
    16
}

const fn default_jwks_cache_secs() -> u64 {
    3_600
}

const fn default_cors_max_age_secs() -> u64 {
    600
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Default upstream URL. Scheme must be http, https, or unix.
    pub upstream: String,

    /// Base path under which the proxy's own endpoints are mounted.
    #[serde(default = "default_oauth_uri")]
    pub oauth_uri: String,

    /// External URL of this proxy, used to build the OAuth redirect_uri.
    /// When empty, the inbound Host and X-Forwarded-Proto headers are used.
    #[serde(default)]
    pub redirection_url: String,

    /// Keep the inbound Host header when forwarding instead of rewriting
    /// it to the upstream host.
    #[serde(default)]
    pub preserve_host: bool,

    /// Deny any route not covered by an explicit resource.
    #[serde(default = "default_true")]
    pub enable_default_deny: bool,

    /// Respond 404 (401 for unauthenticated callers) on undeclared routes
    /// instead of synthesizing a protected catch-all.
    #[serde(default)]
    pub enable_default_not_found: bool,

    /// Pass the proxy's own cookies through to the upstream.
    #[serde(default)]
    pub enable_authorization_cookies: bool,

    /// Project the raw access token as X-Auth-Token upstream.
    #[serde(default)]
    pub enable_token_header: bool,

    /// Expose POST /oauth/login (resource-owner password grant).
    #[serde(default)]
    pub enable_login_handler: bool,

    /// Static headers applied to every upstream request (overwrite).
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Static headers applied to every response to the client.
    #[serde(default)]
    pub response_headers: HashMap<String, String>,

    /// Claim matchers (name -> regex) every token must satisfy globally.
    #[serde(default)]
    pub match_claims: HashMap<String, String>,

    /// Claim names projected upstream as X-Auth-<ClaimName>.
    #[serde(default)]
    pub add_claims: Vec<String>,

    pub oidc: OidcConfig,

    #[serde(default)]
    pub cookies: CookieConfig,

    #[serde(default)]
    pub csrf: CsrfConfig,

    #[serde(default)]
    pub cors: CorsConfig,

    #[serde(default)]
    pub upstream_options: UpstreamOptions,

    #[serde(default)]
    pub resources: Vec<Resource>,
}

/// Identity provider settings. All IdP URLs are derived from the
/// discovery document fetched at startup.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct OidcConfig {
    /// Issuer URL; `/.well-known/openid-configuration` is appended
    /// unless the URL already points at a discovery document.
    pub discovery_url: String,

    pub client_id: String,

    #[serde(default)]
    pub client_secret: String,

    /// Expected audience of access tokens. Defaults to the client id.
    #[serde(default)]
    pub audience: Option<String>,

    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,

    /// Send a PKCE S256 challenge with the authorization request.
    #[serde(default)]
    pub enable_pkce: bool,

    /// How long fetched JWKS keys are trusted before a re-fetch.
    #[serde(default = "default_jwks_cache_secs")]
    pub jwks_cache_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct CookieConfig {
    /// Access token cookie name (chunk suffixes are derived from it).
    pub access_name: String,

    /// Refresh token cookie name.
    pub refresh_name: String,

    /// Cookie domain; empty uses the request host.
    pub domain: String,

    /// Mark cookies Secure. Disable only for plain-HTTP development.
    pub secure: bool,

    /// Session cookies: omit Max-Age so browsers drop them on exit.
    pub session_only: bool,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            access_name: default_access_cookie(),
            refresh_name: default_refresh_cookie(),
            domain: String::new(),
            secure: true,
            session_only: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct CsrfConfig {
    /// Enable double-submit CSRF protection.
    pub enabled: bool,

    pub cookie_name: String,

    pub header_name: String,
}

impl Default for CsrfConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cookie_name: default_csrf_cookie(),
            header_name: default_csrf_header(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct CorsConfig {
    /// Allowed origins. Empty disables CORS handling entirely.
    pub origins: Vec<String>,

    pub methods: Vec<String>,

    pub headers: Vec<String>,

    pub credentials: bool,

    pub max_age_secs: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            origins: Vec::new(),
            methods: Vec::new(),
            headers: Vec::new(),
            credentials: false,
            max_age_secs: default_cors_max_age_secs(),
        }
    }
}

impl CorsConfig {
    /// CORS is mediated by the proxy when at least one origin is listed.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !self.origins.is_empty()
    }
}

/// Connection tuning for the shared upstream client.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct UpstreamOptions {
    /// TCP/Unix connect timeout in milliseconds.
    pub connect_timeout_ms: u64,

    /// How long to wait for upstream response headers before 504.
    pub response_header_timeout_ms: u64,

    /// Idle pooled connections are closed after this many seconds.
    pub keepalive_secs: u64,

    /// Disable connection reuse entirely.
    pub disable_keepalive: bool,

    pub max_idle_per_host: usize,

    /// Negotiate HTTP/2 with the upstream.
    pub enable_http2: bool,

    /// Restrict upstream TLS to modern settings (TLS 1.3 only).
    pub tls_modern: bool,

    /// Extra CA bundle (PEM) trusted for upstream TLS.
    pub ca_bundle: Option<String>,

    /// Client certificate (PEM) presented to the upstream.
    pub client_cert: Option<String>,

    /// Private key (PEM) for the client certificate.
    pub client_key: Option<String>,
}

impl Default for UpstreamOptions {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            response_header_timeout_ms: default_response_header_timeout_ms(),
            keepalive_secs: default_keepalive_secs(),
            disable_keepalive: false,
            max_idle_per_host: default_max_idle_per_host(),
            enable_http2: false,
            tls_modern: false,
            ca_bundle: None,
            client_cert: None,
            client_key: None,
        }
    }
}

/// A protected routing rule: a URL prefix and its access policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Resource {
    /// URL prefix; `/*` is the catch-all.
    pub url: String,

    /// Allowed HTTP methods. Empty means all methods.
    #[serde(default)]
    pub methods: Vec<String>,

    /// Roles the identity must carry (AND semantics).
    #[serde(default)]
    pub roles: Vec<String>,

    /// Groups the identity must carry (AND semantics).
    #[serde(default)]
    pub groups: Vec<String>,

    /// Per-claim regex matchers, unioned with the global `match_claims`.
    #[serde(default)]
    pub claims: HashMap<String, String>,

    /// Per-resource upstream override.
    #[serde(default)]
    pub upstream: Option<String>,

    /// Prefix trimmed from the inbound path before the upstream join.
    #[serde(default)]
    pub strip_base_path: String,

    /// Proxy without authentication or admission checks.
    #[serde(default)]
    pub white_listed: bool,

    /// Subject this resource to CSRF protection when globally enabled.
    #[serde(default = "default_true")]
    pub enable_csrf: bool,
}

impl Resource {
    #[must_use]
    pub fn is_catch_all(&self) -> bool {
        self.url == ALL_ROUTES
    }

    /// A resource allows a method when its list is empty or contains it.
    #[must_use]
    pub fn allows_method(&self, method: &str) -> bool {
        self.methods.is_empty() || self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }

    /// Synthesized catch-all appended when default-deny is active.
    #[must_use]
    pub fn default_deny() -> Self {
        Self {
            url: ALL_ROUTES.to_string(),
            methods: Vec::new(),
            roles: Vec::new(),
            groups: Vec::new(),
            claims: HashMap::new(),
            upstream: None,
            strip_base_path: String::new(),
            white_listed: false,
            enable_csrf: true,
        }
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let methods = if self.methods.is_empty() {
            "ANY".to_string()
        } else {
            self.methods.join(",")
        };
        write!(f, "uri: {} methods: {methods}", self.url)?;
        if !self.roles.is_empty() {
            write!(f, " roles: {}", self.roles.join(","))?;
        }
        if self.white_listed {
            write!(f, " white-listed")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_methods_allow_everything() {
        let r = Resource::default_deny();
        assert!(r.allows_method("GET"));
        assert!(r.allows_method("DELETE"));
    }

    #[test]
    fn method_list_is_case_insensitive() {
        let mut r = Resource::default_deny();
        r.methods = vec!["get".into(), "POST".into()];
        assert!(r.allows_method("GET"));
        assert!(r.allows_method("post"));
        assert!(!r.allows_method("DELETE"));
    }

    #[test]
    fn default_deny_is_catch_all() {
        assert!(Resource::default_deny().is_catch_all());
    }

    #[test]
    fn minimal_yaml_parses() {
        let raw = r"
upstream: http://127.0.0.1:8080
oidc:
  discovery_url: https://idp.example.com/realms/test
  client_id: doorman
resources:
  - url: /api
    methods: [GET, POST]
    roles: [user]
";
        let config: Config = serde_yml::from_str(raw).unwrap();
        assert_eq!(config.oauth_uri, "/oauth");
        assert_eq!(config.resources.len(), 1);
        assert!(config.enable_default_deny);
        assert_eq!(config.cookies.access_name, "kc-access");
        assert_eq!(config.oidc.scopes, vec!["openid", "email", "profile"]);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let raw = r"
upstream: http://127.0.0.1:8080
oidc:
  discovery_url: https://idp.example.com/realms/test
  client_id: doorman
no_such_field: true
";
        assert!(serde_yml::from_str::<Config>(raw).is_err());
    }
}
