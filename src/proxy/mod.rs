//! The request pipeline: per-resource middleware chain and dispatch.
//!
//! Every request that is not handled by the proxy's own `/oauth`
//! endpoints lands in [`pipeline_handler`]: the resource router picks a
//! [`Resource`](crate::config::model::Resource) (or the catch-all
//! policy), the middleware chain for that resource runs in its fixed
//! order, and the forwarding engine executes whatever survives. The
//! chain order is a correctness property, not a style choice — it is
//! modeled as a declarative list ([`chain_for`]) and pinned by tests.
//!
//! Submodules: [`routing`] (prefix matching, default-deny), [`auth`]
//! (OIDC authentication), [`admission`] (role/claim checks), [`csrf`]
//! (double-submit), [`identity`] (header projection), [`headers`]
//! (rewrite rules), [`client`] (upstream client factory), and
//! [`forward`] (the forwarding engine).

pub mod admission;
pub mod auth;
pub mod client;
pub mod csrf;
pub mod forward;
pub mod headers;
pub mod identity;
pub mod routing;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::header::{CONTENT_TYPE, SET_COOKIE};
use axum::http::{HeaderValue, Method, Request, Response, StatusCode};
use axum::response::IntoResponse;

use crate::config::model::Resource;
use crate::oidc::Identity;
use crate::server::AppState;
use crate::session::{self, CookieOptions};
use routing::CatchAll;

/// Response header carrying the structured denial reason on 403s.
pub const DENIED_REASON_HEADER: &str = "x-auth-denied-reason";

/// Per-request record threaded through the chain. Created on entry,
/// mutated only by this request's middleware, dropped with the
/// response.
#[derive(Debug, Default)]
pub struct RequestScope {
    pub correlation_id: String,
    /// Index of the matched resource in the router's table.
    pub resource: Option<usize>,
    pub identity: Option<Identity>,
    pub access_denied: bool,
    pub denied_reason: Option<&'static str>,
    /// Set-Cookie values attached to the final response (token refresh,
    /// login redirect bookkeeping).
    pub pending_cookies: Vec<String>,
    /// The CSRF steps of the chain were reached.
    pub reached_csrf: bool,
    /// Protection disabled for this resource or globally.
    pub csrf_skip: bool,
    /// The echo step was reached; copy the token into the response.
    pub csrf_echo: bool,
}

impl RequestScope {
    #[must_use]
    pub fn new(correlation_id: String) -> Self {
        Self {
            correlation_id,
            ..Self::default()
        }
    }

    fn deny(&mut self, reason: Option<&'static str>) {
        self.access_denied = true;
        self.denied_reason = reason;
    }
}

/// One step of the per-resource middleware chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainStep {
    Authenticate,
    Admit,
    IdentityHeaders,
    CsrfSkipResource,
    CsrfProtect,
    CsrfEchoHeader,
}

static FULL_CHAIN: [ChainStep; 6] = [
    ChainStep::Authenticate,
    ChainStep::Admit,
    ChainStep::IdentityHeaders,
    ChainStep::CsrfSkipResource,
    ChainStep::CsrfProtect,
    ChainStep::CsrfEchoHeader,
];

/// The middleware composition for a resource. White-listed resources
/// are proxied with no checks at all; everything else gets the full
/// chain in its fixed order, with the forwarding engine downstream.
#[must_use]
pub fn chain_for(resource: &Resource) -> &'static [ChainStep] {
    if resource.white_listed {
        &[]
    } else {
        &FULL_CHAIN
    }
}

/// Build a terminal error response with a structured JSON body.
#[must_use]
pub fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    let body = serde_json::json!({ "error": message }).to_string();
    match Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body))
    {
        Ok(response) => response,
        Err(_) => status.into_response(),
    }
}

/// The Axum fallback receiving every request the `/oauth` router does
/// not own.
pub async fn pipeline_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Response<Body> {
    let correlation_id = req
        .headers()
        .get("x-correlation-id")
        .and_then(|v| v.to_str().ok())
        .map_or_else(|| uuid::Uuid::new_v4().to_string(), String::from);

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let original_uri = req
        .uri()
        .path_and_query()
        .map_or_else(|| path.clone(), |pq| pq.as_str().to_string());
    let client_ip = headers::real_ip(req.headers(), addr);
    let cookies = session::parse_cookies(req.headers());
    let mut scope = RequestScope::new(correlation_id);

    tracing::debug!(
        correlation_id = %scope.correlation_id,
        method = %method,
        path = %path,
        "request received"
    );

    let response = match state.router.match_path(&path) {
        Some(idx) => {
            run_resource(&state, &mut scope, &cookies, req, idx, &original_uri, &client_ip).await
        }
        None => match state.router.catch_all() {
            CatchAll::Resource(idx) => {
                run_resource(&state, &mut scope, &cookies, req, idx, &original_uri, &client_ip)
                    .await
            }
            CatchAll::NotFound => {
                scope.deny(None);
                StatusCode::NOT_FOUND.into_response()
            }
            CatchAll::AuthenticatedNotFound => {
                match auth::authenticate(&state, &cookies, req.headers(), &original_uri).await {
                    Ok((identity, set_cookies)) => {
                        scope.identity = Some(identity);
                        scope.pending_cookies.extend(set_cookies);
                        StatusCode::NOT_FOUND.into_response()
                    }
                    Err(denial) => {
                        scope.deny(None);
                        denial
                    }
                }
            }
            CatchAll::Forward => forward::execute(&state, &scope, req, &client_ip).await,
        },
    };

    finalize(response, &state, &scope, &cookies, &method)
}

/// Run the middleware chain for one matched resource, then forward.
async fn run_resource(
    state: &Arc<AppState>,
    scope: &mut RequestScope,
    cookies: &HashMap<String, String>,
    mut req: Request<Body>,
    idx: usize,
    original_uri: &str,
    client_ip: &str,
) -> Response<Body> {
    let config = &state.config;
    let resource = state.router.resource(idx);
    scope.resource = Some(idx);

    // Method dispatch: anything outside the allow-list terminates here.
    if !resource.allows_method(req.method().as_str()) {
        scope.deny(None);
        return error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    }

    let method = req.method().clone();

    for step in chain_for(resource) {
        match step {
            ChainStep::Authenticate => {
                match auth::authenticate(state, cookies, req.headers(), original_uri).await {
                    Ok((identity, set_cookies)) => {
                        scope.identity = Some(identity);
                        scope.pending_cookies.extend(set_cookies);
                    }
                    Err(denial) => {
                        scope.deny(None);
                        return denial;
                    }
                }
            }
            ChainStep::Admit => {
                let Some(identity) = scope.identity.as_ref() else {
                    scope.deny(None);
                    return StatusCode::UNAUTHORIZED.into_response();
                };
                if let Err(reason) = admission::admit(
                    identity,
                    resource,
                    &state.global_matchers,
                    &state.resource_matchers[idx],
                ) {
                    tracing::debug!(
                        correlation_id = %scope.correlation_id,
                        subject = %identity.subject,
                        resource = %resource.url,
                        reason = reason,
                        "admission denied"
                    );
                    scope.deny(Some(reason));
                    let mut response = error_response(StatusCode::FORBIDDEN, "access denied");
                    if let Ok(value) = HeaderValue::from_str(reason) {
                        response.headers_mut().insert(DENIED_REASON_HEADER, value);
                    }
                    return response;
                }
            }
            ChainStep::IdentityHeaders => {
                if let Some(identity) = scope.identity.as_ref() {
                    identity::inject(
                        req.headers_mut(),
                        identity,
                        &config.add_claims,
                        config.enable_token_header,
                    );
                }
            }
            ChainStep::CsrfSkipResource => {
                scope.reached_csrf = true;
                if !config.csrf.enabled || !resource.enable_csrf {
                    scope.csrf_skip = true;
                }
            }
            ChainStep::CsrfProtect => {
                if !scope.csrf_skip
                    && !csrf::is_safe_method(&method)
                    && !csrf::check(cookies, req.headers(), &config.csrf)
                {
                    scope.deny(Some("csrf_mismatch"));
                    return error_response(StatusCode::FORBIDDEN, "csrf token mismatch");
                }
            }
            ChainStep::CsrfEchoHeader => {
                scope.csrf_echo = true;
            }
        }
    }

    forward::execute(state, scope, req, client_ip).await
}

/// Response-phase work: CSRF cookie issue + header echo, deferred
/// Set-Cookie values, operator response headers, correlation id.
fn finalize(
    mut response: Response<Body>,
    state: &AppState,
    scope: &RequestScope,
    cookies: &HashMap<String, String>,
    method: &Method,
) -> Response<Body> {
    let config = &state.config;

    if scope.reached_csrf && !scope.csrf_skip {
        let existing = cookies.get(&config.csrf.cookie_name).cloned();
        let token = match existing {
            Some(token) => Some(token),
            None if csrf::is_safe_method(method) => {
                let token = csrf::mint_token();
                let cookie = session::build_cookie(
                    &config.csrf.cookie_name,
                    &token,
                    &CookieOptions::csrf(&config.cookies),
                );
                if let Ok(value) = cookie.parse() {
                    response.headers_mut().append(SET_COOKIE, value);
                }
                Some(token)
            }
            None => None,
        };

        if scope.csrf_echo {
            if let Some(token) = token {
                if let (Ok(name), Ok(value)) = (
                    config.csrf.header_name.parse::<axum::http::HeaderName>(),
                    HeaderValue::from_str(&token),
                ) {
                    response.headers_mut().insert(name, value);
                }
            }
        }
    }

    for cookie in &scope.pending_cookies {
        if let Ok(value) = cookie.parse() {
            response.headers_mut().append(SET_COOKIE, value);
        }
    }

    for (key, value) in &config.response_headers {
        match (
            key.parse::<axum::http::HeaderName>(),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().insert(name, value);
            }
            _ => {
                tracing::warn!(header = %key, "invalid response header in config, skipping");
            }
        }
    }

    if let Ok(value) = HeaderValue::from_str(&scope.correlation_id) {
        response.headers_mut().insert("x-correlation-id", value);
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(white_listed: bool) -> Resource {
        let mut r = Resource::default_deny();
        r.url = "/api".into();
        r.white_listed = white_listed;
        r
    }

    #[test]
    fn chain_order_is_pinned() {
        // The composition order is a correctness property of the
        // pipeline; a reorder here is a behavioral change.
        assert_eq!(
            chain_for(&resource(false)),
            &[
                ChainStep::Authenticate,
                ChainStep::Admit,
                ChainStep::IdentityHeaders,
                ChainStep::CsrfSkipResource,
                ChainStep::CsrfProtect,
                ChainStep::CsrfEchoHeader,
            ]
        );
    }

    #[test]
    fn whitelisted_resources_run_no_middleware() {
        assert!(chain_for(&resource(true)).is_empty());
    }

    #[test]
    fn error_response_is_structured() {
        let response = error_response(StatusCode::BAD_GATEWAY, "upstream unreachable");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }

    #[test]
    fn scope_denial_records_reason() {
        let mut scope = RequestScope::new("id".into());
        scope.deny(Some(admission::REASON_CLAIM));
        assert!(scope.access_denied);
        assert_eq!(scope.denied_reason, Some(admission::REASON_CLAIM));
    }
}
