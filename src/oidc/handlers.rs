//! The proxy-owned endpoints, mounted under the configurable oauth
//! base (default `/oauth`): authorize, callback, logout, token,
//! expired, the optional password-grant login, and health.
//!
//! These routes participate in CSRF cookie issuance and header echo but
//! deliberately skip the protect check — the IdP round-trip must work
//! without a pre-existing token.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::header::{LOCATION, SET_COOKIE};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::proxy::{auth, csrf, error_response};
use crate::server::AppState;
use crate::session::{self, CookieOptions};

pub fn oauth_router(state: &Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/authorize", get(authorize_handler))
        .route("/callback", get(callback_handler))
        .route("/logout", get(logout_handler))
        .route("/token", get(token_handler))
        .route("/expired", get(expired_handler))
        .route("/login", post(login_handler))
        .route("/health", get(health_handler))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            oauth_csrf_layer,
        ))
}

/// CSRF Configure + EchoHeader for the oauth endpoints, without
/// Protect.
async fn oauth_csrf_layer(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let config = &state.config;
    if !config.csrf.enabled {
        return next.run(req).await;
    }

    let method = req.method().clone();
    let cookies = session::parse_cookies(req.headers());
    let mut response = next.run(req).await;

    let token = match cookies.get(&config.csrf.cookie_name) {
        Some(token) => Some(token.clone()),
        None if csrf::is_safe_method(&method) => {
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

    if let Some(token) = token {
        if let (Ok(name), Ok(value)) = (
            config.csrf.header_name.parse::<axum::http::HeaderName>(),
            token.parse(),
        ) {
            response.headers_mut().insert(name, value);
        }
    }

    response
}

#[derive(Deserialize)]
pub struct AuthorizeParams {
    redirect: Option<String>,
}

/// Start the authorization-code flow by hand. The redirect target must
/// be a local path; anything else falls back to the root.
async fn authorize_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<AuthorizeParams>,
) -> Response {
    let target = params
        .redirect
        .filter(|r| r.starts_with('/'))
        .unwrap_or_else(|| "/".to_string());
    auth::login_redirect(&state, &headers, &target)
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Complete the code flow: verify the state nonce against its cookie,
/// exchange the code, validate the token, issue the session cookies,
/// and land on the original URL.
async fn callback_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<CallbackParams>,
) -> Response {
    let config = &state.config;
    let cookies = session::parse_cookies(&headers);

    if let Some(ref error) = params.error {
        let description = params.error_description.as_deref().unwrap_or_default();
        warn!(error = %error, description = %description, "authorization was denied by the provider");
        return error_response(StatusCode::FORBIDDEN, &format!("authorization failed: {error}"));
    }

    let expected_state = cookies.get(session::STATE_COOKIE);
    if expected_state.is_none() || params.state.as_deref() != expected_state.map(String::as_str) {
        warn!("state cookie does not match the callback state parameter");
        return error_response(StatusCode::FORBIDDEN, "state mismatch");
    }

    let Some(ref code) = params.code else {
        return error_response(StatusCode::BAD_REQUEST, "no authorization code received");
    };

    let redirect_uri = auth::callback_redirect_uri(config, &headers);
    let verifier = if config.oidc.enable_pkce {
        cookies.get(session::PKCE_COOKIE).map(String::as_str)
    } else {
        None
    };

    let tokens = match state.tokens.exchange_code(code, &redirect_uri, verifier).await {
        Ok(tokens) => tokens,
        Err(e) => {
            warn!(error = %e, "code exchange failed");
            return error_response(StatusCode::FORBIDDEN, "code exchange failed");
        }
    };

    if let Err(e) = state.tokens.verify(&tokens.access_token).await {
        warn!(error = %e, "token issued by the provider failed validation");
        return error_response(StatusCode::FORBIDDEN, "invalid token");
    }

    let mut set_cookies = session::chunked_cookies(
        &config.cookies.access_name,
        &tokens.access_token,
        &CookieOptions::token(&config.cookies, tokens.expires_in),
    );
    if let Some(ref refresh) = tokens.refresh_token {
        set_cookies.extend(session::chunked_cookies(
            &config.cookies.refresh_name,
            refresh,
            &CookieOptions::token(&config.cookies, None),
        ));
    }
    // The round-trip cookies are spent.
    set_cookies.push(session::clear_cookie(session::REQUEST_URI_COOKIE, &config.cookies));
    set_cookies.push(session::clear_cookie(session::STATE_COOKIE, &config.cookies));
    if config.oidc.enable_pkce {
        set_cookies.push(session::clear_cookie(session::PKCE_COOKIE, &config.cookies));
    }

    let target = session::decode_request_uri(&cookies).unwrap_or_else(|| "/".to_string());
    debug!(target = %target, "authorization complete");
    found(&target, set_cookies)
}

#[derive(Deserialize)]
pub struct LogoutParams {
    redirect: Option<String>,
}

/// Clear the session and, when the provider advertises an end-session
/// endpoint, send the browser there.
async fn logout_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<LogoutParams>,
) -> Response {
    let config = &state.config;
    let cookies = session::parse_cookies(&headers);

    if auth::resolve_identity(&state, &cookies, &headers).await.is_err() {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let set_cookies = session::clear_session_cookies(&config.cookies, &cookies);

    let post_logout = params
        .redirect
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| {
            if config.redirection_url.is_empty() {
                "/".to_string()
            } else {
                config.redirection_url.clone()
            }
        });

    match state.tokens.end_session_url(&post_logout) {
        Some(end_session) => found(&end_session, set_cookies),
        None => {
            let mut response = (StatusCode::OK, "OK").into_response();
            append_cookies(&mut response, set_cookies);
            response
        }
    }
}

/// Return the current access token claims.
async fn token_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let cookies = session::parse_cookies(&headers);
    match auth::resolve_identity(&state, &cookies, &headers).await {
        Ok((identity, _)) => Json(identity.claims).into_response(),
        Err(_) => StatusCode::UNAUTHORIZED.into_response(),
    }
}

/// Probe endpoint: 200 while the access token is still valid.
async fn expired_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let cookies = session::parse_cookies(&headers);
    let Some(token) = auth::extract_token(&cookies, &headers, &state.config.cookies.access_name)
    else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    match state.tokens.verify(&token).await {
        Ok(_) => (StatusCode::OK, "OK").into_response(),
        Err(_) => StatusCode::UNAUTHORIZED.into_response(),
    }
}

#[derive(Deserialize)]
pub struct LoginRequest {
    username: String,
    password: String,
}

/// Resource-owner password grant. Disabled unless
/// `enable_login_handler` is set; browsers should use the code flow.
async fn login_handler(
    State(state): State<Arc<AppState>>,
    Form(request): Form<LoginRequest>,
) -> Response {
    let config = &state.config;
    if !config.enable_login_handler {
        return StatusCode::NOT_FOUND.into_response();
    }

    let tokens = match state
        .tokens
        .password_grant(&request.username, &request.password)
        .await
    {
        Ok(tokens) => tokens,
        Err(e) => {
            debug!(error = %e, "password grant rejected");
            return error_response(StatusCode::UNAUTHORIZED, "invalid credentials");
        }
    };

    let mut set_cookies = session::chunked_cookies(
        &config.cookies.access_name,
        &tokens.access_token,
        &CookieOptions::token(&config.cookies, tokens.expires_in),
    );
    if let Some(ref refresh) = tokens.refresh_token {
        set_cookies.extend(session::chunked_cookies(
            &config.cookies.refresh_name,
            refresh,
            &CookieOptions::token(&config.cookies, None),
        ));
    }

    let mut response = Json(serde_json::json!({
        "access_token": tokens.access_token,
        "refresh_token": tokens.refresh_token,
        "expires_in": tokens.expires_in,
    }))
    .into_response();
    append_cookies(&mut response, set_cookies);
    response
}

#[derive(Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub revision: String,
    pub build_time: String,
    pub uptime_seconds: u64,
    pub config_version: String,
    pub resources: usize,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        revision: env!("DOORMAN_GIT_SHORT").to_string(),
        build_time: env!("DOORMAN_BUILD_TIME").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        config_version: state
            .config_version
            .get(..8)
            .unwrap_or(&state.config_version)
            .to_string(),
        resources: state.router.resources().len(),
    })
}

/// A 302 with deferred Set-Cookie values attached.
fn found(location: &str, set_cookies: Vec<String>) -> Response {
    let mut response = (StatusCode::FOUND, "").into_response();
    if let Ok(value) = location.parse() {
        response.headers_mut().insert(LOCATION, value);
    }
    append_cookies(&mut response, set_cookies);
    response
}

fn append_cookies(response: &mut Response, set_cookies: Vec<String>) {
    for cookie in set_cookies {
        if let Ok(value) = cookie.parse() {
            response.headers_mut().append(SET_COOKIE, value);
        }
    }
}
