//! Authentication: verify the request identity or drive the OIDC
//! authorization-code flow.
//!
//! The candidate access token comes from the (chunk-reassembled) access
//! cookie first, then from an `Authorization: Bearer` header. Expired
//! tokens are refreshed out-of-band when a refresh cookie exists, with
//! the new cookies re-issued atomically on the final response. With no
//! valid identity, browser clients are redirected (302) into the code
//! flow carrying the original URL in the `request_uri` cookie; API
//! clients get a bare 401.

use std::collections::HashMap;

use axum::http::header::{ACCEPT, AUTHORIZATION, LOCATION, SET_COOKIE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::debug;

use crate::config::model::Config;
use crate::oidc::{self, Identity, TokenError};
use crate::server::AppState;
use crate::session::{self, CookieOptions};

/// Why no identity could be established.
#[derive(Debug)]
pub enum AuthFailed {
    NoToken,
    Invalid(String),
}

/// Extract the candidate access token: cookie first, bearer second.
#[must_use]
pub fn extract_token(
    cookies: &HashMap<String, String>,
    headers: &HeaderMap,
    access_cookie: &str,
) -> Option<String> {
    session::assemble_chunked(cookies, access_cookie).or_else(|| bearer_token(headers))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(ToString::to_string)
}

/// Whether the client is a browser that can follow the login redirect.
#[must_use]
pub fn accepts_html(headers: &HeaderMap) -> bool {
    headers
        .get(ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("text/html") || accept.contains("*/*"))
}

/// The redirect_uri registered with the IdP: the configured external
/// URL when set, otherwise reconstructed from the inbound headers.
#[must_use]
pub fn callback_redirect_uri(config: &Config, headers: &HeaderMap) -> String {
    let base = if config.redirection_url.is_empty() {
        let proto = headers
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("http");
        let host = headers
            .get("host")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("localhost");
        format!("{proto}://{host}")
    } else {
        config.redirection_url.trim_end_matches('/').to_string()
    };
    format!("{base}{}/callback", config.oauth_uri)
}

/// Establish an identity for this request. On a successful refresh the
/// returned Set-Cookie values re-issue the session atomically.
pub async fn resolve_identity(
    state: &AppState,
    cookies: &HashMap<String, String>,
    headers: &HeaderMap,
) -> Result<(Identity, Vec<String>), AuthFailed> {
    let config = &state.config;
    let Some(token) = extract_token(cookies, headers, &config.cookies.access_name) else {
        return Err(AuthFailed::NoToken);
    };

    match state.tokens.verify(&token).await {
        Ok(claims) => Ok((Identity::from_claims(token, claims), Vec::new())),
        Err(TokenError::Expired) => {
            let Some(refresh) =
                session::assemble_chunked(cookies, &config.cookies.refresh_name)
            else {
                return Err(AuthFailed::Invalid("token expired".into()));
            };
            refresh_session(state, &refresh).await
        }
        Err(e) => Err(AuthFailed::Invalid(e.to_string())),
    }
}

/// Out-of-band refresh: exchange the refresh token, validate the new
/// access token, and prepare replacement cookies.
async fn refresh_session(
    state: &AppState,
    refresh_token: &str,
) -> Result<(Identity, Vec<String>), AuthFailed> {
    let response = state
        .tokens
        .refresh(refresh_token)
        .await
        .map_err(|e| AuthFailed::Invalid(format!("refresh failed: {e}")))?;

    let claims = state
        .tokens
        .verify(&response.access_token)
        .await
        .map_err(|e| AuthFailed::Invalid(format!("refreshed token invalid: {e}")))?;

    let config = &state.config;
    let mut set_cookies = session::chunked_cookies(
        &config.cookies.access_name,
        &response.access_token,
        &CookieOptions::token(&config.cookies, response.expires_in),
    );
    if let Some(ref rotated) = response.refresh_token {
        set_cookies.extend(session::chunked_cookies(
            &config.cookies.refresh_name,
            rotated,
            &CookieOptions::token(&config.cookies, None),
        ));
    }

    debug!("access token refreshed");
    Ok((
        Identity::from_claims(response.access_token.clone(), claims),
        set_cookies,
    ))
}

/// 302 into the authorization-code flow: persist the original request
/// URI and the state nonce, then point the browser at the IdP.
#[must_use]
pub fn login_redirect(state: &AppState, headers: &HeaderMap, original_uri: &str) -> Response {
    let config = &state.config;
    let nonce = oidc::generate_state();
    let redirect_uri = callback_redirect_uri(config, headers);

    let mut set_cookies = vec![
        session::request_uri_cookie(original_uri, &config.cookies),
        session::state_cookie(&nonce, &config.cookies),
    ];

    let challenge = if config.oidc.enable_pkce {
        let (verifier, challenge) = oidc::generate_pkce();
        set_cookies.push(session::pkce_cookie(&verifier, &config.cookies));
        Some(challenge)
    } else {
        None
    };

    let location = state
        .tokens
        .authorization_url(&redirect_uri, &nonce, challenge.as_deref());

    let mut response = (StatusCode::FOUND, "").into_response();
    if let Ok(value) = location.parse() {
        response.headers_mut().insert(LOCATION, value);
    }
    for cookie in set_cookies {
        if let Ok(value) = cookie.parse() {
            response.headers_mut().append(SET_COOKIE, value);
        }
    }
    response
}

/// The authentication step of the middleware chain. `Err` carries the
/// terminal response (login redirect or 401).
pub async fn authenticate(
    state: &AppState,
    cookies: &HashMap<String, String>,
    headers: &HeaderMap,
    original_uri: &str,
) -> Result<(Identity, Vec<String>), Response> {
    match resolve_identity(state, cookies, headers).await {
        Ok(authenticated) => Ok(authenticated),
        Err(failure) => {
            if let AuthFailed::Invalid(ref reason) = failure {
                debug!(reason = %reason, "authentication failed");
            }
            if accepts_html(headers) {
                Err(login_redirect(state, headers, original_uri))
            } else {
                Err(StatusCode::UNAUTHORIZED.into_response())
            }
        }
    }
}
