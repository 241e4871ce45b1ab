//! Double-submit CSRF protection.
//!
//! A random token lives in a JS-readable cookie; state-changing
//! requests must echo it back in the configured header. The pieces are
//! composed by the pipeline: Configure mints the cookie on safe
//! methods, Protect enforces equality on unsafe ones, and EchoHeader
//! copies the current token into the response so SPAs can rotate.
//! The `/oauth` endpoints and resources with `enable_csrf: false` skip
//! Protect but still participate in Configure/EchoHeader.

use std::collections::HashMap;

use axum::http::{HeaderMap, Method};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::Rng;

use crate::config::model::CsrfConfig;

/// Methods that never mutate state and therefore skip the check.
#[must_use]
pub fn is_safe_method(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

/// Mint a fresh random token.
#[must_use]
pub fn mint_token() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// The double-submit comparison: the cookie value must equal the header
/// value. Absence of either fails closed.
#[must_use]
pub fn check(
    cookies: &HashMap<String, String>,
    headers: &HeaderMap,
    config: &CsrfConfig,
) -> bool {
    let Some(cookie_value) = cookies.get(&config.cookie_name) else {
        return false;
    };
    let Some(header_value) = headers
        .get(config.header_name.as_str())
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    !cookie_value.is_empty() && cookie_value == header_value
}
