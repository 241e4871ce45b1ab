//! Cookie ownership: naming, attributes, and chunked reassembly.
//!
//! Doorman owns a small set of cookies on the wire: the access and
//! refresh token cookies (chunked when they outgrow what browsers
//! accept), the `request_uri` cookie that carries the original URL
//! across the OIDC round-trip, the `OAuth_Token_State` nonce cookie,
//! and the CSRF cookie. This module centralizes how those cookies are
//! parsed, built, split, and cleared so the middleware chain and the
//! `/oauth` handlers agree on the wire format.

use std::collections::HashMap;

use axum::http::header::COOKIE;
use axum::http::HeaderMap;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;

use crate::config::model::CookieConfig;

/// Carries the original request URL across the authorization round-trip.
pub const REQUEST_URI_COOKIE: &str = "request_uri";

/// Holds the state nonce between the redirect and the callback.
pub const STATE_COOKIE: &str = "OAuth_Token_State";

/// Holds the PKCE code verifier between the redirect and the callback.
pub const PKCE_COOKIE: &str = "OAuth_PKCE";

/// Browsers cap individual cookies near 4 KB including name and
/// attributes; chunk payloads stay comfortably below that.
pub const MAX_COOKIE_CHUNK: usize = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    Lax,
    Strict,
    None,
}

impl SameSite {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Lax => "Lax",
            Self::Strict => "Strict",
            Self::None => "None",
        }
    }
}

/// Attributes applied when building a single Set-Cookie value.
#[derive(Debug, Clone)]
pub struct CookieOptions<'a> {
    pub domain: &'a str,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: SameSite,
    /// Seconds until expiry; `None` produces a browser-session cookie.
    pub max_age: Option<u64>,
}

impl<'a> CookieOptions<'a> {
    /// Token cookie attributes per config: HttpOnly, SameSite=Lax.
    #[must_use]
    pub fn token(config: &'a CookieConfig, max_age: Option<u64>) -> Self {
        Self {
            domain: &config.domain,
            secure: config.secure,
            http_only: true,
            same_site: SameSite::Lax,
            max_age: if config.session_only { None } else { max_age },
        }
    }

    /// Short-lived flow cookie (request_uri, state): HttpOnly, Lax.
    #[must_use]
    pub fn flow(config: &'a CookieConfig) -> Self {
        Self {
            domain: &config.domain,
            secure: config.secure,
            http_only: true,
            same_site: SameSite::Lax,
            max_age: None,
        }
    }

    /// CSRF cookie: readable from JS so SPAs can echo it back.
    #[must_use]
    pub fn csrf(config: &'a CookieConfig) -> Self {
        Self {
            domain: &config.domain,
            secure: config.secure,
            http_only: false,
            same_site: SameSite::Lax,
            max_age: None,
        }
    }
}

/// Collect all request cookies into a name -> value map.
#[must_use]
pub fn parse_cookies(headers: &HeaderMap) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for value in headers.get_all(COOKIE) {
        let Ok(raw) = value.to_str() else { continue };
        for pair in raw.split(';') {
            let pair = pair.trim();
            if let Some((name, value)) = pair.split_once('=') {
                out.insert(name.to_string(), value.to_string());
            }
        }
    }
    out
}

/// Reassemble a possibly chunked cookie: `name`, `name.1`, `name.2`, ...
///
/// Chunks stop at the first missing suffix. A missing base chunk means
/// no cookie at all; reassembly is deliberately tolerant so a dropped
/// chunk degrades to "not logged in" rather than a hard failure.
#[must_use]
pub fn assemble_chunked(cookies: &HashMap<String, String>, name: &str) -> Option<String> {
    let mut value = cookies.get(name)?.clone();
    let mut index = 1;
    while let Some(chunk) = cookies.get(&format!("{name}.{index}")) {
        value.push_str(chunk);
        index += 1;
    }
    Some(value)
}

/// Build the Set-Cookie values for a (possibly chunked) cookie.
#[must_use]
pub fn chunked_cookies(name: &str, value: &str, options: &CookieOptions<'_>) -> Vec<String> {
    if value.len() <= MAX_COOKIE_CHUNK {
        return vec![build_cookie(name, value, options)];
    }

    let mut out = Vec::new();
    for (i, chunk) in split_at_boundaries(value, MAX_COOKIE_CHUNK).into_iter().enumerate() {
        if i == 0 {
            out.push(build_cookie(name, chunk, options));
        } else {
            out.push(build_cookie(&format!("{name}.{i}"), chunk, options));
        }
    }
    out
}

fn split_at_boundaries(value: &str, max: usize) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut rest = value;
    while rest.len() > max {
        // Token material is ASCII, but stay correct for any UTF-8 input.
        let mut cut = max;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        let (head, tail) = rest.split_at(cut);
        chunks.push(head);
        rest = tail;
    }
    chunks.push(rest);
    chunks
}

/// Format a single Set-Cookie header value.
#[must_use]
pub fn build_cookie(name: &str, value: &str, options: &CookieOptions<'_>) -> String {
    let mut cookie = format!("{name}={value}; Path=/");
    if !options.domain.is_empty() {
        cookie.push_str("; Domain=");
        cookie.push_str(options.domain);
    }
    if let Some(max_age) = options.max_age {
        cookie.push_str("; Max-Age=");
        cookie.push_str(&max_age.to_string());
    }
    if options.http_only {
        cookie.push_str("; HttpOnly");
    }
    if options.secure {
        cookie.push_str("; Secure");
    }
    cookie.push_str("; SameSite=");
    cookie.push_str(options.same_site.as_str());
    cookie
}

/// An expired Set-Cookie value that removes the cookie.
#[must_use]
pub fn clear_cookie(name: &str, config: &CookieConfig) -> String {
    let mut cookie = format!("{name}=; Path=/; Max-Age=0");
    if !config.domain.is_empty() {
        cookie.push_str("; Domain=");
        cookie.push_str(&config.domain);
    }
    cookie
}

/// Set-Cookie values clearing the whole session: both token cookies and
/// any chunk suffix observed in the request.
#[must_use]
pub fn clear_session_cookies(
    config: &CookieConfig,
    request_cookies: &HashMap<String, String>,
) -> Vec<String> {
    let mut out = Vec::new();
    for base in [&config.access_name, &config.refresh_name] {
        out.push(clear_cookie(base, config));
        let mut index = 1;
        while request_cookies.contains_key(&format!("{base}.{index}")) {
            out.push(clear_cookie(&format!("{base}.{index}"), config));
            index += 1;
        }
    }
    out
}

/// Base64-encode and store the original request URI for the round-trip.
#[must_use]
pub fn request_uri_cookie(uri: &str, config: &CookieConfig) -> String {
    build_cookie(
        REQUEST_URI_COOKIE,
        &URL_SAFE_NO_PAD.encode(uri.as_bytes()),
        &CookieOptions::flow(config),
    )
}

/// Decode the stored request URI, if present and well-formed.
#[must_use]
pub fn decode_request_uri(cookies: &HashMap<String, String>) -> Option<String> {
    let raw = cookies.get(REQUEST_URI_COOKIE)?;
    let bytes = URL_SAFE_NO_PAD.decode(raw.as_bytes()).ok()?;
    String::from_utf8(bytes).ok()
}

#[must_use]
pub fn state_cookie(nonce: &str, config: &CookieConfig) -> String {
    build_cookie(STATE_COOKIE, nonce, &CookieOptions::flow(config))
}

#[must_use]
pub fn pkce_cookie(verifier: &str, config: &CookieConfig) -> String {
    build_cookie(PKCE_COOKIE, verifier, &CookieOptions::flow(config))
}

/// Rebuild a Cookie header with the given base names (and their chunk
/// suffixes) removed. Returns `None` when nothing remains.
#[must_use]
pub fn filter_cookie_header(raw: &str, drop: &[&str]) -> Option<String> {
    let kept: Vec<&str> = raw
        .split(';')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .filter(|pair| {
            let name = pair.split_once('=').map_or(*pair, |(n, _)| n);
            !drop.iter().any(|d| {
                name == *d
                    || name
                        .strip_prefix(*d)
                        .and_then(|rest| rest.strip_prefix('.'))
                        .is_some_and(|n| n.bytes().all(|b| b.is_ascii_digit()))
            })
        })
        .collect();

    if kept.is_empty() {
        None
    } else {
        Some(kept.join("; "))
    }
}
