//! Header rewriting for upstream requests.
//!
//! Implements the fixed rewrite order the forwarding engine applies:
//! `X-Forwarded-*` enrichment, Origin suppression when CORS is mediated
//! at the proxy, operator-configured static headers, CSRF/session cookie
//! scrubbing, hop-by-hop stripping, and the outbound `Host` decision.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::LazyLock;

use axum::http::header::{COOKIE, HOST, ORIGIN};
use axum::http::{HeaderMap, HeaderName, HeaderValue};

use crate::config::model::Config;
use crate::session;

static HOP_BY_HOP: LazyLock<Vec<HeaderName>> = LazyLock::new(|| {
    [
        "connection",
        "keep-alive",
        "transfer-encoding",
        "te",
        "trailer",
        "upgrade",
        "proxy-authorization",
        "proxy-authenticate",
    ]
    .iter()
    .filter_map(|name| name.parse::<HeaderName>().ok())
    .collect()
});

/// The client IP used for `X-Forwarded-For`: an existing forwarded
/// chain takes precedence, then `X-Real-IP`, then the peer address.
#[must_use]
pub fn real_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    if let Some(chain) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = chain.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if !real.is_empty() {
            return real.to_string();
        }
    }
    peer.ip().to_string()
}

/// Apply the proxy forwarding headers in their fixed order:
/// append the client to `X-Forwarded-For`, record the inbound host and
/// protocol, suppress `Origin` when the proxy mediates CORS, and lay
/// operator-configured static headers on top (overwrite semantics).
pub fn apply_forwarding(
    headers: &mut HeaderMap,
    client_ip: &str,
    inbound_host: Option<&str>,
    upstream_scheme: &str,
    cors_enabled: bool,
    custom: &HashMap<String, String>,
) {
    let chain = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map_or_else(
            || client_ip.to_string(),
            |existing| format!("{existing}, {client_ip}"),
        );
    if let Ok(value) = HeaderValue::from_str(&chain) {
        headers.insert("x-forwarded-for", value);
    }

    if let Some(host) = inbound_host {
        if let Ok(value) = HeaderValue::from_str(host) {
            headers.insert("x-forwarded-host", value);
        }
    }

    // Preserve an inbound X-Forwarded-Proto; otherwise the upstream
    // scheme is what the client effectively spoke to reach it.
    if !headers.contains_key("x-forwarded-proto") {
        if let Ok(value) = HeaderValue::from_str(upstream_scheme) {
            headers.insert("x-forwarded-proto", value);
        }
    }

    if cors_enabled {
        // CORS was already evaluated here; do not let the upstream
        // re-evaluate it.
        headers.remove(ORIGIN);
    }

    for (key, value) in custom {
        match (key.parse::<HeaderName>(), HeaderValue::from_str(value)) {
            (Ok(name), Ok(val)) => {
                headers.insert(name, val);
            }
            _ => {
                tracing::warn!(header = %key, "invalid header name or value in headers config, skipping");
            }
        }
    }
}

/// Remove the proxy's own cookies (and their chunks) from the Cookie
/// header before the request leaves for the upstream.
pub fn scrub_proxy_cookies(headers: &mut HeaderMap, names: &[&str]) {
    let merged: Vec<String> = headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok().map(ToString::to_string))
        .collect();
    if merged.is_empty() {
        return;
    }

    headers.remove(COOKIE);
    let kept: Vec<String> = merged
        .iter()
        .filter_map(|raw| session::filter_cookie_header(raw, names))
        .collect();
    if !kept.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&kept.join("; ")) {
            headers.insert(COOKIE, value);
        }
    }
}

/// Decide the outbound Host: an operator-configured static `Host`
/// wins, else the upstream authority unless `preserve_host` keeps the
/// inbound one.
pub fn set_outbound_host(
    headers: &mut HeaderMap,
    config: &Config,
    inbound_host: Option<&str>,
    upstream_authority: &str,
) {
    let host = if let Some(explicit) = config.headers.get("Host").or_else(|| config.headers.get("host")) {
        explicit.clone()
    } else if config.preserve_host {
        inbound_host.unwrap_or(upstream_authority).to_string()
    } else {
        upstream_authority.to_string()
    };

    if let Ok(value) = HeaderValue::from_str(&host) {
        headers.insert(HOST, value);
    }
}

/// Strip hop-by-hop headers. Not applied on the protocol-upgrade path,
/// which must carry `Connection` and `Upgrade` through verbatim.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "10.0.0.9:41000".parse().unwrap()
    }

    fn base_config() -> Config {
        serde_yml::from_str(
            r"
upstream: http://127.0.0.1:8080
oidc:
  discovery_url: https://idp.example.com/realms/test
  client_id: doorman
",
        )
        .unwrap()
    }

    #[test]
    fn real_ip_prefers_forwarded_chain() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "1.2.3.4, 5.6.7.8".parse().unwrap());
        assert_eq!(real_ip(&headers, peer()), "1.2.3.4");
    }

    #[test]
    fn real_ip_falls_back_to_peer() {
        assert_eq!(real_ip(&HeaderMap::new(), peer()), "10.0.0.9");
    }

    #[test]
    fn forwarded_for_appends_client_last() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "1.2.3.4".parse().unwrap());
        apply_forwarding(
            &mut headers,
            "10.0.0.9",
            Some("gate.example.com"),
            "https",
            false,
            &HashMap::new(),
        );
        assert_eq!(
            headers.get("x-forwarded-for").unwrap(),
            "1.2.3.4, 10.0.0.9"
        );
        assert_eq!(
            headers.get("x-forwarded-host").unwrap(),
            "gate.example.com"
        );
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "https");
    }

    #[test]
    fn inbound_proto_is_preserved() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-proto", "https".parse().unwrap());
        apply_forwarding(&mut headers, "1.1.1.1", None, "http", false, &HashMap::new());
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "https");
    }

    #[test]
    fn origin_is_stripped_when_cors_mediated() {
        let mut headers = HeaderMap::new();
        headers.insert(ORIGIN, "https://spa.example.com".parse().unwrap());
        apply_forwarding(&mut headers, "1.1.1.1", None, "http", true, &HashMap::new());
        assert!(headers.get(ORIGIN).is_none());
    }

    #[test]
    fn origin_survives_without_cors() {
        let mut headers = HeaderMap::new();
        headers.insert(ORIGIN, "https://spa.example.com".parse().unwrap());
        apply_forwarding(&mut headers, "1.1.1.1", None, "http", false, &HashMap::new());
        assert!(headers.get(ORIGIN).is_some());
    }

    #[test]
    fn custom_headers_overwrite() {
        let mut headers = HeaderMap::new();
        headers.insert("x-tier", "bronze".parse().unwrap());
        let mut custom = HashMap::new();
        custom.insert("X-Tier".to_string(), "gold".to_string());
        apply_forwarding(&mut headers, "1.1.1.1", None, "http", false, &custom);
        assert_eq!(headers.get("x-tier").unwrap(), "gold");
    }

    #[test]
    fn proxy_cookies_are_scrubbed() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, "kc-csrf=t; app=1; request_uri=abc".parse().unwrap());
        scrub_proxy_cookies(&mut headers, &["kc-csrf", "request_uri"]);
        assert_eq!(headers.get(COOKIE).unwrap(), "app=1");
    }

    #[test]
    fn cookie_header_removed_when_nothing_left() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, "kc-csrf=t".parse().unwrap());
        scrub_proxy_cookies(&mut headers, &["kc-csrf"]);
        assert!(headers.get(COOKIE).is_none());
    }

    #[test]
    fn host_defaults_to_upstream() {
        let mut headers = HeaderMap::new();
        set_outbound_host(&mut headers, &base_config(), Some("gate.example.com"), "app:8080");
        assert_eq!(headers.get(HOST).unwrap(), "app:8080");
    }

    #[test]
    fn preserve_host_keeps_inbound() {
        let mut config = base_config();
        config.preserve_host = true;
        let mut headers = HeaderMap::new();
        set_outbound_host(&mut headers, &config, Some("gate.example.com"), "app:8080");
        assert_eq!(headers.get(HOST).unwrap(), "gate.example.com");
    }

    #[test]
    fn explicit_host_header_wins() {
        let mut config = base_config();
        config
            .headers
            .insert("Host".to_string(), "internal.example.com".to_string());
        let mut headers = HeaderMap::new();
        set_outbound_host(&mut headers, &config, Some("gate.example.com"), "app:8080");
        assert_eq!(headers.get(HOST).unwrap(), "internal.example.com");
    }

    #[test]
    fn hop_by_hop_is_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", "keep-alive".parse().unwrap());
        headers.insert("upgrade", "websocket".parse().unwrap());
        headers.insert("content-type", "application/json".parse().unwrap());
        strip_hop_by_hop(&mut headers);
        assert!(headers.get("connection").is_none());
        assert!(headers.get("upgrade").is_none());
        assert!(headers.get("content-type").is_some());
    }
}
