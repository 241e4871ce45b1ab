//! The forwarding engine: rewrite the surviving request and drive it to
//! the upstream.
//!
//! Requests arrive here only after the middleware chain left the scope
//! without a denial. The inbound request is rewritten in a fixed order
//! (forwarding headers, CORS origin suppression, operator headers,
//! cookie scrubbing, host/scheme substitution, base-path stripping,
//! upstream path join, Host selection) and then either executed through
//! the pooled client or, for protocol upgrades, tunneled: the inbound
//! connection is taken over, the upstream dialed, the rewritten head
//! replayed, and both byte streams spliced until either side closes.

use axum::body::Body;
use axum::http::header::HOST;
use axum::http::request::Parts;
use axum::http::{Request, Response, StatusCode};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tracing::{debug, error, warn};

use super::client::{Upstream, UpstreamFailure};
use super::{error_response, headers, RequestScope};
use crate::server::AppState;
use crate::session;

/// A request is upgraded when `Connection` lists `upgrade` and an
/// `Upgrade` header is present.
#[must_use]
pub fn is_upgrade(req_headers: &axum::http::HeaderMap) -> bool {
    let wants_upgrade = req_headers
        .get("connection")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| {
            v.split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        });
    wants_upgrade && req_headers.contains_key("upgrade")
}

/// Rewrite and execute. The scope has already been checked for denial
/// by the pipeline; this function never consults the policy again.
pub async fn execute(
    state: &AppState,
    scope: &RequestScope,
    req: Request<Body>,
    client_ip: &str,
) -> Response<Body> {
    let config = &state.config;
    let upstream = scope
        .resource
        .and_then(|idx| state.resource_upstreams[idx].as_ref())
        .unwrap_or(&state.default_upstream);

    let inbound_host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string);
    let upgrade = is_upgrade(req.headers());

    let (mut parts, body) = req.into_parts();

    let strip_base_path = scope
        .resource
        .map(|idx| state.router.resource(idx).strip_base_path.as_str())
        .unwrap_or("");
    let path_and_query = rewrite_path(
        parts.uri.path(),
        parts.uri.query(),
        strip_base_path,
        &upstream.base_path,
    );

    headers::apply_forwarding(
        &mut parts.headers,
        client_ip,
        inbound_host.as_deref(),
        &upstream.scheme,
        config.cors.is_enabled(),
        &config.headers,
    );

    if config.csrf.enabled {
        parts.headers.remove(config.csrf.header_name.as_str());
        if !config.enable_authorization_cookies {
            headers::scrub_proxy_cookies(
                &mut parts.headers,
                &[session::REQUEST_URI_COOKIE, config.csrf.cookie_name.as_str()],
            );
        }
    } else if !config.enable_authorization_cookies {
        headers::scrub_proxy_cookies(&mut parts.headers, &[session::REQUEST_URI_COOKIE]);
    }

    headers::set_outbound_host(
        &mut parts.headers,
        config,
        inbound_host.as_deref(),
        &upstream.authority,
    );

    debug!(
        upstream = %upstream.authority,
        path = %path_and_query,
        upgraded = upgrade,
        "proxying to upstream"
    );

    if upgrade {
        return tunnel(state, parts, upstream, &path_and_query).await;
    }

    headers::strip_hop_by_hop(&mut parts.headers);

    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(error = %e, "failed to read request body");
            return error_response(StatusCode::BAD_REQUEST, "malformed request body");
        }
    };

    let uri = format!(
        "{}://{}{}",
        upstream.scheme, upstream.authority, path_and_query
    );
    let mut upstream_req = match Request::builder()
        .method(parts.method)
        .uri(uri.as_str())
        .body(Full::new(body))
    {
        Ok(req) => req,
        Err(e) => {
            warn!(uri = %uri, error = %e, "failed to build upstream request");
            return error_response(StatusCode::BAD_REQUEST, "malformed request");
        }
    };
    *upstream_req.headers_mut() = parts.headers;

    match state.client.request(upstream, upstream_req).await {
        Ok(response) => {
            let (mut head, body) = response.into_parts();
            headers::strip_hop_by_hop(&mut head.headers);
            Response::from_parts(head, Body::new(body))
        }
        Err(failure) => upstream_error(&failure),
    }
}

fn upstream_error(failure: &UpstreamFailure) -> Response<Body> {
    warn!(error = %failure, "upstream request failed");
    match failure {
        UpstreamFailure::Dial(_) => error_response(StatusCode::BAD_GATEWAY, "upstream unreachable"),
        UpstreamFailure::Timeout => {
            error_response(StatusCode::GATEWAY_TIMEOUT, "upstream timed out")
        }
        UpstreamFailure::Protocol(_) => {
            error_response(StatusCode::BAD_GATEWAY, "upstream protocol error")
        }
    }
}

/// Strip the base path (exact leading-prefix, segment-aligned) and join
/// the upstream path prefix with a single separator.
fn rewrite_path(path: &str, query: Option<&str>, strip: &str, upstream_base: &str) -> String {
    let mut path = path;
    if !strip.is_empty() {
        if let Some(rest) = path.strip_prefix(strip) {
            if rest.is_empty() {
                path = "/";
            } else if rest.starts_with('/') {
                path = rest;
            }
        }
    }

    let mut joined = if upstream_base.is_empty() {
        path.to_string()
    } else {
        // upstream_base never ends with '/', path always starts with it
        format!("{upstream_base}{path}")
    };

    if let Some(query) = query {
        joined.push('?');
        joined.push_str(query);
    }
    joined
}

/// Manual hijack + splice for protocol upgrades. The pooled reverse
/// proxy cannot tunnel arbitrary upgrades, so the upstream is dialed
/// directly, the rewritten head replayed, and the two connections
/// relayed with both directions running concurrently.
async fn tunnel(
    state: &AppState,
    mut parts: Parts,
    upstream: &Upstream,
    path_and_query: &str,
) -> Response<Body> {
    let Some(client_upgrade) = parts.extensions.remove::<OnUpgrade>() else {
        error!("upgrade requested on a connection that cannot be hijacked");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to upgrade connection");
    };

    let stream = match state.client.dial(upstream).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(error = %e, "failed to dial upstream for upgrade");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to upgrade connection");
        }
    };

    let (mut sender, conn) = match hyper::client::conn::http1::handshake(TokioIo::new(stream)).await
    {
        Ok(pair) => pair,
        Err(e) => {
            error!(error = %e, "upstream handshake failed for upgrade");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to upgrade connection");
        }
    };
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!(error = %e, "upgraded upstream connection closed with error");
        }
    });

    let mut upstream_req = match Request::builder()
        .method(parts.method.clone())
        .uri(path_and_query)
        .body(Full::new(Bytes::new()))
    {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "failed to build upgrade request");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to upgrade connection");
        }
    };
    *upstream_req.headers_mut() = parts.headers;

    let upstream_response = match sender.send_request(upstream_req).await {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "failed to replay upgrade request upstream");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to upgrade connection");
        }
    };

    if upstream_response.status() != StatusCode::SWITCHING_PROTOCOLS {
        // The upstream declined the upgrade; relay its answer as-is.
        let (head, body) = upstream_response.into_parts();
        return Response::from_parts(head, Body::new(body));
    }

    let mut response = match Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .body(Body::empty())
    {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "failed to build upgrade response");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to upgrade connection");
        }
    };
    *response.headers_mut() = upstream_response.headers().clone();

    tokio::spawn(async move {
        let upstream_io = match hyper::upgrade::on(upstream_response).await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                error!(error = %e, "upstream upgrade did not complete");
                return;
            }
        };
        let client_io = match client_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                error!(error = %e, "client upgrade did not complete");
                return;
            }
        };

        let mut client_io = TokioIo::new(client_io);
        let mut upstream_io = TokioIo::new(upstream_io);
        match tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await {
            Ok((from_client, from_upstream)) => {
                debug!(from_client, from_upstream, "upgrade relay finished");
            }
            Err(e) => {
                debug!(error = %e, "upgrade relay closed with error");
            }
        }
    });

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;

    #[test]
    fn strip_then_join_keeps_single_slash() {
        assert_eq!(rewrite_path("/p/x", None, "/p", "/apitls"), "/apitls/x");
        assert_eq!(rewrite_path("/p", None, "/p", ""), "/");
        assert_eq!(rewrite_path("/p/x", None, "", "/base"), "/base/p/x");
        assert_eq!(rewrite_path("/x", None, "", ""), "/x");
    }

    #[test]
    fn strip_requires_segment_boundary() {
        assert_eq!(rewrite_path("/private", None, "/p", ""), "/private");
    }

    #[test]
    fn query_survives_rewrite() {
        assert_eq!(
            rewrite_path("/fake/foo", Some("a=1&b=2"), "/fake", "/apitls"),
            "/apitls/foo?a=1&b=2"
        );
    }

    #[test]
    fn upgrade_detection_needs_both_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", "Upgrade".parse().unwrap());
        assert!(!is_upgrade(&headers));

        headers.insert("upgrade", "websocket".parse().unwrap());
        assert!(is_upgrade(&headers));

        let mut keepalive = HeaderMap::new();
        keepalive.insert("connection", "keep-alive".parse().unwrap());
        keepalive.insert("upgrade", "websocket".parse().unwrap());
        assert!(!is_upgrade(&keepalive));
    }

    #[test]
    fn upgrade_detection_handles_token_lists() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", "keep-alive, Upgrade".parse().unwrap());
        headers.insert("upgrade", "websocket".parse().unwrap());
        assert!(is_upgrade(&headers));
    }
}
