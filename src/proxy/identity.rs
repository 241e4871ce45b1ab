//! Identity header projection.
//!
//! After successful authentication a configurable subset of claims is
//! projected into upstream-facing request headers. Any inbound header
//! with the same name is removed first so a client cannot spoof an
//! identity past the proxy.

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;

use crate::oidc::Identity;

pub const SUBJECT_HEADER: &str = "x-auth-subject";
pub const EMAIL_HEADER: &str = "x-auth-email";
pub const USERNAME_HEADER: &str = "x-auth-username";
pub const ROLES_HEADER: &str = "x-auth-roles";
pub const GROUPS_HEADER: &str = "x-auth-groups";
pub const TOKEN_HEADER: &str = "x-auth-token";
pub const EXPIRES_IN_HEADER: &str = "x-auth-expiresin";

const CANONICAL: &[&str] = &[
    SUBJECT_HEADER,
    EMAIL_HEADER,
    USERNAME_HEADER,
    ROLES_HEADER,
    GROUPS_HEADER,
    TOKEN_HEADER,
    EXPIRES_IN_HEADER,
];

/// `given_name` -> `X-Auth-Given-Name`.
#[must_use]
pub fn claim_header_name(claim: &str) -> String {
    let mut name = String::from("x-auth-");
    for (i, part) in claim.split(['_', '-']).enumerate() {
        if i > 0 {
            name.push('-');
        }
        name.push_str(&part.to_lowercase());
    }
    name
}

fn claim_header_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => Some(
            items
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(","),
        ),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Drop any identity headers the client supplied itself.
pub fn scrub_inbound(headers: &mut HeaderMap, add_claims: &[String]) {
    for name in CANONICAL {
        headers.remove(*name);
    }
    for claim in add_claims {
        if let Ok(name) = claim_header_name(claim).parse::<HeaderName>() {
            headers.remove(&name);
        }
    }
}

/// Project the identity into the request headers, multi-valued claims
/// comma-joined.
pub fn inject(
    headers: &mut HeaderMap,
    identity: &Identity,
    add_claims: &[String],
    enable_token_header: bool,
) {
    scrub_inbound(headers, add_claims);

    insert(headers, SUBJECT_HEADER, &identity.subject);
    insert(headers, EMAIL_HEADER, &identity.email);
    insert(headers, USERNAME_HEADER, &identity.preferred_username);
    insert(headers, ROLES_HEADER, &identity.roles.join(","));
    insert(headers, GROUPS_HEADER, &identity.groups.join(","));
    insert(
        headers,
        EXPIRES_IN_HEADER,
        &identity.expires_in().to_string(),
    );
    if enable_token_header {
        insert(headers, TOKEN_HEADER, &identity.token);
    }

    for claim in add_claims {
        let Some(value) = identity.claims.get(claim).and_then(claim_header_value) else {
            continue;
        };
        let Ok(name) = claim_header_name(claim).parse::<HeaderName>() else {
            continue;
        };
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    }
}

fn insert(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}
