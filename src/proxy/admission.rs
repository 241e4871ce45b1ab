//! Admission control: role, group, and claim checks for the matched
//! resource.
//!
//! Runs after authentication with AND semantics throughout: every
//! required role, every required group, and every claim matcher must
//! hold. Matchers from the global configuration and from the resource
//! are unioned — resource-local entries add constraints, they never
//! subtract. Any failure produces 403 with a structured reason.

use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;

use crate::config::model::Resource;
use crate::oidc::Identity;

pub const REASON_ROLE: &str = "role_missing";
pub const REASON_GROUP: &str = "group_missing";
pub const REASON_CLAIM: &str = "claim_mismatch";

/// A compiled claim matcher (name -> regex).
#[derive(Debug, Clone)]
pub struct ClaimMatcher {
    pub claim: String,
    pub pattern: Regex,
}

/// Compile a claim matcher map. Invalid patterns were already rejected
/// by config validation; any stragglers are skipped with a warning.
#[must_use]
pub fn compile_matchers(raw: &HashMap<String, String>) -> Vec<ClaimMatcher> {
    let mut matchers: Vec<ClaimMatcher> = raw
        .iter()
        .filter_map(|(claim, pattern)| match Regex::new(pattern) {
            Ok(regex) => Some(ClaimMatcher {
                claim: claim.clone(),
                pattern: regex,
            }),
            Err(e) => {
                tracing::warn!(claim = %claim, error = %e, "skipping invalid claim matcher");
                None
            }
        })
        .collect();
    // Deterministic evaluation order for logs and tests.
    matchers.sort_by(|a, b| a.claim.cmp(&b.claim));
    matchers
}

/// Check the identity against the resource policy. Returns the denial
/// reason on the first failed constraint.
pub fn admit(
    identity: &Identity,
    resource: &Resource,
    global_matchers: &[ClaimMatcher],
    resource_matchers: &[ClaimMatcher],
) -> Result<(), &'static str> {
    for role in &resource.roles {
        if !identity.roles.iter().any(|r| r == role) {
            return Err(REASON_ROLE);
        }
    }

    for group in &resource.groups {
        if !identity.groups.iter().any(|g| g == group) {
            return Err(REASON_GROUP);
        }
    }

    for matcher in global_matchers.iter().chain(resource_matchers) {
        if !claim_matches(&identity.claims, matcher) {
            return Err(REASON_CLAIM);
        }
    }

    Ok(())
}

/// A string claim must match the regex; an array claim matches when any
/// element does; a missing claim never matches.
fn claim_matches(claims: &Value, matcher: &ClaimMatcher) -> bool {
    match claims.get(&matcher.claim) {
        Some(Value::String(s)) => matcher.pattern.is_match(s),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .any(|s| matcher.pattern.is_match(s)),
        Some(Value::Bool(b)) => matcher.pattern.is_match(&b.to_string()),
        Some(Value::Number(n)) => matcher.pattern.is_match(&n.to_string()),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(claims: serde_json::Value) -> Identity {
        Identity::from_claims("tok".into(), claims)
    }

    fn resource(roles: &[&str], groups: &[&str]) -> Resource {
        let mut r = Resource::default_deny();
        r.url = "/api".into();
        r.roles = roles.iter().map(ToString::to_string).collect();
        r.groups = groups.iter().map(ToString::to_string).collect();
        r
    }

    fn matchers(pairs: &[(&str, &str)]) -> Vec<ClaimMatcher> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        compile_matchers(&map)
    }

    #[test]
    fn all_roles_required() {
        let id = identity(serde_json::json!({"realm_access": {"roles": ["user"]}}));
        assert!(admit(&id, &resource(&["user"], &[]), &[], &[]).is_ok());
        assert_eq!(
            admit(&id, &resource(&["user", "admin"], &[]), &[], &[]),
            Err(REASON_ROLE)
        );
    }

    #[test]
    fn client_roles_are_namespaced() {
        let id = identity(serde_json::json!({
            "resource_access": {"portal": {"roles": ["editor"]}}
        }));
        assert!(admit(&id, &resource(&["portal:editor"], &[]), &[], &[]).is_ok());
        assert_eq!(
            admit(&id, &resource(&["editor"], &[]), &[], &[]),
            Err(REASON_ROLE)
        );
    }

    #[test]
    fn all_groups_required() {
        let id = identity(serde_json::json!({"groups": ["eng", "ops"]}));
        assert!(admit(&id, &resource(&[], &["eng", "ops"]), &[], &[]).is_ok());
        assert_eq!(
            admit(&id, &resource(&[], &["eng", "sales"]), &[], &[]),
            Err(REASON_GROUP)
        );
    }

    #[test]
    fn claim_regex_must_match() {
        let id = identity(serde_json::json!({"email": "a@corp"}));
        let m = matchers(&[("email", "@corp$")]);
        assert!(admit(&id, &resource(&[], &[]), &m, &[]).is_ok());

        let id = identity(serde_json::json!({"email": "a@other"}));
        assert_eq!(admit(&id, &resource(&[], &[]), &m, &[]), Err(REASON_CLAIM));
    }

    #[test]
    fn missing_claim_fails() {
        let id = identity(serde_json::json!({}));
        let m = matchers(&[("email", ".*")]);
        assert_eq!(admit(&id, &resource(&[], &[]), &m, &[]), Err(REASON_CLAIM));
    }

    #[test]
    fn global_and_resource_matchers_are_unioned() {
        let id = identity(serde_json::json!({"email": "a@corp", "plan": "free"}));
        let global = matchers(&[("email", "@corp$")]);
        let local = matchers(&[("plan", "^pro$")]);
        // Global alone passes; the union fails on the local matcher.
        assert!(admit(&id, &resource(&[], &[]), &global, &[]).is_ok());
        assert_eq!(
            admit(&id, &resource(&[], &[]), &global, &local),
            Err(REASON_CLAIM)
        );
    }

    #[test]
    fn array_claims_match_any_element() {
        let id = identity(serde_json::json!({"aud": ["account", "doorman"]}));
        let m = matchers(&[("aud", "^doorman$")]);
        assert!(admit(&id, &resource(&[], &[]), &m, &[]).is_ok());
    }

    #[test]
    fn matchers_evaluate_in_claim_order() {
        let compiled = matchers(&[("zzz", ".*"), ("aaa", ".*")]);
        assert_eq!(compiled[0].claim, "aaa");
        assert_eq!(compiled[1].claim, "zzz");
    }
}
