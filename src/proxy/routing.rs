//! Resource matching and the default-deny catch-all policy.
//!
//! [`ResourceRouter`] binds configured [`Resource`]s to URL prefixes.
//! Longest-prefix match selects the resource for a path; ties are broken
//! by configuration order. The catch-all (`/*`) behavior is resolved
//! once at startup from the `enable_default_deny` /
//! `enable_default_not_found` flags and any explicit `/*` resource.

use tracing::{info, warn};

use crate::config::model::Resource;

/// What happens to a path no explicit resource covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchAll {
    /// `/*` resolves to a configured or synthesized resource.
    Resource(usize),
    /// Authenticate first, then 404 — unauthenticated probes get the
    /// auth flow's 401/redirect instead of learning the route map.
    AuthenticatedNotFound,
    /// Plain 404.
    NotFound,
    /// Operator opt-out: forward without authentication.
    Forward,
}

#[derive(Debug)]
pub struct ResourceRouter {
    resources: Vec<Resource>,
    catch_all: CatchAll,
}

impl ResourceRouter {
    #[must_use]
    pub fn from_config(
        mut resources: Vec<Resource>,
        enable_default_deny: bool,
        enable_default_not_found: bool,
    ) -> Self {
        for resource in &resources {
            if resource.url.len() > 1 && resource.url.ends_with('/') {
                warn!(
                    resource = %resource.url,
                    amended = %resource.url.trim_end_matches('/'),
                    "the resource url is not a prefix"
                );
            }
        }

        let explicit = resources.iter().position(Resource::is_catch_all);

        let catch_all = if let Some(idx) = explicit {
            // An explicit /* wins over any synthesized behavior.
            CatchAll::Resource(idx)
        } else if enable_default_deny && enable_default_not_found {
            info!(
                "undeclared routes respond 401 unauthenticated or 404 for authenticated users"
            );
            CatchAll::AuthenticatedNotFound
        } else if enable_default_deny {
            info!("adding a default denial to protected resources: all routes to upstream require authentication");
            resources.push(Resource::default_deny());
            CatchAll::Resource(resources.len() - 1)
        } else if enable_default_not_found {
            info!("undeclared routes respond 404");
            CatchAll::NotFound
        } else {
            warn!("routes to upstream are not configured to be denied by default");
            CatchAll::Forward
        };

        Self {
            resources,
            catch_all,
        }
    }

    #[must_use]
    pub const fn catch_all(&self) -> CatchAll {
        self.catch_all
    }

    #[must_use]
    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    #[must_use]
    pub fn resource(&self, idx: usize) -> &Resource {
        &self.resources[idx]
    }

    /// Longest-prefix match over the non-catch-all resources. Ties are
    /// broken by configuration order. `None` defers to the catch-all.
    #[must_use]
    pub fn match_path(&self, path: &str) -> Option<usize> {
        let mut best: Option<(usize, usize)> = None;

        for (idx, resource) in self.resources.iter().enumerate() {
            if resource.is_catch_all() {
                continue;
            }
            let prefix = resource.url.trim_end_matches("/*");
            if !prefix_matches(prefix, path) {
                continue;
            }
            let specificity = prefix.len();
            // Strictly-greater keeps the earliest resource on ties.
            if best.map_or(true, |(_, s)| specificity > s) {
                best = Some((idx, specificity));
            }
        }

        best.map(|(idx, _)| idx)
    }
}

/// A pattern matches the path itself or any segment below it, so `/app`
/// covers `/app` and `/app/x` but not `/apple`.
fn prefix_matches(prefix: &str, path: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(url: &str) -> Resource {
        let mut r = Resource::default_deny();
        r.url = url.to_string();
        r
    }

    fn router(urls: &[&str], deny: bool, not_found: bool) -> ResourceRouter {
        ResourceRouter::from_config(urls.iter().map(|u| resource(u)).collect(), deny, not_found)
    }

    #[test]
    fn longest_prefix_wins() {
        let r = router(&["/api", "/api/admin"], false, false);
        assert_eq!(r.match_path("/api/admin/users"), Some(1));
        assert_eq!(r.match_path("/api/other"), Some(0));
    }

    #[test]
    fn ties_resolve_by_config_order() {
        // Same effective prefix via the /* suffix form.
        let r = router(&["/api/*", "/api"], false, false);
        assert_eq!(r.match_path("/api/x"), Some(0));
    }

    #[test]
    fn prefix_does_not_split_segments() {
        let r = router(&["/app"], false, false);
        assert_eq!(r.match_path("/app"), Some(0));
        assert_eq!(r.match_path("/app/x"), Some(0));
        assert_eq!(r.match_path("/apple"), None);
    }

    #[test]
    fn wildcard_suffix_is_equivalent_to_prefix() {
        let r = router(&["/ws/*"], false, false);
        assert_eq!(r.match_path("/ws/deep/path"), Some(0));
        assert_eq!(r.match_path("/ws"), Some(0));
    }

    #[test]
    fn explicit_catch_all_is_used_with_default_deny() {
        let r = router(&["/api", "/*"], true, false);
        assert_eq!(r.catch_all(), CatchAll::Resource(1));
        // No synthetic resource appended.
        assert_eq!(r.resources().len(), 2);
        // Non-matching paths defer to the catch-all.
        assert_eq!(r.match_path("/other"), None);
    }

    #[test]
    fn default_deny_synthesizes_catch_all() {
        let r = router(&["/api"], true, false);
        assert_eq!(r.resources().len(), 2);
        assert_eq!(r.catch_all(), CatchAll::Resource(1));
        assert!(r.resources()[1].is_catch_all());
        assert!(!r.resources()[1].white_listed);
    }

    #[test]
    fn default_deny_with_not_found_authenticates_then_404s() {
        let r = router(&["/api"], true, true);
        assert_eq!(r.catch_all(), CatchAll::AuthenticatedNotFound);
        assert_eq!(r.resources().len(), 1);
    }

    #[test]
    fn not_found_without_default_deny() {
        let r = router(&["/api"], false, true);
        assert_eq!(r.catch_all(), CatchAll::NotFound);
    }

    #[test]
    fn opt_out_forwards_unauthenticated() {
        let r = router(&["/api"], false, false);
        assert_eq!(r.catch_all(), CatchAll::Forward);
    }

    #[test]
    fn catch_all_resource_not_prefix_matched() {
        let r = router(&["/*"], true, false);
        assert_eq!(r.match_path("/anything"), None);
        assert_eq!(r.catch_all(), CatchAll::Resource(0));
    }
}
