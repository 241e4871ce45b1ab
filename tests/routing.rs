//! Integration tests for resource matching and the middleware chain
//! composition, driven through the library API.

use doorman::config::model::Resource;
use doorman::proxy::routing::{CatchAll, ResourceRouter};
use doorman::proxy::{chain_for, ChainStep};

fn resource(url: &str) -> Resource {
    let mut r = Resource::default_deny();
    r.url = url.to_string();
    r
}

#[test]
fn longest_prefix_comprehensive() {
    let router = ResourceRouter::from_config(
        vec![
            resource("/api"),
            resource("/api/admin"),
            resource("/api/admin/audit"),
            resource("/static"),
        ],
        false,
        false,
    );

    assert_eq!(router.match_path("/api"), Some(0));
    assert_eq!(router.match_path("/api/users"), Some(0));
    assert_eq!(router.match_path("/api/admin"), Some(1));
    assert_eq!(router.match_path("/api/admin/users"), Some(1));
    assert_eq!(router.match_path("/api/admin/audit/log"), Some(2));
    assert_eq!(router.match_path("/static/app.css"), Some(3));
    assert_eq!(router.match_path("/other"), None);
}

#[test]
fn config_order_breaks_ties() {
    let router = ResourceRouter::from_config(
        vec![resource("/api/*"), resource("/api")],
        false,
        false,
    );
    // Both patterns reduce to the same prefix; the first declared wins.
    assert_eq!(router.match_path("/api/x"), Some(0));
}

#[test]
fn default_deny_appends_synthetic_catch_all() {
    let router = ResourceRouter::from_config(vec![resource("/api")], true, false);
    assert_eq!(router.resources().len(), 2);
    let synthetic = &router.resources()[1];
    assert!(synthetic.is_catch_all());
    assert!(synthetic.methods.is_empty(), "catch-all allows all methods");
    assert_eq!(router.catch_all(), CatchAll::Resource(1));
}

#[test]
fn explicit_catch_all_is_not_duplicated() {
    let router =
        ResourceRouter::from_config(vec![resource("/api"), resource("/*")], true, false);
    assert_eq!(router.resources().len(), 2);
    assert_eq!(router.catch_all(), CatchAll::Resource(1));
}

#[test]
fn flag_combinations_resolve_catch_all_behavior() {
    let both = ResourceRouter::from_config(vec![resource("/api")], true, true);
    assert_eq!(both.catch_all(), CatchAll::AuthenticatedNotFound);

    let not_found = ResourceRouter::from_config(vec![resource("/api")], false, true);
    assert_eq!(not_found.catch_all(), CatchAll::NotFound);

    let open = ResourceRouter::from_config(vec![resource("/api")], false, false);
    assert_eq!(open.catch_all(), CatchAll::Forward);
}

#[test]
fn middleware_chain_order_is_fixed() {
    let protected = resource("/api");
    assert_eq!(
        chain_for(&protected),
        &[
            ChainStep::Authenticate,
            ChainStep::Admit,
            ChainStep::IdentityHeaders,
            ChainStep::CsrfSkipResource,
            ChainStep::CsrfProtect,
            ChainStep::CsrfEchoHeader,
        ]
    );

    let mut open = resource("/public");
    open.white_listed = true;
    assert!(chain_for(&open).is_empty());
}
