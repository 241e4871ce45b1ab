//! Configuration validation with detailed error reporting.
//!
//! The [`validate`] function checks a parsed [`Config`] for structural
//! errors such as empty resource URLs, invalid HTTP methods, malformed
//! upstream URLs, bad claim regexes, and contradictory flag
//! combinations. Returns a list of [`ValidationError`] values with
//! per-field suggestions.

use regex::Regex;
use url::Url;

use super::model::{Config, ALL_ROUTES};
use crate::error::ValidationError;

const VALID_METHODS: &[&str] = &[
    "GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS", "TRACE", "CONNECT",
];

const UPSTREAM_SCHEMES: &[&str] = &["http", "https", "unix"];

pub fn validate(config: &Config) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_upstream(&mut errors, "(root)", "upstream", &config.upstream);

    if config.oidc.discovery_url.is_empty() {
        errors.push(ValidationError {
            resource: "(root)".into(),
            field: "oidc.discovery_url".into(),
            message: "discovery URL cannot be empty".into(),
            suggestion: Some("point it at your realm, e.g. https://idp/realms/main".into()),
        });
    }

    if config.oidc.client_id.is_empty() {
        errors.push(ValidationError {
            resource: "(root)".into(),
            field: "oidc.client_id".into(),
            message: "client_id cannot be empty".into(),
            suggestion: None,
        });
    }

    if !config.oauth_uri.starts_with('/') {
        errors.push(ValidationError {
            resource: "(root)".into(),
            field: "oauth_uri".into(),
            message: "must start with '/'".into(),
            suggestion: Some(format!("did you mean '/{}'?", config.oauth_uri)),
        });
    }

    for (claim, pattern) in &config.match_claims {
        if let Err(e) = Regex::new(pattern) {
            errors.push(ValidationError {
                resource: "(root)".into(),
                field: format!("match_claims.{claim}"),
                message: format!("'{pattern}' is not a valid regex: {e}"),
                suggestion: None,
            });
        }
    }

    if config.cors.credentials && config.cors.origins.iter().any(|o| o == "*") {
        errors.push(ValidationError {
            resource: "(root)".into(),
            field: "cors.origins".into(),
            message: "a wildcard origin cannot be combined with credentials".into(),
            suggestion: Some("list the allowed origins explicitly".into()),
        });
    }

    let tls = &config.upstream_options;
    if tls.client_cert.is_some() != tls.client_key.is_some() {
        errors.push(ValidationError {
            resource: "(root)".into(),
            field: "upstream_options.client_cert".into(),
            message: "client_cert and client_key must be set together".into(),
            suggestion: None,
        });
    }

    let mut seen_urls = std::collections::HashSet::new();

    for (i, resource) in config.resources.iter().enumerate() {
        let id = if resource.url.is_empty() {
            format!("resources[{i}]")
        } else {
            resource.url.clone()
        };

        if resource.url.is_empty() {
            errors.push(ValidationError {
                resource: id.clone(),
                field: "url".into(),
                message: "url cannot be empty".into(),
                suggestion: None,
            });
            continue;
        }

        if !resource.url.starts_with('/') {
            errors.push(ValidationError {
                resource: id.clone(),
                field: "url".into(),
                message: "url must start with '/'".into(),
                suggestion: Some(format!("did you mean '/{}'?", resource.url)),
            });
        }

        if !seen_urls.insert(&resource.url) {
            errors.push(ValidationError {
                resource: id.clone(),
                field: "url".into(),
                message: "duplicate resource url".into(),
                suggestion: None,
            });
        }

        for method in &resource.methods {
            let upper = method.to_uppercase();
            if !VALID_METHODS.contains(&upper.as_str()) {
                errors.push(ValidationError {
                    resource: id.clone(),
                    field: "methods".into(),
                    message: format!("'{method}' is not a valid HTTP method"),
                    suggestion: None,
                });
            }
        }

        for (claim, pattern) in &resource.claims {
            if let Err(e) = Regex::new(pattern) {
                errors.push(ValidationError {
                    resource: id.clone(),
                    field: format!("claims.{claim}"),
                    message: format!("'{pattern}' is not a valid regex: {e}"),
                    suggestion: None,
                });
            }
        }

        if let Some(ref upstream) = resource.upstream {
            check_upstream(&mut errors, &id, "upstream", upstream);
        }

        if !resource.strip_base_path.is_empty() && !resource.strip_base_path.starts_with('/') {
            errors.push(ValidationError {
                resource: id.clone(),
                field: "strip_base_path".into(),
                message: "must start with '/'".into(),
                suggestion: Some(format!("did you mean '/{}'?", resource.strip_base_path)),
            });
        }

        if resource.white_listed && (!resource.roles.is_empty() || !resource.claims.is_empty()) {
            errors.push(ValidationError {
                resource: id.clone(),
                field: "white_listed".into(),
                message: "white-listed resources ignore roles and claims".into(),
                suggestion: Some("remove the constraints or the white_listed flag".into()),
            });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_upstream(errors: &mut Vec<ValidationError>, id: &str, field: &str, raw: &str) {
    match Url::parse(raw) {
        Ok(parsed) => {
            let scheme = parsed.scheme();
            if !UPSTREAM_SCHEMES.contains(&scheme) {
                errors.push(ValidationError {
                    resource: id.to_string(),
                    field: field.to_string(),
                    message: format!(
                        "'{raw}' uses unsupported scheme '{scheme}' (expected http, https, or unix)"
                    ),
                    suggestion: None,
                });
            }
        }
        Err(_) => {
            errors.push(ValidationError {
                resource: id.to_string(),
                field: field.to_string(),
                message: format!("'{raw}' is not a valid URL"),
                suggestion: None,
            });
        }
    }
}

/// Render a human-readable summary of a valid config.
#[must_use]
pub fn format_validation_report(path: &str, config: &Config) -> String {
    let mut lines = vec![format!(
        "  {} resources, upstream {}\n",
        config.resources.len(),
        config.upstream
    )];

    for resource in &config.resources {
        let methods = if resource.methods.is_empty() {
            "ANY".to_string()
        } else {
            resource.methods.join(", ")
        };
        let mode = if resource.white_listed {
            "white-listed"
        } else {
            "protected"
        };
        lines.push(format!("  {}  [{methods}]  {mode}", resource.url));
        if let Some(ref upstream) = resource.upstream {
            lines.push(format!("    upstream: {upstream}"));
        }
        if resource.url == ALL_ROUTES {
            lines.push("    (explicit catch-all)".into());
        }
    }

    format!("{} is valid\n{}", path, lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::{OidcConfig, Resource};

    fn minimal_config() -> Config {
        serde_yml::from_str(
            r"
upstream: http://127.0.0.1:8080
oidc:
  discovery_url: https://idp.example.com/realms/test
  client_id: doorman
resources:
  - url: /api
",
        )
        .unwrap()
    }

    #[test]
    fn valid_config_passes() {
        assert!(validate(&minimal_config()).is_ok());
    }

    #[test]
    fn bad_upstream_scheme_fails() {
        let mut config = minimal_config();
        config.upstream = "ftp://files.example.com".into();
        let errors = validate(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.message.contains("scheme")));
    }

    #[test]
    fn unix_upstream_is_accepted() {
        let mut config = minimal_config();
        config.upstream = "unix:///tmp/up.sock".into();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn empty_client_id_fails() {
        let mut config = minimal_config();
        config.oidc = OidcConfig {
            client_id: String::new(),
            ..config.oidc
        };
        let errors = validate(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "oidc.client_id"));
    }

    #[test]
    fn resource_url_without_slash_fails() {
        let mut config = minimal_config();
        config.resources[0].url = "api".into();
        let errors = validate(&config).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| e.suggestion.as_deref() == Some("did you mean '/api'?")));
    }

    #[test]
    fn duplicate_resource_url_fails() {
        let mut config = minimal_config();
        let dup = config.resources[0].clone();
        config.resources.push(dup);
        let errors = validate(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.message.contains("duplicate")));
    }

    #[test]
    fn invalid_method_fails() {
        let mut config = minimal_config();
        config.resources[0].methods = vec!["FETCH".into()];
        let errors = validate(&config).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| e.message.contains("not a valid HTTP method")));
    }

    #[test]
    fn invalid_claim_regex_fails() {
        let mut config = minimal_config();
        config.resources[0]
            .claims
            .insert("email".into(), "*[".into());
        let errors = validate(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "claims.email"));
    }

    #[test]
    fn whitelisted_with_roles_fails() {
        let mut config = minimal_config();
        config.resources[0].white_listed = true;
        config.resources[0].roles = vec!["admin".into()];
        let errors = validate(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "white_listed"));
    }

    #[test]
    fn client_cert_without_key_fails() {
        let mut config = minimal_config();
        config.upstream_options.client_cert = Some("/etc/tls/cert.pem".into());
        let errors = validate(&config).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| e.message.contains("must be set together")));
    }

    #[test]
    fn wildcard_origin_with_credentials_fails() {
        let mut config = minimal_config();
        config.cors.origins = vec!["*".into()];
        config.cors.credentials = true;
        let errors = validate(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "cors.origins"));
    }

    #[test]
    fn explicit_catch_all_is_valid() {
        let mut config = minimal_config();
        config.resources.push(Resource::default_deny());
        assert!(validate(&config).is_ok());
    }
}
