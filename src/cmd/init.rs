//! `doorman init` — generate a starter configuration file.
//!
//! Creates a YAML or JSON config file with either a minimal or a fully
//! documented template.

use std::path::PathBuf;

use crate::cli::{ConfigFormat, InitArgs};
use crate::error::DoormanError;

pub fn execute(args: &InitArgs) -> Result<(), DoormanError> {
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from(format!("doorman.{}", args.format.extension())));

    if output.exists() {
        return Err(DoormanError::FileExists { path: output });
    }

    let content = match (&args.format, args.full) {
        (ConfigFormat::Yaml, false) => YAML_MINIMAL,
        (ConfigFormat::Yaml, true) => YAML_FULL,
        (ConfigFormat::Json, _) => JSON_MINIMAL,
    };

    std::fs::write(&output, content)?;
    println!("Created {}", output.display());
    Ok(())
}

const YAML_MINIMAL: &str = r#"# Doorman config — https://github.com/doorman-proxy/doorman

upstream: "http://127.0.0.1:8080"

oidc:
  discovery_url: "https://idp.example.com/realms/main"
  client_id: "doorman"
  client_secret: "changeme"

resources:
  - url: "/api"
    methods: ["GET", "POST"]
    roles: ["user"]
"#;

const YAML_FULL: &str = r#"# Doorman config — https://github.com/doorman-proxy/doorman
#
# All values shown are defaults unless noted otherwise.

# Default upstream for every resource without an override.
# Schemes: http, https, unix (unix:///path/to/socket).
upstream: "http://127.0.0.1:8080"

# Base path for the proxy's own endpoints (authorize, callback, ...).
# oauth_uri: "/oauth"

# External URL of this proxy, used to build the OAuth redirect_uri.
# Empty uses the inbound Host header.
# redirection_url: "https://gate.example.com"

# preserve_host: false           # Keep the client's Host header upstream
# enable_default_deny: true      # Undeclared routes require authentication
# enable_default_not_found: false
# enable_authorization_cookies: false
# enable_token_header: false     # Send X-Auth-Token upstream
# enable_login_handler: false    # POST /oauth/login password grant

oidc:
  discovery_url: "https://idp.example.com/realms/main"
  client_id: "doorman"
  client_secret: "changeme"
  # audience: "doorman"          # Defaults to client_id
  # scopes: ["openid", "email", "profile"]
  # enable_pkce: false
  # jwks_cache_secs: 3600

# cookies:
#   access_name: "kc-access"
#   refresh_name: "kc-state"
#   domain: ""                   # Empty uses the request host
#   secure: true
#   session_only: false          # Omit Max-Age (browser-session cookies)

# csrf:
#   enabled: false
#   cookie_name: "kc-csrf"
#   header_name: "X-CSRF-Token"

# cors:
#   origins: []                  # Non-empty enables CORS at the proxy
#   methods: ["GET", "POST"]
#   headers: []
#   credentials: false

# upstream_options:
#   connect_timeout_ms: 5000
#   response_header_timeout_ms: 30000
#   keepalive_secs: 30
#   disable_keepalive: false
#   max_idle_per_host: 16
#   enable_http2: false
#   tls_modern: false            # TLS 1.3 only towards the upstream
#   ca_bundle: "/etc/tls/upstream-ca.pem"
#   client_cert: "/etc/tls/client.pem"
#   client_key: "/etc/tls/client-key.pem"

# Static headers set on every upstream request (overwrite semantics).
# headers:
#   X-Forwarded-Env: "prod"

# Headers added to every response to the client.
# response_headers: {}

# Claim matchers every token must satisfy (name -> regex).
# match_claims:
#   iss: "^https://idp.example.com/"

# Claims projected upstream as X-Auth-<ClaimName>.
# add_claims: ["given_name", "family_name"]

resources:
  - url: "/api"
    methods: ["GET", "POST"]
    roles: ["user"]
    # groups: []
    # claims:
    #   email: "@example.com$"
    # upstream: "https://inner.example.com/api-v2"
    # strip_base_path: "/api"
    # enable_csrf: true

  # Public assets: proxied without authentication.
  # - url: "/static"
  #   white_listed: true
"#;

const JSON_MINIMAL: &str = r#"{
  "upstream": "http://127.0.0.1:8080",
  "oidc": {
    "discovery_url": "https://idp.example.com/realms/main",
    "client_id": "doorman",
    "client_secret": "changeme"
  },
  "resources": [
    { "url": "/api", "methods": ["GET", "POST"], "roles": ["user"] }
  ]
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::Config;

    #[test]
    fn yaml_templates_parse() {
        let minimal: Config = serde_yml::from_str(YAML_MINIMAL).unwrap();
        assert_eq!(minimal.resources.len(), 1);

        let full: Config = serde_yml::from_str(YAML_FULL).unwrap();
        assert_eq!(full.oidc.client_id, "doorman");
    }

    #[test]
    fn json_template_parses() {
        let config: Config = serde_json::from_str(JSON_MINIMAL).unwrap();
        assert_eq!(config.resources[0].roles, vec!["user"]);
    }

    #[test]
    fn templates_pass_validation() {
        let minimal: Config = serde_yml::from_str(YAML_MINIMAL).unwrap();
        assert!(crate::config::validation::validate(&minimal).is_ok());
        let full: Config = serde_yml::from_str(YAML_FULL).unwrap();
        assert!(crate::config::validation::validate(&full).is_ok());
    }
}
