//! `doorman run` — start the proxy server.
//!
//! Loads and validates the configuration, discovers the identity
//! provider, compiles the runtime state, and serves with graceful
//! shutdown. Configuration is immutable for the life of the process.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use crate::cli::RunArgs;
use crate::config;
use crate::error::DoormanError;
use crate::logging;
use crate::oidc::TokenService;
use crate::server::{self, AppState};

pub async fn execute(args: RunArgs) -> Result<(), DoormanError> {
    let log_format = logging::resolve_format(args.pretty, args.json);
    logging::init(&args.log_level, log_format);

    let path = resolve_config_path(args.config)?;
    let (cfg, version) = config::load(&path).await?;

    tracing::info!(
        config = %path.display(),
        upstream = %cfg.upstream,
        resources = cfg.resources.len(),
        "configuration loaded"
    );
    log_startup_notes(&cfg);

    let http = reqwest::Client::new();
    let tokens = TokenService::discover(http, &cfg.oidc).await?;

    let state = Arc::new(AppState::assemble(cfg, version, tokens)?);

    for resource in state.router.resources() {
        tracing::info!(resource = %resource, "protecting resource");
    }

    // Keep the JWKS cache warm for the life of the process.
    tokio::spawn(state.tokens.clone().jwks_poll_loop());

    let router = server::build_router(state, args.max_body);

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!(addr = %addr, "doorman started");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(server::shutdown_signal())
    .await?;

    tracing::info!("doorman stopped");
    Ok(())
}

fn resolve_config_path(explicit: Option<PathBuf>) -> Result<PathBuf, DoormanError> {
    if let Some(path) = explicit {
        return Ok(path);
    }

    for name in ["doorman.yaml", "doorman.yml", "doorman.json"] {
        let path = PathBuf::from(name);
        if path.exists() {
            tracing::info!(path = %path.display(), "auto-detected config file");
            return Ok(path);
        }
    }

    Err(DoormanError::NoConfigFile {
        hint: "Provide --config <file> or create ./doorman.yaml.\n  \
               Run 'doorman init' to create a config file."
            .into(),
    })
}

fn log_startup_notes(cfg: &crate::config::model::Config) {
    if cfg.cookies.session_only {
        tracing::info!("using session cookies only for access and refresh tokens");
    }
    for (claim, value) in &cfg.match_claims {
        tracing::info!(claim = %claim, value = %value, "token must contain");
    }
    if cfg.redirection_url.is_empty() {
        tracing::warn!("no redirection url has been set, will use host headers");
    }
    if cfg.csrf.enabled {
        tracing::info!(header = %cfg.csrf.header_name, "csrf protection is enabled");
    }
    if cfg.enable_login_handler {
        tracing::info!("password-grant login handler is enabled");
    }
}
