//! Axum server setup, shared application state, and graceful shutdown.
//!
//! Contains [`AppState`] (the `Arc`-shared state holding the immutable
//! config, the resource router with its compiled claim matchers, the
//! pooled upstream client, and the token service), [`build_router`] for
//! constructing the Axum router with the `/oauth` endpoints and the
//! pipeline fallback, and [`shutdown_signal`] for SIGTERM / Ctrl+C
//! handling.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::{HeaderName, HeaderValue, Method};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::config::model::{Config, CorsConfig};
use crate::error::DoormanError;
use crate::oidc::{handlers, TokenService};
use crate::proxy::admission::{self, ClaimMatcher};
use crate::proxy::client::{self, ProxyClient, Upstream};
use crate::proxy;
use crate::proxy::routing::ResourceRouter;

pub struct AppState {
    pub config: Arc<Config>,
    /// SHA-256 of the raw config file, surfaced by `/oauth/health`.
    pub config_version: String,
    pub router: ResourceRouter,
    pub client: ProxyClient,
    pub default_upstream: Upstream,
    /// Per-resource upstream overrides, parallel to the router's table.
    pub resource_upstreams: Vec<Option<Upstream>>,
    pub global_matchers: Vec<ClaimMatcher>,
    /// Compiled per-resource claim matchers, parallel to the router's
    /// table.
    pub resource_matchers: Vec<Vec<ClaimMatcher>>,
    pub tokens: TokenService,
    pub start_time: Instant,
}

impl AppState {
    /// Compile the validated config into the immutable runtime state:
    /// the resource router (with the default-deny catch-all resolved),
    /// parsed upstream endpoints, claim matchers, and the shared
    /// upstream client.
    pub fn assemble(
        config: Config,
        config_version: String,
        tokens: TokenService,
    ) -> Result<Self, DoormanError> {
        let config = Arc::new(config);

        let router = ResourceRouter::from_config(
            config.resources.clone(),
            config.enable_default_deny,
            config.enable_default_not_found,
        );

        let default_upstream = client::parse_upstream(&config.upstream)?;
        let resource_upstreams = router
            .resources()
            .iter()
            .map(|r| r.upstream.as_deref().map(client::parse_upstream).transpose())
            .collect::<Result<Vec<_>, _>>()?;

        let global_matchers = admission::compile_matchers(&config.match_claims);
        let resource_matchers = router
            .resources()
            .iter()
            .map(|r| admission::compile_matchers(&r.claims))
            .collect();

        let proxy_client = ProxyClient::from_options(&config.upstream_options)?;

        Ok(Self {
            config,
            config_version,
            router,
            client: proxy_client,
            default_upstream,
            resource_upstreams,
            global_matchers,
            resource_matchers,
            tokens,
            start_time: Instant::now(),
        })
    }
}

/// Assemble the Axum router: the proxy-owned endpoints under the
/// configured oauth base, the pipeline fallback for everything else,
/// and the trace / body-limit / CORS layers.
pub fn build_router(state: Arc<AppState>, max_body: usize) -> Router {
    let oauth_uri = state.config.oauth_uri.clone();
    let cors = state.config.cors.clone();

    let router = Router::new()
        .nest(&oauth_uri, handlers::oauth_router(&state))
        .fallback(proxy::pipeline_handler)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(RequestBodyLimitLayer::new(max_body)),
        );

    let router = if cors.is_enabled() {
        router.layer(build_cors_layer(&cors))
    } else {
        router
    };

    router.with_state(state)
}

fn build_cors_layer(cors: &CorsConfig) -> CorsLayer {
    let mut layer = CorsLayer::new().allow_credentials(cors.credentials);

    // A wildcard origin cannot be combined with credentials; config
    // validation rejects that pairing.
    if cors.origins.iter().any(|o| o == "*") {
        layer = layer.allow_origin(Any);
    } else {
        let origins: Vec<HeaderValue> = cors
            .origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        layer = layer.allow_origin(AllowOrigin::list(origins));
    }

    if !cors.methods.is_empty() {
        let methods: Vec<Method> = cors
            .methods
            .iter()
            .filter_map(|m| m.to_uppercase().parse().ok())
            .collect();
        layer = layer.allow_methods(AllowMethods::list(methods));
    }

    if !cors.headers.is_empty() {
        let headers: Vec<HeaderName> = cors
            .headers
            .iter()
            .filter_map(|h| h.parse().ok())
            .collect();
        layer = layer.allow_headers(AllowHeaders::list(headers));
    }

    layer.max_age(Duration::from_secs(cors.max_age_secs))
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received Ctrl+C"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}
