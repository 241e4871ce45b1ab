//! Doorman is an identity-aware HTTP reverse proxy.
//!
//! It sits in front of protected upstreams and enforces authentication
//! against an OpenID Connect identity provider (Keycloak being the
//! canonical one) plus fine-grained per-resource authorization.
//! Unauthenticated browser requests are redirected into the
//! authorization-code flow, tokens are validated and carried in cookies,
//! and authorized requests are transparently forwarded upstream with the
//! caller's identity projected into headers.
//!
//! # Architecture
//!
//! - [`cli`] -- Command-line argument parsing with clap derive macros.
//! - [`cmd`] -- Subcommand dispatch and execution (run, init, validate).
//! - [`config`] -- Configuration loading and validation.
//! - [`error`] -- Unified error types using `thiserror`.
//! - [`logging`] -- Structured tracing setup with JSON and pretty-print
//!   output.
//! - [`oidc`] -- OpenID Connect collaborators: provider discovery, the
//!   token service (code exchange, refresh, JWKS-backed validation), and
//!   the `/oauth` endpoints served by the proxy itself.
//! - [`proxy`] -- The request pipeline: resource routing, the
//!   authentication / admission / CSRF / identity-header middleware
//!   chain, and the forwarding engine with protocol-upgrade tunneling.
//! - [`server`] -- Axum server setup, shared application state, the
//!   upstream client, and graceful shutdown.
//! - [`session`] -- Cookie ownership: naming, attributes, chunked
//!   split/reassembly, and the request-URI / state cookies used across
//!   the OIDC round-trip.

// Binary crate — public functions are internal, not consumed by external users.
#![allow(clippy::missing_errors_doc)]

pub mod cli;
pub mod cmd;
pub mod config;
pub mod error;
pub mod logging;
pub mod oidc;
pub mod proxy;
pub mod server;
pub mod session;
