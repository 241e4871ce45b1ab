//! The upstream client factory.
//!
//! One pooled hyper client is constructed at startup and shared by
//! every request: TLS from webpki roots plus the optional upstream CA
//! bundle and client certificate, connection-reuse limits, and
//! per-phase timeouts. `unix://` upstreams are normalized to an opaque
//! `domain-sock` marker and dialed per request over the filesystem
//! socket. [`ProxyClient::dial`] exposes the raw dialer for the
//! protocol-upgrade relay.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response, Uri};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tracing::{debug, info};
use url::Url;

use crate::config::model::UpstreamOptions;
use crate::error::DoormanError;

/// Synthetic host marker for unix-socket upstreams.
pub const DOMAIN_SOCKET_HOST: &str = "domain-sock";

/// A parsed upstream endpoint, normalized for forwarding.
#[derive(Debug, Clone)]
pub struct Upstream {
    /// `http` or `https`; `unix` is normalized away.
    pub scheme: String,
    /// `host` or `host:port`.
    pub authority: String,
    /// Path prefix joined onto rewritten request paths. Never ends
    /// with `/`; empty when the upstream URL has no path.
    pub base_path: String,
    /// Filesystem socket path for `unix://` upstreams.
    pub socket: Option<Arc<PathBuf>>,
}

impl Upstream {
    /// Host and port for raw dialing, with scheme-default ports.
    #[must_use]
    pub fn host_port(&self) -> (String, u16) {
        let default_port = if self.scheme == "https" { 443 } else { 80 };
        match self.authority.rsplit_once(':') {
            Some((host, port)) => match port.parse() {
                Ok(port) => (host.to_string(), port),
                Err(_) => (self.authority.clone(), default_port),
            },
            None => (self.authority.clone(), default_port),
        }
    }
}

/// Parse and normalize an upstream URL. For `unix://` the host+path is
/// reinterpreted as a socket path and the endpoint becomes
/// `http://domain-sock` with an empty base path.
pub fn parse_upstream(raw: &str) -> Result<Upstream, DoormanError> {
    let url = Url::parse(raw).map_err(|e| DoormanError::InvalidUpstream {
        url: raw.to_string(),
        message: e.to_string(),
    })?;

    match url.scheme() {
        "unix" => {
            let socket = format!("{}{}", url.host_str().unwrap_or(""), url.path());
            if socket.is_empty() {
                return Err(DoormanError::InvalidUpstream {
                    url: raw.to_string(),
                    message: "unix upstream has no socket path".into(),
                });
            }
            info!(socket = %socket, "using unix socket for upstream");
            Ok(Upstream {
                scheme: "http".to_string(),
                authority: DOMAIN_SOCKET_HOST.to_string(),
                base_path: String::new(),
                socket: Some(Arc::new(PathBuf::from(socket))),
            })
        }
        scheme @ ("http" | "https") => {
            let host = url.host_str().ok_or_else(|| DoormanError::InvalidUpstream {
                url: raw.to_string(),
                message: "upstream URL has no host".into(),
            })?;
            let authority = match url.port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            };
            let base_path = url.path().trim_end_matches('/').to_string();
            Ok(Upstream {
                scheme: scheme.to_string(),
                authority,
                base_path,
                socket: None,
            })
        }
        other => Err(DoormanError::InvalidUpstream {
            url: raw.to_string(),
            message: format!("unsupported scheme '{other}'"),
        }),
    }
}

/// Failures talking to the upstream, mapped onto client status codes by
/// the forwarding engine.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamFailure {
    #[error("upstream dial failed: {0}")]
    Dial(String),

    #[error("upstream response timed out")]
    Timeout,

    #[error("upstream protocol error: {0}")]
    Protocol(String),
}

/// Raw byte stream towards the upstream, used by the upgrade relay.
pub trait RawIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> RawIo for T {}

type PooledClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

pub struct ProxyClient {
    pooled: PooledClient,
    tls: Arc<rustls::ClientConfig>,
    connect_timeout: Duration,
    response_header_timeout: Duration,
}

impl ProxyClient {
    pub fn from_options(options: &UpstreamOptions) -> Result<Self, DoormanError> {
        // When multiple rustls crypto providers are compiled in, rustls
        // cannot auto-detect which one to use. Explicitly install `ring`.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let tls = Arc::new(build_tls_config(options)?);

        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_connect_timeout(Some(Duration::from_millis(options.connect_timeout_ms)));
        http.set_keepalive(Some(Duration::from_secs(options.keepalive_secs)));

        let builder = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls.as_ref().clone())
            .https_or_http();
        let https = if options.enable_http2 {
            builder.enable_http1().enable_http2().wrap_connector(http)
        } else {
            builder.enable_http1().wrap_connector(http)
        };

        let max_idle = if options.disable_keepalive {
            0
        } else {
            options.max_idle_per_host
        };
        let pooled = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(options.keepalive_secs))
            .pool_max_idle_per_host(max_idle)
            .build(https);

        Ok(Self {
            pooled,
            tls,
            connect_timeout: Duration::from_millis(options.connect_timeout_ms),
            response_header_timeout: Duration::from_millis(options.response_header_timeout_ms),
        })
    }

    /// Execute a normal (non-upgrade) upstream request.
    pub async fn request(
        &self,
        upstream: &Upstream,
        req: Request<Full<Bytes>>,
    ) -> Result<Response<Incoming>, UpstreamFailure> {
        if let Some(ref socket) = upstream.socket {
            return self.unix_request(socket, req).await;
        }

        match tokio::time::timeout(self.response_header_timeout, self.pooled.request(req)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) if e.is_connect() => Err(UpstreamFailure::Dial(e.to_string())),
            Ok(Err(e)) => Err(UpstreamFailure::Protocol(e.to_string())),
            Err(_) => Err(UpstreamFailure::Timeout),
        }
    }

    /// Per-request HTTP/1.1 exchange over a unix domain socket. The
    /// hyper pool keys connections by URI authority, so sockets are
    /// dialed fresh; upstream servers behind a local socket make that
    /// cheap.
    async fn unix_request(
        &self,
        socket: &PathBuf,
        mut req: Request<Full<Bytes>>,
    ) -> Result<Response<Incoming>, UpstreamFailure> {
        let stream = tokio::time::timeout(self.connect_timeout, UnixStream::connect(socket))
            .await
            .map_err(|_| UpstreamFailure::Dial("unix connect timed out".into()))?
            .map_err(|e| UpstreamFailure::Dial(e.to_string()))?;

        // Origin-form request target on the raw connection.
        *req.uri_mut() = origin_form(req.uri());

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| UpstreamFailure::Protocol(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "unix upstream connection closed with error");
            }
        });

        match tokio::time::timeout(self.response_header_timeout, sender.send_request(req)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(UpstreamFailure::Protocol(e.to_string())),
            Err(_) => Err(UpstreamFailure::Timeout),
        }
    }

    /// Dial a raw connection for the protocol-upgrade relay: TCP for
    /// http, TLS-wrapped TCP for https, or the unix socket.
    pub async fn dial(&self, upstream: &Upstream) -> Result<Box<dyn RawIo>, UpstreamFailure> {
        if let Some(ref socket) = upstream.socket {
            let stream = tokio::time::timeout(self.connect_timeout, UnixStream::connect(socket.as_ref()))
                .await
                .map_err(|_| UpstreamFailure::Dial("unix connect timed out".into()))?
                .map_err(|e| UpstreamFailure::Dial(e.to_string()))?;
            return Ok(Box::new(stream));
        }

        let (host, port) = upstream.host_port();
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| UpstreamFailure::Dial("connect timed out".into()))?
            .map_err(|e| UpstreamFailure::Dial(e.to_string()))?;

        if upstream.scheme == "https" {
            let server_name = ServerName::try_from(host.clone())
                .map_err(|e| UpstreamFailure::Dial(format!("invalid TLS server name: {e}")))?;
            let connector = tokio_rustls::TlsConnector::from(self.tls.clone());
            let tls_stream = connector
                .connect(server_name, stream)
                .await
                .map_err(|e| UpstreamFailure::Dial(format!("TLS handshake: {e}")))?;
            Ok(Box::new(tls_stream))
        } else {
            Ok(Box::new(stream))
        }
    }
}

fn origin_form(uri: &Uri) -> Uri {
    uri.path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .parse()
        .unwrap_or_else(|_| Uri::from_static("/"))
}

fn build_tls_config(options: &UpstreamOptions) -> Result<rustls::ClientConfig, DoormanError> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(ref path) = options.ca_bundle {
        let pem = std::fs::read(path).map_err(|e| DoormanError::TlsMaterial {
            path: path.clone(),
            message: e.to_string(),
        })?;
        for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
            let cert = cert.map_err(|e| DoormanError::TlsMaterial {
                path: path.clone(),
                message: e.to_string(),
            })?;
            roots.add(cert).map_err(|e| DoormanError::TlsMaterial {
                path: path.clone(),
                message: e.to_string(),
            })?;
        }
    }

    let builder = if options.tls_modern {
        rustls::ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
    } else {
        rustls::ClientConfig::builder()
    };
    let builder = builder.with_root_certificates(roots);

    match (&options.client_cert, &options.client_key) {
        (Some(cert_path), Some(key_path)) => {
            let cert_pem = std::fs::read(cert_path).map_err(|e| DoormanError::TlsMaterial {
                path: cert_path.clone(),
                message: e.to_string(),
            })?;
            let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| DoormanError::TlsMaterial {
                    path: cert_path.clone(),
                    message: e.to_string(),
                })?;

            let key_pem = std::fs::read(key_path).map_err(|e| DoormanError::TlsMaterial {
                path: key_path.clone(),
                message: e.to_string(),
            })?;
            let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
                .map_err(|e| DoormanError::TlsMaterial {
                    path: key_path.clone(),
                    message: e.to_string(),
                })?
                .ok_or_else(|| DoormanError::TlsMaterial {
                    path: key_path.clone(),
                    message: "no private key found".into(),
                })?;

            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| DoormanError::TlsMaterial {
                    path: cert_path.clone(),
                    message: e.to_string(),
                })
        }
        _ => Ok(builder.with_no_client_auth()),
    }
}
