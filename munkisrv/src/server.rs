// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The HTTP(S) front end for the repository.

use std::{fmt::Debug, net::SocketAddr, pin::Pin, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    extract::{rejection::PathRejection, Path, Request, State},
    http::{header, StatusCode, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Redirect, Response},
    routing::get,
    Router,
};
use openssl::ssl::{Ssl, SslAcceptor};
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinSet,
};
use tokio_openssl::SslStream;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, Instrument};
use url::Url;
use uuid::Uuid;

use crate::{
    config::Config,
    error::SignError,
    keys::PrivateKeyMaterial,
    repo::Repository,
    signer::{package_url, UrlSigner},
    tls,
};

/// Requests below this prefix are redirected to CloudFront.
const PACKAGES_PREFIX: &str = "/repo/pkgs/";

/// How long a client has to complete the TLS handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// State shared by every request handler.
#[derive(Debug, Clone)]
pub struct AppState {
    signer: Arc<UrlSigner>,
    cdn_base: Arc<Url>,
    repo: Arc<Repository>,
}

impl AppState {
    pub fn new(signer: UrlSigner, cdn_base: Url, repo: Repository) -> Self {
        Self {
            signer: Arc::new(signer),
            cdn_base: Arc::new(cdn_base),
            repo: Arc::new(repo),
        }
    }

    /// Decode the signing key, parse the CDN URL, and open the repository.
    ///
    /// # Errors
    ///
    /// An error is returned if the signing key can't be decoded or isn't an RSA key, or if
    /// the CloudFront URL isn't an absolute HTTP(S) URL.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let key = PrivateKeyMaterial::from_pem(
            config.cloudfront.private_key.as_bytes(),
            "CloudFront private key",
        )?;
        let signer = UrlSigner::new(config.cloudfront.key_id.clone(), key)?;
        let cdn_base = Url::parse(&config.cloudfront.url)
            .with_context(|| format!("cloudfront.url is invalid: {}", config.cloudfront.url))?;
        anyhow::ensure!(
            matches!(cdn_base.scheme(), "http" | "https") && cdn_base.host_str().is_some(),
            "cloudfront.url must be an http or https URL with a host: {}",
            config.cloudfront.url
        );
        let repo = Repository::open(&config.server.repo_directory);

        Ok(Self::new(signer, cdn_base, repo))
    }
}

/// Build the request router.
///
/// Routes:
/// - `GET /healthz` - 200 if the repository has a catalog, 500 otherwise
/// - `GET /repo/pkgs/*` - 307 to a signed CloudFront URL
/// - `GET /repo/*` - files from the repository directory
///
/// `HEAD` is accepted wherever `GET` is.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/repo/{*path}", get(repository))
        .fallback(not_found)
        .layer(middleware::from_fn(request_span))
        .with_state(state)
}

async fn request_span(request: Request, next: Next) -> Response {
    let span = tracing::info_span!(
        "request",
        request_id = %Uuid::now_v7(),
        method = %request.method(),
        path = %request.uri().path(),
    );
    async move {
        let start = tokio::time::Instant::now();
        let response = next.run(request).await;
        tracing::info!(
            status = response.status().as_u16(),
            latency = ?start.elapsed(),
            "Request completed"
        );
        response
    }
    .instrument(span)
    .await
}

async fn healthz(State(state): State<AppState>) -> StatusCode {
    if state.repo.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "Page not found")
}

async fn repository(
    State(state): State<AppState>,
    uri: Uri,
    path: Result<Path<String>, PathRejection>,
) -> Response {
    // Package paths are signed exactly as received, so they bypass the decoded path.
    if let Some(package) = uri.path().strip_prefix(PACKAGES_PREFIX) {
        return redirect_package(&state, package);
    }

    match path {
        Ok(Path(path)) => serve_file(&state, &path).await,
        Err(rejection) => {
            tracing::debug!(%rejection, "Unable to decode the request path");
            not_found().await.into_response()
        }
    }
}

fn redirect_package(state: &AppState, package: &str) -> Response {
    let url = match package_url(&state.cdn_base, package) {
        Ok(url) => url,
        Err(SignError::PathTraversal) => {
            tracing::warn!(package, "Rejecting package request with a parent directory segment");
            return (StatusCode::BAD_REQUEST, "Bad request").into_response();
        }
        Err(error) => {
            tracing::error!(?error, "Failed to build the package URL");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to sign url").into_response();
        }
    };

    match state.signer.sign_with_default_lifetime(url.as_str()) {
        Ok(signed) => {
            tracing::debug!(%url, expires = signed.expires(), "Redirecting package request");
            Redirect::temporary(signed.as_str()).into_response()
        }
        Err(error) => {
            tracing::error!(%url, ?error, "Failed to sign the package URL");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to sign url").into_response()
        }
    }
}

async fn serve_file(state: &AppState, path: &str) -> Response {
    match state.repo.read(path).await {
        Ok(Some(file)) => ([(header::CONTENT_TYPE, file.content_type)], file.contents).into_response(),
        Ok(None) => not_found().await.into_response(),
        Err(error) => {
            tracing::error!(path, ?error, "Failed to read from the repository");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
        }
    }
}

/// Accepts TCP connections and completes the TLS handshake before handing them to axum.
///
/// Handshakes run in their own tasks so a slow client doesn't hold up other connections.
struct TlsListener {
    tcp_listener: TcpListener,
    acceptor: SslAcceptor,
    handshakes: JoinSet<Option<(SslStream<TcpStream>, SocketAddr)>>,
}

enum Accepted {
    Tcp(std::io::Result<(TcpStream, SocketAddr)>),
    Handshake(Result<Option<(SslStream<TcpStream>, SocketAddr)>, tokio::task::JoinError>),
}

impl TlsListener {
    fn new(tcp_listener: TcpListener, acceptor: SslAcceptor) -> Self {
        Self {
            tcp_listener,
            acceptor,
            handshakes: JoinSet::new(),
        }
    }
}

async fn handshake(
    acceptor: SslAcceptor,
    tcp_stream: TcpStream,
    client_addr: SocketAddr,
) -> Option<(SslStream<TcpStream>, SocketAddr)> {
    let ssl = Ssl::new(acceptor.context())
        .inspect_err(|error| tracing::error!(?error, "Failed to create a TLS session"))
        .ok()?;
    let mut stream = SslStream::new(ssl, tcp_stream)
        .inspect_err(|error| tracing::error!(?error, "Failed to create a TLS stream"))
        .ok()?;

    match tokio::time::timeout(HANDSHAKE_TIMEOUT, Pin::new(&mut stream).accept()).await {
        Ok(Ok(())) => {
            tracing::debug!(?client_addr, "TLS session established");
            Some((stream, client_addr))
        }
        Ok(Err(error)) => {
            tracing::warn!(?client_addr, %error, "TLS handshake failed");
            None
        }
        Err(_) => {
            tracing::warn!(?client_addr, "TLS handshake timed out");
            None
        }
    }
}

impl axum::serve::Listener for TlsListener {
    type Io = SslStream<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            let accepted = tokio::select! {
                result = self.tcp_listener.accept() => Accepted::Tcp(result),
                Some(result) = self.handshakes.join_next() => Accepted::Handshake(result),
            };

            match accepted {
                Accepted::Tcp(Ok((tcp_stream, client_addr))) => {
                    tracing::debug!(?client_addr, "New TCP connection established");
                    self.handshakes.spawn(
                        handshake(self.acceptor.clone(), tcp_stream, client_addr)
                            .instrument(tracing::Span::current()),
                    );
                }
                Accepted::Tcp(Err(error)) => {
                    // Usually file descriptor exhaustion; give connections time to close.
                    tracing::error!(?error, "Failed to accept TCP connection");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Accepted::Handshake(Ok(Some(connection))) => return connection,
                Accepted::Handshake(Ok(None)) => {}
                Accepted::Handshake(Err(error)) => {
                    tracing::error!(?error, "TLS handshake task failed");
                }
            }
        }
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        self.tcp_listener.local_addr()
    }
}

async fn serve<L>(listener: L, app: Router, halt_token: CancellationToken) -> anyhow::Result<()>
where
    L: axum::serve::Listener,
    L::Addr: Debug,
{
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            halt_token.cancelled().await;
            tracing::info!("Shutdown requested, no new requests will be accepted");
        })
        .await?;
    tracing::info!("All requests completed");

    Ok(())
}

pub struct Listener {
    /// The socket address connections are expected to arrive on. This is primarily useful for
    /// tests when binding to port 0.
    addr: SocketAddr,
    /// Whether the listener expects TLS connections.
    tls: bool,
    /// A task that is serving requests. Once the [`CancellationToken`] has been cancelled,
    /// this task will complete once all in-flight requests complete.
    task: tokio::task::JoinHandle<Result<(), anyhow::Error>>,
    halt_token: CancellationToken,
}

impl Listener {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// Get a cancellation token which can be used to start the graceful shutdown of this
    /// listener.
    pub fn halt_token(&self) -> CancellationToken {
        self.halt_token.clone()
    }

    pub async fn wait_to_finish(self) -> anyhow::Result<()> {
        self.task.await?
    }

    /// Stop accepting new connections and wait for in-flight requests to complete.
    pub async fn halt(self) -> anyhow::Result<()> {
        self.halt_token.cancel();
        self.task.await??;

        Ok(())
    }
}

/// Serve the repository on the configured address.
///
/// The TLS configuration is validated and built, and the signing key decoded, before the
/// socket is bound; any problem is returned as an error. This function returns once the
/// listener has been established.
#[instrument(skip_all, err)]
pub async fn listen(config: Config) -> anyhow::Result<Listener> {
    tls::validate(&config.tls)?;
    let tls_context = tls::build(&config.tls)?;
    let state = AppState::from_config(&config)?;
    tracing::info!(tls = ?config.tls.info(), "Loaded configuration");

    let tcp_listener = TcpListener::bind(config.server.listen_address)
        .await
        .with_context(|| format!("failed to bind to {}", config.server.listen_address))?;
    let addr = tcp_listener.local_addr()?;
    let halt_token = CancellationToken::new();
    let app = router(state);

    let tls = tls_context.is_some();
    let task = match tls_context {
        Some(context) => tokio::spawn(
            serve(
                TlsListener::new(tcp_listener, context.acceptor().clone()),
                app,
                halt_token.clone(),
            )
            .instrument(tracing::Span::current()),
        ),
        None => tokio::spawn(
            serve(tcp_listener, app, halt_token.clone()).instrument(tracing::Span::current()),
        ),
    };
    tracing::info!(%addr, tls, "Listening for requests");

    Ok(Listener {
        addr,
        tls,
        task,
        halt_token,
    })
}
