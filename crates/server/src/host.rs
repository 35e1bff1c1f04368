// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Server Host: accepts connections, enforces global limits, and
//! coordinates graceful shutdown.
//!
//! TLS terminates here via a small `axum::serve::Listener` adapter so the
//! rest of the stack (router, session pump) stays transport-agnostic; the
//! plain-TCP path uses `axum::serve` directly.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use rustls_pemfile::{certs, private_key};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::session;
use crate::state::AppState;

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> axum::response::Response {
    if !state.check_connection_rate(addr.ip()).await {
        return (StatusCode::TOO_MANY_REQUESTS, "connection rate limit exceeded").into_response();
    }
    if !state.try_acquire_connection() {
        return (StatusCode::SERVICE_UNAVAILABLE, "max connections reached").into_response();
    }

    let max_size = state.config.message_size_limit;
    ws.max_message_size(max_size).on_upgrade(move |socket| async move {
        session::run(state.clone(), socket).await;
    })
}

fn build_router(state: Arc<AppState>, ws_path: &str) -> Router {
    Router::new().route(ws_path, get(ws_handler)).layer(TraceLayer::new_for_http()).with_state(state)
}

/// Loads a `rustls::ServerConfig` from the configured PEM cert chain and
/// private key, restricted to the configured minimum protocol version.
fn load_tls_config(config: &ServerConfig) -> anyhow::Result<rustls::ServerConfig> {
    let cert_path = config.tls_cert.as_ref().ok_or_else(|| anyhow::anyhow!("tls_cert not configured"))?;
    let key_path = config.tls_key.as_ref().ok_or_else(|| anyhow::anyhow!("tls_key not configured"))?;

    let cert_file = std::fs::File::open(cert_path)
        .map_err(|e| anyhow::anyhow!("failed to open TLS cert {}: {e}", cert_path.display()))?;
    let chain: Vec<_> =
        certs(&mut io::BufReader::new(cert_file)).collect::<Result<_, _>>().map_err(|e| {
            anyhow::anyhow!("failed to parse TLS cert chain {}: {e}", cert_path.display())
        })?;

    let key_file = std::fs::File::open(key_path)
        .map_err(|e| anyhow::anyhow!("failed to open TLS key {}: {e}", key_path.display()))?;
    let key = private_key(&mut io::BufReader::new(key_file))
        .map_err(|e| anyhow::anyhow!("failed to parse TLS key {}: {e}", key_path.display()))?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {}", key_path.display()))?;

    let versions: &[&rustls::SupportedProtocolVersion] = match config.tls_min_version.as_str() {
        "1.3" => &[&rustls::version::TLS13],
        _ => &[&rustls::version::TLS12, &rustls::version::TLS13],
    };

    let names = config.tls_cipher_suite_names();
    let mut provider = rustls::crypto::ring::default_provider();
    if !names.is_empty() {
        let filtered: Vec<_> = provider
            .cipher_suites
            .iter()
            .filter(|s| names.iter().any(|n| format!("{:?}", s.suite()).eq_ignore_ascii_case(n)))
            .cloned()
            .collect();
        if filtered.is_empty() {
            warn!(?names, "none of the configured cipher suites matched the ring provider; using defaults");
        } else {
            provider.cipher_suites = filtered;
        }
    }

    let server_config = rustls::ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(versions)
        .map_err(|e| anyhow::anyhow!("failed to build TLS protocol version set: {e}"))?
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|e| anyhow::anyhow!("failed to build TLS server config: {e}"))?;

    Ok(server_config)
}

/// Adapts a `TcpListener` + `TlsAcceptor` pair to `axum::serve::Listener` so
/// TLS termination composes with `axum::serve` the same way the plain-TCP
/// path does.
struct TlsListener {
    inner: TcpListener,
    acceptor: TlsAcceptor,
}

impl axum::serve::Listener for TlsListener {
    type Io = tokio_rustls::server::TlsStream<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            let (stream, addr) = match self.inner.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "TCP accept failed");
                    continue;
                }
            };
            match self.acceptor.accept(stream).await {
                Ok(tls) => return (tls, addr),
                Err(e) => {
                    warn!(error = %e, peer = %addr, "TLS handshake failed");
                    continue;
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}

/// Binds the configured address and serves until `state.shutdown` fires,
/// then returns once the listener has stopped accepting. Cancelling
/// in-flight executions and persisting state is the caller's (`lib::run`)
/// responsibility, run after this function returns.
pub async fn serve(state: Arc<AppState>) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let tcp = TcpListener::bind(&addr).await.map_err(|e| anyhow::anyhow!("failed to bind {addr}: {e}"))?;
    let router =
        build_router(state.clone(), &state.config.ws_path).into_make_service_with_connect_info::<SocketAddr>();
    let shutdown = state.shutdown.clone();

    if state.config.tls_cert.is_some() {
        let tls_config = load_tls_config(&state.config)?;
        let acceptor = TlsAcceptor::from(Arc::new(tls_config));
        let listener = TlsListener { inner: tcp, acceptor };
        info!(%addr, "agentbridge-server listening (tls)");
        axum::serve(listener, router).with_graceful_shutdown(shutdown.cancelled_owned()).await?;
    } else {
        info!(%addr, "agentbridge-server listening (plaintext)");
        axum::serve(tcp, router).with_graceful_shutdown(shutdown.cancelled_owned()).await?;
    }

    Ok(())
}
