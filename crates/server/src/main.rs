mod config;
mod host_guard;
mod metrics;
mod protection;
mod relay;
mod session;
mod session_store;
mod ssh_client;
mod supervisor;
mod tls;
mod token;
mod turnstile;
mod web;

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::host_guard::HostGuard;
use crate::metrics::Metrics;
use crate::protection::ProtectionState;
use crate::session_store::MemorySessionStore;
use crate::supervisor::Shutdown;
use crate::token::TokenIssuer;
use crate::turnstile::TurnstileClient;
use crate::web::AppState;

/// How long the accept loop waits for in-flight connections to finish
/// closing after a shutdown signal before exiting anyway (spec §4.6).
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(3);

fn parse_args() -> (PathBuf, Option<u16>) {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = PathBuf::from("./config/gateway.toml");
    let mut port_override = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    port_override = args[i + 1].parse().ok();
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }

    (config_path, port_override)
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (config_path, port_override) = parse_args();

    let mut config = config::load_config(&config_path)?;
    if let Some(p) = port_override {
        config.server.port = p;
    }

    if let Err(issues) = config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                tracing::error!("{}", issue);
            } else {
                tracing::warn!("{}", issue);
            }
        }
        if has_errors {
            tracing::error!(
                "Configuration has {} issue(s). Fix the ERROR(s) above and restart.",
                issues.len()
            );
            std::process::exit(1);
        }
    }

    let port = config.server.port;
    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, port)
        .parse()
        .context("Invalid bind address")?;

    let tls_config = tls::build_tls_config(
        config.server.tls_cert.as_deref(),
        config.server.tls_key.as_deref(),
    )?;
    let tls_acceptor = tls::make_acceptor(tls_config);

    // allowed_hosts is validated as IP literals by config.validate(); an
    // empty list means "unrestricted", encoded as None so the host guard
    // and relay don't have to special-case an empty Vec.
    let allowed_hosts = if config.server.allowed_hosts.is_empty() {
        None
    } else {
        Some(
            config
                .server
                .allowed_hosts
                .iter()
                .map(|h| h.parse::<IpAddr>())
                .collect::<Result<Vec<_>, _>>()
                .context("allowed_hosts entry failed to parse as an IP literal")?,
        )
    };

    // The session store is the single source of truth for both
    // authenticated-user state and in-flight challenge tokens — the
    // token issuer's fast_index is only a cache over it, never a second
    // store (see token.rs).
    let session_store: Arc<dyn session_store::SessionStore> = Arc::new(MemorySessionStore::new());
    let tokens = Arc::new(TokenIssuer::new(
        session_store.clone(),
        Duration::from_millis(config.turnstile.token_ttl_ms),
    ));
    let protection = Arc::new(ProtectionState::new(
        config.protection.concurrent_per_ip,
        config.protection.max_ssh_attempts_per_user,
    ));
    let host_guard = Arc::new(HostGuard::new());
    let turnstile = Arc::new(TurnstileClient::new(config.turnstile.clone())?);
    let metrics = Arc::new(Metrics::new());
    let shutdown = Shutdown::new();

    let sweeper = supervisor::spawn_sweeper(protection.clone(), tokens.clone(), shutdown.subscribe());

    let state = Arc::new(AppState {
        config,
        host_guard,
        protection,
        session_store,
        tokens,
        turnstile,
        metrics,
        shutdown: shutdown.clone(),
        allowed_hosts,
        started_at: std::time::Instant::now(),
    });

    let app = web::build_router(Arc::clone(&state))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-");
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        path = %request.uri().path(),
                        request_id = %request_id,
                    )
                })
                .on_request(|_request: &axum::http::Request<_>, _span: &tracing::Span| {
                    tracing::event!(Level::INFO, "started");
                })
                .on_response(
                    |response: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     _span: &tracing::Span| {
                        tracing::event!(
                            Level::INFO,
                            status = %response.status().as_u16(),
                            duration_ms = %latency.as_millis(),
                            "completed"
                        );
                    },
                ),
        )
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!("===========================================");
    tracing::info!("  SSH Gateway Server v0.1.0");
    tracing::info!("  Listening on https://{bind_addr}");
    tracing::info!("===========================================");

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {bind_addr}"))?;

    tracing::info!("Server ready, accepting connections");

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!("Failed to accept TCP connection: {e}");
                        continue;
                    }
                };

                let acceptor = tls_acceptor.clone();
                // Every accepted connection gets its own peer address
                // layered onto a clone of the router, since this manual
                // hyper server (unlike `axum::serve`) has no built-in
                // `ConnectInfo` extractor to carry it to handlers.
                let app = app.clone().layer(axum::Extension(peer_addr));

                tokio::spawn(async move {
                    let tls_stream = match tokio::time::timeout(
                        Duration::from_secs(10),
                        acceptor.accept(stream),
                    ).await {
                        Ok(Ok(s)) => s,
                        Ok(Err(e)) => {
                            tracing::debug!(%peer_addr, "TLS handshake failed: {e}");
                            return;
                        }
                        Err(_) => {
                            tracing::debug!(%peer_addr, "TLS handshake timed out");
                            return;
                        }
                    };

                    let io = hyper_util::rt::TokioIo::new(tls_stream);
                    let hyper_service = hyper_util::service::TowerToHyperService::new(app);
                    let builder = hyper_util::server::conn::auto::Builder::new(
                        hyper_util::rt::TokioExecutor::new(),
                    );

                    if let Err(e) = builder.serve_connection_with_upgrades(io, hyper_service).await {
                        tracing::debug!(%peer_addr, "Connection error: {e}");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
                break;
            }
        }
    }

    // Tell every live relay task to close, then give them a bounded
    // grace period to finish before the process exits out from under
    // them. Sessions are not persisted across a restart — an SSH shell
    // has nothing meaningful to resume into.
    shutdown.trigger();
    sweeper.abort();
    tokio::time::sleep(SHUTDOWN_GRACE_PERIOD).await;

    tracing::info!("SSH gateway shut down cleanly");

    Ok(())
}
