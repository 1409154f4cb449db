use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use cloudplay_server::{build_broker, config, grpc, tls, web};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use web::AppState;

struct Args {
    config_path: PathBuf,
    http_port: Option<u16>,
    grpc_port: Option<u16>,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args {
        config_path: PathBuf::from("./config/cloudplay.toml"),
        http_port: None,
        grpc_port: None,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    parsed.config_path = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--http-port" => {
                if i + 1 < args.len() {
                    parsed.http_port = args[i + 1].parse().ok();
                    i += 1;
                }
            }
            "--grpc-port" => {
                if i + 1 < args.len() {
                    parsed.grpc_port = args[i + 1].parse().ok();
                    i += 1;
                }
            }
            other => tracing::warn!("Ignoring unknown argument: {other}"),
        }
        i += 1;
    }

    parsed
}

#[tokio::main]
async fn main() -> Result<()> {
    // Already installed is fine.
    let _ = rustls::crypto::ring::default_provider().install_default();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = parse_args();

    let mut config = config::load_config(&args.config_path)?;
    if let Some(p) = args.http_port {
        config.server.http_port = p;
    }
    if let Some(p) = args.grpc_port {
        config.server.grpc_port = p;
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

    let http_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.http_port)
        .parse()
        .context("Invalid HTTP bind address")?;
    let grpc_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.grpc_port)
        .parse()
        .context("Invalid gRPC bind address")?;

    let broker = build_broker(&config)?;
    let watch_interval = Duration::from_millis(config.signaling.watch_interval_ms);
    let use_tls = config.server.tls;
    let tls_acceptor = if use_tls {
        let setup = tls::build_tls_config(
            config.server.tls_cert.as_deref(),
            config.server.tls_key.as_deref(),
        )?;
        Some(tls::make_acceptor(setup.config))
    } else {
        None
    };

    let state = Arc::new(AppState {
        config,
        broker: Arc::clone(&broker),
        started_at: std::time::Instant::now(),
    });
    let app = web::with_request_tracing(web::build_router(state));

    let http_listener = TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("Failed to bind to {http_addr}"))?;
    let grpc_listener = TcpListener::bind(grpc_addr)
        .await
        .with_context(|| format!("Failed to bind to {grpc_addr}"))?;

    let scheme = if use_tls { "https" } else { "http" };
    tracing::info!("===========================================");
    tracing::info!("  Cloudplay broker v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("  Players: {scheme}://{http_addr}");
    tracing::info!("  Hosts (gRPC): {grpc_addr}");
    tracing::info!("===========================================");

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let grpc_task = tokio::spawn(grpc::serve(
        grpc_listener,
        broker,
        watch_interval,
        shutdown.clone().cancelled_owned(),
    ));

    match tls_acceptor {
        Some(acceptor) => serve_tls(http_listener, acceptor, app, &shutdown).await,
        None => {
            axum::serve(http_listener, app)
                .with_graceful_shutdown(shutdown.clone().cancelled_owned())
                .await
                .context("HTTP server failed")?;
        }
    }

    // The HTTP side may have stopped on its own; take gRPC down with it.
    shutdown.cancel();
    grpc_task
        .await
        .context("gRPC task panicked")?
        .context("gRPC server failed")?;

    tracing::info!("Cloudplay broker shut down cleanly");
    Ok(())
}

async fn wait_for_signal(shutdown: CancellationToken) {
    let mut sigterm =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
                shutdown.cancel();
                return;
            }
        };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received SIGINT, initiating graceful shutdown");
        }
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
    shutdown.cancel();
}

/// Accept TLS connections and serve them with axum until shutdown.
async fn serve_tls(
    listener: TcpListener,
    acceptor: tokio_rustls::TlsAcceptor,
    app: Router,
    shutdown: &CancellationToken,
) {
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

                let acceptor = acceptor.clone();
                let app = app.clone();

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
            _ = shutdown.cancelled() => break,
        }
    }
}
