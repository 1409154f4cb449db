use std::sync::Arc;

use anyhow::Context;
use cloudplay_agent::agent::{ActivePeer, Agent, AgentOptions, DEFAULT_CONNECT_TIMEOUT};
use cloudplay_agent::broadcast::Broadcast;
use cloudplay_agent::cli::{self, Invocation};
use cloudplay_agent::input::LoggingSink;
use cloudplay_agent::media::{SampleSink, serve_media};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = match cli::parse_args(std::env::args().skip(1))? {
        Invocation::Run(args) => args,
        Invocation::Help => {
            println!("{}", cli::help_text());
            return Ok(());
        }
        Invocation::Version => {
            println!("cloudplay-agent {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
    };

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let channel = Channel::from_shared(args.broker_url.clone())
        .context("Invalid --broker-url")?
        .connect()
        .await
        .with_context(|| format!("Failed to connect to broker at {}", args.broker_url))?;
    info!(broker = %args.broker_url, host_id = %args.host_id, "Connected to broker");

    let (areas, broadcast_task) = Broadcast::start(shutdown.clone());
    let active = Arc::new(ActivePeer::default());

    let listener = TcpListener::bind(args.media_addr)
        .await
        .with_context(|| format!("Failed to bind media listener on {}", args.media_addr))?;
    info!(addr = %args.media_addr, "Waiting for the media streamer");
    let media_task = tokio::spawn(serve_media(
        listener,
        Arc::clone(&active) as Arc<dyn SampleSink>,
        areas.subscribe().await?,
        Some(args.capture_area),
        shutdown.clone(),
    ));

    let options = AgentOptions {
        host_id: args.host_id,
        ice: args.ice,
        watch: args.watch,
        poll: args.poll,
        capture_area: args.capture_area,
        launch_game: args.launch_game,
        connect_timeout: DEFAULT_CONNECT_TIMEOUT,
    };
    let mut agent = Agent::new(options, channel, areas, active, Box::new(LoggingSink));
    let result = agent.run(&shutdown).await;

    shutdown.cancel();
    if let Err(e) = media_task.await {
        warn!("Media ingest task failed: {e}");
    }
    if let Err(e) = broadcast_task.await {
        warn!("Capture-area broadcast task failed: {e}");
    }
    info!("Agent stopped");
    result
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
            tracing::info!("Received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, shutting down");
        }
    }
    shutdown.cancel();
}
