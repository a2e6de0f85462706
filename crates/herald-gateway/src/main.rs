use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use herald_core::config::HeraldConfig;
use herald_gateway::{build_router, start_pipeline, AppState};
use herald_store::SqliteStore;
use herald_telegram::TelegramSink;
use tracing::{error, info};

/// Scheduled publication dispatcher.
#[derive(Debug, Parser)]
#[command(name = "herald", version, about)]
struct Cli {
    /// Config file (defaults to $HERALD_CONFIG, then ~/.herald/herald.toml).
    #[arg(short, long)]
    config: Option<String>,

    /// Run the pipeline without the HTTP surface.
    #[arg(long)]
    no_http: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "herald=info,herald_gateway=info,herald_scheduler=info,herald_worker=info,\
                 herald_store=info,herald_channel=info,herald_telegram=info,tower_http=debug"
                    .into()
            }),
        )
        .init();

    let cli = Cli::parse();

    // load config: --config > HERALD_CONFIG env > ~/.herald/herald.toml
    let config_path = cli.config.or_else(|| std::env::var("HERALD_CONFIG").ok());
    let config = HeraldConfig::load(config_path.as_deref()).context("loading configuration")?;

    let db_path = &config.database.path;
    ensure_parent_dir(db_path)?;
    info!(path = %db_path, "opening SQLite database");
    let store = Arc::new(SqliteStore::open(db_path).context("opening publication store")?);

    let channel = herald_channel::connect(&config.channel).context("connecting event channel")?;
    info!(backend = ?config.channel.backend, topic = %config.channel.topic, "event channel ready");

    let sink = Arc::new(TelegramSink::with_platform(config.worker.platform.clone()));
    let supervisor = start_pipeline(&config, store.clone(), channel, sink);

    let http = if config.gateway.enabled && !cli.no_http {
        let addr: SocketAddr = format!("{}:{}", config.gateway.bind, config.gateway.port)
            .parse()
            .context("parsing gateway bind address")?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding {addr}"))?;
        info!("Herald gateway listening on {}", addr);

        let router = build_router(Arc::new(AppState::new(config.clone(), store)));
        let stop = supervisor.token();
        Some(tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await
        }))
    } else {
        info!("HTTP surface disabled");
        None
    };

    shutdown_signal().await;

    let result = supervisor.shutdown().await;
    if let Some(handle) = http {
        match handle.await {
            Ok(Ok(())) => info!("HTTP server stopped"),
            Ok(Err(e)) => error!(error = %e, "HTTP server failed"),
            Err(e) => error!(error = %e, "HTTP server task panicked"),
        }
    }
    result.context("pipeline shutdown")?;
    info!("shutdown complete");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "cannot listen for Ctrl-C");
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
                error!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("interrupt received, shutting down"),
        _ = terminate => info!("terminate received, shutting down"),
    }
}

fn ensure_parent_dir(path: &str) -> anyhow::Result<()> {
    match std::path::Path::new(path).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent)
            .with_context(|| format!("creating database directory {}", parent.display())),
        _ => Ok(()),
    }
}
