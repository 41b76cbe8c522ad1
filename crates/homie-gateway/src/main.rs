use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod app;
mod cli;
mod health;

#[derive(Parser, Debug)]
#[command(name = "openhomie", about = "Friend-bot runtime")]
struct Args {
    /// Path to openhomie.toml (default: ~/.openhomie/openhomie.toml).
    #[arg(long)]
    config: Option<String>,

    /// Identity directory override.
    #[arg(long)]
    identity: Option<String>,

    /// Health endpoint bind address.
    #[arg(long, default_value = "127.0.0.1:8787")]
    health_addr: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "openhomie=info,homie_engine=info".into()),
        )
        .init();

    let args = Args::parse();

    let mut config = homie_core::config::OpenhomieConfig::load(args.config.as_deref())
        .unwrap_or_else(|e| {
            warn!("config load failed ({e}); using defaults");
            homie_core::config::OpenhomieConfig::default()
        });
    if let Some(identity) = args.identity {
        config.paths.identity_dir = identity;
    }

    let state = Arc::new(app::AppState::build(config)?);
    let cancel = CancellationToken::new();

    // Health endpoint.
    let router = health::router(Arc::clone(&state));
    let addr: std::net::SocketAddr = args.health_addr.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "health endpoint listening");
    let health_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router)
            .with_graceful_shutdown(async move { health_cancel.cancelled().await })
            .await;
    });

    // Proactive heartbeat.
    let _proactive_loop = if state.config.proactive.enabled {
        Some(Arc::clone(&state.dispatcher).spawn_loop(cancel.clone()))
    } else {
        None
    };

    // Feedback finalization pass rides the same supervision.
    let _finalize_loop = state.spawn_finalize_loop(cancel.clone());

    // CLI transport until ctrl-c or stdin EOF.
    let cli_state = Arc::clone(&state);
    let cli_cancel = cancel.clone();
    let cli_task = tokio::spawn(async move { cli::run(cli_state, cli_cancel).await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl-c received; shutting down");
        }
        _ = cli_task => {
            info!("cli transport finished; shutting down");
        }
    }

    state.lifecycle.begin_shutdown();
    cancel.cancel();
    // Grace period for in-flight turns to observe cancellation and drain.
    tokio::time::sleep(Duration::from_secs(2)).await;
    info!("shutdown complete");
    Ok(())
}
