use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use framesight::config::Config;

#[derive(Parser)]
#[command(name = "framesight", version)]
struct Args {
    /// Path to the TOML config file.
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = Config::load(args.config.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log.level)),
        )
        .init();

    cfg.validate()?;

    let listener = TcpListener::bind(cfg.http.listen).await?;
    info!("listening on {}", cfg.http.listen);

    framesight::server_up(cfg, listener, shutdown_signal()).await
}

/// Waits for a signal that requests a graceful shutdown, SIGTERM or SIGINT.
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut signal_terminate = signal(SignalKind::terminate()).unwrap();
    let mut signal_interrupt = signal(SignalKind::interrupt()).unwrap();

    tokio::select! {
        _ = signal_terminate.recv() => info!("received SIGTERM"),
        _ = signal_interrupt.recv() => info!("received SIGINT"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("received CTRL_C");
}
