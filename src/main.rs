use tokio_util::sync::CancellationToken;

use wep::config::WorkerConfig;
use wep::server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = WorkerConfig::from_env()?;

    eprintln!("WEP v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Worker: {}", config.worker_id);
    eprintln!("   Task stream: ws://{}/ws", config.listen_addr());
    eprintln!("   Health: http://{}/health", config.listen_addr());
    if let Some(ref path) = config.spec_path {
        eprintln!("   Specifications: {}", path.display());
    }
    eprintln!("   Concurrency: {}\n", config.max_concurrency);

    // ── Shutdown ─────────────────────────────────────────────────────────
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                return;
            }
            tracing::info!("Shutdown requested, draining sessions");
            shutdown.cancel();
        });
    }

    server::run(&config, shutdown).await?;
    Ok(())
}
