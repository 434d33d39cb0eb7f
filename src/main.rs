use std::sync::Arc;

use dinegate::rate_limit::spawn_sweeper;
use dinegate::{app, build_state_from_env, SHUTDOWN_LOG_GRACE};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging. Reads RUST_LOG environment variable.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let (config, state) = build_state_from_env()?;
    tracing::info!(models = %state.models, "model routes bound");

    let cancel = CancellationToken::new();
    let sweeper = spawn_sweeper(
        Arc::clone(&state.rate_limiter),
        config.sweep_interval,
        cancel.clone(),
    );
    let logger = state.logger.clone();

    let addr: std::net::SocketAddr = ([0, 0, 0, 0], config.port).into();
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("listening on {}", addr);
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cancel.cancel();
    let _ = sweeper.await;
    if logger.drain(SHUTDOWN_LOG_GRACE).await {
        tracing::info!("conversation log drained");
    }
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
