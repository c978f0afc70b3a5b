use anyhow::Context;
use exchange_backend::config::Config;
use exchange_backend::{app, telemetry, AppState};
use std::net::SocketAddr;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    telemetry::init_tracing(config.log_json);

    let state = AppState::from_config(&config).await?;
    let app = app(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "gift exchange listening");
    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}
