use anyhow::{Context, Result};
use std::sync::Arc;
use tally_core::{Clock, SystemClock};
use tally_gate::config::load_config;
use tally_gate::identity::build_backend;
use tally_gate::logging::init_logging;
use tally_gate::{build_router, AppState};
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;
    let log_guard = init_logging(&config);
    if let Some(path) = log_guard.as_ref().and_then(|guard| guard.current_path()) {
        info!(event = "log_file", path = %path.display());
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let identity = build_backend(&config.identity, config.secure_cookies, clock.clone())?;
    let state = AppState::new(config.policy.clone(), identity, clock)
        .with_lifetime_policy(config.lifetime_policy)
        .with_production(config.production);
    let app = build_router(Arc::new(state));

    let listener = TcpListener::bind(&config.addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.addr))?;
    info!(
        event = "gate_start",
        addr = %config.addr,
        freshness_window_ms = config.policy.freshness_window_ms,
        lifetime_policy = ?config.lifetime_policy,
        production = config.production
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;
    info!(event = "gate_stop");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
