//! Service binary entry point

use insight_artifacts::run_sweeper;
use insight_server::{start_server, AppConfig, AppState};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How often the orphan sweeper runs.
const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10 * 60);

/// Minimum artifact age before the sweeper considers it orphaned.
const SWEEP_RETENTION_MINUTES: i64 = 60;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "insight_server=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::default();
    config.validate()?;

    let state = AppState::from_config(&config);

    // Crash net for work trees whose completion unit never ran.
    tokio::spawn(run_sweeper(
        state.artifacts.clone(),
        Arc::new(state.orchestrator.clone()),
        SWEEP_INTERVAL,
        chrono::Duration::minutes(SWEEP_RETENTION_MINUTES),
    ));

    tracing::info!("video insight service starting");
    start_server(&config.bind_addr, state).await?;
    Ok(())
}
