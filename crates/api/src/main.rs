use std::sync::Arc;

use anyhow::Context;

use flagsched_api::app::{build_app, build_services};
use flagsched_api::config::JobConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    flagsched_observability::init();

    let config = JobConfig::from_env().context("invalid configuration")?;
    let services = build_services(&config)
        .await
        .context("failed to connect to the database")?;

    let app = build_app(Arc::new(services));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
