use anyhow::Context;

use rentflow_infra::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load().context("failed to load configuration")?;
    rentflow_observability::init_with(&config.log);

    let app = rentflow_api::app::build_app(config.engine.clone());

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind_addr))?;

    tracing::info!(
        addr = %listener.local_addr()?,
        grace_period_days = config.engine.grace_period_days,
        "listening"
    );

    axum::serve(listener, app).await?;
    Ok(())
}
