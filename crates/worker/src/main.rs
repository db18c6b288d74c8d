use drowl_infra::{Engine, EngineConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    drowl_observability::init();

    let config = EngineConfig::from_env()?;
    let engine = Engine::new(config)?;

    engine.start().await;
    tracing::info!(workers = engine.config().worker_count, "drowl worker running; ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    engine.shutdown().await;
    Ok(())
}
