use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;
use ultrazend::config::Config;
use ultrazend::{init_tracing, run_api, shutdown_signal, storage, AppContext};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Config::from_env().context("failed to load configuration")?;
    let pool = storage::connect(&config).await.context("failed to connect to storage")?;
    storage::migrate(&pool).await.context("failed to run migrations")?;

    let shutdown = CancellationToken::new();
    let ctx = AppContext::build(pool, config).await.context("failed to build application context")?;

    let handle = run_api(&ctx, shutdown.clone()).await.context("failed to start API server")?;

    shutdown_signal(shutdown.clone()).await;
    info!("received shutdown signal, stopping API server");
    shutdown.cancel();
    handle.await.ok();

    Ok(())
}
