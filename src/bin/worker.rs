use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;
use ultrazend::config::Config;
use ultrazend::{init_tracing, run_workers, shutdown_signal, storage, AppContext};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Config::from_env().context("failed to load configuration")?;
    let concurrency = config.worker.delivery_concurrency;
    let pool = storage::connect(&config).await.context("failed to connect to storage")?;
    storage::migrate(&pool).await.context("failed to run migrations")?;

    let shutdown = CancellationToken::new();
    let ctx = AppContext::build(pool, config).await.context("failed to build application context")?;

    let worker_id = format!("worker-{}", std::process::id());
    let run = tokio::spawn({
        let ctx = ctx.clone();
        let shutdown = shutdown.clone();
        async move { run_workers(&ctx, worker_id, concurrency, shutdown).await }
    });

    shutdown_signal(shutdown.clone()).await;
    info!("received shutdown signal, stopping delivery workers");
    shutdown.cancel();
    run.await.ok();

    Ok(())
}
