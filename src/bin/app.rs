use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;
use ultrazend::config::Config;
use ultrazend::{init_tracing, run_api, run_periodic, run_smtp, run_workers, shutdown_signal, storage, AppContext};

/// All-in-one process: API, SMTP listeners, delivery workers, and periodic
/// maintenance in a single binary, for small deployments that don't need
/// the roles split across processes.
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

    let api_handle = run_api(&ctx, shutdown.clone()).await.context("failed to start API server")?;
    run_smtp(&ctx, shutdown.clone()).await.context("failed to start SMTP listeners")?;

    let worker_handle = tokio::spawn({
        let ctx = ctx.clone();
        let shutdown = shutdown.clone();
        let worker_id = format!("worker-{}", std::process::id());
        async move { run_workers(&ctx, worker_id, concurrency, shutdown).await }
    });

    let periodic_handle = tokio::spawn({
        let ctx = ctx.clone();
        let shutdown = shutdown.clone();
        async move { run_periodic(&ctx, shutdown).await }
    });

    shutdown_signal(shutdown.clone()).await;
    info!("received shutdown signal, stopping services");
    shutdown.cancel();

    api_handle.await.ok();
    worker_handle.await.ok();
    periodic_handle.await.ok();

    Ok(())
}
