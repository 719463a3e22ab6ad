//! Post publishing worker binary.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use linkpost_linkedin::LinkedInClient;
use linkpost_queue::{JobBackend, PostScheduler, QueueConfig, RedisJobQueue};
use linkpost_service::PostService;
use linkpost_store::PgStore;
use linkpost_worker::{metrics, JobExecutor, PublishHandler, WorkerConfig};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Worker failed: {:#}", e);
        std::process::exit(1);
    }
}

fn init_tracing() -> anyhow::Result<()> {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"))
        .add_directive("linkpost=info".parse()?)
        .add_directive("sqlx=warn".parse()?);

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    // Install rustls crypto provider (required for TLS/HTTPS)
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    dotenvy::dotenv().ok();
    init_tracing()?;

    info!("Starting linkpost-worker");

    let config = WorkerConfig::from_env();
    info!("Worker config: {:?}", config);

    if let Some(port) = std::env::var("METRICS_PORT").ok().and_then(|p| p.parse::<u16>().ok()) {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        metrics::init_metrics(addr).context("Failed to start Prometheus exporter")?;
        info!("Prometheus metrics on {}", addr);
    }

    let store = Arc::new(PgStore::from_env().await.context("Failed to connect to Postgres")?);
    store.migrate().await.context("Failed to run migrations")?;

    let queue_config = QueueConfig::from_env();
    let retry_policy = queue_config.retry_policy();
    let queue = RedisJobQueue::new(queue_config).context("Failed to create job queue")?;
    queue.ping().await.context("Failed to reach Redis")?;
    let backend: Arc<dyn JobBackend> = Arc::new(queue);

    let linkedin = Arc::new(LinkedInClient::from_env().context("Failed to create LinkedIn client")?);

    let handler = PublishHandler::new(
        store.clone(),
        store.clone(),
        store.clone(),
        linkedin.clone(),
        linkedin,
        config.publish_timeout,
    );

    let reconcile_interval = config.reconcile_interval;
    let executor = Arc::new(JobExecutor::new(config, backend.clone(), handler)?);

    if !reconcile_interval.is_zero() {
        let service = PostService::new(store.clone(), PostScheduler::new(backend, retry_policy));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(reconcile_interval);
            loop {
                interval.tick().await;
                match service.reconcile_overdue().await {
                    Ok(0) => {}
                    Ok(n) => info!("Re-enqueued {} overdue post(s)", n),
                    Err(e) => warn!("Reconcile sweep failed: {}", e),
                }
            }
        });
    }

    let signal_executor = Arc::clone(&executor);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
        signal_executor.shutdown();
    });

    executor.run().await?;

    info!("Worker shutdown complete");
    Ok(())
}
