use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use kiln::bus::{EventBus, LocalBus};
use kiln::config::Config;
use kiln::db::Db;
use kiln::providers::http::{HttpImageGenerator, HttpModelGenerator};
use kiln::queue::{JobQueue, QueueName, run_consumer};
use kiln::registry::SubscriptionRegistry;
use kiln::storage::{FsObjectStore, ObjectStore};
use kiln::store::Store;
use kiln::sweeper::OrphanSweeper;
use kiln::workers::WorkerSettings;
use kiln::workers::image::ImageWorker;
use kiln::workers::model::ModelWorker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    // Load .env file if present (silently ignored if missing)
    dotenvy::dotenv().ok();

    tracing::info!("kiln starting");

    let config = Config::from_env();
    let db = Arc::new(Db::open(&config.db_path)?);
    let store = Arc::new(Store::new(db.clone(), config.proxy_base.clone()));
    let storage: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(
        config.storage_root.clone(),
        config.storage_public_base.clone(),
    ));
    let queue = Arc::new(JobQueue::new(db.clone()));
    let bus: Arc<dyn EventBus> = Arc::new(LocalBus::new());

    // Jobs left claimed by a previous process go back to pending.
    let recovered = queue.recover_claimed().await?;
    if recovered > 0 {
        tracing::info!(recovered, "requeued jobs from a previous run");
    }

    let shutdown = CancellationToken::new();

    let registry = Arc::new(SubscriptionRegistry::new(
        store.clone(),
        config.heartbeat_interval,
    ));
    registry.spawn_pump(bus.as_ref(), shutdown.clone());

    let mut consumers = Vec::new();

    match config.image_provider.clone() {
        Some(endpoint) => {
            let worker = Arc::new(ImageWorker::new(
                store.clone(),
                storage.clone(),
                Arc::new(HttpImageGenerator::new(endpoint, config.image_call_timeout)),
                bus.clone(),
                WorkerSettings {
                    proxy_base: config.proxy_base.clone(),
                    job_timeout: config.image_job_timeout,
                    backoff_base: config.backoff_base,
                    storage_timeout: config.storage_timeout,
                    poll_interval: config.model_poll_interval,
                },
            ));
            consumers.push(tokio::spawn(run_consumer(
                queue.clone(),
                QueueName::Image,
                config.image_concurrency,
                config.image_job_timeout,
                config.backoff_base,
                worker,
                shutdown.clone(),
            )));
        }
        None => tracing::warn!("no image provider configured: image queue idle"),
    }

    match config.model_provider.clone() {
        Some(endpoint) => {
            let worker = Arc::new(ModelWorker::new(
                store.clone(),
                storage.clone(),
                Arc::new(HttpModelGenerator::new(
                    endpoint,
                    config.model_submit_timeout,
                    config.model_poll_timeout,
                    config.storage_timeout,
                )),
                bus.clone(),
                WorkerSettings {
                    proxy_base: config.proxy_base.clone(),
                    job_timeout: config.model_job_timeout,
                    backoff_base: config.backoff_base,
                    storage_timeout: config.storage_timeout,
                    poll_interval: config.model_poll_interval,
                },
            ));
            consumers.push(tokio::spawn(run_consumer(
                queue.clone(),
                QueueName::Model,
                config.model_concurrency,
                config.model_job_timeout,
                config.backoff_base,
                worker,
                shutdown.clone(),
            )));
        }
        None => tracing::warn!("no 3D provider configured: model queue idle"),
    }

    let sweeper = OrphanSweeper::new(
        store.clone(),
        storage.clone(),
        config.sweep_interval,
        config.sweep_batch_size,
        config.sweep_max_retries,
    );
    let sweeper_handle = tokio::spawn(sweeper.run(shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    tracing::info!("kiln shutting down");
    shutdown.cancel();

    consumers.push(sweeper_handle);
    futures_util::future::join_all(consumers).await;

    Ok(())
}
