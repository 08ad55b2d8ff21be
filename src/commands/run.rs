//! `run` subcommand: the default production mode. Starts the source
//! adapters, ingestion workers, webhook dispatcher, read/feeder API, and
//! metrics server together in one process (spec §2, §5), and shuts them
//! down in the order §5 prescribes: adapters first, then let workers and
//! dispatchers drain in-flight messages for a grace period.

use std::sync::Arc;

use anyhow::{Context, Result};
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::PgConnection;
use tracing::{info, warn};

use flyoverhead_ingest::config::Config;
use flyoverhead_ingest::governor::Governor;
use flyoverhead_ingest::hot_cache::LiveStateCache;
use flyoverhead_ingest::ingest_worker::IngestWorker;
use flyoverhead_ingest::instance_lock::InstanceLock;
use flyoverhead_ingest::metrics;
use flyoverhead_ingest::queue::RedisQueue;
use flyoverhead_ingest::source_adapters::feeder::FeederAdapter;
use flyoverhead_ingest::source_adapters::global_public::GlobalPublicAdapter;
use flyoverhead_ingest::source_adapters::regional_commercial::RegionalCommercialAdapter;
use flyoverhead_ingest::state_repository::StateRepository;
use flyoverhead_ingest::web;
use flyoverhead_ingest::webhook::dispatcher::WebhookDispatcher;
use flyoverhead_ingest::webhook::publisher::WebhookPublisher;

type PgPool = Pool<ConnectionManager<PgConnection>>;

/// Regional-commercial cell grid size, degrees. 5-degree cells keep the
/// cell count manageable worldwide while still letting the adaptive
/// per-cell interval (`regional_commercial.rs`) back off quiet regions
/// independently of busy ones.
const REGIONAL_CELL_SIZE_DEGREES: f64 = 5.0;

pub async fn handle_run(
    config: Config,
    web_interface: String,
    web_port: u16,
    metrics_port: u16,
) -> Result<()> {
    let _lock = InstanceLock::new("flyoverhead-run").context("another instance is already running")?;

    metrics::install_recorder();
    metrics::initialize_ingest_metrics();
    tokio::spawn(metrics::process_metrics_task());

    let manager = ConnectionManager::<PgConnection>::new(config.database_url.clone());
    let pool: PgPool = Pool::builder()
        .build(manager)
        .context("failed to build database connection pool")?;

    let redis_client = redis::Client::open(config.redis_url.clone())
        .context("failed to construct redis client")?;

    let ingest_queue = RedisQueue::new(redis_client.clone(), flyoverhead_ingest::config::INGEST_QUEUE_PREFIX);
    let webhook_queue = RedisQueue::new(redis_client.clone(), flyoverhead_ingest::config::WEBHOOK_QUEUE_PREFIX);

    let webhook_governor = Governor::new(
        redis_client.clone(),
        "flyoverhead:webhooks",
        config.breaker_threshold,
        config.breaker_reset,
    );
    let feeder_governor = Governor::new(
        redis_client.clone(),
        "flyoverhead:feeders",
        config.breaker_threshold,
        config.breaker_reset,
    );

    let repository = Arc::new(StateRepository::new(pool.clone()));
    let cache = Arc::new(LiveStateCache::new(config.cache_max_entries, config.cache_ttl));
    let publisher = Arc::new(WebhookPublisher::new(pool.clone(), webhook_queue.clone()));
    let feeder_adapter = Arc::new(FeederAdapter::new(pool.clone(), ingest_queue.clone(), feeder_governor));

    // Source adapters are tracked separately from worker/dispatcher tasks:
    // on shutdown they must stop immediately (spec §5), while workers and
    // dispatchers get a grace period to finish in-flight messages first.
    let mut adapter_tasks = Vec::new();
    let mut tasks = Vec::new();

    for i in 0..config.ingest_workers {
        let worker = IngestWorker::new(
            ingest_queue.clone(),
            Arc::clone(&repository),
            Arc::clone(&cache),
            Arc::clone(&publisher),
            config.clone(),
        );
        let poll_timeout = config.poll_timeout;
        tasks.push(tokio::spawn(async move {
            info!(worker = i, "ingest worker started");
            loop {
                if let Err(e) = worker.run_once().await {
                    warn!(worker = i, error = %e, "ingest worker iteration failed");
                    tokio::time::sleep(poll_timeout).await;
                }
            }
        }));
    }

    for i in 0..config.dispatch_workers {
        let dispatcher = WebhookDispatcher::new(
            pool.clone(),
            webhook_queue.clone(),
            webhook_governor.clone(),
            &config,
        )?;
        let poll_timeout = config.poll_timeout;
        tasks.push(tokio::spawn(async move {
            info!(dispatcher = i, "webhook dispatcher started");
            loop {
                if let Err(e) = dispatcher.run_once(poll_timeout).await {
                    warn!(dispatcher = i, error = %e, "webhook dispatcher iteration failed");
                    tokio::time::sleep(poll_timeout).await;
                }
            }
        }));
    }

    {
        let global_public = GlobalPublicAdapter::new(
            std::env::var("GLOBAL_PUBLIC_BASE_URL")
                .unwrap_or_else(|_| "https://opensky-network.org/api".to_string()),
            std::env::var("GLOBAL_PUBLIC_USERNAME")
                .ok()
                .zip(std::env::var("GLOBAL_PUBLIC_PASSWORD").ok()),
            ingest_queue.clone(),
        );
        let interval = config.public_poll_interval;
        adapter_tasks.push(tokio::spawn(async move {
            info!("global-public source adapter started");
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                global_public.poll_once().await;
            }
        }));
    }

    if let Ok(base_url) = std::env::var("REGIONAL_COMMERCIAL_BASE_URL") {
        let api_key = std::env::var("REGIONAL_COMMERCIAL_API_KEY").unwrap_or_default();
        let regional = RegionalCommercialAdapter::new(
            base_url,
            api_key,
            ingest_queue.clone(),
            REGIONAL_CELL_SIZE_DEGREES,
            config.commercial_rate_per_sec,
        );
        adapter_tasks.push(tokio::spawn(async move {
            info!("regional-commercial source adapter started");
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(5));
            loop {
                ticker.tick().await;
                regional.poll_once().await;
            }
        }));
    } else {
        info!("REGIONAL_COMMERCIAL_BASE_URL not set, regional-commercial adapter disabled");
    }

    tokio::spawn(metrics::start_metrics_server(metrics_port));

    let web_server = web::start_web_server(web_interface, web_port, cache, repository, feeder_adapter, &config);

    tokio::select! {
        result = web_server => {
            if let Err(e) = result {
                warn!(error = %e, "web server exited");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received, draining in-flight work");
        }
    }

    info!("stopping source adapters");
    for task in adapter_tasks {
        task.abort();
    }

    info!(
        grace_secs = config.shutdown_grace.as_secs(),
        "waiting for in-flight worker/dispatcher messages to complete"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    for task in tasks {
        task.abort();
    }

    Ok(())
}
