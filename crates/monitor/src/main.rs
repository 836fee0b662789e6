use anyhow::Context;
use k8s_openapi::api::{
    batch::v1::{CronJob, Job},
    core::v1::Pod,
};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cronwatch_monitor::{
    cache::ResourceCache,
    config::Config,
    kubernetes::{ClusterApi, KubeCluster},
    metrics::{MetricsRecorder, MetricsRegistry},
    server::Server,
    service::CronjobService,
    store::{create_store, CacheStore},
    sync::{SyncMonitor, Synchronizer},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load configuration
    let config = Config::load().context("Invalid configuration")?;
    info!("Loaded configuration: {:?}", config);

    // Initialize store
    let store = create_store(&config.database).await.context("Failed to open cache store")?;
    store.init().await.context("Failed to migrate cache store")?;

    // Initialize cluster client
    let cluster: Arc<dyn ClusterApi> = Arc::new(
        KubeCluster::new(config.kube.namespace.clone())
            .await
            .context("Failed to reach the cluster")?,
    );

    let metrics = Arc::new(MetricsRegistry::new(config.kube.namespace.as_deref())?);
    let cache = Arc::new(ResourceCache::new(store.clone()));
    let service = Arc::new(CronjobService::new(
        cluster.clone(),
        cache.clone(),
        config.cache.ttl(),
        config.cache.refresh_interval(),
    ));

    let shutdown = CancellationToken::new();
    let mut synchronizers = SyncMonitor::default();
    let mut tasks = Vec::new();

    let cron_jobs = Synchronizer::<CronJob>::new(cluster.clone(), cache.clone());
    synchronizers.track(&cron_jobs);
    tasks.push(tokio::spawn(cron_jobs.run(shutdown.clone())));

    let jobs = Synchronizer::<Job>::new(cluster.clone(), cache.clone());
    synchronizers.track(&jobs);
    tasks.push(tokio::spawn(jobs.run(shutdown.clone())));

    let pods = Synchronizer::<Pod>::new(cluster.clone(), cache.clone());
    synchronizers.track(&pods);
    tasks.push(tokio::spawn(pods.run(shutdown.clone())));

    let recorder = MetricsRecorder::new(metrics.clone(), shutdown.clone());
    tasks.push(tokio::spawn(recorder.run(service.clone())));
    tasks.push(tokio::spawn(purge_expired(store, config.cache.purge_interval(), shutdown.clone())));

    // Start server
    let app = Server::new(service, metrics, synchronizers, shutdown.clone()).build_router();
    let listener = tokio::net::TcpListener::bind(&config.server.addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.addr))?;
    info!("Starting server on {}", config.server.addr);

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_for_signal().await;
            info!("Shutdown requested");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            error!("Background task failed: {}", e);
        }
    }
    info!("Stopped");

    Ok(())
}

/// Periodically drops expired cache rows until shutdown.
async fn purge_expired(store: Arc<dyn CacheStore>, every: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => match store.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => info!("Purged {} expired cache entries", purged),
                Err(e) => error!("Failed to purge expired cache entries: {}", e),
            },
        }
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
