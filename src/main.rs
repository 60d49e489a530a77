use crate::events::{EventEmitter, NamespaceFilter};
use crate::query::QueryEngine;
use crate::reconciler::Reconciler;
use crate::store::InventoryStore;
use crate::watcher::WatchSupervisor;
use anyhow::Context;
use std::env;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::info;

mod config;
mod events;
mod image_reference;
mod metrics_exporter;
mod query;
mod reconciler;
mod state;
mod store;
mod watcher;
mod webserver;
mod workload;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    info!("Starting kubetag {}", env!("CARGO_PKG_VERSION"));

    let config_path = env::var("KUBETAG_CONFIG").unwrap_or_else(|_| "config.yaml".to_string());
    let config = config::load_config(&config_path)?;

    let store = Arc::new(
        InventoryStore::open(&config.database.path).context("Failed to open inventory database")?,
    );
    let filter = NamespaceFilter::new(&config.namespaces)?;
    let emitter = EventEmitter::new(filter, config.diff_strategy);
    let reconciler = Reconciler::new(store.clone());
    let namespace = config.single_namespace().map(str::to_string);

    let client = watcher::create_client().await?;
    let token = CancellationToken::new();
    let mut supervisor = WatchSupervisor::new(
        client.clone(),
        namespace.clone(),
        emitter.clone(),
        reconciler.clone(),
        token.clone(),
    );
    supervisor.start();

    let scheduler = match &config.resync_schedule {
        Some(cron_schedule) => Some(
            schedule_resync(cron_schedule.clone(), client, namespace, emitter, reconciler).await?,
        ),
        None => None,
    };

    let app = webserver::create_app(QueryEngine::new(store));
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.webserver.port));
    info!("Starting webserver on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(token))
        .await?;

    if let Some(mut scheduler) = scheduler {
        scheduler.shutdown().await?;
    }
    supervisor.stop().await;
    info!("Shutdown complete");

    Ok(())
}

async fn schedule_resync(
    cron_schedule: String,
    client: kube::Client,
    namespace: Option<String>,
    emitter: EventEmitter,
    reconciler: Reconciler,
) -> anyhow::Result<JobScheduler> {
    info!("Executing resync job at cron schedule {}", cron_schedule);
    let scheduler = JobScheduler::new().await?;

    let job = Job::new_async(cron_schedule, move |_uuid, _l| {
        let client = client.clone();
        let namespace = namespace.clone();
        let emitter = emitter.clone();
        let reconciler = reconciler.clone();
        Box::pin(async move {
            if let Err(e) =
                watcher::resync(&client, namespace.as_deref(), &emitter, &reconciler).await
            {
                tracing::error!("Error running resync job: {:?}", e);
            }
        })
    })?;
    scheduler.add(job).await?;
    scheduler.start().await?;

    Ok(scheduler)
}

async fn shutdown_signal(token: CancellationToken) {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            tracing::error!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            token.cancel();
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = terminate.recv() => {},
        _ = token.cancelled() => {},
    }
    info!("Shutting down gracefully");
    token.cancel();
}
