use crate::events::{EventEmitter, ImageEvent, Trigger};
use crate::reconciler::Reconciler;
use crate::workload::{PodTemplate, ResourceKey, Workload};
use anyhow::Context;
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::batch::v1::CronJob;
use kube::api::ListParams;
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client};
use std::collections::{HashMap, HashSet};
use std::pin::pin;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub async fn create_client() -> anyhow::Result<Client> {
    info!("Initializing K8s client");
    let client = Client::try_default().await?;
    let api_server_info = client.apiserver_version().await?;
    info!(
        "Connected to Kubernetes API server with version {}.{}",
        api_server_info.major, api_server_info.minor
    );
    Ok(client)
}

/// Last known pod template of every workload of one kind, used to derive MODIFIED
/// snapshots and to notice workloads that vanished while the watch was re-listing.
#[derive(Default)]
struct TemplateCache {
    templates: HashMap<ResourceKey, PodTemplate>,
    relisting: Option<HashSet<ResourceKey>>,
    synced: bool,
}

/// Outcome of a completed re-list.
enum Relist {
    /// First complete listing since start, to be reconciled against the store as a whole.
    Initial(Vec<(ResourceKey, PodTemplate)>),
    /// Workloads that disappeared since the previous listing.
    Gone(Vec<(ResourceKey, Trigger)>),
}

impl TemplateCache {
    fn apply(&mut self, key: ResourceKey, template: PodTemplate) -> Option<Trigger> {
        if let Some(seen) = self.relisting.as_mut() {
            seen.insert(key.clone());
        }
        let previous = self.templates.insert(key, template.clone());
        if !self.synced {
            return None;
        }
        match previous {
            None => Some(Trigger::Created(template)),
            Some(old) if old != template => Some(Trigger::Modified { old, new: template }),
            Some(_) => None,
        }
    }

    fn delete(&mut self, key: &ResourceKey, template: PodTemplate) -> Trigger {
        self.templates.remove(key);
        Trigger::Removed(template)
    }

    fn begin_relist(&mut self) {
        self.relisting = Some(HashSet::new());
    }

    fn finish_relist(&mut self) -> Relist {
        let removed: Vec<(ResourceKey, PodTemplate)> = match self.relisting.take() {
            Some(seen) => {
                let gone: Vec<ResourceKey> = self
                    .templates
                    .keys()
                    .filter(|key| !seen.contains(*key))
                    .cloned()
                    .collect();
                gone.into_iter()
                    .filter_map(|key| {
                        let template = self.templates.remove(&key)?;
                        Some((key, template))
                    })
                    .collect()
            }
            None => Vec::new(),
        };

        if !self.synced {
            self.synced = true;
            return Relist::Initial(
                self.templates
                    .iter()
                    .map(|(key, template)| (key.clone(), template.clone()))
                    .collect(),
            );
        }
        Relist::Gone(
            removed
                .into_iter()
                .map(|(key, template)| (key, Trigger::Removed(template)))
                .collect(),
        )
    }
}

/// Owns the watch tasks feeding the reconciler. Constructed once at startup and
/// stopped explicitly.
pub struct WatchSupervisor {
    client: Client,
    namespace: Option<String>,
    emitter: EventEmitter,
    reconciler: Reconciler,
    token: CancellationToken,
    tasks: JoinSet<()>,
}

impl WatchSupervisor {
    pub fn new(
        client: Client,
        namespace: Option<String>,
        emitter: EventEmitter,
        reconciler: Reconciler,
        token: CancellationToken,
    ) -> Self {
        Self {
            client,
            namespace,
            emitter,
            reconciler,
            token,
            tasks: JoinSet::new(),
        }
    }

    pub fn start(&mut self) {
        info!("Starting workload watchers");
        self.spawn::<Deployment>();
        self.spawn::<DaemonSet>();
        self.spawn::<CronJob>();
    }

    fn spawn<K: Workload>(&mut self) {
        let api = workload_api::<K>(&self.client, self.namespace.as_deref());
        let emitter = self.emitter.clone();
        let reconciler = self.reconciler.clone();
        let token = self.token.clone();
        self.tasks
            .spawn(watch_workloads(api, emitter, reconciler, token));
    }

    /// Cancels every watch and waits for in-flight reconciliations to finish.
    pub async fn stop(&mut self) {
        info!("Stopping workload watchers");
        self.token.cancel();
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                warn!("Watcher task ended abnormally: {}", e);
            }
        }
    }
}

fn workload_api<K: Workload>(client: &Client, namespace: Option<&str>) -> Api<K> {
    match namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    }
}

async fn watch_workloads<K: Workload>(
    api: Api<K>,
    emitter: EventEmitter,
    reconciler: Reconciler,
    token: CancellationToken,
) {
    let kind = K::RESOURCE_TYPE;
    info!("Watching {} resources", kind);
    let mut cache = TemplateCache::default();
    let mut stream = pin!(watcher(api, watcher::Config::default()).default_backoff());

    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            next = stream.next() => match next {
                Some(event) => event,
                None => break,
            },
        };

        let changes: Vec<(ResourceKey, Trigger)> = match event {
            Ok(watcher::Event::Init) => {
                debug!("Re-listing {} resources", kind);
                cache.begin_relist();
                Vec::new()
            }
            Ok(watcher::Event::InitApply(obj)) | Ok(watcher::Event::Apply(obj)) => {
                let key = obj.resource_key();
                cache
                    .apply(key.clone(), obj.pod_template())
                    .map(|trigger| (key, trigger))
                    .into_iter()
                    .collect()
            }
            Ok(watcher::Event::Delete(obj)) => {
                let key = obj.resource_key();
                let trigger = cache.delete(&key, obj.pod_template());
                vec![(key, trigger)]
            }
            Ok(watcher::Event::InitDone) => match cache.finish_relist() {
                Relist::Initial(listing) => {
                    info!(
                        "{} watch synced, reconciling {} workloads against the inventory",
                        kind,
                        listing.len()
                    );
                    let reconciler = reconciler.clone();
                    let emitter = emitter.clone();
                    let reconciled = tokio::task::spawn_blocking(move || {
                        reconciler.apply_listing(kind, &listing, &emitter, Utc::now())
                    })
                    .await;
                    if let Err(e) = reconciled {
                        warn!("Initial reconciliation for {} failed: {}", kind, e);
                    }
                    continue;
                }
                Relist::Gone(gone) => {
                    info!(
                        "{} watch synced, {} tracked, {} removed while disconnected",
                        kind,
                        cache.templates.len(),
                        gone.len()
                    );
                    gone
                }
            },
            Err(e) => {
                warn!("{} watch stream error: {}", kind, e);
                Vec::new()
            }
        };

        let events: Vec<ImageEvent> = changes
            .iter()
            .flat_map(|(key, trigger)| emitter.emit(key, trigger))
            .collect();
        if events.is_empty() {
            continue;
        }

        // Store writes block; keep them off the async workers and let them finish even
        // if cancellation arrives meanwhile.
        let reconciler = reconciler.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || reconciler.apply_all(&events)).await {
            warn!("Reconciliation task for {} failed: {}", kind, e);
        }
    }

    info!("Stopped watching {} resources", kind);
}

/// Lists every watched workload once and reconciles each kind against the store,
/// refreshing `last_seen` for what still runs and retiring what is gone.
pub async fn resync(
    client: &Client,
    namespace: Option<&str>,
    emitter: &EventEmitter,
    reconciler: &Reconciler,
) -> anyhow::Result<()> {
    resync_kind::<Deployment>(client, namespace, emitter, reconciler).await?;
    resync_kind::<DaemonSet>(client, namespace, emitter, reconciler).await?;
    resync_kind::<CronJob>(client, namespace, emitter, reconciler).await?;
    Ok(())
}

async fn resync_kind<K: Workload>(
    client: &Client,
    namespace: Option<&str>,
    emitter: &EventEmitter,
    reconciler: &Reconciler,
) -> anyhow::Result<()> {
    let api = workload_api::<K>(client, namespace);
    let list = api
        .list(&ListParams::default())
        .await
        .with_context(|| format!("Failed to list {} resources", K::RESOURCE_TYPE))?;
    let listing: Vec<(ResourceKey, PodTemplate)> = list
        .items
        .iter()
        .map(|obj| (obj.resource_key(), obj.pod_template()))
        .collect();

    info!("Resync reconciling {} {} resources", listing.len(), K::RESOURCE_TYPE);
    let reconciler = reconciler.clone();
    let emitter = emitter.clone();
    tokio::task::spawn_blocking(move || {
        reconciler.apply_listing(K::RESOURCE_TYPE, &listing, &emitter, Utc::now())
    })
    .await
    .context("Resync reconciliation task failed")?;
    Ok(())
}
