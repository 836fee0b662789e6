//! Watch synchronizers: one long-running task per resource kind folding its
//! event feed into the cache.

use std::{
    collections::{BTreeMap, HashSet},
    marker::PhantomData,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use futures::{future::BoxFuture, StreamExt};
use k8s_openapi::api::{
    batch::v1::{CronJob, Job},
    core::v1::Pod,
};
use kube::{Resource, ResourceExt};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    cache::{keys, ResourceCache},
    kubernetes::{job_owner, same_identity, ClusterApi, EventFeed, Snapshot, WatchEvent},
    Error, Result,
};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// A resource kind that a synchronizer keeps in the cache.
pub trait Collected: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: &'static str;

    /// Collection that always exists for this kind, even when empty.
    const COLLECTION: Option<&'static str>;

    /// Cache key of the collection this object belongs in, `None` if it
    /// cannot be placed.
    fn collection_key(&self) -> Option<String>;

    fn snapshot(cluster: &dyn ClusterApi) -> BoxFuture<'_, Result<Snapshot<Self>>>;

    fn open_watch<'a>(cluster: &'a dyn ClusterApi, resource_version: &'a str) -> BoxFuture<'a, Result<EventFeed<Self>>>;
}

impl Collected for CronJob {
    const KIND: &'static str = "CronJob";
    const COLLECTION: Option<&'static str> = Some(keys::CRON_JOBS);

    fn collection_key(&self) -> Option<String> {
        Some(keys::CRON_JOBS.to_string())
    }

    fn snapshot(cluster: &dyn ClusterApi) -> BoxFuture<'_, Result<Snapshot<Self>>> {
        cluster.snapshot_cron_jobs()
    }

    fn open_watch<'a>(cluster: &'a dyn ClusterApi, resource_version: &'a str) -> BoxFuture<'a, Result<EventFeed<Self>>> {
        cluster.watch_cron_jobs(resource_version)
    }
}

impl Collected for Job {
    const KIND: &'static str = "Job";
    const COLLECTION: Option<&'static str> = Some(keys::JOBS);

    fn collection_key(&self) -> Option<String> {
        Some(keys::JOBS.to_string())
    }

    fn snapshot(cluster: &dyn ClusterApi) -> BoxFuture<'_, Result<Snapshot<Self>>> {
        cluster.snapshot_jobs()
    }

    fn open_watch<'a>(cluster: &'a dyn ClusterApi, resource_version: &'a str) -> BoxFuture<'a, Result<EventFeed<Self>>> {
        cluster.watch_jobs(resource_version)
    }
}

impl Collected for Pod {
    const KIND: &'static str = "Pod";
    const COLLECTION: Option<&'static str> = None;

    // Pods are only ever looked up per run.
    fn collection_key(&self) -> Option<String> {
        let job = job_owner(self)?;
        Some(keys::pods_for_job(&self.namespace().unwrap_or_default(), &job))
    }

    fn snapshot(cluster: &dyn ClusterApi) -> BoxFuture<'_, Result<Snapshot<Self>>> {
        cluster.snapshot_pods()
    }

    fn open_watch<'a>(cluster: &'a dyn ClusterApi, resource_version: &'a str) -> BoxFuture<'a, Result<EventFeed<Self>>> {
        cluster.watch_pods(resource_version)
    }
}

/// Folds one event into a collection. Names stay unique: the existing entry
/// with the same identity is always dropped first.
pub fn apply_event<K: Resource>(items: &mut Vec<K>, event: WatchEvent<K>) {
    match event {
        WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
            items.retain(|item| !same_identity(item, &obj));
            items.push(obj);
        }
        WatchEvent::Deleted(obj) => items.retain(|item| !same_identity(item, &obj)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Connecting,
    Streaming,
    Reconnecting,
    Terminated,
}

pub struct Synchronizer<K> {
    cluster: Arc<dyn ClusterApi>,
    cache: Arc<ResourceCache>,
    state: watch::Sender<SyncState>,
    // collections written since startup, cleared on resync when they empty out
    written: Mutex<HashSet<String>>,
    initial_backoff: Duration,
    max_backoff: Duration,
    _kind: PhantomData<fn() -> K>,
}

impl<K: Collected> Synchronizer<K> {
    pub fn new(cluster: Arc<dyn ClusterApi>, cache: Arc<ResourceCache>) -> Self {
        let (state, _) = watch::channel(SyncState::Connecting);
        Self {
            cluster,
            cache,
            state,
            written: Mutex::new(HashSet::new()),
            initial_backoff: INITIAL_BACKOFF,
            max_backoff: MAX_BACKOFF,
            _kind: PhantomData,
        }
    }

    /// Backoff applied when opening a watch fails.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    pub fn state(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: SyncState) {
        self.state.send_replace(state);
    }

    /// Runs until `shutdown` fires. Every (re)open lists the kind, replaces
    /// its collections with the listing and watches from there, so objects
    /// deleted while no watch was open do not linger. A feed that ends is
    /// reopened right away; failing to open one backs off exponentially.
    pub async fn run(self, shutdown: CancellationToken) {
        let kind = K::KIND;
        info!(kind, "Starting synchronizer");
        let mut backoff = self.initial_backoff;

        'watch: loop {
            self.set_state(SyncState::Connecting);

            let opened = tokio::select! {
                _ = shutdown.cancelled() => break 'watch,
                opened = self.open() => opened,
            };

            let mut feed = match opened {
                Ok(feed) => {
                    backoff = self.initial_backoff;
                    feed
                }
                Err(e) => {
                    warn!(kind, "Failed to open watch, retrying in {:?}: {}", backoff, e);
                    self.set_state(SyncState::Reconnecting);
                    tokio::select! {
                        _ = shutdown.cancelled() => break 'watch,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(self.max_backoff);
                    continue;
                }
            };

            self.set_state(SyncState::Streaming);

            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break 'watch,
                    event = feed.next() => event,
                };
                let Some(event) = event else {
                    break;
                };
                if let Err(e) = self.apply(event).await {
                    error!(kind, "Failed to store watch event: {}", e);
                }
            }

            info!(kind, "Watch closed, opening again");
            self.set_state(SyncState::Reconnecting);
        }

        self.set_state(SyncState::Terminated);
        info!(kind, "Synchronizer stopped");
    }

    async fn open(&self) -> Result<EventFeed<K>> {
        let snapshot = K::snapshot(self.cluster.as_ref()).await?;
        self.resync(snapshot.items).await?;
        K::open_watch(self.cluster.as_ref(), &snapshot.resource_version).await
    }

    /// Replaces every collection of this kind with a fresh listing.
    /// Collections with nothing left in them are removed.
    pub async fn resync(&self, items: Vec<K>) -> Result<()> {
        let mut groups: BTreeMap<String, Vec<K>> = BTreeMap::new();
        for item in items {
            match item.collection_key() {
                Some(key) => groups.entry(key).or_default().push(item),
                None => debug!(kind = K::KIND, name = %item.name_any(), "No collection for object, skipping"),
            }
        }

        let stale: Vec<String> = {
            let mut written = self.lock_written()?;
            written.extend(K::COLLECTION.map(str::to_string));
            let stale = written.iter().filter(|key| !groups.contains_key(*key)).cloned().collect();
            written.retain(|key| groups.contains_key(key));
            written.extend(groups.keys().cloned());
            stale
        };

        info!(kind = K::KIND, collections = groups.len(), removed = stale.len(), "Resynchronizing");
        for (key, items) in &groups {
            self.cache.replace_collection(key, items).await?;
        }
        for key in &stale {
            self.cache.remove_collection(key).await?;
        }
        Ok(())
    }

    fn lock_written(&self) -> Result<MutexGuard<'_, HashSet<String>>> {
        self.written
            .lock()
            .map_err(|e| Error::Internal(format!("Synchronizer key set poisoned: {}", e)))
    }

    /// Applies one event to its collection in a single store transaction.
    pub async fn apply(&self, event: WatchEvent<K>) -> Result<()> {
        let obj = event.object();
        let Some(key) = obj.collection_key() else {
            warn!(kind = K::KIND, name = %obj.name_any(), "No collection for object, skipping event");
            return Ok(());
        };
        debug!(kind = K::KIND, event = event.type_name(), %key, name = %obj.name_any(), "Applying event");
        self.lock_written()?.insert(key.clone());

        self.cache
            .update_collection(&key, move |items: &mut Vec<K>| apply_event(items, event))
            .await
    }
}

/// Latest state of every running synchronizer, for health reporting.
#[derive(Clone, Default)]
pub struct SyncMonitor {
    states: Vec<(&'static str, watch::Receiver<SyncState>)>,
}

impl SyncMonitor {
    pub fn track<K: Collected>(&mut self, synchronizer: &Synchronizer<K>) {
        self.states.push((K::KIND, synchronizer.state()));
    }

    pub fn snapshot(&self) -> BTreeMap<&'static str, SyncState> {
        self.states.iter().map(|(kind, rx)| (*kind, *rx.borrow())).collect()
    }

    pub fn is_healthy(&self) -> bool {
        self.states.iter().all(|(_, rx)| *rx.borrow() == SyncState::Streaming)
    }
}
