//! Typed view over the [`CacheStore`]: the key scheme and the JSON-encoded
//! collections the synchronizers maintain.

use std::{
    collections::{btree_map::Entry, BTreeMap},
    sync::Arc,
};

use k8s_openapi::api::{
    batch::v1::{CronJob, Job},
    core::v1::Pod,
};
use kube::ResourceExt;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use crate::{
    kubernetes::{compare_resource_versions, cron_job_owner, is_owned_by},
    store::CacheStore,
    Result,
};

pub mod keys {
    /// Every scheduled-job definition, kept by the cron job synchronizer.
    pub const CRON_JOBS: &str = "cronjobs";
    /// Every job run, kept by the job synchronizer.
    pub const JOBS: &str = "jobs";
    /// Job runs grouped by owning scheduled job, populated cache-aside.
    pub const RUN_INDEX: &str = "jobs_by_cronjob";

    pub fn pods_for_job(namespace: &str, job: &str) -> String {
        format!("pods/{}/{}", namespace, job)
    }

    pub fn cron_job(namespace: &str, name: &str) -> String {
        format!("cronjob/{}/{}", namespace, name)
    }

    pub fn run_index_entry(namespace: &str, cron_job: &str) -> String {
        format!("{}/{}", namespace, cron_job)
    }
}

/// Job runs keyed by `namespace/cronjob`.
pub type RunIndex = BTreeMap<String, Vec<Job>>;

/// Groups runs by the scheduled job that owns them. Standalone runs are left out.
pub fn build_run_index(jobs: Vec<Job>) -> RunIndex {
    let mut index = RunIndex::new();
    for job in jobs {
        let Some(owner) = cron_job_owner(&job).map(str::to_string) else {
            continue;
        };
        let key = keys::run_index_entry(&job.namespace().unwrap_or_default(), &owner);
        index.entry(key).or_default().push(job);
    }
    index
}

pub fn runs_for(index: &RunIndex, cron_job: &CronJob) -> Vec<Job> {
    let key = keys::run_index_entry(&cron_job.namespace().unwrap_or_default(), &cron_job.name_any());
    index.get(&key).cloned().unwrap_or_default()
}

/// Decodes a cached value, treating undecodable bytes as absent.
pub fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Option<T> {
    match serde_json::from_slice(bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key, "Discarding undecodable cache entry: {}", e);
            None
        }
    }
}

pub struct ResourceCache {
    store: Arc<dyn CacheStore>,
}

impl ResourceCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> Arc<dyn CacheStore> {
        self.store.clone()
    }

    /// Reads a whole collection. Missing or corrupt entries read as empty;
    /// store failures are returned.
    pub async fn read_collection<K: DeserializeOwned>(&self, key: &str) -> Result<Vec<K>> {
        let Some(bytes) = self.store.get(key).await? else {
            return Ok(Vec::new());
        };
        Ok(decode(key, &bytes).unwrap_or_default())
    }

    /// Read-modify-write of a collection inside one store transaction.
    pub async fn update_collection<K, F>(&self, key: &str, apply: F) -> Result<()>
    where
        K: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce(&mut Vec<K>) + Send + 'static,
    {
        let owned_key = key.to_string();
        self.store
            .update(
                key,
                Box::new(move |current: Option<Vec<u8>>| -> Result<Vec<u8>> {
                    let mut items: Vec<K> = current
                        .and_then(|bytes| decode(&owned_key, &bytes))
                        .unwrap_or_default();
                    apply(&mut items);
                    Ok(serde_json::to_vec(&items)?)
                }),
            )
            .await
    }

    /// Overwrites a whole collection.
    pub async fn replace_collection<K: Serialize>(&self, key: &str, items: &[K]) -> Result<()> {
        self.store.set(key, &serde_json::to_vec(items)?, None).await
    }

    pub async fn remove_collection(&self, key: &str) -> Result<()> {
        debug!(key, "Removing collection");
        self.store.delete(key).await
    }

    pub async fn cron_jobs(&self) -> Result<Vec<CronJob>> {
        self.read_collection(keys::CRON_JOBS).await
    }

    pub async fn jobs(&self) -> Result<Vec<Job>> {
        self.read_collection(keys::JOBS).await
    }

    /// Pods of one run that have started, one per pod name (the newest
    /// resource version wins when retries left several generations behind).
    pub async fn pods_for_job(&self, job: &Job) -> Result<Vec<Pod>> {
        let job_name = job.name_any();
        let key = keys::pods_for_job(&job.namespace().unwrap_or_default(), &job_name);
        let pods: Vec<Pod> = self.read_collection(&key).await?;

        let mut latest: BTreeMap<String, Pod> = BTreeMap::new();
        for pod in pods {
            let started = pod.status.as_ref().and_then(|s| s.start_time.as_ref()).is_some();
            if !started || !is_owned_by(&pod, &job_name) {
                continue;
            }
            match latest.entry(pod.name_any()) {
                Entry::Vacant(slot) => {
                    slot.insert(pod);
                }
                Entry::Occupied(mut slot) => {
                    let newer = compare_resource_versions(
                        pod.metadata.resource_version.as_deref(),
                        slot.get().metadata.resource_version.as_deref(),
                    )
                    .is_gt();
                    if newer {
                        slot.insert(pod);
                    }
                }
            }
        }

        debug!(%key, count = latest.len(), "Loaded pods for job");
        Ok(latest.into_values().collect())
    }
}
