use async_trait::async_trait;
use futures::{pin_mut, StreamExt};
use k8s_openapi::{
    api::{
        batch::v1::{CronJob, Job},
        core::v1::Pod,
    },
    NamespaceResourceScope,
};
use kube::{
    api::{Api, ListParams, WatchEvent as KubeWatchEvent, WatchParams},
    Client, Resource,
};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::{
    kubernetes::{ClusterApi, EventFeed, Snapshot, WatchEvent},
    Error, Result,
};

// The API server closes watches after this long; the synchronizers reopen them.
const WATCH_TIMEOUT_SECS: u32 = 290;
const WATCH_BUFFER: usize = 64;

pub struct KubeCluster {
    client: Client,
    namespace: Option<String>,
}

impl KubeCluster {
    /// Connects with the in-cluster or kubeconfig credentials. `namespace`
    /// scopes watches and listings; `None` means every namespace.
    pub async fn new(namespace: Option<String>) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::Kubernetes(format!("Failed to create client: {}", e)))?;

        Ok(Self::from_client(client, namespace))
    }

    pub fn from_client(client: Client, namespace: Option<String>) -> Self {
        Self { client, namespace }
    }

    fn scoped<K>(&self) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    async fn get_in<K>(&self, namespace: &str, name: &str) -> Result<Option<K>>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + DeserializeOwned + Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let obj = api.get_opt(name).await?;
        if obj.is_none() {
            let kind = K::kind(&());
            warn!(%kind, namespace, name, "Resource not found");
        }
        Ok(obj)
    }

    async fn snapshot<K>(&self) -> Result<Snapshot<K>>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + DeserializeOwned + Debug,
    {
        let list = self.scoped::<K>().list(&ListParams::default()).await?;
        let resource_version = list.metadata.resource_version.unwrap_or_default();
        let kind = K::kind(&());
        debug!(%kind, count = list.items.len(), %resource_version, "Listed resources");
        Ok(Snapshot {
            items: list.items,
            resource_version,
        })
    }

    /// Opens a watch and pumps its events into a channel, so the returned
    /// feed owns everything it needs. The feed ends when the server closes
    /// the watch.
    async fn open_watch<K>(&self, resource_version: &str) -> Result<EventFeed<K>>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug
            + Send
            + Sync
            + 'static,
    {
        let api: Api<K> = self.scoped();
        let kind = K::kind(&()).to_string();
        let task_kind = kind.clone();
        let version = resource_version.to_string();
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let (opened_tx, opened_rx) = oneshot::channel::<Result<()>>();

        tokio::spawn(async move {
            let kind = task_kind;
            let params = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
            let stream = match api.watch(&params, &version).await {
                Ok(stream) => {
                    let _ = opened_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = opened_tx.send(Err(e.into()));
                    return;
                }
            };
            pin_mut!(stream);

            while let Some(item) = stream.next().await {
                let event = match item {
                    Ok(KubeWatchEvent::Added(obj)) => WatchEvent::Added(obj),
                    Ok(KubeWatchEvent::Modified(obj)) => WatchEvent::Modified(obj),
                    Ok(KubeWatchEvent::Deleted(obj)) => WatchEvent::Deleted(obj),
                    Ok(KubeWatchEvent::Bookmark(_)) => continue,
                    Ok(KubeWatchEvent::Error(status)) => {
                        warn!(%kind, code = status.code, "Watch error: {}", status.message);
                        if status.code == 410 {
                            // resourceVersion too old; let the synchronizer reopen
                            break;
                        }
                        continue;
                    }
                    Err(e) => {
                        warn!(%kind, "Skipping undecodable watch event: {}", e);
                        continue;
                    }
                };

                if tx.send(event).await.is_err() {
                    debug!(%kind, "Watch consumer went away");
                    break;
                }
            }
        });

        opened_rx
            .await
            .map_err(|_| Error::Internal(format!("{} watch task exited before opening", kind)))??;

        info!(%kind, namespace = ?self.namespace, "Watch opened");
        Ok(ReceiverStream::new(rx).boxed())
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get_cron_job(&self, namespace: &str, name: &str) -> Result<Option<CronJob>> {
        self.get_in(namespace, name).await
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>> {
        self.get_in(namespace, name).await
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        self.get_in(namespace, name).await
    }

    async fn list_jobs(&self) -> Result<Vec<Job>> {
        let jobs = self.scoped::<Job>().list(&ListParams::default()).await?;
        info!("There are {} jobs in the cluster", jobs.items.len());
        Ok(jobs.items)
    }

    async fn snapshot_cron_jobs(&self) -> Result<Snapshot<CronJob>> {
        self.snapshot().await
    }

    async fn snapshot_jobs(&self) -> Result<Snapshot<Job>> {
        self.snapshot().await
    }

    async fn snapshot_pods(&self) -> Result<Snapshot<Pod>> {
        self.snapshot().await
    }

    async fn watch_cron_jobs(&self, resource_version: &str) -> Result<EventFeed<CronJob>> {
        self.open_watch(resource_version).await
    }

    async fn watch_jobs(&self, resource_version: &str) -> Result<EventFeed<Job>> {
        self.open_watch(resource_version).await
    }

    async fn watch_pods(&self, resource_version: &str) -> Result<EventFeed<Pod>> {
        self.open_watch(resource_version).await
    }
}
