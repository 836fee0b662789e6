//! Narrow view of the cluster API: the get/list/watch calls the monitor
//! actually consumes, for scheduled-job definitions (`CronJob`), job runs
//! (`Job`) and their pods.

mod client;
mod resources;

pub use client::KubeCluster;
pub use resources::*;

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::{
    batch::v1::{CronJob, Job},
    core::v1::Pod,
};

use crate::Result;

/// One change notification from a watch.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
}

impl<K> WatchEvent<K> {
    pub fn object(&self) -> &K {
        match self {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => obj,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            WatchEvent::Added(_) => "ADDED",
            WatchEvent::Modified(_) => "MODIFIED",
            WatchEvent::Deleted(_) => "DELETED",
        }
    }
}

/// Full listing of one kind, with the resourceVersion a watch resumes from.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot<K> {
    pub items: Vec<K>,
    pub resource_version: String,
}

/// A live event feed. The stream ending means the server closed the watch,
/// not that an error occurred.
pub type EventFeed<K> = BoxStream<'static, WatchEvent<K>>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_cron_job(&self, namespace: &str, name: &str) -> Result<Option<CronJob>>;
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>>;
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;
    async fn list_jobs(&self) -> Result<Vec<Job>>;

    async fn snapshot_cron_jobs(&self) -> Result<Snapshot<CronJob>>;
    async fn snapshot_jobs(&self) -> Result<Snapshot<Job>>;
    async fn snapshot_pods(&self) -> Result<Snapshot<Pod>>;

    /// Watches start right after `resource_version`, so nothing between a
    /// snapshot and its watch is missed.
    async fn watch_cron_jobs(&self, resource_version: &str) -> Result<EventFeed<CronJob>>;
    async fn watch_jobs(&self, resource_version: &str) -> Result<EventFeed<Job>>;
    async fn watch_pods(&self, resource_version: &str) -> Result<EventFeed<Pod>>;
}
