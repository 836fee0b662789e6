//! The API surface served to clients: streaming summaries and single-shot
//! raw snapshots.

use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::{
    aggregate::Aggregator,
    cache::{build_run_index, decode, keys, runs_for, ResourceCache, RunIndex},
    cache_aside::CacheAside,
    delivery::{deliver, Subscriber},
    kubernetes::{is_standalone, ClusterApi},
    summary::{CronjobPods, CronjobRef, CronjobSummary, JobSummary},
    Error, Result,
};

/// Runs that no scheduled job owns.
pub fn find_standalone_runs(jobs: Vec<Job>) -> Vec<Job> {
    jobs.into_iter().filter(is_standalone).collect()
}

pub struct CronjobService {
    cluster: Arc<dyn ClusterApi>,
    cache: Arc<ResourceCache>,
    aside: CacheAside,
    aggregator: Aggregator,
    refresh_interval: Duration,
}

impl CronjobService {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        cache: Arc<ResourceCache>,
        cache_ttl: Duration,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            aside: CacheAside::new(cache.store(), cache_ttl),
            aggregator: Aggregator::new(cache.clone()),
            cluster,
            cache,
            refresh_interval,
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    /// Runs grouped by owning scheduled job. Upstream failures degrade to an
    /// empty index for this call only.
    async fn run_index(&self) -> RunIndex {
        let fetched = self
            .aside
            .get_and_store(keys::RUN_INDEX, || async {
                let jobs = self.cluster.list_jobs().await?;
                Ok::<_, Error>(serde_json::to_vec(&build_run_index(jobs))?)
            })
            .await;

        match fetched {
            Ok(bytes) => decode(keys::RUN_INDEX, &bytes).unwrap_or_default(),
            Err(e) => {
                error!("Failed to load job runs index: {}", e);
                RunIndex::new()
            }
        }
    }

    /// One scheduled-job definition, read through the cache.
    pub async fn find_cron_job(&self, namespace: &str, name: &str) -> Result<CronJob> {
        let key = keys::cron_job(namespace, name);
        let bytes = self
            .aside
            .get_and_store(&key, || async {
                match self.cluster.get_cron_job(namespace, name).await? {
                    Some(cron_job) => Ok::<_, Error>(serde_json::to_vec(&cron_job)?),
                    None => Err(Error::NotFound(format!("cronjob {}/{}", namespace, name))),
                }
            })
            .await?;

        decode(&key, &bytes).ok_or_else(|| Error::NotFound(format!("cronjob {}/{}", namespace, name)))
    }

    pub async fn list_cronjobs(&self) -> Result<Vec<CronjobSummary>> {
        let cron_jobs = self.cache.cron_jobs().await?;
        let index = self.run_index().await;

        let builds = cron_jobs
            .iter()
            .map(|cron_job| self.aggregator.build_cronjob_summary(cron_job, runs_for(&index, cron_job)));
        let mut summaries = join_all(builds).await.into_iter().collect::<Result<Vec<_>>>()?;

        summaries.sort_by_key(|s| s.name.to_lowercase());
        debug!(count = summaries.len(), "Built cronjob summaries");
        Ok(summaries)
    }

    pub async fn get_cronjob(&self, namespace: &str, name: &str) -> Result<CronjobSummary> {
        let cron_job = self.find_cron_job(namespace, name).await?;
        let index = self.run_index().await;
        self.aggregator
            .build_cronjob_summary(&cron_job, runs_for(&index, &cron_job))
            .await
    }

    /// Pods of every run of one scheduled job, oldest first.
    pub async fn get_cronjob_pods(&self, namespace: &str, name: &str) -> Result<CronjobPods> {
        let summary = self.get_cronjob(namespace, name).await?;

        let mut pods = summary.all_pods;
        pods.sort_by_key(|p| p.start_time);

        Ok(CronjobPods {
            pods,
            cronjob: CronjobRef {
                name: summary.name,
                namespace: summary.namespace,
                runs: summary.all_runs,
            },
        })
    }

    pub async fn list_job_runs(&self) -> Result<Vec<JobSummary>> {
        let jobs = find_standalone_runs(self.cache.jobs().await?);
        self.aggregator.build_job_summaries(jobs, chrono::Utc::now()).await
    }

    pub async fn get_cron_job_raw(&self, namespace: &str, name: &str) -> Result<String> {
        let cron_job = self.cluster.get_cron_job(namespace, name).await?;
        to_yaml(cron_job, "cronjob", namespace, name)
    }

    pub async fn get_job_raw(&self, namespace: &str, name: &str) -> Result<String> {
        let job = self.cluster.get_job(namespace, name).await?;
        to_yaml(job, "job", namespace, name)
    }

    pub async fn get_pod_raw(&self, namespace: &str, name: &str) -> Result<String> {
        let pod = self.cluster.get_pod(namespace, name).await?;
        to_yaml(pod, "pod", namespace, name)
    }

    pub async fn stream_cronjobs<S>(&self, subscriber: S) -> Result<()>
    where
        S: Subscriber<Vec<CronjobSummary>>,
    {
        info!("Streaming cronjob list");
        deliver(self.refresh_interval, subscriber, || self.list_cronjobs()).await
    }

    pub async fn stream_cronjob<S>(&self, namespace: &str, name: &str, subscriber: S) -> Result<()>
    where
        S: Subscriber<CronjobSummary>,
    {
        info!(namespace, name, "Streaming cronjob");
        deliver(self.refresh_interval, subscriber, || self.get_cronjob(namespace, name)).await
    }

    pub async fn stream_cronjob_pods<S>(&self, namespace: &str, name: &str, subscriber: S) -> Result<()>
    where
        S: Subscriber<CronjobPods>,
    {
        info!(namespace, name, "Streaming cronjob pods");
        deliver(self.refresh_interval, subscriber, || self.get_cronjob_pods(namespace, name)).await
    }

    pub async fn stream_job_runs<S>(&self, subscriber: S) -> Result<()>
    where
        S: Subscriber<Vec<JobSummary>>,
    {
        info!("Streaming job runs");
        deliver(self.refresh_interval, subscriber, || self.list_job_runs()).await
    }
}

fn to_yaml<T: Serialize>(obj: Option<T>, kind: &str, namespace: &str, name: &str) -> Result<String> {
    let obj = obj.ok_or_else(|| Error::NotFound(format!("{} {}/{}", kind, namespace, name)))?;
    Ok(serde_yaml::to_string(&obj)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        kubernetes::MockClusterApi,
        store::CacheStore,
        testutil::{memory_store, CronJobBuilder, JobBuilder, PodBuilder},
    };
    use chrono::{TimeZone, Utc};
    use tokio::sync::mpsc;

    async fn service_with(cluster: MockClusterApi, cron_jobs: Vec<CronJob>, jobs: Vec<Job>) -> CronjobService {
        let store: Arc<dyn CacheStore> = memory_store().await;
        store
            .set(keys::CRON_JOBS, &serde_json::to_vec(&cron_jobs).unwrap(), None)
            .await
            .unwrap();
        store.set(keys::JOBS, &serde_json::to_vec(&jobs).unwrap(), None).await.unwrap();

        CronjobService::new(
            Arc::new(cluster),
            Arc::new(ResourceCache::new(store)),
            Duration::from_secs(15),
            Duration::from_millis(5),
        )
    }

    fn started_run(name: &str, owner: &str) -> Job {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 2, 0, 0).unwrap();
        JobBuilder::new(name)
            .owned_by_cron_job(owner)
            .created_at(at)
            .started_at(at)
            .completed_at(at)
            .build()
    }

    #[test]
    fn test_find_standalone_runs_drops_owned() {
        let runs = find_standalone_runs(vec![
            JobBuilder::new("nightly-1").owned_by_cron_job("nightly").build(),
            JobBuilder::new("manual-backfill").build(),
            JobBuilder::new("hourly-7").owned_by_cron_job("hourly").build(),
        ]);

        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].metadata.name.as_deref(), Some("manual-backfill"));
    }

    #[tokio::test]
    async fn test_list_cronjobs_sorted_with_runs_and_cached_index() {
        let mut cluster = MockClusterApi::new();
        cluster
            .expect_list_jobs()
            .times(1)
            .returning(|| Ok(vec![started_run("beta-1", "beta"), started_run("alpha-1", "Alpha")]));
        let service = service_with(
            cluster,
            vec![CronJobBuilder::new("beta").build(), CronJobBuilder::new("Alpha").build()],
            Vec::new(),
        )
        .await;

        let first = service.list_cronjobs().await.unwrap();
        let second = service.list_cronjobs().await.unwrap();

        let names: Vec<&str> = first.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Alpha", "beta"]);
        assert_eq!(first[0].all_runs[0].name, "alpha-1");
        assert_eq!(first[1].all_runs[0].name, "beta-1");
        assert_eq!(second.len(), 2);
    }

    #[tokio::test]
    async fn test_index_failure_degrades_and_is_not_cached() {
        let mut cluster = MockClusterApi::new();
        cluster
            .expect_list_jobs()
            .times(2)
            .returning(|| Err(Error::Kubernetes("the server is currently unable to handle the request".into())));
        let service = service_with(cluster, vec![CronJobBuilder::new("nightly").build()], Vec::new()).await;

        for _ in 0..2 {
            let summaries = service.list_cronjobs().await.unwrap();
            assert_eq!(summaries.len(), 1);
            assert!(summaries[0].all_runs.is_empty());
        }
    }

    #[tokio::test]
    async fn test_get_cronjob_missing_is_not_found() {
        let mut cluster = MockClusterApi::new();
        cluster.expect_get_cron_job().returning(|_, _| Ok(None));
        let service = service_with(cluster, Vec::new(), Vec::new()).await;

        let err = service.get_cronjob("default", "gone").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_get_cronjob_pods_labels_with_runs() {
        let mut cluster = MockClusterApi::new();
        cluster
            .expect_get_cron_job()
            .times(1)
            .returning(|_, name| Ok(Some(CronJobBuilder::new(name).build())));
        cluster
            .expect_list_jobs()
            .returning(|| Ok(vec![started_run("nightly-1", "nightly")]));
        let service = service_with(cluster, Vec::new(), Vec::new()).await;

        let pods = service.get_cronjob_pods("default", "nightly").await.unwrap();
        let again = service.get_cronjob("default", "nightly").await.unwrap();

        assert_eq!(pods.cronjob.name, "nightly");
        assert_eq!(pods.cronjob.runs.len(), 1);
        assert!(pods.pods.is_empty());
        assert_eq!(again.name, "nightly");
    }

    #[tokio::test]
    async fn test_get_cronjob_pods_sorted_by_start_and_status_times() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 2, 0, 0).unwrap();
        let mut cluster = MockClusterApi::new();
        cluster.expect_get_cron_job().returning(move |_, name| {
            Ok(Some(
                CronJobBuilder::new(name)
                    .last_schedule_time(t0)
                    .last_successful_time(t0 + chrono::Duration::seconds(5))
                    .build(),
            ))
        });
        cluster.expect_list_jobs().returning(move || {
            Ok(vec![
                JobBuilder::new("nightly-1").owned_by_cron_job("nightly").created_at(t0).build(),
                JobBuilder::new("nightly-2")
                    .owned_by_cron_job("nightly")
                    .created_at(t0 + chrono::Duration::seconds(60))
                    .build(),
            ])
        });
        let service = service_with(cluster, Vec::new(), Vec::new()).await;

        // the older run's pod started later than the newer run's
        let seeded = [
            ("nightly-1", "nightly-1-late", t0 + chrono::Duration::seconds(120)),
            ("nightly-2", "nightly-2-early", t0 + chrono::Duration::seconds(30)),
        ];
        let store = service.cache.store();
        for (job, pod, started) in seeded {
            let pods = vec![PodBuilder::new(pod).owned_by_job(job).started_at(started).build()];
            store
                .set(&keys::pods_for_job("default", job), &serde_json::to_vec(&pods).unwrap(), None)
                .await
                .unwrap();
        }

        let pods = service.get_cronjob_pods("default", "nightly").await.unwrap();
        let summary = service.get_cronjob("default", "nightly").await.unwrap();

        let names: Vec<&str> = pods.pods.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["nightly-2-early", "nightly-1-late"]);
        let runs: Vec<&str> = pods.cronjob.runs.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(runs, vec!["nightly-1", "nightly-2"]);
        assert_eq!(summary.last_schedule_time, "2024-03-01T02:00:00Z");
        assert_eq!(summary.last_successful_time, "2024-03-01T02:00:05Z");
    }

    #[tokio::test]
    async fn test_list_job_runs_only_standalone() {
        let service = service_with(
            MockClusterApi::new(),
            Vec::new(),
            vec![started_run("nightly-1", "nightly"), JobBuilder::new("manual").build()],
        )
        .await;

        let runs = service.list_job_runs().await.unwrap();

        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].name, "manual");
    }

    #[tokio::test]
    async fn test_raw_yaml_and_not_found() {
        let mut cluster = MockClusterApi::new();
        cluster
            .expect_get_job()
            .returning(|_, name| Ok((name == "manual").then(|| JobBuilder::new(name).build())));
        let service = service_with(cluster, Vec::new(), Vec::new()).await;

        let yaml = service.get_job_raw("default", "manual").await.unwrap();
        assert!(yaml.contains("name: manual"));

        let err = service.get_job_raw("default", "other").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_stream_job_runs_pushes_until_receiver_drops() {
        let service = Arc::new(
            service_with(MockClusterApi::new(), Vec::new(), vec![JobBuilder::new("manual").build()]).await,
        );
        let (tx, mut rx) = mpsc::channel(1);
        let streaming = service.clone();
        let task = tokio::spawn(async move { streaming.stream_job_runs(tx).await });

        for _ in 0..2 {
            let batch = rx.recv().await.unwrap();
            assert_eq!(batch[0].name, "manual");
        }
        drop(rx);

        let result = task.await.unwrap();
        assert!(matches!(result, Ok(()) | Err(Error::SubscriberGone)));
    }
}
