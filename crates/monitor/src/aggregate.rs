//! Assembles per-scheduled-job summaries from cached runs and pods.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use kube::ResourceExt;
use tracing::debug;

use crate::{
    cache::ResourceCache,
    status::{container_commands, format_time, summarize_job, POD_RUNNING},
    summary::{CronjobSummary, JobSummary, PodSummary},
    Error, Result,
};

pub struct Aggregator {
    cache: Arc<ResourceCache>,
}

impl Aggregator {
    pub fn new(cache: Arc<ResourceCache>) -> Self {
        Self { cache }
    }

    /// Summarizes every run concurrently, one task per run. Results come back
    /// in input order once all tasks have finished; a store error from any
    /// task fails the whole batch.
    pub async fn build_job_summaries(&self, jobs: Vec<Job>, now: DateTime<Utc>) -> Result<Vec<JobSummary>> {
        let handles: Vec<_> = jobs
            .into_iter()
            .map(|job| {
                let cache = self.cache.clone();
                tokio::spawn(async move {
                    let pods = cache.pods_for_job(&job).await?;
                    Ok::<_, Error>(summarize_job(&job, &pods, now))
                })
            })
            .collect();

        // barrier: every task finishes before any result is looked at
        let joined = join_all(handles).await;

        let mut summaries = Vec::with_capacity(joined.len());
        for result in joined {
            let summary = result.map_err(|e| Error::Internal(format!("Run summary task failed: {}", e)))??;
            summaries.push(summary);
        }
        Ok(summaries)
    }

    pub async fn build_cronjob_summary(&self, cron_job: &CronJob, jobs: Vec<Job>) -> Result<CronjobSummary> {
        self.build_cronjob_summary_at(cron_job, jobs, Utc::now()).await
    }

    pub async fn build_cronjob_summary_at(
        &self,
        cron_job: &CronJob,
        jobs: Vec<Job>,
        now: DateTime<Utc>,
    ) -> Result<CronjobSummary> {
        debug!(cronjob = %cron_job.name_any(), runs = jobs.len(), "Aggregating cronjob");
        let runs = self.build_job_summaries(jobs, now).await?;
        Ok(assemble(cron_job, runs))
    }
}

/// Creation time of a run; absent or unparsable timestamps sort first.
fn created_at(run: &JobSummary) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&run.creation_timestamp)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub fn sort_by_creation(runs: &mut [JobSummary]) {
    runs.sort_by_key(created_at);
}

/// Duration of the second-to-last completed run, so a run that just
/// finished does not skew the figure; the only completed run if there is
/// just one.
pub fn last_duration(sorted_runs: &[JobSummary]) -> i64 {
    let completed: Vec<&JobSummary> = sorted_runs.iter().filter(|r| r.is_completed()).collect();
    match completed.len() {
        0 => 0,
        1 => completed[0].duration_seconds,
        n => completed[n - 2].duration_seconds,
    }
}

pub fn current_duration(sorted_running_runs: &[JobSummary]) -> i64 {
    sorted_running_runs.last().map(|r| r.duration_seconds).unwrap_or(0)
}

fn assemble(cron_job: &CronJob, mut all_runs: Vec<JobSummary>) -> CronjobSummary {
    sort_by_creation(&mut all_runs);

    let running_runs: Vec<JobSummary> = all_runs.iter().filter(|r| r.is_running()).cloned().collect();
    let all_pods: Vec<PodSummary> = all_runs.iter().flat_map(|r| r.pods.iter().cloned()).collect();
    let running_pods: Vec<PodSummary> = all_pods.iter().filter(|p| p.phase == POD_RUNNING).cloned().collect();

    let spec = cron_job.spec.as_ref();
    let status = cron_job.status.as_ref();

    CronjobSummary {
        name: cron_job.name_any(),
        namespace: cron_job.namespace().unwrap_or_default(),
        uid: cron_job.uid().unwrap_or_default(),
        definition: spec.map(|s| s.schedule.clone()).unwrap_or_default(),
        concurrency_policy: spec.and_then(|s| s.concurrency_policy.clone()),
        creation_timestamp: format_time(cron_job.metadata.creation_timestamp.as_ref()),
        last_schedule_time: format_time(status.and_then(|s| s.last_schedule_time.as_ref())),
        last_successful_time: format_time(status.and_then(|s| s.last_successful_time.as_ref())),
        active: status.and_then(|s| s.active.as_ref()).is_some_and(|a| !a.is_empty()),
        last_duration: last_duration(&all_runs),
        current_duration: current_duration(&running_runs),
        container_commands: container_commands(cron_job),
        failed: all_runs.iter().any(|r| r.failed),
        all_runs,
        running_runs,
        all_pods,
        running_pods,
    }
}
