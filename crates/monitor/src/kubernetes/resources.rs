use std::cmp::Ordering;

use k8s_openapi::api::{batch::v1::Job, core::v1::Pod};
use kube::{Resource, ResourceExt};

/// Label the job controller puts on every pod it creates.
pub const JOB_NAME_LABEL: &str = "job-name";

pub fn same_identity<K: Resource>(a: &K, b: &K) -> bool {
    a.meta().name == b.meta().name && a.meta().namespace == b.meta().namespace
}

/// Name of the `CronJob` that spawned this run, if any.
pub fn cron_job_owner(job: &Job) -> Option<&str> {
    job.owner_references()
        .iter()
        .find(|owner| owner.kind == "CronJob")
        .map(|owner| owner.name.as_str())
}

/// Runs created by hand (`kubectl create job`) rather than by a schedule.
pub fn is_standalone(job: &Job) -> bool {
    job.owner_references().is_empty()
}

pub fn is_owned_by(pod: &Pod, job_name: &str) -> bool {
    pod.owner_references().iter().any(|owner| owner.name == job_name)
}

/// Name of the `Job` that owns this pod, falling back to the job-name label.
pub fn job_owner(pod: &Pod) -> Option<String> {
    pod.owner_references()
        .iter()
        .find(|owner| owner.kind == "Job")
        .map(|owner| owner.name.clone())
        .or_else(|| pod.labels().get(JOB_NAME_LABEL).cloned())
}

/// Orders resource versions numerically when both parse, lexically otherwise.
pub fn compare_resource_versions(a: Option<&str>, b: Option<&str>) -> Ordering {
    match (a.and_then(|v| v.parse::<u64>().ok()), b.and_then(|v| v.parse::<u64>().ok())) {
        (Some(a), Some(b)) => a.cmp(&b),
        _ => a.cmp(&b),
    }
}
