//! Pure status derivation for job runs and their pods.
//!
//! Nothing here touches the cache or the cluster; callers pass in the
//! snapshots (and the current time, where it matters).

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use k8s_openapi::{
    api::{
        batch::v1::{CronJob, Job, JobCondition},
        core::v1::{ContainerStatus, Pod, PodCondition},
    },
    apimachinery::pkg::apis::meta::v1::Time,
};
use kube::ResourceExt;

use crate::summary::{ContainerGroups, ContainerReport, JobSummary, PodSummary, TerminationReason};

pub const FAILED_CONDITION: &str = "Failed";
/// Waiting reason for a container whose config (secret, configmap) can never resolve.
pub const CONFIG_ERROR_REASON: &str = "CreateContainerConfigError";
/// Terminated reason for a container that exited non-zero.
pub const ERROR_REASON: &str = "Error";
pub const SIDECAR_RESTART_POLICY: &str = "Always";
pub const POD_RUNNING: &str = "Running";

#[derive(Debug, Clone, PartialEq)]
pub struct FailureState {
    pub failed: bool,
    pub failure_condition: Option<JobCondition>,
    pub conditions: Vec<JobCondition>,
}

/// A run has failed if the control plane posted a `Failed` condition or if
/// any of its pods failed, whichever shows up first.
pub fn compute_failure(job: &Job, pods: &[PodSummary]) -> FailureState {
    let conditions = job
        .status
        .as_ref()
        .and_then(|s| s.conditions.clone())
        .unwrap_or_default();

    let failure_condition = conditions.iter().find(|c| c.type_ == FAILED_CONDITION).cloned();
    let failed = failure_condition.is_some() || pods.iter().any(|p| p.failed);

    FailureState {
        failed,
        failure_condition,
        conditions,
    }
}

pub fn compute_duration(
    job: &Job,
    failed: bool,
    failure_condition: Option<&JobCondition>,
    now: DateTime<Utc>,
) -> Duration {
    let status = job.status.as_ref();
    let started = status.and_then(|s| s.start_time.as_ref());
    let failed_at = failure_condition
        .filter(|_| failed)
        .and_then(|c| c.last_transition_time.as_ref());

    match (failed_at, started) {
        // a run that failed before the controller recorded a start has no duration
        (_, None) => Duration::zero(),
        (Some(failed_at), Some(started)) => failed_at.0 - started.0,
        (None, Some(started)) => match status.and_then(|s| s.completion_time.as_ref()) {
            Some(completed) => completed.0 - started.0,
            None => now - started.0,
        },
    }
}

pub fn completion_seconds(job: &Job) -> i64 {
    job.status
        .as_ref()
        .and_then(|s| s.completion_time.as_ref())
        .map(|t| t.0.timestamp())
        .unwrap_or(0)
}

/// `1h2m3s` style, truncated to whole seconds.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.num_seconds();
    let sign = if total < 0 { "-" } else { "" };
    let total = total.abs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);

    if hours > 0 {
        format!("{}{}h{}m{}s", sign, hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}{}m{}s", sign, minutes, seconds)
    } else {
        format!("{}{}s", sign, seconds)
    }
}

/// Containers of a pod sorted into "stopped" (informational) and "failed".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PodTermination {
    pub terminated: ContainerGroups<ContainerReport>,
    pub failed: ContainerGroups<ContainerReport>,
    pub reasons: Vec<TerminationReason>,
}

impl PodTermination {
    pub fn is_failed(&self) -> bool {
        !self.reasons.is_empty()
    }
}

pub fn compute_termination_reasons(pod: &Pod) -> PodTermination {
    let mut termination = PodTermination::default();
    let Some(status) = pod.status.as_ref() else {
        return termination;
    };

    let phase = status.phase.clone().unwrap_or_default();
    let conditions = status.conditions.clone().unwrap_or_default();
    let started = status.start_time.as_ref();
    let mut reasons = Vec::new();

    let mut classify = |statuses: &Option<Vec<ContainerStatus>>| {
        let mut terminated = Vec::new();
        let mut failed = Vec::new();
        for container in statuses.iter().flatten() {
            for report in classify_container(container, &phase, &conditions, started) {
                if let Some(reason) = &report.termination_reason {
                    reasons.push(reason.clone());
                    failed.push(report.clone());
                }
                terminated.push(report);
            }
        }
        (terminated, failed)
    };

    let (ephemeral_terminated, ephemeral_failed) = classify(&status.ephemeral_container_statuses);
    let (init_terminated, init_failed) = classify(&status.init_container_statuses);
    let (main_terminated, main_failed) = classify(&status.container_statuses);

    termination.terminated = ContainerGroups {
        init_containers: init_terminated,
        containers: main_terminated,
        ephemeral_containers: ephemeral_terminated,
    };
    termination.failed = ContainerGroups {
        init_containers: init_failed,
        containers: main_failed,
        ephemeral_containers: ephemeral_failed,
    };
    termination.reasons = reasons;
    termination
}

// A container can report both a waiting and a terminated state (the last
// termination of a restarting container); each is classified on its own.
fn classify_container(
    container: &ContainerStatus,
    phase: &str,
    conditions: &[PodCondition],
    pod_started: Option<&Time>,
) -> Vec<ContainerReport> {
    let Some(state) = container.state.as_ref() else {
        return Vec::new();
    };
    let report = |termination_reason: Option<TerminationReason>| ContainerReport {
        name: container.name.clone(),
        phase: phase.to_string(),
        state: container.state.clone(),
        pod_conditions: conditions.to_vec(),
        termination_reason,
    };

    let mut reports = Vec::new();

    if let Some(waiting) = &state.waiting {
        let fatal = waiting.reason.as_deref() == Some(CONFIG_ERROR_REASON);
        reports.push(report(fatal.then(|| TerminationReason {
            container_name: container.name.clone(),
            reason: waiting.reason.clone(),
            message: waiting.message.clone(),
            exit_code: None,
            finished_at: pod_started.map(|t| t.0),
        })));
    }

    if let Some(terminated) = &state.terminated {
        let fatal = terminated.reason.as_deref() == Some(ERROR_REASON);
        reports.push(report(fatal.then(|| TerminationReason {
            container_name: container.name.clone(),
            reason: terminated.reason.clone(),
            message: terminated.message.clone(),
            exit_code: Some(terminated.exit_code),
            finished_at: terminated.finished_at.as_ref().map(|t| t.0),
        })));
    }

    reports
}

/// Init containers with an `Always` restart policy are sidecars: they keep
/// running for the life of the pod and do not block completion.
pub fn has_sidecar(job: &Job) -> bool {
    job.spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|s| s.init_containers.as_ref())
        .map(|containers| {
            containers
                .iter()
                .any(|c| c.restart_policy.as_deref() == Some(SIDECAR_RESTART_POLICY))
        })
        .unwrap_or(false)
}

pub fn summarize_pod(pod: &Pod) -> PodSummary {
    let termination = compute_termination_reasons(pod);
    let status = pod.status.as_ref();

    // latest termination among the main containers
    let finished_at = termination
        .terminated
        .containers
        .iter()
        .filter_map(|c| c.state.as_ref()?.terminated.as_ref()?.finished_at.as_ref())
        .map(|t| t.0)
        .max();

    PodSummary {
        name: pod.name_any(),
        namespace: pod.namespace().unwrap_or_default(),
        uid: pod.uid().unwrap_or_default(),
        resource_version: pod.resource_version(),
        phase: status.and_then(|s| s.phase.clone()).unwrap_or_default(),
        start_time: status.and_then(|s| s.start_time.as_ref()).map(|t| t.0),
        failed: termination.is_failed(),
        termination_reasons: termination.reasons,
        terminated_containers: termination.terminated,
        failed_containers: termination.failed,
        finished_at,
    }
}

/// Builds the full summary of one run from its already-filtered pods.
pub fn summarize_job(job: &Job, pods: &[Pod], now: DateTime<Utc>) -> JobSummary {
    let pod_summaries: Vec<PodSummary> = pods.iter().map(summarize_pod).collect();
    let failure = compute_failure(job, &pod_summaries);
    let duration = compute_duration(job, failure.failed, failure.failure_condition.as_ref(), now);
    let termination_reasons = pod_summaries
        .iter()
        .flat_map(|p| p.termination_reasons.iter().cloned())
        .collect();
    let status = job.status.clone().unwrap_or_default();

    JobSummary {
        name: job.name_any(),
        namespace: job.namespace().unwrap_or_default(),
        uid: job.uid().unwrap_or_default(),
        creation_timestamp: format_time(job.metadata.creation_timestamp.as_ref()),
        generation: job.metadata.generation.unwrap_or_default(),
        duration: format_duration(duration),
        duration_seconds: duration.num_seconds(),
        completion_seconds: completion_seconds(job),
        start_time: status.start_time.as_ref().map(|t| t.0),
        completion_time: status.completion_time.as_ref().map(|t| t.0),
        active: status.active.unwrap_or_default(),
        ready: status.ready.unwrap_or_default(),
        succeeded_pods: status.succeeded.unwrap_or_default(),
        failed_pods: status.failed.unwrap_or_default(),
        conditions: failure.conditions,
        // completion time is only set once the run succeeds
        succeeded: status.completion_time.is_some(),
        failed: failure.failed,
        failure_reason: failure.failure_condition,
        pods: pod_summaries,
        termination_reasons,
        with_sidecar_containers: has_sidecar(job),
    }
}

/// Each container's command tokens joined by spaces, grouped by container kind.
pub fn container_commands(cron_job: &CronJob) -> ContainerGroups<String> {
    let Some(pod_spec) = cron_job
        .spec
        .as_ref()
        .and_then(|s| s.job_template.spec.as_ref())
        .and_then(|s| s.template.spec.as_ref())
    else {
        return ContainerGroups::default();
    };

    let join = |command: &Option<Vec<String>>| command.as_deref().unwrap_or_default().join(" ");

    ContainerGroups {
        init_containers: pod_spec.init_containers.iter().flatten().map(|c| join(&c.command)).collect(),
        containers: pod_spec.containers.iter().map(|c| join(&c.command)).collect(),
        ephemeral_containers: pod_spec
            .ephemeral_containers
            .iter()
            .flatten()
            .map(|c| join(&c.command))
            .collect(),
    }
}

/// RFC 3339 at second precision, empty when absent.
pub fn format_time(time: Option<&Time>) -> String {
    time.map(|t| t.0.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{CronJobBuilder, JobBuilder, PodBuilder};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 2, 0, 0).unwrap()
    }

    #[test]
    fn test_failed_condition_is_captured() {
        let job = JobBuilder::new("run")
            .condition("Suspended", t0())
            .condition("Failed", t0() + Duration::seconds(5))
            .build();

        let failure = compute_failure(&job, &[]);

        assert!(failure.failed);
        assert_eq!(failure.failure_condition.unwrap().type_, "Failed");
        assert_eq!(failure.conditions.len(), 2);
    }

    #[test]
    fn test_failed_pod_fails_run_without_condition() {
        let job = JobBuilder::new("run").started_at(t0()).active(1).build();
        let pod = PodBuilder::new("run-abc")
            .owned_by_job("run")
            .started_at(t0())
            .terminated("main", "Error", t0() + Duration::seconds(3))
            .build();

        let failure = compute_failure(&job, &[summarize_pod(&pod)]);

        assert!(failure.failed);
        assert!(failure.failure_condition.is_none());
    }

    #[test]
    fn test_healthy_run_is_not_failed() {
        let job = JobBuilder::new("run").condition("Complete", t0()).build();
        let failure = compute_failure(&job, &[]);
        assert!(!failure.failed);
        assert!(failure.failure_condition.is_none());
    }

    #[test]
    fn test_duration_of_failed_run_ends_at_failure() {
        let job = JobBuilder::new("run")
            .started_at(t0())
            .condition("Failed", t0() + Duration::seconds(42))
            .build();
        let failure = compute_failure(&job, &[]);

        let duration = compute_duration(&job, failure.failed, failure.failure_condition.as_ref(), t0() + Duration::hours(1));

        assert_eq!(duration, Duration::seconds(42));
    }

    #[test]
    fn test_duration_without_start_is_zero() {
        let job = JobBuilder::new("run").build();
        assert_eq!(compute_duration(&job, false, None, t0()), Duration::zero());
    }

    #[test]
    fn test_failed_run_that_never_started_is_zero() {
        let job = JobBuilder::new("run").condition("Failed", t0() + Duration::seconds(42)).build();
        let failure = compute_failure(&job, &[]);

        assert!(failure.failed);
        let duration = compute_duration(&job, failure.failed, failure.failure_condition.as_ref(), t0());
        assert_eq!(duration, Duration::zero());
    }

    #[test]
    fn test_pod_failure_without_condition_keeps_counting() {
        let job = JobBuilder::new("run").started_at(t0()).active(1).failed_pods(2).build();
        let pod = PodBuilder::new("run-a")
            .owned_by_job("run")
            .started_at(t0())
            .terminated("main", "Error", t0() + Duration::seconds(10))
            .build();

        let summary = summarize_job(&job, &[pod], t0() + Duration::seconds(90));

        assert!(summary.failed);
        assert!(summary.failure_reason.is_none());
        assert_eq!(summary.failed_pods, 2);
        assert_eq!(summary.duration_seconds, 90);
    }

    #[test]
    fn test_duration_of_completed_run() {
        let job = JobBuilder::new("run")
            .started_at(t0())
            .completed_at(t0() + Duration::seconds(30))
            .build();
        assert_eq!(compute_duration(&job, false, None, t0() + Duration::hours(2)), Duration::seconds(30));
    }

    #[test]
    fn test_duration_of_live_run_grows_with_time() {
        let job = JobBuilder::new("run").started_at(t0()).active(1).build();

        let mut previous = Duration::zero();
        for offset in [1, 5, 5, 60, 3600] {
            let now = t0() + Duration::seconds(offset);
            let duration = compute_duration(&job, false, None, now);
            assert!(duration >= previous);
            assert_eq!(duration, Duration::seconds(offset));
            previous = duration;
        }
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::zero()), "0s");
        assert_eq!(format_duration(Duration::seconds(30)), "30s");
        assert_eq!(format_duration(Duration::seconds(90)), "1m30s");
        assert_eq!(format_duration(Duration::seconds(3723)), "1h2m3s");
        assert_eq!(format_duration(Duration::milliseconds(-2500)), "-2s");
    }

    #[test]
    fn test_config_error_marks_pod_terminated_and_failed() {
        let pod = PodBuilder::new("run-abc")
            .started_at(t0())
            .waiting("app", CONFIG_ERROR_REASON, "secret \"creds\" not found")
            .build();

        let termination = compute_termination_reasons(&pod);

        assert_eq!(termination.terminated.containers.len(), 1);
        assert_eq!(termination.failed.containers.len(), 1);
        let reason = termination.failed.containers[0].termination_reason.as_ref().unwrap();
        assert_eq!(reason.container_name, "app");
        assert_eq!(reason.finished_at, Some(t0()));
        assert_eq!(termination.reasons.len(), 1);
        assert!(summarize_pod(&pod).failed);
    }

    #[test]
    fn test_benign_states_are_informational_only() {
        let pod = PodBuilder::new("run-abc")
            .started_at(t0())
            .waiting("app", "ContainerCreating", "")
            .init_terminated("setup", "Completed", t0() + Duration::seconds(1))
            .build();

        let termination = compute_termination_reasons(&pod);

        assert_eq!(termination.terminated.containers.len(), 1);
        assert_eq!(termination.terminated.init_containers.len(), 1);
        assert!(termination.failed.is_empty());
        assert!(!termination.is_failed());
    }

    #[test]
    fn test_error_exit_in_init_container_fails_pod() {
        let pod = PodBuilder::new("run-abc")
            .started_at(t0())
            .init_terminated("migrate", "Error", t0() + Duration::seconds(9))
            .build();

        let summary = summarize_pod(&pod);

        assert!(summary.failed);
        assert_eq!(summary.failed_containers.init_containers.len(), 1);
        assert_eq!(summary.termination_reasons[0].exit_code, Some(1));
        // finishedAt only tracks main containers
        assert_eq!(summary.finished_at, None);
    }

    #[test]
    fn test_pod_finished_at_is_latest_main_termination() {
        let pod = PodBuilder::new("run-abc")
            .started_at(t0())
            .terminated("a", "Completed", t0() + Duration::seconds(10))
            .terminated("b", "Completed", t0() + Duration::seconds(20))
            .build();

        assert_eq!(summarize_pod(&pod).finished_at, Some(t0() + Duration::seconds(20)));
    }

    #[test]
    fn test_sidecar_detection() {
        let with_sidecar = JobBuilder::new("a").init_container_with_restart_policy("proxy", "Always").build();
        let plain_init = JobBuilder::new("b").init_container_with_restart_policy("setup", "OnFailure").build();

        assert!(has_sidecar(&with_sidecar));
        assert!(!has_sidecar(&plain_init));
        assert!(!has_sidecar(&JobBuilder::new("c").build()));
    }

    #[test]
    fn test_container_commands_are_space_joined() {
        let cron_job = CronJobBuilder::new("nightly-export")
            .init_container("fetch", &["sh", "-c", "fetch.sh"])
            .container("export", &["python", "export.py", "--all"])
            .build();

        let commands = container_commands(&cron_job);

        assert_eq!(commands.init_containers, vec!["sh -c fetch.sh"]);
        assert_eq!(commands.containers, vec!["python export.py --all"]);
        assert!(commands.ephemeral_containers.is_empty());
    }

    #[test]
    fn test_summarize_job_collects_pod_reasons() {
        let job = JobBuilder::new("run")
            .created_at(t0())
            .started_at(t0())
            .completed_at(t0() + Duration::seconds(90))
            .succeeded(1)
            .build();
        let pod = PodBuilder::new("run-abc")
            .owned_by_job("run")
            .started_at(t0())
            .terminated("main", "Error", t0() + Duration::seconds(30))
            .build();

        let summary = summarize_job(&job, &[pod], t0() + Duration::hours(1));

        assert_eq!(summary.creation_timestamp, "2024-03-01T02:00:00Z");
        assert_eq!(summary.duration_seconds, 90);
        assert_eq!(summary.duration, "1m30s");
        assert!(summary.succeeded);
        assert!(summary.failed);
        assert_eq!(summary.termination_reasons.len(), 1);
        assert_eq!(summary.completion_seconds, (t0() + Duration::seconds(90)).timestamp());
    }
}
