//! Derived, never-persisted views served to subscribers.

use chrono::{DateTime, Utc};
use k8s_openapi::api::{
    batch::v1::JobCondition,
    core::v1::{ContainerState, PodCondition},
};
use serde::{Deserialize, Serialize};

/// Why a container is considered to have failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminationReason {
    pub container_name: String,
    pub reason: Option<String>,
    pub message: Option<String>,
    pub exit_code: Option<i32>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerReport {
    pub name: String,
    pub phase: String,
    pub state: Option<ContainerState>,
    pub pod_conditions: Vec<PodCondition>,
    pub termination_reason: Option<TerminationReason>,
}

/// Per-container-kind grouping, used for reports and for template commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerGroups<T> {
    pub init_containers: Vec<T>,
    pub containers: Vec<T>,
    pub ephemeral_containers: Vec<T>,
}

impl<T> Default for ContainerGroups<T> {
    fn default() -> Self {
        Self {
            init_containers: Vec::new(),
            containers: Vec::new(),
            ephemeral_containers: Vec::new(),
        }
    }
}

impl<T> ContainerGroups<T> {
    pub fn is_empty(&self) -> bool {
        self.init_containers.is_empty() && self.containers.is_empty() && self.ephemeral_containers.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSummary {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub resource_version: Option<String>,
    pub phase: String,
    pub start_time: Option<DateTime<Utc>>,
    pub terminated_containers: ContainerGroups<ContainerReport>,
    pub failed_containers: ContainerGroups<ContainerReport>,
    pub termination_reasons: Vec<TerminationReason>,
    pub failed: bool,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub creation_timestamp: String,
    pub generation: i64,
    /// Human form of `duration_seconds`, e.g. `1m30s`.
    pub duration: String,
    pub duration_seconds: i64,
    /// Unix seconds of completion, 0 while the run has not completed.
    pub completion_seconds: i64,
    pub start_time: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
    pub active: i32,
    pub ready: i32,
    pub succeeded_pods: i32,
    pub failed_pods: i32,
    pub conditions: Vec<JobCondition>,
    pub succeeded: bool,
    pub failed: bool,
    pub failure_reason: Option<JobCondition>,
    pub pods: Vec<PodSummary>,
    pub termination_reasons: Vec<TerminationReason>,
    pub with_sidecar_containers: bool,
}

impl JobSummary {
    pub fn is_running(&self) -> bool {
        self.active > 0
    }

    /// Finished one way or the other, with nothing left running.
    pub fn is_completed(&self) -> bool {
        self.completion_time.is_some() || (self.failed && !self.is_running())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronjobSummary {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    /// The schedule expression.
    pub definition: String,
    pub concurrency_policy: Option<String>,
    pub creation_timestamp: String,
    pub last_schedule_time: String,
    pub last_successful_time: String,
    pub active: bool,
    pub last_duration: i64,
    pub current_duration: i64,
    pub container_commands: ContainerGroups<String>,
    pub all_runs: Vec<JobSummary>,
    pub running_runs: Vec<JobSummary>,
    pub all_pods: Vec<PodSummary>,
    pub running_pods: Vec<PodSummary>,
    pub failed: bool,
}

/// Just enough of a scheduled job to label a pod listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronjobRef {
    pub name: String,
    pub namespace: String,
    pub runs: Vec<JobSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronjobPods {
    pub pods: Vec<PodSummary>,
    pub cronjob: CronjobRef,
}
