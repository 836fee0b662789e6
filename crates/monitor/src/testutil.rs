//! Fixture builders for cluster objects used across the unit tests.

use chrono::{DateTime, Utc};
use k8s_openapi::{
    api::{
        batch::v1::{
            CronJob, CronJobSpec, CronJobStatus, Job, JobCondition, JobSpec, JobStatus, JobTemplateSpec,
        },
        core::v1::{
            Container, ContainerState, ContainerStateTerminated, ContainerStateWaiting, ContainerStatus,
            ObjectReference, Pod, PodSpec, PodStatus, PodTemplateSpec,
        },
    },
    apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time},
};
use std::{collections::BTreeMap, sync::Arc, time::Duration};

use crate::store::{CacheStore, SqliteStore};

/// Polls `check` every 10ms for up to two seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// A migrated in-memory SQLite store.
pub async fn memory_store() -> Arc<dyn CacheStore> {
    let store = SqliteStore::new(":memory:", 1).await.unwrap();
    store.init().await.unwrap();
    Arc::new(store)
}

fn meta(name: &str, namespace: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        uid: Some(format!("{}-uid", name)),
        ..Default::default()
    }
}

fn owner(kind: &str, name: &str) -> OwnerReference {
    OwnerReference {
        api_version: "batch/v1".to_string(),
        kind: kind.to_string(),
        name: name.to_string(),
        uid: format!("{}-uid", name),
        ..Default::default()
    }
}

fn container(name: &str, command: &[&str]) -> Container {
    Container {
        name: name.to_string(),
        image: Some("busybox".to_string()),
        command: Some(command.iter().map(|c| c.to_string()).collect()),
        ..Default::default()
    }
}

pub struct CronJobBuilder {
    cron_job: CronJob,
}

impl CronJobBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            cron_job: CronJob {
                metadata: meta(name, "default"),
                spec: Some(CronJobSpec {
                    schedule: "*/5 * * * *".to_string(),
                    job_template: JobTemplateSpec {
                        metadata: None,
                        spec: Some(JobSpec {
                            template: PodTemplateSpec {
                                metadata: None,
                                spec: Some(PodSpec::default()),
                            },
                            ..Default::default()
                        }),
                    },
                    ..Default::default()
                }),
                status: Some(CronJobStatus::default()),
            },
        }
    }

    fn pod_spec(&mut self) -> &mut PodSpec {
        self.cron_job
            .spec
            .get_or_insert_with(Default::default)
            .job_template
            .spec
            .get_or_insert_with(Default::default)
            .template
            .spec
            .get_or_insert_with(Default::default)
    }

    pub fn container(mut self, name: &str, command: &[&str]) -> Self {
        self.pod_spec().containers.push(container(name, command));
        self
    }

    pub fn init_container(mut self, name: &str, command: &[&str]) -> Self {
        self.pod_spec()
            .init_containers
            .get_or_insert_with(Vec::new)
            .push(container(name, command));
        self
    }

    pub fn last_schedule_time(mut self, at: DateTime<Utc>) -> Self {
        self.cron_job.status.get_or_insert_with(Default::default).last_schedule_time = Some(Time(at));
        self
    }

    pub fn last_successful_time(mut self, at: DateTime<Utc>) -> Self {
        self.cron_job.status.get_or_insert_with(Default::default).last_successful_time = Some(Time(at));
        self
    }

    pub fn active_run(mut self, job_name: &str) -> Self {
        self.cron_job
            .status
            .get_or_insert_with(Default::default)
            .active
            .get_or_insert_with(Vec::new)
            .push(ObjectReference {
                kind: Some("Job".to_string()),
                name: Some(job_name.to_string()),
                ..Default::default()
            });
        self
    }

    pub fn build(self) -> CronJob {
        self.cron_job
    }
}

pub struct JobBuilder {
    job: Job,
}

impl JobBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            job: Job {
                metadata: meta(name, "default"),
                spec: Some(JobSpec {
                    template: PodTemplateSpec {
                        metadata: None,
                        spec: Some(PodSpec::default()),
                    },
                    ..Default::default()
                }),
                status: Some(JobStatus::default()),
            },
        }
    }

    pub fn namespace(mut self, namespace: &str) -> Self {
        self.job.metadata.namespace = Some(namespace.to_string());
        self
    }

    pub fn owned_by_cron_job(mut self, cron_job: &str) -> Self {
        self.job
            .metadata
            .owner_references
            .get_or_insert_with(Vec::new)
            .push(owner("CronJob", cron_job));
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.job.metadata.creation_timestamp = Some(Time(at));
        self
    }

    pub fn resource_version(mut self, version: &str) -> Self {
        self.job.metadata.resource_version = Some(version.to_string());
        self
    }

    fn status(&mut self) -> &mut JobStatus {
        self.job.status.get_or_insert_with(Default::default)
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.status().start_time = Some(Time(at));
        self
    }

    pub fn completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.status().completion_time = Some(Time(at));
        self
    }

    pub fn active(mut self, count: i32) -> Self {
        self.status().active = Some(count);
        self
    }

    pub fn succeeded(mut self, count: i32) -> Self {
        self.status().succeeded = Some(count);
        self
    }

    pub fn failed_pods(mut self, count: i32) -> Self {
        self.status().failed = Some(count);
        self
    }

    pub fn condition(mut self, type_: &str, transitioned_at: DateTime<Utc>) -> Self {
        self.status().conditions.get_or_insert_with(Vec::new).push(JobCondition {
            type_: type_.to_string(),
            status: "True".to_string(),
            last_transition_time: Some(Time(transitioned_at)),
            reason: Some(format!("{}Reason", type_)),
            ..Default::default()
        });
        self
    }

    pub fn init_container_with_restart_policy(mut self, name: &str, policy: &str) -> Self {
        let spec = self
            .job
            .spec
            .get_or_insert_with(Default::default)
            .template
            .spec
            .get_or_insert_with(Default::default);
        spec.init_containers.get_or_insert_with(Vec::new).push(Container {
            name: name.to_string(),
            restart_policy: Some(policy.to_string()),
            ..Default::default()
        });
        self
    }

    pub fn build(self) -> Job {
        self.job
    }
}

pub struct PodBuilder {
    pod: Pod,
}

impl PodBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            pod: Pod {
                metadata: meta(name, "default"),
                spec: Some(PodSpec::default()),
                status: Some(PodStatus::default()),
            },
        }
    }

    pub fn owned_by_job(mut self, job: &str) -> Self {
        self.pod
            .metadata
            .owner_references
            .get_or_insert_with(Vec::new)
            .push(owner("Job", job));
        self
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.pod
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn resource_version(mut self, version: &str) -> Self {
        self.pod.metadata.resource_version = Some(version.to_string());
        self
    }

    fn status(&mut self) -> &mut PodStatus {
        self.pod.status.get_or_insert_with(Default::default)
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.status().start_time = Some(Time(at));
        self
    }

    pub fn phase(mut self, phase: &str) -> Self {
        self.status().phase = Some(phase.to_string());
        self
    }

    pub fn waiting(mut self, container: &str, reason: &str, message: &str) -> Self {
        self.status().container_statuses.get_or_insert_with(Vec::new).push(ContainerStatus {
            name: container.to_string(),
            state: Some(ContainerState {
                waiting: Some(ContainerStateWaiting {
                    reason: Some(reason.to_string()),
                    message: Some(message.to_string()),
                }),
                ..Default::default()
            }),
            ..Default::default()
        });
        self
    }

    pub fn terminated(mut self, container: &str, reason: &str, finished_at: DateTime<Utc>) -> Self {
        self.status().container_statuses.get_or_insert_with(Vec::new).push(terminated_status(
            container,
            reason,
            finished_at,
        ));
        self
    }

    pub fn init_terminated(mut self, container: &str, reason: &str, finished_at: DateTime<Utc>) -> Self {
        self.status()
            .init_container_statuses
            .get_or_insert_with(Vec::new)
            .push(terminated_status(container, reason, finished_at));
        self
    }

    pub fn build(self) -> Pod {
        self.pod
    }
}

fn terminated_status(container: &str, reason: &str, finished_at: DateTime<Utc>) -> ContainerStatus {
    ContainerStatus {
        name: container.to_string(),
        state: Some(ContainerState {
            terminated: Some(ContainerStateTerminated {
                exit_code: if reason == "Completed" { 0 } else { 1 },
                reason: Some(reason.to_string()),
                finished_at: Some(Time(finished_at)),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}
