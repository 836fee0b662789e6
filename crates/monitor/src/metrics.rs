use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use prometheus::{Encoder, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{delivery::Subscriber, service::CronjobService, summary::CronjobSummary, Error, Result};

const METRIC_NAMESPACE: &str = "cronwatch";

struct CronjobGauges {
    completions: IntGauge,
    failures: IntGauge,
    durations: IntGaugeVec,
}

impl CronjobGauges {
    fn collectors(&self) -> [Box<dyn prometheus::core::Collector>; 3] {
        [
            Box::new(self.completions.clone()),
            Box::new(self.failures.clone()),
            Box::new(self.durations.clone()),
        ]
    }
}

/// Owned Prometheus registry with the cluster-wide totals and one set of
/// gauges per scheduled job, keyed by `(namespace, name)`. Names that
/// sanitize to the same metric name stay apart through the `cronjob` label.
pub struct MetricsRegistry {
    registry: Registry,
    subsystem: String,
    name_pattern: Regex,
    registered: IntGauge,
    running: IntGauge,
    failing: IntGauge,
    completed: IntGauge,
    per_cronjob: Mutex<HashMap<(String, String), CronjobGauges>>,
}

impl MetricsRegistry {
    /// `watched_namespace` becomes the metric subsystem when set.
    pub fn new(watched_namespace: Option<&str>) -> Result<Self> {
        let name_pattern = Regex::new(r"_*[^0-9A-Za-z_]+_*")
            .map_err(|e| Error::Internal(format!("Invalid metric name pattern: {}", e)))?;
        let subsystem = watched_namespace
            .map(|ns| name_pattern.replace_all(ns, "_").into_owned())
            .unwrap_or_default();
        let registry = Registry::new();

        let gauge = |name: &str, help: &str| -> Result<IntGauge> {
            let gauge = IntGauge::with_opts(Opts::new(name, help).namespace(METRIC_NAMESPACE).subsystem(subsystem.as_str()))?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };

        let registered = gauge("registered_cronjobs_total", "Scheduled jobs currently defined")?;
        let running = gauge("running_cronjobs_total", "Runs currently active")?;
        let failing = gauge("failing_cronjobs_total", "Runs that have failed")?;
        let completed = gauge("completed_cronjobs_total", "Runs that have completed")?;

        Ok(Self {
            registry,
            subsystem,
            name_pattern,
            registered,
            running,
            failing,
            completed,
            per_cronjob: Mutex::new(HashMap::new()),
        })
    }

    pub fn sanitize_metric_name(&self, name: &str) -> String {
        self.name_pattern.replace_all(name, "_").into_owned()
    }

    fn cronjob_gauges(&self, namespace: &str, cronjob: &str) -> Result<CronjobGauges> {
        let name = self.sanitize_metric_name(cronjob);
        let opts = |suffix: &str, help: String| {
            Opts::new(format!("{}_{}", name, suffix), help)
                .namespace(METRIC_NAMESPACE)
                .subsystem(self.subsystem.as_str())
                .const_label("namespace", namespace)
                .const_label("cronjob", cronjob)
        };

        let gauges = CronjobGauges {
            completions: IntGauge::with_opts(opts("completion_total", format!("{} completion total", name)))?,
            failures: IntGauge::with_opts(opts("failure_total", format!("{} failure total", name)))?,
            durations: IntGaugeVec::new(
                opts("duration_seconds", format!("Duration of {} in seconds", name)),
                &["job_name"],
            )?,
        };
        for collector in gauges.collectors() {
            self.registry.register(collector)?;
        }
        Ok(gauges)
    }

    /// Updates every gauge from one batch of summaries. Scheduled jobs
    /// missing from the batch have their gauges unregistered.
    pub fn observe(&self, summaries: &[CronjobSummary]) -> Result<()> {
        let mut per_cronjob = self
            .per_cronjob
            .lock()
            .map_err(|e| Error::Internal(format!("Metrics lock poisoned: {}", e)))?;

        let (mut running, mut failing, mut completed) = (0, 0, 0);
        let mut seen = HashSet::new();

        for summary in summaries {
            let key = (summary.namespace.clone(), summary.name.clone());
            if !per_cronjob.contains_key(&key) {
                let gauges = self.cronjob_gauges(&key.0, &key.1)?;
                per_cronjob.insert(key.clone(), gauges);
            }
            let Some(gauges) = per_cronjob.get(&key) else {
                continue;
            };

            let completions = summary.all_runs.iter().filter(|r| r.completion_time.is_some()).count() as i64;
            let failures = summary.all_runs.iter().filter(|r| r.failed).count() as i64;
            gauges.completions.set(completions);
            gauges.failures.set(failures);

            gauges.durations.reset();
            for run in &summary.all_runs {
                let duration = if run.is_running() { run.duration_seconds } else { 0 };
                gauges.durations.with_label_values(&[run.name.as_str()]).set(duration);
            }

            running += summary.running_runs.len() as i64;
            failing += failures;
            completed += completions;
            seen.insert(key);
        }

        let gone: Vec<(String, String)> = per_cronjob.keys().filter(|k| !seen.contains(*k)).cloned().collect();
        for key in gone {
            if let Some(gauges) = per_cronjob.remove(&key) {
                debug!(namespace = %key.0, cronjob = %key.1, "Unregistering metrics");
                for collector in gauges.collectors() {
                    self.registry.unregister(collector)?;
                }
            }
        }

        self.registered.set(summaries.len() as i64);
        self.running.set(running);
        self.failing.set(failing);
        self.completed.set(completed);
        Ok(())
    }

    /// Text exposition of everything registered.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("Metrics output is not UTF-8: {}", e)))
    }
}

/// Feeds the registry from its own cronjob-list delivery loop.
#[derive(Clone)]
pub struct MetricsRecorder {
    metrics: Arc<MetricsRegistry>,
    shutdown: CancellationToken,
}

impl MetricsRecorder {
    pub fn new(metrics: Arc<MetricsRegistry>, shutdown: CancellationToken) -> Self {
        Self { metrics, shutdown }
    }

    /// Records until shutdown. A failed round is logged and retried on the
    /// next refresh.
    pub async fn run(self, service: Arc<CronjobService>) {
        info!("Starting metrics collection");
        let shutdown = self.shutdown.clone();

        let record = async {
            loop {
                match service.stream_cronjobs(self.clone()).await {
                    Ok(()) => break,
                    Err(e) => {
                        error!("Metrics collection failed: {}", e);
                        tokio::time::sleep(service.refresh_interval()).await;
                    }
                }
            }
        };

        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = record => {}
        }
        info!("Stopped metrics collection");
    }
}

#[async_trait]
impl Subscriber<Vec<CronjobSummary>> for MetricsRecorder {
    async fn push(&mut self, summaries: Vec<CronjobSummary>) -> Result<()> {
        self.metrics.observe(&summaries)
    }

    fn is_cancelled(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
