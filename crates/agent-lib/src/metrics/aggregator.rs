//! Per-partition rollups of glidein activity
//!
//! Worker counts come from lifecycle transitions reported by the agents, not
//! from guesses. Every window close emits the full set of partition series,
//! zeros included, so a consumer can tell "reported zero" from "never
//! reported".

use super::backend::TimeSeriesBackend;
use crate::health::{components, HealthRegistry};
use crate::models::{
    series_name, AggregatedMetric, AggregatorEvent, MetricSample, TransitionKind,
    WorkerTransition,
};
use crate::observability::GlideinMetrics;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tracing::{debug, info, warn};

pub const LAUNCHED: &str = "glideins.launched";
pub const RUNNING: &str = "glideins.running";
pub const IDLE: &str = "glideins.idle";
pub const AVG_IDLE_TIME: &str = "glideins.avg_idle_time";
pub const MIN_IDLE_TIME: &str = "glideins.min_idle_time";
pub const MAX_IDLE_TIME: &str = "glideins.max_idle_time";

/// Partition series emitted on every window close
pub const PARTITION_METRICS: [&str; 6] = [
    LAUNCHED,
    RUNNING,
    IDLE,
    AVG_IDLE_TIME,
    MIN_IDLE_TIME,
    MAX_IDLE_TIME,
];

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// First component of every series name
    pub namespace: String,
    /// Source component for partition rollups (the controller's client id)
    pub reporter_id: String,
    /// Length of one aggregation window
    pub window: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            namespace: "pyglidein".to_string(),
            reporter_id: "pyglideinclient".to_string(),
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Launched,
    Idle { since: i64 },
    Busy,
    Draining,
}

#[derive(Debug, Clone)]
struct WorkerView {
    partition: String,
    state: WorkerState,
}

/// Counts for one partition, computed at call time
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartitionSnapshot {
    pub launched: u32,
    pub running: u32,
    pub idle: u32,
    pub avg_idle_time: f64,
    pub min_idle_time: f64,
    pub max_idle_time: f64,
}

#[derive(Debug, Default)]
struct AggregatorState {
    workers: HashMap<String, WorkerView>,
    samples: Vec<MetricSample>,
    /// Partitions ever seen; they keep reporting after their last worker leaves
    partitions: BTreeSet<String>,
}

impl AggregatorState {
    fn apply(&mut self, transition: WorkerTransition) {
        self.partitions.insert(transition.partition.clone());
        let state = match transition.kind {
            TransitionKind::Terminated => {
                self.workers.remove(&transition.worker_id);
                return;
            }
            TransitionKind::Launched => WorkerState::Launched,
            TransitionKind::Busy => WorkerState::Busy,
            TransitionKind::Draining => WorkerState::Draining,
            TransitionKind::Idle => match self.workers.get(&transition.worker_id) {
                // repeated idle reports keep the original idle start
                Some(WorkerView {
                    state: WorkerState::Idle { since },
                    ..
                }) => WorkerState::Idle { since: *since },
                _ => WorkerState::Idle {
                    since: transition.timestamp,
                },
            },
        };
        self.workers.insert(
            transition.worker_id,
            WorkerView {
                partition: transition.partition,
                state,
            },
        );
    }

    fn snapshot(&self, partition: &str, now: i64) -> PartitionSnapshot {
        let mut snapshot = PartitionSnapshot::default();
        let mut idle_times = Vec::new();

        for view in self.workers.values().filter(|v| v.partition == partition) {
            snapshot.launched += 1;
            match view.state {
                WorkerState::Busy => snapshot.running += 1,
                WorkerState::Idle { since } => {
                    snapshot.idle += 1;
                    idle_times.push((now - since).max(0) as f64);
                }
                WorkerState::Launched | WorkerState::Draining => {}
            }
        }

        if !idle_times.is_empty() {
            snapshot.avg_idle_time = idle_times.iter().sum::<f64>() / idle_times.len() as f64;
            snapshot.min_idle_time = idle_times.iter().copied().fold(f64::INFINITY, f64::min);
            snapshot.max_idle_time = idle_times.iter().copied().fold(0.0, f64::max);
        }
        snapshot
    }
}

/// Accumulates transitions and samples and rolls them up per window
pub struct MetricsAggregator {
    config: AggregatorConfig,
    state: Mutex<AggregatorState>,
    metrics: GlideinMetrics,
    health: Option<HealthRegistry>,
}

impl MetricsAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self {
            config,
            state: Mutex::new(AggregatorState::default()),
            metrics: GlideinMetrics::new(),
            health: None,
        }
    }

    /// Report every push outcome as the aggregator's health
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AggregatorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn window_start(&self, now: i64) -> i64 {
        now - self.config.window.as_secs() as i64
    }

    /// Ingest one event. Returns false when a sample was dropped as stale.
    pub fn ingest(&self, event: AggregatorEvent, now: i64) -> bool {
        match event {
            AggregatorEvent::Transition(transition) => {
                self.lock().apply(transition);
                true
            }
            AggregatorEvent::Sample(sample) => {
                if sample.timestamp < self.window_start(now) {
                    self.metrics.inc_stale_samples();
                    debug!(
                        worker_id = %sample.worker_id,
                        metric = %sample.metric,
                        "Dropping stale metric sample"
                    );
                    return false;
                }
                let mut state = self.lock();
                state.partitions.insert(sample.partition.clone());
                state.samples.push(sample);
                true
            }
        }
    }

    /// Fresh counts for a partition
    pub fn snapshot(&self, partition: &str, now: i64) -> PartitionSnapshot {
        self.lock().snapshot(partition, now)
    }

    /// Idle workers of a partition with their idle seconds, longest idle first
    pub fn idle_workers(&self, partition: &str, now: i64) -> Vec<(String, i64)> {
        let state = self.lock();
        let mut idle: Vec<(String, i64)> = state
            .workers
            .iter()
            .filter(|(_, view)| view.partition == partition)
            .filter_map(|(id, view)| match view.state {
                WorkerState::Idle { since } => Some((id.clone(), (now - since).max(0))),
                _ => None,
            })
            .collect();
        idle.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        idle
    }

    /// Close the current window: compute every series and start a new window
    pub fn close_window(&self, now: i64) -> Vec<AggregatedMetric> {
        let window_start = self.window_start(now);
        let mut state = self.lock();
        let mut points = Vec::new();

        for partition in &state.partitions {
            let snapshot = state.snapshot(partition, now);
            let values = [
                (LAUNCHED, snapshot.launched as f64),
                (RUNNING, snapshot.running as f64),
                (IDLE, snapshot.idle as f64),
                (AVG_IDLE_TIME, snapshot.avg_idle_time),
                (MIN_IDLE_TIME, snapshot.min_idle_time),
                (MAX_IDLE_TIME, snapshot.max_idle_time),
            ];
            for (metric, value) in values {
                points.push(AggregatedMetric {
                    series: series_name(
                        &self.config.namespace,
                        &self.config.reporter_id,
                        partition,
                        metric,
                    ),
                    timestamp: now,
                    value,
                });
            }
        }

        // latest in-window value per worker series
        let mut latest: BTreeMap<String, (i64, f64)> = BTreeMap::new();
        for sample in state.samples.drain(..) {
            if sample.timestamp < window_start {
                self.metrics.inc_stale_samples();
                continue;
            }
            let name = series_name(
                &sample.namespace,
                &sample.worker_id,
                &sample.partition,
                &sample.metric,
            );
            let slot = latest.entry(name).or_insert((sample.timestamp, sample.value));
            if sample.timestamp >= slot.0 {
                *slot = (sample.timestamp, sample.value);
            }
        }
        points.extend(latest.into_iter().map(|(series, (_, value))| AggregatedMetric {
            series,
            timestamp: now,
            value,
        }));

        points
    }

    /// Consume events and push a rollup to `backend` at every window close
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<AggregatorEvent>,
        backend: Arc<dyn TimeSeriesBackend>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(
            window_secs = self.config.window.as_secs(),
            namespace = %self.config.namespace,
            "Starting metrics aggregator"
        );
        let mut ticker = interval(self.config.window);
        ticker.tick().await;

        loop {
            tokio::select! {
                Some(event) = events.recv() => {
                    self.ingest(event, chrono::Utc::now().timestamp());
                }
                _ = ticker.tick() => {
                    self.flush(backend.as_ref()).await;
                }
                _ = shutdown.recv() => {
                    self.flush(backend.as_ref()).await;
                    info!("Shutting down metrics aggregator");
                    break;
                }
            }
        }
    }

    async fn flush(&self, backend: &dyn TimeSeriesBackend) {
        // the state lock is released before the push suspends
        let points = self.close_window(chrono::Utc::now().timestamp());
        if points.is_empty() {
            return;
        }
        let pushed = backend.push(&points).await;
        if let Err(e) = &pushed {
            warn!(error = %e, points = points.len(), "Failed to push aggregated metrics");
        }
        if let Some(health) = &self.health {
            health.observe(components::AGGREGATOR, &pushed).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregator() -> MetricsAggregator {
        MetricsAggregator::new(AggregatorConfig {
            namespace: "ns".to_string(),
            reporter_id: "client".to_string(),
            window: Duration::from_secs(60),
        })
    }

    fn transition(worker: &str, kind: TransitionKind, ts: i64) -> AggregatorEvent {
        AggregatorEvent::Transition(WorkerTransition {
            worker_id: worker.to_string(),
            partition: "Cluster".to_string(),
            kind,
            timestamp: ts,
        })
    }

    fn sample(worker: &str, value: f64, ts: i64) -> AggregatorEvent {
        AggregatorEvent::Sample(MetricSample {
            namespace: "ns".to_string(),
            worker_id: worker.to_string(),
            partition: "Cluster".to_string(),
            metric: "TIME_PER_PHOTON".to_string(),
            timestamp: ts,
            value,
        })
    }

    fn value(points: &[AggregatedMetric], series: &str) -> f64 {
        points
            .iter()
            .find(|p| p.series == series)
            .unwrap_or_else(|| panic!("missing {series}"))
            .value
    }

    #[test]
    fn test_counts_follow_transitions() {
        let agg = aggregator();
        agg.ingest(transition("w1", TransitionKind::Launched, 1000), 1000);
        agg.ingest(transition("w2", TransitionKind::Launched, 1000), 1000);
        agg.ingest(transition("w3", TransitionKind::Launched, 1000), 1000);
        agg.ingest(transition("w1", TransitionKind::Idle, 1010), 1010);
        agg.ingest(transition("w2", TransitionKind::Idle, 1030), 1030);
        agg.ingest(transition("w3", TransitionKind::Busy, 1030), 1030);

        let points = agg.close_window(1040);
        assert_eq!(value(&points, "ns.client.Cluster.glideins.launched"), 3.0);
        assert_eq!(value(&points, "ns.client.Cluster.glideins.running"), 1.0);
        assert_eq!(value(&points, "ns.client.Cluster.glideins.idle"), 2.0);
        assert_eq!(value(&points, "ns.client.Cluster.glideins.avg_idle_time"), 20.0);
        assert_eq!(value(&points, "ns.client.Cluster.glideins.min_idle_time"), 10.0);
        assert_eq!(value(&points, "ns.client.Cluster.glideins.max_idle_time"), 30.0);
    }

    #[test]
    fn test_zero_series_are_still_emitted() {
        let agg = aggregator();
        agg.ingest(transition("w1", TransitionKind::Launched, 1000), 1000);
        agg.ingest(transition("w1", TransitionKind::Terminated, 1001), 1001);

        let points = agg.close_window(1002);
        assert_eq!(points.len(), PARTITION_METRICS.len());
        assert!(points.iter().all(|p| p.value == 0.0));
    }

    #[test]
    fn test_repeated_idle_keeps_idle_start() {
        let agg = aggregator();
        agg.ingest(transition("w1", TransitionKind::Idle, 1000), 1000);
        agg.ingest(transition("w1", TransitionKind::Idle, 1050), 1050);

        assert_eq!(agg.idle_workers("Cluster", 1060), vec![("w1".to_string(), 60)]);

        agg.ingest(transition("w1", TransitionKind::Busy, 1070), 1070);
        assert!(agg.idle_workers("Cluster", 1080).is_empty());
    }

    #[test]
    fn test_stale_samples_dropped_and_latest_wins() {
        let agg = aggregator();
        assert!(!agg.ingest(sample("w1", 9.0, 900), 1000));
        assert!(agg.ingest(sample("w1", 1.0, 990), 1000));
        assert!(agg.ingest(sample("w1", 2.0, 995), 1000));

        let points = agg.close_window(1000);
        assert_eq!(value(&points, "ns.w1.Cluster.TIME_PER_PHOTON"), 2.0);

        // the next window does not carry samples forward
        let next = agg.close_window(1060);
        assert!(next.iter().all(|p| p.series != "ns.w1.Cluster.TIME_PER_PHOTON"));
    }

    #[test]
    fn test_samples_aging_out_before_close_are_dropped() {
        let agg = aggregator();
        agg.ingest(sample("w1", 3.0, 1000), 1000);

        let points = agg.close_window(1100);
        assert!(points.iter().all(|p| p.series != "ns.w1.Cluster.TIME_PER_PHOTON"));
    }

    #[test]
    fn test_zero_valued_sample_is_kept() {
        let agg = aggregator();
        agg.ingest(sample("w1", 0.0, 1000), 1000);
        let points = agg.close_window(1001);
        assert_eq!(value(&points, "ns.w1.Cluster.TIME_PER_PHOTON"), 0.0);
    }

    struct UnreachableBackend;

    #[async_trait::async_trait]
    impl TimeSeriesBackend for UnreachableBackend {
        async fn push(&self, _points: &[AggregatedMetric]) -> anyhow::Result<()> {
            anyhow::bail!("carbon refused connection")
        }
    }

    #[tokio::test]
    async fn test_failed_push_degrades_health() {
        let health = HealthRegistry::new();
        health.register(components::AGGREGATOR).await;
        let agg = aggregator().with_health(health.clone());
        agg.ingest(
            transition("w1", TransitionKind::Launched, chrono::Utc::now().timestamp()),
            chrono::Utc::now().timestamp(),
        );

        agg.flush(&UnreachableBackend).await;

        let report = health.health().await;
        let component = &report.components[components::AGGREGATOR];
        assert_eq!(component.status, crate::health::ComponentStatus::Degraded);
        assert!(component.message.as_deref().unwrap().contains("carbon"));

        agg.flush(&crate::metrics::InMemoryTimeSeries::new(Duration::from_secs(600)))
            .await;
        let report = health.health().await;
        assert_eq!(
            report.components[components::AGGREGATOR].status,
            crate::health::ComponentStatus::Healthy
        );
    }
}
