//! Fleet controller
//!
//! Each poll observes queue demand, live records and launches still in
//! flight, evaluates the scaling policy and acts through a launcher. The
//! observations are eventually consistent; the policy only has to converge.

mod launcher;
mod scaling;

pub use launcher::{AgentFactory, GlideinLauncher, LocalLauncher};
pub use scaling::{evaluate, ScalingContext, ScalingDecision};

use crate::health::{components, HealthRegistry};
use crate::metrics::MetricsAggregator;
use crate::models::Activity;
use crate::observability::{GlideinMetrics, StructuredLogger};
use crate::queue::JobQueue;
use crate::registry::{AdvertisementRegistry, RecordFilter};
use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub site: String,
    pub partition: String,
    /// Cap on concurrently live glideins
    pub max_glideins: u32,
    pub slots_per_glidein: u32,
    pub poll_interval: Duration,
    /// Idle glideins kept beyond demand before draining
    pub scale_down_margin: u32,
    /// How long shutdown waits for drained glideins
    pub shutdown_grace: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            site: "local".to_string(),
            partition: "default".to_string(),
            max_glideins: 10,
            slots_per_glidein: 1,
            poll_interval: Duration::from_secs(10),
            scale_down_margin: 1,
            shutdown_grace: Duration::from_secs(120),
        }
    }
}

pub struct FleetController {
    config: ControllerConfig,
    queue: Arc<dyn JobQueue>,
    registry: Arc<dyn AdvertisementRegistry>,
    aggregator: Arc<MetricsAggregator>,
    launcher: Arc<dyn GlideinLauncher>,
    health: Option<HealthRegistry>,
    logger: StructuredLogger,
    metrics: GlideinMetrics,
}

impl FleetController {
    pub fn new(
        config: ControllerConfig,
        queue: Arc<dyn JobQueue>,
        registry: Arc<dyn AdvertisementRegistry>,
        aggregator: Arc<MetricsAggregator>,
        launcher: Arc<dyn GlideinLauncher>,
    ) -> Self {
        Self {
            logger: StructuredLogger::new(&config.site),
            config,
            queue,
            registry,
            aggregator,
            launcher,
            health: None,
            metrics: GlideinMetrics::new(),
        }
    }

    /// Report poll outcomes as the controller component's health
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Gather the current view of the partition
    pub async fn observe(&self) -> Result<ScalingContext> {
        let demand = self.queue.demand().await.context("Failed to read queue demand")?;
        let records = self
            .registry
            .list_all(&RecordFilter::all().partition(&self.config.partition))
            .await
            .context("Failed to list advertisements")?;

        // aggregator order (longest idle first), restricted to records that
        // still accept work; idle records it has not seen yet go last
        let idle_records: Vec<&str> = records
            .iter()
            .filter(|r| r.activity == Activity::Idle)
            .map(|r| r.identity.as_str())
            .collect();
        let now = chrono::Utc::now().timestamp();
        let mut idle_workers: Vec<String> = self
            .aggregator
            .idle_workers(&self.config.partition, now)
            .into_iter()
            .map(|(id, _)| id)
            .filter(|id| idle_records.contains(&id.as_str()))
            .collect();
        for id in idle_records {
            if !idle_workers.iter().any(|known| known == id) {
                idle_workers.push(id.to_string());
            }
        }

        Ok(ScalingContext {
            demand: demand.idle,
            pending: self.launcher.pending(),
            advertised: records.len() as u32,
            live: self.launcher.live(),
            idle_workers,
            slots_per_glidein: self.config.slots_per_glidein,
            max_glideins: self.config.max_glideins,
            hysteresis: self.config.scale_down_margin,
        })
    }

    /// One observe/evaluate/act round
    pub async fn poll_once(&self) -> Result<ScalingDecision> {
        for report in self.launcher.reap().await {
            debug!(
                identity = %report.identity,
                log_url = ?report.log_url,
                failures = report.failures.len(),
                "Glidein finished"
            );
        }

        self.release_orphaned_jobs().await?;
        let context = self.observe().await?;
        let decision = evaluate(&context);
        self.metrics.set_live_glideins(context.live as i64);

        if decision != ScalingDecision::None {
            self.logger.log_scaling_decision(
                decision.name(),
                context.demand,
                context.supply(),
                decision.count(),
            );
        }

        match &decision {
            ScalingDecision::None => {}
            ScalingDecision::ScaleUp { count } => {
                self.launcher
                    .launch(*count)
                    .await
                    .context("Failed to launch glideins")?;
            }
            ScalingDecision::ScaleDown { workers } => {
                for identity in workers {
                    if !self.launcher.drain(identity).await {
                        debug!(identity = %identity, "Idle worker not managed here");
                    }
                }
            }
        }
        Ok(decision)
    }

    /// Requeue jobs whose claimant no longer has a live record
    async fn release_orphaned_jobs(&self) -> Result<usize> {
        // a claim made after this instant came from a worker listed below
        let snapshot = std::time::Instant::now();
        let live: BTreeSet<String> = self
            .registry
            .list_all(&RecordFilter::all())
            .await
            .context("Failed to list advertisements")?
            .into_iter()
            .map(|record| record.identity)
            .collect();
        let released = self
            .queue
            .release_orphans(&live, snapshot)
            .await
            .context("Failed to release orphaned jobs")?;
        if released > 0 {
            info!(released, "Requeued jobs of vanished glideins");
        }
        Ok(released)
    }

    /// Poll until shutdown, then drain every glidein and wait for them
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            partition = %self.config.partition,
            max_glideins = self.config.max_glideins,
            poll_secs = self.config.poll_interval.as_secs(),
            "Starting fleet controller"
        );
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let outcome = self.poll_once().await;
                    if let Err(e) = &outcome {
                        warn!(error = %e, "Controller poll failed");
                    }
                    if let Some(health) = &self.health {
                        health.observe(components::CONTROLLER, &outcome).await;
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down fleet controller");
                    break;
                }
            }
        }

        self.shutdown_fleet().await;
    }

    async fn shutdown_fleet(&self) {
        let signalled = self.launcher.drain_all().await;
        info!(glideins = signalled, "Draining fleet");

        let deadline = Instant::now() + self.config.shutdown_grace;
        while self.launcher.live() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        self.launcher.reap().await;
        let remaining = self.launcher.live();
        if remaining > 0 {
            warn!(remaining, "Glideins still running after shutdown grace");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentConfig, AgentReport, GlideinAgent};
    use crate::finalizer::{FinalizerConfig, LocalObjectStore, LogFinalizer};
    use crate::metrics::AggregatorConfig;
    use crate::models::{
        AggregatorEvent, CapabilitySchema, GlideinRecord, JobSpec, TransitionKind,
        WorkerTransition,
    };
    use crate::probe::{ResourceProbe, StaticCheck};
    use crate::queue::{JobAction, JobFilter, LocalQueue};
    use crate::registry::{InMemoryRegistry, LeaseConfig};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use url::Url;

    #[derive(Default)]
    struct RecordingLauncher {
        launched: Mutex<u32>,
        drained: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl GlideinLauncher for RecordingLauncher {
        async fn launch(&self, count: u32) -> anyhow::Result<u32> {
            *self.launched.lock().unwrap() += count;
            Ok(count)
        }

        async fn drain(&self, identity: &str) -> bool {
            self.drained.lock().unwrap().push(identity.to_string());
            true
        }

        async fn drain_all(&self) -> usize {
            0
        }

        fn pending(&self) -> u32 {
            0
        }

        fn live(&self) -> u32 {
            *self.launched.lock().unwrap()
        }

        async fn reap(&self) -> Vec<AgentReport> {
            Vec::new()
        }
    }

    fn schema() -> CapabilitySchema {
        CapabilitySchema::new(["GPU"], Vec::<String>::new())
    }

    fn config() -> ControllerConfig {
        ControllerConfig {
            partition: "Cluster".to_string(),
            max_glideins: 4,
            poll_interval: Duration::from_millis(20),
            shutdown_grace: Duration::from_secs(10),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_poll_scales_up_to_cap() {
        let queue = Arc::new(LocalQueue::default());
        queue.submit(JobSpec::new("/bin/sleep", "5m").with_memory(500), 8).await.unwrap();
        let launcher = Arc::new(RecordingLauncher::default());
        let controller = FleetController::new(
            config(),
            queue,
            Arc::new(InMemoryRegistry::new(schema(), LeaseConfig::default())),
            Arc::new(MetricsAggregator::new(AggregatorConfig::default())),
            launcher.clone(),
        );

        let decision = controller.poll_once().await.unwrap();
        assert_eq!(decision, ScalingDecision::ScaleUp { count: 4 });
        // at the cap nothing more is launched
        assert_eq!(controller.poll_once().await.unwrap(), ScalingDecision::None);
        assert_eq!(*launcher.launched.lock().unwrap(), 4);
    }

    #[tokio::test]
    async fn test_poll_drains_longest_idle_when_queue_empty() {
        let registry = Arc::new(InMemoryRegistry::new(schema(), LeaseConfig::default()));
        let aggregator = Arc::new(MetricsAggregator::new(AggregatorConfig::default()));
        let now = chrono::Utc::now().timestamp();
        for (id, idle_since) in [("g-old", now - 300), ("g-mid", now - 100), ("g-new", now - 5)] {
            registry
                .publish(GlideinRecord::new(id, "SiteA", "Cluster"))
                .await
                .unwrap();
            aggregator.ingest(
                AggregatorEvent::Transition(WorkerTransition {
                    worker_id: id.to_string(),
                    partition: "Cluster".to_string(),
                    kind: TransitionKind::Idle,
                    timestamp: idle_since,
                }),
                now,
            );
        }
        let launcher = Arc::new(RecordingLauncher::default());
        let controller = FleetController::new(
            config(),
            Arc::new(LocalQueue::default()),
            registry,
            aggregator,
            launcher.clone(),
        );

        let decision = controller.poll_once().await.unwrap();
        assert_eq!(
            decision,
            ScalingDecision::ScaleDown {
                workers: vec!["g-old".to_string(), "g-mid".to_string()]
            }
        );
        assert_eq!(*launcher.drained.lock().unwrap(), vec!["g-old", "g-mid"]);
    }

    #[tokio::test]
    async fn test_poll_requeues_jobs_of_expired_glideins() {
        let queue = Arc::new(LocalQueue::default());
        let registry = Arc::new(InMemoryRegistry::new(
            schema(),
            LeaseConfig {
                lease_timeout: Duration::from_millis(50),
                drain_lease: Duration::from_millis(50),
            },
        ));
        registry
            .publish(GlideinRecord::new("g-crashed", "SiteA", "Cluster"))
            .await
            .unwrap();
        queue.submit(JobSpec::new("/bin/sleep", "5m"), 1).await.unwrap();
        let offer = crate::queue::MachineOffer {
            worker_id: "g-crashed".to_string(),
            memory_mb: 2000,
            resources: Default::default(),
        };
        queue.claim(&offer).await.unwrap().unwrap();

        let controller = FleetController::new(
            config(),
            queue.clone(),
            registry.clone(),
            Arc::new(MetricsAggregator::new(AggregatorConfig::default())),
            Arc::new(RecordingLauncher::default()),
        );
        // the lease is still live: the claim stands
        controller.poll_once().await.unwrap();
        assert_eq!(queue.demand().await.unwrap().running, 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        controller.poll_once().await.unwrap();
        let demand = queue.demand().await.unwrap();
        assert_eq!(demand.running, 0);
        assert_eq!(demand.idle, 1);
    }

    #[tokio::test]
    async fn test_local_fleet_runs_jobs_then_drains_on_shutdown() {
        let logs = TempDir::new().unwrap();
        let objects = TempDir::new().unwrap();
        let queue = Arc::new(LocalQueue::default());
        let registry = Arc::new(InMemoryRegistry::new(schema(), LeaseConfig::default()));
        let aggregator = Arc::new(MetricsAggregator::new(AggregatorConfig::default()));
        let store = Arc::new(LocalObjectStore::new(
            objects.path(),
            Url::parse("http://localhost:8080").unwrap(),
            "secret",
        ));
        let (events_tx, mut events_rx) = mpsc::channel(1024);

        let agent_config = AgentConfig {
            site: "SiteA".to_string(),
            partition: "Cluster".to_string(),
            refresh_interval: Duration::from_millis(50),
            poll_interval: Duration::from_millis(10),
            log_root: logs.path().to_path_buf(),
            ..Default::default()
        };
        let factory: AgentFactory = {
            let queue = queue.clone();
            let registry = registry.clone();
            Arc::new(move || {
                GlideinAgent::builder()
                    .config(agent_config.clone())
                    .probe(ResourceProbe::builder().check("GPU", StaticCheck(true)).build())
                    .registry(registry.clone())
                    .queue(queue.clone())
                    .finalizer(LogFinalizer::new(store.clone(), FinalizerConfig::default()))
                    .events(events_tx.clone())
                    .build()
            })
        };
        let launcher = Arc::new(LocalLauncher::new(factory));
        let controller = Arc::new(FleetController::new(
            config(),
            queue.clone(),
            registry.clone(),
            aggregator.clone(),
            launcher.clone(),
        ));

        let cluster = queue
            .submit(JobSpec::new("/bin/echo", "hello").with_memory(500), 2)
            .await
            .unwrap();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn({
            let controller = controller.clone();
            async move { controller.run(shutdown_rx).await }
        });

        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let done = queue
                    .query_history(&JobFilter::cluster(cluster), 10)
                    .await
                    .unwrap();
                if done.len() == 2 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert!(registry.live_count() >= 1);
        assert!(registry
            .list_all(&RecordFilter::all().site("SiteA"))
            .await
            .unwrap()
            .iter()
            .all(|r| r.resource("GPU") == Some(true)));

        queue.act(JobAction::Remove, &JobFilter::all()).await.unwrap();
        shutdown_tx.send(()).unwrap();
        task.await.unwrap();

        assert_eq!(launcher.live(), 0);
        assert_eq!(registry.live_count(), 0);
        let reports = launcher.reports();
        assert!(!reports.is_empty());
        assert!(reports.iter().all(|r| r.log_url.is_some()));

        let mut launched = 0;
        while let Ok(event) = events_rx.try_recv() {
            if let AggregatorEvent::Transition(t) = event {
                if t.kind == TransitionKind::Launched {
                    launched += 1;
                }
            }
        }
        assert_eq!(launched, reports.len());
    }
}
