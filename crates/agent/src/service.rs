//! Wiring of every in-process component from one configuration

use crate::api::AppState;
use crate::config::GlideinConfig;
use anyhow::Result;
use glidein_lib::{
    agent::{GlideinAgent, JobExecutor, ProcessExecutor},
    controller::{AgentFactory, FleetController, LocalLauncher},
    finalizer::{LocalObjectStore, LogFinalizer},
    health::{components, HealthRegistry},
    metrics::{FanoutBackend, GraphiteBackend, InMemoryTimeSeries, MetricsAggregator, TimeSeriesBackend},
    models::AggregatorEvent,
    queue::LocalQueue,
    registry::InMemoryRegistry,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

const EVENT_BUFFER: usize = 4096;
const GRAPHITE_TIMEOUT: Duration = Duration::from_secs(5);

/// The controller process: registry, queue, object store, aggregator and
/// the fleet of local glideins
pub struct Service {
    pub config: GlideinConfig,
    pub health: HealthRegistry,
    pub registry: Arc<InMemoryRegistry>,
    pub queue: Arc<LocalQueue>,
    pub store: Arc<LocalObjectStore>,
    pub aggregator: Arc<MetricsAggregator>,
    pub timeseries: Arc<InMemoryTimeSeries>,
    pub launcher: Arc<LocalLauncher>,
    pub controller: Arc<FleetController>,
    backend: Arc<dyn TimeSeriesBackend>,
    events: Option<mpsc::Receiver<AggregatorEvent>>,
}

impl Service {
    pub async fn build(config: GlideinConfig) -> Result<Self> {
        let health = HealthRegistry::new();
        for component in [
            components::PROBE,
            components::REGISTRY,
            components::AGGREGATOR,
            components::CONTROLLER,
            components::FINALIZER,
        ] {
            health.register(component).await;
        }

        let registry = Arc::new(InMemoryRegistry::new(config.schema(), config.lease()));
        let queue = Arc::new(LocalQueue::default());

        let secret = if config.storage.secret.is_empty() {
            warn!("No storage secret configured, log URLs will not survive a restart");
            uuid::Uuid::new_v4().simple().to_string()
        } else {
            config.storage.secret.clone()
        };
        let store = Arc::new(LocalObjectStore::new(
            &config.storage.root,
            config.public_url()?,
            secret,
        ));

        let aggregator = Arc::new(
            MetricsAggregator::new(config.aggregator_config()).with_health(health.clone()),
        );
        let timeseries = Arc::new(InMemoryTimeSeries::new(Duration::from_secs(
            config.metrics.retention_secs,
        )));
        let backend: Arc<dyn TimeSeriesBackend> = match &config.metrics.graphite_server {
            Some(address) => {
                info!(address = %address, "Pushing metrics to graphite");
                let memory: Arc<dyn TimeSeriesBackend> = timeseries.clone();
                let graphite: Arc<dyn TimeSeriesBackend> =
                    Arc::new(GraphiteBackend::new(address.clone(), GRAPHITE_TIMEOUT));
                Arc::new(FanoutBackend::new(vec![memory, graphite]))
            }
            None => timeseries.clone(),
        };

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let factory: AgentFactory = {
            let agent_config = config.agent_config();
            let probe = config.probe();
            let finalizer = LogFinalizer::new(store.clone(), config.finalizer_config());
            let executor: Arc<dyn JobExecutor> = match &config.glidein.output_dir {
                Some(root) => Arc::new(ProcessExecutor::new().with_output_root(root)),
                None => Arc::new(ProcessExecutor::new()),
            };
            let registry = registry.clone();
            let queue = queue.clone();
            let health = health.clone();
            Arc::new(move || {
                GlideinAgent::builder()
                    .config(agent_config.clone())
                    .probe(probe.clone())
                    .registry(registry.clone())
                    .queue(queue.clone())
                    .executor(executor.clone())
                    .finalizer(finalizer.clone())
                    .events(events_tx.clone())
                    .health(health.clone())
                    .build()
            })
        };
        let launcher = Arc::new(LocalLauncher::new(factory));
        let controller = Arc::new(
            FleetController::new(
                config.controller_config(),
                queue.clone(),
                registry.clone(),
                aggregator.clone(),
                launcher.clone(),
            )
            .with_health(health.clone()),
        );

        Ok(Self {
            config,
            health,
            registry,
            queue,
            store,
            aggregator,
            timeseries,
            launcher,
            controller,
            backend,
            events: Some(events_rx),
        })
    }

    /// State shared by the API handlers
    pub fn app_state(&self) -> Arc<AppState> {
        Arc::new(AppState {
            health_registry: self.health.clone(),
            queue: self.queue.clone(),
            registry: self.registry.clone(),
            timeseries: self.timeseries.clone(),
            store: self.store.clone(),
        })
    }

    /// Spawn the reaper, the aggregator and the controller. The controller
    /// task finishes only after the fleet has drained.
    pub fn start(&mut self, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let registry = self.registry.clone();
        let period = Duration::from_secs(self.config.registry.reaper_interval_secs.max(1));
        let reaper_shutdown = shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            registry.run_reaper(period, reaper_shutdown).await
        }));

        match self.events.take() {
            Some(events) => handles.push(tokio::spawn(self.aggregator.clone().run(
                events,
                self.backend.clone(),
                shutdown.subscribe(),
            ))),
            None => warn!("Service already started, aggregator not respawned"),
        }

        let controller = self.controller.clone();
        let controller_shutdown = shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            controller.run(controller_shutdown).await
        }));

        handles
    }
}
