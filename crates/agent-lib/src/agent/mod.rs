//! Glidein agent
//!
//! One agent is one worker slot joining the pool. It probes the host,
//! advertises a record, runs matched jobs while keeping the lease alive, and
//! on drain stops accepting work, lets in-flight jobs finish, uploads its log
//! bundle and withdraws.
//!
//! Failures that do not prevent the agent from reaching `Terminated` are
//! collected into the final [`AgentReport`] instead of aborting the lifecycle.

mod executor;
mod journal;
mod state;

pub use executor::{JobExecutor, ProcessExecutor};
pub use journal::Journal;
pub use state::{AgentState, StateMachine};

use crate::error::{GlideinError, Result};
use crate::finalizer::LogFinalizer;
use crate::health::{components, ComponentStatus, HealthRegistry};
use crate::models::{
    Activity, AggregatorEvent, GlideinRecord, MetricSample, RecordDelta, TransitionKind,
    WorkerTransition,
};
use crate::observability::{GlideinMetrics, StructuredLogger};
use crate::probe::{LiveMetrics, ProbeReport, ResourceProbe};
use crate::queue::{ClaimedJob, JobOutcome, JobQueue, MachineOffer};
use crate::registry::AdvertisementRegistry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Configuration for one glidein agent
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Site label advertised on the record
    pub site: String,
    pub partition: String,
    /// First component of emitted metric series
    pub namespace: String,
    /// Preferred identity; `None` generates `{site}-{uuid}`
    pub identity: Option<String>,
    /// Concurrent jobs
    pub slots: usize,
    /// Memory offered to the matchmaker, in MB
    pub memory_mb: u64,
    /// Period of lease renewal and metric reporting
    pub refresh_interval: Duration,
    /// Period of asking the queue for work
    pub poll_interval: Duration,
    /// Regenerated identities tried after a collision
    pub max_identity_retries: u32,
    /// Consecutive failed refreshes before the agent drains itself
    pub max_refresh_failures: u32,
    /// Parent of the per-launch log directories
    pub log_root: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            site: "local".to_string(),
            partition: "default".to_string(),
            namespace: "pyglidein".to_string(),
            identity: None,
            slots: 1,
            memory_mb: 2000,
            refresh_interval: Duration::from_secs(30),
            poll_interval: Duration::from_secs(5),
            max_identity_retries: 3,
            max_refresh_failures: 3,
            log_root: std::env::temp_dir().join("pyglidein"),
        }
    }
}

/// Identity and state as seen from outside the agent task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub identity: String,
    pub state: AgentState,
}

/// One non-fatal (or the final fatal) failure of the lifecycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub kind: String,
    pub detail: String,
    pub timestamp: i64,
}

/// Outcome of a finished agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentReport {
    pub identity: String,
    pub final_state: AgentState,
    pub log_url: Option<String>,
    pub jobs_completed: u64,
    pub warnings: Vec<String>,
    pub failures: Vec<FailureRecord>,
}

impl AgentReport {
    pub fn has_failure(&self, kind: &str) -> bool {
        self.failures.iter().any(|f| f.kind == kind)
    }
}

#[derive(Debug)]
struct FinishedJob {
    job: ClaimedJob,
    elapsed: Duration,
    outcome: JobOutcome,
}

fn generate_identity(site: &str) -> String {
    format!("{site}-{}", Uuid::new_v4().simple())
}

pub struct GlideinAgent {
    config: AgentConfig,
    probe: ResourceProbe,
    registry: Arc<dyn AdvertisementRegistry>,
    queue: Arc<dyn JobQueue>,
    executor: Arc<dyn JobExecutor>,
    finalizer: LogFinalizer,
    events: Option<mpsc::Sender<AggregatorEvent>>,
    health: Option<HealthRegistry>,
    status: watch::Sender<AgentStatus>,
    logger: StructuredLogger,
    metrics: GlideinMetrics,
    journal: Journal,
    state: StateMachine,
    identity: String,
    resources: BTreeMap<String, bool>,
    live: LiveMetrics,
    activity: Activity,
    in_flight: JoinSet<FinishedJob>,
    jobs_completed: u64,
    refresh_failures: u32,
    warnings: Vec<String>,
    published_warnings: usize,
    failures: Vec<FailureRecord>,
}

impl GlideinAgent {
    pub fn builder() -> GlideinAgentBuilder {
        GlideinAgentBuilder::new()
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Follow identity and state changes
    pub fn subscribe(&self) -> watch::Receiver<AgentStatus> {
        self.status.subscribe()
    }

    /// Run the full lifecycle. `drain` flipping to true (or its sender
    /// going away) starts draining.
    pub async fn run(mut self, mut drain: watch::Receiver<bool>) -> AgentReport {
        let log_url = match self.lifecycle(&mut drain).await {
            Ok(url) => url,
            Err(e) => {
                error!(identity = %self.identity, error = %e, "Glidein lifecycle aborted");
                self.record_failure(&e);
                self.journal.append(&format!("aborted: {e}")).await;
                None
            }
        };

        if self.state.current() != AgentState::Terminated {
            if let Err(e) = self.state.transition(AgentState::Terminated) {
                warn!(error = %e, "Failed to record termination");
            }
        }
        self.publish_status();
        self.emit_transition(TransitionKind::Terminated).await;
        self.logger
            .log_terminated(&self.identity, log_url.is_some(), self.failures.len());

        AgentReport {
            identity: self.identity,
            final_state: self.state.current(),
            log_url,
            jobs_completed: self.jobs_completed,
            warnings: self.warnings,
            failures: self.failures,
        }
    }

    async fn lifecycle(&mut self, drain: &mut watch::Receiver<bool>) -> Result<Option<String>> {
        self.journal.create().await?;
        self.journal
            .append(&format!("glidein starting at site {}", self.config.site))
            .await;

        self.enter(AgentState::Probing).await?;
        let report = self.probe.probe().await;
        self.apply_probe(report).await;

        self.enter(AgentState::Advertising).await?;
        self.advertise().await?;

        self.enter(AgentState::Running).await?;
        self.logger
            .log_glidein_started(&self.identity, &self.config.partition);
        self.emit_transition(TransitionKind::Launched).await;
        self.emit_transition(TransitionKind::Idle).await;

        let reason = self.serve(drain).await;
        self.drain(&reason).await
    }

    async fn enter(&mut self, next: AgentState) -> Result<()> {
        self.state.transition(next)?;
        self.publish_status();
        self.journal.append(&format!("state {next}")).await;
        Ok(())
    }

    async fn apply_probe(&mut self, report: ProbeReport) {
        let failures = report.capabilities.failures();
        if let Some(health) = &self.health {
            let message = failures
                .iter()
                .map(|(capability, reason)| format!("{capability}: {reason}"))
                .collect::<Vec<_>>()
                .join("; ");
            if message.is_empty() {
                health.set(components::PROBE, ComponentStatus::Healthy, None).await;
            } else {
                health
                    .set(components::PROBE, ComponentStatus::Degraded, Some(message))
                    .await;
            }
        }
        for (capability, reason) in failures {
            self.metrics.inc_probe_failure(&capability);
            self.logger
                .log_probe_failure(&self.identity, &capability, &reason);
            self.journal.append(&format!("probe {capability}: {reason}")).await;
            self.failures.push(FailureRecord {
                kind: "probe".to_string(),
                detail: reason.clone(),
                timestamp: chrono::Utc::now().timestamp(),
            });
            self.warnings.push(reason);
        }
        self.resources = report.capabilities.advertised();
        self.live = report.metrics;
    }

    fn current_record(&self) -> GlideinRecord {
        let mut record =
            GlideinRecord::new(&self.identity, &self.config.site, &self.config.partition);
        record.resources = self.resources.clone();
        record.metrics = self.live.snapshot();
        record.activity = self.activity;
        record.warnings = self.warnings.clone();
        record
    }

    /// Publish the current record, regenerating the identity on collision
    async fn advertise(&mut self) -> Result<u64> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let record = self.current_record();
            let published_warnings = record.warnings.len();
            let outcome = self.registry.publish(record).await;
            if !matches!(outcome, Err(GlideinError::DuplicateIdentity(_))) {
                self.observe(components::REGISTRY, &outcome).await;
            }
            match outcome {
                Ok(sequence) => {
                    self.published_warnings = published_warnings;
                    self.refresh_failures = 0;
                    self.logger
                        .log_advertised(&self.identity, sequence, attempts);
                    self.journal
                        .append(&format!("advertised as {} (sequence {sequence})", self.identity))
                        .await;
                    return Ok(sequence);
                }
                Err(e @ GlideinError::DuplicateIdentity(_)) => {
                    self.metrics.inc_duplicate_identity();
                    warn!(identity = %self.identity, attempts, "Identity already advertised");
                    self.record_failure(&e);
                    self.warnings.push(e.to_string());
                    if attempts > self.config.max_identity_retries {
                        return Err(GlideinError::IdentityExhausted { attempts });
                    }
                    self.identity = generate_identity(&self.config.site);
                    self.publish_status();
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Accept work until drained. Returns the drain reason.
    async fn serve(&mut self, drain: &mut watch::Receiver<bool>) -> String {
        if *drain.borrow_and_update() {
            return "drain requested".to_string();
        }

        let mut refresh = interval(self.config.refresh_interval);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        refresh.tick().await;
        let mut poll = interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = drain.changed() => {
                    match changed {
                        Err(_) => return "drain channel closed".to_string(),
                        Ok(()) if *drain.borrow_and_update() => {
                            return "drain requested".to_string();
                        }
                        Ok(()) => {}
                    }
                }
                Some(joined) = self.in_flight.join_next() => {
                    self.on_job_finished(joined).await;
                    self.claim_work().await;
                    self.sync_activity().await;
                }
                _ = poll.tick() => {
                    self.claim_work().await;
                    self.sync_activity().await;
                }
                _ = refresh.tick() => {
                    self.report_metrics().await;
                    let delta = RecordDelta::activity(self.activity)
                        .with_metrics(self.live.snapshot());
                    if let Err(reason) = self.send_refresh(delta).await {
                        return reason;
                    }
                }
            }
        }
    }

    async fn claim_work(&mut self) {
        while self.in_flight.len() < self.config.slots {
            let offer = MachineOffer {
                worker_id: self.identity.clone(),
                memory_mb: self.config.memory_mb,
                resources: self.resources.clone(),
            };
            match self.queue.claim(&offer).await {
                Ok(Some(job)) => self.start_job(job).await,
                Ok(None) => break,
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "Failed to claim work");
                    break;
                }
            }
        }
    }

    async fn start_job(&mut self, job: ClaimedJob) {
        info!(identity = %self.identity, job = %job.id, "Starting job");
        self.journal
            .append(&format!("starting job {} ({})", job.id, job.spec.executable))
            .await;

        let executor = Arc::clone(&self.executor);
        let side_dir = self.journal.jobs_dir();
        self.in_flight.spawn(async move {
            let start = Instant::now();
            let outcome = executor
                .execute(&job, &side_dir)
                .await
                .unwrap_or_else(|e| JobOutcome::failed(format!("{e:#}")));
            FinishedJob {
                job,
                elapsed: start.elapsed(),
                outcome,
            }
        });
    }

    async fn on_job_finished(&mut self, joined: std::result::Result<FinishedJob, JoinError>) {
        let finished = match joined {
            Ok(finished) => finished,
            Err(e) => {
                error!(identity = %self.identity, error = %e, "Job task failed");
                return;
            }
        };

        let id = finished.job.id;
        let succeeded = finished.outcome.succeeded();
        self.jobs_completed += 1;
        self.metrics
            .inc_job_completed(if succeeded { "success" } else { "failure" });
        self.live.record_work(finished.elapsed, 1);
        self.journal
            .append(&format!(
                "job {id} finished exit={:?} error={:?} elapsed={:.3}s",
                finished.outcome.exit_code,
                finished.outcome.error,
                finished.elapsed.as_secs_f64()
            ))
            .await;

        if let Err(e) = self.queue.complete(&finished.job, finished.outcome).await {
            warn!(identity = %self.identity, job = %id, error = %e, "Failed to report job completion");
        }
    }

    /// Track Idle/Busy; changes are announced immediately
    async fn sync_activity(&mut self) {
        let next = if self.in_flight.is_empty() {
            Activity::Idle
        } else {
            Activity::Busy
        };
        if next == self.activity {
            return;
        }
        self.activity = next;
        self.emit_transition(match next {
            Activity::Busy => TransitionKind::Busy,
            _ => TransitionKind::Idle,
        })
        .await;
        // failures surface again on the next periodic refresh
        if let Err(reason) = self.send_refresh(RecordDelta::activity(next)).await {
            debug!(identity = %self.identity, reason = %reason, "Activity refresh failed");
        }
    }

    fn unpublished_warnings(&self) -> Vec<String> {
        self.warnings[self.published_warnings.min(self.warnings.len())..].to_vec()
    }

    /// Renew the lease. An expired lease is re-advertised; an unreachable
    /// registry only ends the agent after repeated failures.
    async fn send_refresh(&mut self, mut delta: RecordDelta) -> std::result::Result<(), String> {
        delta.warnings = self.unpublished_warnings();
        let outcome = self.registry.refresh(&self.identity, delta).await;
        if !matches!(outcome, Err(GlideinError::UnknownRecord(_))) {
            self.observe(components::REGISTRY, &outcome).await;
        }
        match outcome {
            Ok(_) => {
                self.published_warnings = self.warnings.len();
                self.refresh_failures = 0;
                Ok(())
            }
            Err(e @ GlideinError::UnknownRecord(_)) => {
                warn!(identity = %self.identity, "Lease expired, re-advertising");
                self.record_failure(&e);
                self.warnings.push("advertisement lease expired".to_string());
                let previous = self.identity.clone();
                match self.advertise().await {
                    Ok(_) => {
                        if previous != self.identity {
                            self.emit_transition_for(&previous, TransitionKind::Terminated)
                                .await;
                            self.emit_transition(TransitionKind::Launched).await;
                            self.emit_transition(match self.activity {
                                Activity::Busy => TransitionKind::Busy,
                                _ => TransitionKind::Idle,
                            })
                            .await;
                        }
                        Ok(())
                    }
                    Err(e) => {
                        self.record_failure(&e);
                        Err(format!("re-advertising failed: {e}"))
                    }
                }
            }
            Err(e) => {
                self.refresh_failures += 1;
                warn!(
                    identity = %self.identity,
                    failures = self.refresh_failures,
                    error = %e,
                    "Lease refresh failed"
                );
                if self.refresh_failures >= self.config.max_refresh_failures {
                    self.record_failure(&e);
                    Err(format!(
                        "registry unreachable after {} refreshes",
                        self.refresh_failures
                    ))
                } else {
                    Ok(())
                }
            }
        }
    }

    async fn report_metrics(&self) {
        let Some(events) = &self.events else {
            return;
        };
        let now = chrono::Utc::now().timestamp();
        for (metric, value) in self.live.snapshot() {
            let sample = MetricSample {
                namespace: self.config.namespace.clone(),
                worker_id: self.identity.clone(),
                partition: self.config.partition.clone(),
                metric: metric.to_lowercase(),
                timestamp: now,
                value,
            };
            if events.send(AggregatorEvent::Sample(sample)).await.is_err() {
                debug!("Aggregator channel closed");
                return;
            }
        }
    }

    async fn drain(&mut self, reason: &str) -> Result<Option<String>> {
        self.enter(AgentState::Draining).await?;
        self.activity = Activity::Draining;
        self.emit_transition(TransitionKind::Draining).await;
        self.logger
            .log_draining(&self.identity, self.in_flight.len(), reason);
        self.journal.append(&format!("draining: {reason}")).await;

        // stop new work being routed here before anything else; the registry
        // holds a draining record for the drain lease without renewals
        let advertised = self.drain_refresh(RecordDelta::activity(Activity::Draining)).await;

        while let Some(joined) = self.in_flight.join_next().await {
            self.on_job_finished(joined).await;
        }

        self.journal.append("jobs finished, uploading logs").await;
        let finalized = self
            .finalizer
            .finalize(&self.identity, self.journal.dir())
            .await;
        self.observe(components::FINALIZER, &finalized).await;
        let log_url = match finalized {
            Ok(log) => {
                self.logger.log_upload(
                    &self.identity,
                    &log.object_key,
                    log.bytes,
                    log.elapsed.as_secs_f64(),
                );
                Some(log.url.to_string())
            }
            Err(e) => {
                self.logger.log_upload_failure(&self.identity, &e.to_string());
                self.journal.append(&format!("log upload failed: {e}")).await;
                self.record_failure(&e);
                self.warnings.push(e.to_string());
                None
            }
        };

        if advertised {
            let delta = RecordDelta {
                log_url: log_url.clone(),
                ..Default::default()
            };
            self.drain_refresh(delta).await;
        }
        match self.registry.withdraw(&self.identity).await {
            Ok(removed) => debug!(identity = %self.identity, removed, "Advertisement withdrawn"),
            Err(e) => self.record_failure(&e),
        }

        self.enter(AgentState::Terminated).await?;
        Ok(log_url)
    }

    /// Refresh while draining. Returns whether the record is still live.
    async fn drain_refresh(&mut self, mut delta: RecordDelta) -> bool {
        delta.warnings = self.unpublished_warnings();
        match self.registry.refresh(&self.identity, delta).await {
            Ok(_) => {
                self.published_warnings = self.warnings.len();
                true
            }
            Err(e @ GlideinError::UnknownRecord(_)) => {
                self.record_failure(&e);
                false
            }
            Err(e) => {
                warn!(identity = %self.identity, error = %e, "Refresh while draining failed");
                self.record_failure(&e);
                true
            }
        }
    }

    async fn observe<T>(&self, component: &str, outcome: &Result<T>) {
        if let Some(health) = &self.health {
            health.observe(component, outcome).await;
        }
    }

    async fn emit_transition(&self, kind: TransitionKind) {
        self.emit_transition_for(&self.identity, kind).await;
    }

    async fn emit_transition_for(&self, worker_id: &str, kind: TransitionKind) {
        if let Some(events) = &self.events {
            let transition = WorkerTransition::now(worker_id, &self.config.partition, kind);
            if events.send(AggregatorEvent::Transition(transition)).await.is_err() {
                debug!("Aggregator channel closed");
            }
        }
    }

    fn publish_status(&self) {
        self.status.send_replace(AgentStatus {
            identity: self.identity.clone(),
            state: self.state.current(),
        });
    }

    fn record_failure(&mut self, error: &GlideinError) {
        self.failures.push(FailureRecord {
            kind: error.kind().to_string(),
            detail: error.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
        });
    }
}

/// Builder for a glidein agent
pub struct GlideinAgentBuilder {
    config: AgentConfig,
    probe: Option<ResourceProbe>,
    registry: Option<Arc<dyn AdvertisementRegistry>>,
    queue: Option<Arc<dyn JobQueue>>,
    executor: Option<Arc<dyn JobExecutor>>,
    finalizer: Option<LogFinalizer>,
    events: Option<mpsc::Sender<AggregatorEvent>>,
    health: Option<HealthRegistry>,
}

impl GlideinAgentBuilder {
    pub fn new() -> Self {
        Self {
            config: AgentConfig::default(),
            probe: None,
            registry: None,
            queue: None,
            executor: None,
            finalizer: None,
            events: None,
            health: None,
        }
    }

    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn probe(mut self, probe: ResourceProbe) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn registry(mut self, registry: Arc<dyn AdvertisementRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn JobExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn finalizer(mut self, finalizer: LogFinalizer) -> Self {
        self.finalizer = Some(finalizer);
        self
    }

    /// Where lifecycle transitions and metric samples are sent
    pub fn events(mut self, events: mpsc::Sender<AggregatorEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Shared health the probe, registry and finalizer outcomes report to
    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn build(self) -> anyhow::Result<GlideinAgent> {
        let registry = self
            .registry
            .ok_or_else(|| anyhow::anyhow!("Registry is required"))?;
        let queue = self
            .queue
            .ok_or_else(|| anyhow::anyhow!("Queue is required"))?;
        let finalizer = self
            .finalizer
            .ok_or_else(|| anyhow::anyhow!("Finalizer is required"))?;
        if self.config.slots == 0 {
            anyhow::bail!("An agent needs at least one slot");
        }
        if self.config.refresh_interval.is_zero() || self.config.poll_interval.is_zero() {
            anyhow::bail!("Refresh and poll intervals must be non-zero");
        }

        let identity = self
            .config
            .identity
            .clone()
            .unwrap_or_else(|| generate_identity(&self.config.site));
        let journal = Journal::new(
            self.config
                .log_root
                .join(Uuid::new_v4().simple().to_string()),
        );
        let state = StateMachine::new();
        let (status, _) = watch::channel(AgentStatus {
            identity: identity.clone(),
            state: state.current(),
        });

        Ok(GlideinAgent {
            logger: StructuredLogger::new(&self.config.site),
            config: self.config,
            probe: self
                .probe
                .unwrap_or_else(|| ResourceProbe::builder().build()),
            registry,
            queue,
            executor: self
                .executor
                .unwrap_or_else(|| Arc::new(ProcessExecutor::new())),
            finalizer,
            events: self.events,
            health: self.health,
            status,
            metrics: GlideinMetrics::new(),
            journal,
            state,
            identity,
            resources: BTreeMap::new(),
            live: LiveMetrics::new(),
            activity: Activity::Idle,
            in_flight: JoinSet::new(),
            jobs_completed: 0,
            refresh_failures: 0,
            warnings: Vec::new(),
            published_warnings: 0,
            failures: Vec::new(),
        })
    }
}

impl Default for GlideinAgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests;
