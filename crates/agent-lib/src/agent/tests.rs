use super::*;
use crate::finalizer::{entry_names, FinalizerConfig, LocalObjectStore, ObjectStore};
use crate::models::{CapabilitySchema, JobSpec};
use crate::probe::{CapabilityCheck, StaticCheck};
use crate::queue::{JobFilter, LocalQueue};
use crate::registry::{InMemoryRegistry, LeaseConfig, RecordFilter};
use async_trait::async_trait;
use std::future::Future;
use tempfile::TempDir;
use url::Url;

struct SleepExecutor {
    delay: Duration,
}

#[async_trait]
impl JobExecutor for SleepExecutor {
    async fn execute(&self, _job: &ClaimedJob, _side_dir: &std::path::Path) -> anyhow::Result<JobOutcome> {
        tokio::time::sleep(self.delay).await;
        Ok(JobOutcome::exited(0))
    }
}

struct BrokenStore;

#[async_trait]
impl ObjectStore for BrokenStore {
    async fn put(&self, _bucket: &str, _key: &str, _bytes: Vec<u8>) -> anyhow::Result<()> {
        anyhow::bail!("bucket unreachable")
    }

    fn presign_get(&self, _bucket: &str, _key: &str, _ttl: Duration) -> anyhow::Result<Url> {
        anyhow::bail!("bucket unreachable")
    }

    async fn get_signed(&self, _url: &Url) -> anyhow::Result<Vec<u8>> {
        anyhow::bail!("bucket unreachable")
    }
}

/// Registry where every identity is already taken
struct CollidingRegistry;

#[async_trait]
impl AdvertisementRegistry for CollidingRegistry {
    async fn publish(&self, record: GlideinRecord) -> Result<u64> {
        Err(GlideinError::DuplicateIdentity(record.identity))
    }

    async fn refresh(&self, identity: &str, _delta: RecordDelta) -> Result<u64> {
        Err(GlideinError::UnknownRecord(identity.to_string()))
    }

    async fn withdraw(&self, _identity: &str) -> Result<bool> {
        Ok(false)
    }

    async fn list_all(&self, _filter: &RecordFilter) -> Result<Vec<GlideinRecord>> {
        Ok(Vec::new())
    }
}

/// Registry call log, in order
#[derive(Debug, Clone, PartialEq)]
enum RegistryCall {
    Refresh(RecordDelta),
    Withdraw,
}

/// Forwards to an in-memory registry and records refreshes and withdrawals
struct RecordingRegistry {
    inner: Arc<InMemoryRegistry>,
    calls: std::sync::Mutex<Vec<RegistryCall>>,
}

impl RecordingRegistry {
    fn calls(&self) -> Vec<RegistryCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl AdvertisementRegistry for RecordingRegistry {
    async fn publish(&self, record: GlideinRecord) -> Result<u64> {
        self.inner.publish(record).await
    }

    async fn refresh(&self, identity: &str, delta: RecordDelta) -> Result<u64> {
        self.calls
            .lock()
            .unwrap()
            .push(RegistryCall::Refresh(delta.clone()));
        self.inner.refresh(identity, delta).await
    }

    async fn withdraw(&self, identity: &str) -> Result<bool> {
        self.calls.lock().unwrap().push(RegistryCall::Withdraw);
        self.inner.withdraw(identity).await
    }

    async fn list_all(&self, filter: &RecordFilter) -> Result<Vec<GlideinRecord>> {
        self.inner.list_all(filter).await
    }
}

struct FailingCheck;

#[async_trait]
impl CapabilityCheck for FailingCheck {
    async fn check(&self) -> anyhow::Result<bool> {
        anyhow::bail!("mount table unreadable")
    }
}

struct Harness {
    registry: Arc<InMemoryRegistry>,
    queue: Arc<LocalQueue>,
    store: Arc<LocalObjectStore>,
    logs: TempDir,
    _objects: TempDir,
}

impl Harness {
    fn new() -> Self {
        Self::with_lease(LeaseConfig::default())
    }

    fn with_lease(lease: LeaseConfig) -> Self {
        let objects = TempDir::new().unwrap();
        let store = Arc::new(LocalObjectStore::new(
            objects.path(),
            Url::parse("http://localhost:8080").unwrap(),
            "secret",
        ));
        Self {
            registry: Arc::new(InMemoryRegistry::new(
                CapabilitySchema::new(["GPU", "CVMFS"], ["TIME_PER_PHOTON"]),
                lease,
            )),
            queue: Arc::new(LocalQueue::default()),
            store,
            logs: TempDir::new().unwrap(),
            _objects: objects,
        }
    }

    fn config(&self, site: &str) -> AgentConfig {
        AgentConfig {
            site: site.to_string(),
            partition: "Cluster".to_string(),
            refresh_interval: Duration::from_millis(50),
            poll_interval: Duration::from_millis(10),
            log_root: self.logs.path().to_path_buf(),
            ..Default::default()
        }
    }

    fn builder(&self, config: AgentConfig) -> GlideinAgentBuilder {
        GlideinAgent::builder()
            .config(config)
            .probe(
                ResourceProbe::builder()
                    .check("GPU", StaticCheck(true))
                    .metric("TIME_PER_PHOTON")
                    .benchmark_rounds(1)
                    .build(),
            )
            .registry(self.registry.clone())
            .queue(self.queue.clone())
            .executor(Arc::new(SleepExecutor {
                delay: Duration::from_millis(20),
            }))
            .finalizer(LogFinalizer::new(self.store.clone(), FinalizerConfig::default()))
    }
}

async fn eventually<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_full_lifecycle_runs_jobs_and_uploads_logs() {
    let h = Harness::new();
    let cluster = h
        .queue
        .submit(JobSpec::new("/bin/sleep", "0").with_memory(500), 2)
        .await
        .unwrap();
    let agent = h.builder(h.config("SiteA")).build().unwrap();
    let (drain_tx, drain_rx) = watch::channel(false);
    let task = tokio::spawn(agent.run(drain_rx));

    let queue = h.queue.clone();
    eventually(|| {
        let queue = queue.clone();
        async move {
            queue
                .query_history(&JobFilter::cluster(cluster), 10)
                .await
                .unwrap()
                .len()
                == 2
        }
    })
    .await;

    let live = h
        .registry
        .list_all(&RecordFilter::all().site("SiteA"))
        .await
        .unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].resource("GPU"), Some(true));
    assert!(live[0].metric("TIME_PER_PHOTON").is_some());

    drain_tx.send(true).unwrap();
    let report = task.await.unwrap();

    assert_eq!(report.final_state, AgentState::Terminated);
    assert_eq!(report.jobs_completed, 2);
    assert!(report.failures.is_empty(), "{:?}", report.failures);
    let url = report.log_url.clone().unwrap();

    assert!(h.registry.list_all(&RecordFilter::all()).await.unwrap().is_empty());
    let retired = h.registry.list_retired(&RecordFilter::all()).await.unwrap();
    assert_eq!(retired[0].identity, report.identity);
    assert_eq!(retired[0].activity, Activity::Draining);
    assert_eq!(retired[0].log_url.as_deref(), Some(url.as_str()));

    let bundle = h.store.get_signed(&Url::parse(&url).unwrap()).await.unwrap();
    let names = entry_names(&bundle).unwrap();
    assert!(names.contains(&format!("log.{}/MasterLog", report.identity)));
}

#[tokio::test]
async fn test_duplicate_identity_is_regenerated() {
    let h = Harness::new();
    h.registry
        .publish(GlideinRecord::new("taken", "SiteA", "Cluster"))
        .await
        .unwrap();

    let mut config = h.config("SiteA");
    config.identity = Some("taken".to_string());
    let agent = h.builder(config).build().unwrap();
    let (_drain_tx, drain_rx) = watch::channel(true);
    let report = agent.run(drain_rx).await;

    assert_ne!(report.identity, "taken");
    assert!(report.identity.starts_with("SiteA-"));
    assert!(report.has_failure("duplicate_identity"));
    assert!(report.warnings.iter().any(|w| w.contains("taken")));
    assert_eq!(report.final_state, AgentState::Terminated);
    assert!(report.log_url.is_some());
    // the original holder is untouched
    assert!(h.registry.get("taken").is_some());
}

#[tokio::test]
async fn test_identity_exhaustion_terminates_without_advertising() {
    let h = Harness::new();
    let mut config = h.config("SiteA");
    config.max_identity_retries = 2;
    let agent = h
        .builder(config)
        .registry(Arc::new(CollidingRegistry))
        .build()
        .unwrap();
    let (_drain_tx, drain_rx) = watch::channel(false);
    let report = agent.run(drain_rx).await;

    assert_eq!(report.final_state, AgentState::Terminated);
    assert!(report.has_failure("identity_exhausted"));
    let collisions = report
        .failures
        .iter()
        .filter(|f| f.kind == "duplicate_identity")
        .count();
    assert_eq!(collisions, 3);
    assert!(report.log_url.is_none());
}

#[tokio::test]
async fn test_upload_failure_still_terminates() {
    let h = Harness::new();
    let agent = h
        .builder(h.config("SiteA"))
        .finalizer(LogFinalizer::new(Arc::new(BrokenStore), FinalizerConfig::default()))
        .build()
        .unwrap();
    let (_drain_tx, drain_rx) = watch::channel(true);
    let report = agent.run(drain_rx).await;

    assert_eq!(report.final_state, AgentState::Terminated);
    assert!(report.log_url.is_none());
    assert!(report.has_failure("upload_failure"));

    let retired = h.registry.list_retired(&RecordFilter::all()).await.unwrap();
    assert!(retired[0].log_url.is_none());
    assert!(retired[0].warnings.iter().any(|w| w.contains("log upload failed")));
}

#[tokio::test]
async fn test_draining_waits_for_in_flight_and_takes_no_new_work() {
    let h = Harness::new();
    h.queue.submit(JobSpec::new("/bin/sleep", "1"), 1).await.unwrap();
    let (events_tx, mut events_rx) = mpsc::channel(256);
    let agent = h
        .builder(h.config("SiteA"))
        .executor(Arc::new(SleepExecutor {
            delay: Duration::from_millis(300),
        }))
        .events(events_tx)
        .build()
        .unwrap();
    let status = agent.subscribe();
    let (drain_tx, drain_rx) = watch::channel(false);
    let task = tokio::spawn(agent.run(drain_rx));

    let queue = h.queue.clone();
    eventually(|| {
        let queue = queue.clone();
        async move { queue.demand().await.unwrap().running == 1 }
    })
    .await;
    drain_tx.send(true).unwrap();

    let identity = status.borrow().identity.clone();
    let registry = h.registry.clone();
    eventually(|| {
        let registry = registry.clone();
        let identity = identity.clone();
        async move {
            registry
                .get(&identity)
                .map_or(false, |r| r.activity == Activity::Draining)
        }
    })
    .await;
    h.queue.submit(JobSpec::new("/bin/sleep", "1"), 1).await.unwrap();

    let report = task.await.unwrap();
    assert_eq!(report.jobs_completed, 1);
    assert_eq!(h.queue.demand().await.unwrap().idle, 1);

    let mut kinds = Vec::new();
    while let Ok(event) = events_rx.try_recv() {
        if let AggregatorEvent::Transition(t) = event {
            assert_eq!(t.worker_id, report.identity);
            kinds.push(t.kind);
        }
    }
    assert_eq!(
        kinds,
        vec![
            TransitionKind::Launched,
            TransitionKind::Idle,
            TransitionKind::Busy,
            TransitionKind::Draining,
            TransitionKind::Terminated,
        ]
    );
}

#[tokio::test]
async fn test_probe_failures_become_warnings() {
    let h = Harness::new();
    let agent = h
        .builder(h.config("SiteA"))
        .probe(
            ResourceProbe::builder()
                .check("GPU", StaticCheck(false))
                .check("CVMFS", FailingCheck)
                .build(),
        )
        .build()
        .unwrap();
    let (_drain_tx, drain_rx) = watch::channel(true);
    let report = agent.run(drain_rx).await;

    assert!(report.has_failure("probe"));
    let retired = h.registry.list_retired(&RecordFilter::all()).await.unwrap();
    assert_eq!(retired[0].resource("GPU"), Some(false));
    assert_eq!(retired[0].resource("CVMFS"), Some(false));
    assert!(retired[0].warnings.iter().any(|w| w.contains("CVMFS")));
}

#[tokio::test]
async fn test_expired_lease_is_readvertised() {
    let h = Harness::with_lease(LeaseConfig {
        lease_timeout: Duration::from_millis(100),
        drain_lease: Duration::from_secs(30),
    });
    let mut config = h.config("SiteA");
    config.refresh_interval = Duration::from_millis(400);
    let agent = h.builder(config).build().unwrap();
    let (drain_tx, drain_rx) = watch::channel(false);
    let task = tokio::spawn(agent.run(drain_rx));

    tokio::time::sleep(Duration::from_millis(900)).await;
    drain_tx.send(true).unwrap();
    let report = task.await.unwrap();

    assert!(report.has_failure("unknown_record"));
    assert!(report
        .warnings
        .iter()
        .any(|w| w == "advertisement lease expired"));
    assert_eq!(report.final_state, AgentState::Terminated);
}

#[tokio::test]
async fn test_draining_sends_only_the_final_refresh() {
    let h = Harness::new();
    h.queue.submit(JobSpec::new("/bin/sleep", "1"), 1).await.unwrap();
    let registry = Arc::new(RecordingRegistry {
        inner: h.registry.clone(),
        calls: std::sync::Mutex::new(Vec::new()),
    });
    // several refresh periods pass while the job is still running
    let agent = h
        .builder(h.config("SiteA"))
        .registry(registry.clone())
        .executor(Arc::new(SleepExecutor {
            delay: Duration::from_millis(400),
        }))
        .build()
        .unwrap();
    let (drain_tx, drain_rx) = watch::channel(false);
    let task = tokio::spawn(agent.run(drain_rx));

    let queue = h.queue.clone();
    eventually(|| {
        let queue = queue.clone();
        async move { queue.demand().await.unwrap().running == 1 }
    })
    .await;
    drain_tx.send(true).unwrap();
    let report = task.await.unwrap();
    assert_eq!(report.jobs_completed, 1);

    let calls = registry.calls();
    let draining = calls
        .iter()
        .position(|call| {
            matches!(call, RegistryCall::Refresh(delta) if delta.activity == Some(Activity::Draining))
        })
        .unwrap();
    let after = &calls[draining + 1..];
    assert_eq!(after.len(), 2, "{after:?}");
    match &after[0] {
        RegistryCall::Refresh(delta) => {
            assert_eq!(delta.log_url, report.log_url);
            assert!(delta.log_url.is_some());
        }
        other => panic!("expected final refresh, got {other:?}"),
    }
    assert_eq!(after[1], RegistryCall::Withdraw);
}

#[tokio::test]
async fn test_outcomes_are_reported_to_health() {
    let h = Harness::new();
    let health = HealthRegistry::new();
    let agent = h
        .builder(h.config("SiteA"))
        .probe(
            ResourceProbe::builder()
                .check("GPU", StaticCheck(true))
                .check("CVMFS", FailingCheck)
                .build(),
        )
        .finalizer(LogFinalizer::new(Arc::new(BrokenStore), FinalizerConfig::default()))
        .health(health.clone())
        .build()
        .unwrap();
    let (_drain_tx, drain_rx) = watch::channel(true);
    agent.run(drain_rx).await;

    let report = health.health().await;
    let probe = &report.components[components::PROBE];
    assert_eq!(probe.status, ComponentStatus::Degraded);
    assert!(probe.message.as_deref().unwrap().contains("CVMFS"));
    assert_eq!(
        report.components[components::FINALIZER].status,
        ComponentStatus::Degraded
    );
    assert_eq!(
        report.components[components::REGISTRY].status,
        ComponentStatus::Healthy
    );
}

#[test]
fn test_builder_requires_collaborators() {
    assert!(GlideinAgent::builder().build().is_err());
}
