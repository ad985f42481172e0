//! Launching and draining glideins

use crate::agent::{AgentReport, AgentState, AgentStatus, GlideinAgent};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// How the controller starts and stops glideins
#[async_trait]
pub trait GlideinLauncher: Send + Sync {
    /// Start `count` glideins; returns how many were started
    async fn launch(&self, count: u32) -> anyhow::Result<u32>;

    /// Ask the glidein advertised as `identity` to drain
    async fn drain(&self, identity: &str) -> bool;

    /// Ask every glidein to drain; returns how many were signalled
    async fn drain_all(&self) -> usize;

    /// Launched but not yet advertised
    fn pending(&self) -> u32;

    /// Launched and not yet terminated
    fn live(&self) -> u32;

    /// Collect reports of glideins that finished since the last call
    async fn reap(&self) -> Vec<AgentReport> {
        Vec::new()
    }
}

/// Builds a fresh agent for every launch
pub type AgentFactory = Arc<dyn Fn() -> anyhow::Result<GlideinAgent> + Send + Sync>;

struct LaunchedAgent {
    drain: watch::Sender<bool>,
    status: watch::Receiver<AgentStatus>,
    handle: JoinHandle<AgentReport>,
}

impl LaunchedAgent {
    fn status(&self) -> AgentStatus {
        self.status.borrow().clone()
    }
}

/// Runs agents as tasks in this process
pub struct LocalLauncher {
    factory: AgentFactory,
    agents: DashMap<u64, LaunchedAgent>,
    next_id: AtomicU64,
    reports: Mutex<VecDeque<AgentReport>>,
    report_limit: usize,
}

impl LocalLauncher {
    pub fn new(factory: AgentFactory) -> Self {
        Self {
            factory,
            agents: DashMap::new(),
            next_id: AtomicU64::new(0),
            reports: Mutex::new(VecDeque::new()),
            report_limit: 256,
        }
    }

    /// Identity and state of every running agent
    pub fn statuses(&self) -> Vec<AgentStatus> {
        let mut statuses: Vec<AgentStatus> =
            self.agents.iter().map(|agent| agent.status()).collect();
        statuses.sort_by(|a, b| a.identity.cmp(&b.identity));
        statuses
    }

    /// Recently finished agents, newest first
    pub fn reports(&self) -> Vec<AgentReport> {
        let reports = self.reports.lock().unwrap_or_else(|e| e.into_inner());
        reports.iter().cloned().collect()
    }

    /// Kill an agent without draining, as a crashed glidein would disappear.
    /// Its record is left to expire.
    pub fn abort(&self, identity: &str) -> bool {
        let key = self
            .agents
            .iter()
            .find(|agent| agent.status().identity == identity)
            .map(|agent| *agent.key());
        match key.and_then(|key| self.agents.remove(&key)) {
            Some((_, agent)) => {
                agent.handle.abort();
                warn!(identity = %identity, "Glidein aborted without draining");
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl GlideinLauncher for LocalLauncher {
    async fn launch(&self, count: u32) -> anyhow::Result<u32> {
        for launched in 0..count {
            let agent = match (self.factory)() {
                Ok(agent) => agent,
                Err(e) if launched > 0 => {
                    warn!(error = %e, launched, "Stopped launching glideins");
                    return Ok(launched);
                }
                Err(e) => return Err(e),
            };
            let status = agent.subscribe();
            let (drain, drain_rx) = watch::channel(false);
            let handle = tokio::spawn(agent.run(drain_rx));
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            self.agents.insert(
                id,
                LaunchedAgent {
                    drain,
                    status,
                    handle,
                },
            );
        }
        info!(count, "Launched glideins");
        Ok(count)
    }

    async fn drain(&self, identity: &str) -> bool {
        let signalled = self
            .agents
            .iter()
            .find(|agent| agent.status().identity == identity)
            .map(|agent| agent.drain.send(true).is_ok())
            .unwrap_or(false);
        if signalled {
            info!(identity = %identity, "Drain signalled");
        }
        signalled
    }

    async fn drain_all(&self) -> usize {
        self.agents
            .iter()
            .filter(|agent| agent.drain.send(true).is_ok())
            .count()
    }

    fn pending(&self) -> u32 {
        self.agents
            .iter()
            .filter(|agent| agent.status().state < AgentState::Running)
            .count() as u32
    }

    fn live(&self) -> u32 {
        self.agents
            .iter()
            .filter(|agent| !agent.handle.is_finished())
            .count() as u32
    }

    async fn reap(&self) -> Vec<AgentReport> {
        let finished: Vec<u64> = self
            .agents
            .iter()
            .filter(|agent| agent.handle.is_finished())
            .map(|agent| *agent.key())
            .collect();

        let mut reports = Vec::new();
        for key in finished {
            let Some((_, agent)) = self.agents.remove(&key) else {
                continue;
            };
            match agent.handle.await {
                Ok(report) => reports.push(report),
                Err(e) => warn!(error = %e, "Glidein task failed"),
            }
        }

        if !reports.is_empty() {
            let mut kept = self.reports.lock().unwrap_or_else(|e| e.into_inner());
            for report in &reports {
                kept.push_front(report.clone());
            }
            kept.truncate(self.report_limit);
        }
        reports
    }
}
