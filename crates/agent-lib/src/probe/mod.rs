//! Host capability probing
//!
//! Runs once per glidein at startup. Every check is bounded by a timeout and
//! runs on its own task; a check that errors or times out is reported as
//! unknown, which is advertised as `false` but kept distinguishable from a
//! known absence.

mod checks;
mod metric;

pub use checks::{DeviceFileCheck, MountCheck, StaticCheck, TcpEndpointCheck};
pub use metric::{benchmark_seconds_per_unit, LiveMetrics, RollingAverage};

use crate::error::GlideinError;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// One yes/no question about the host
#[async_trait]
pub trait CapabilityCheck: Send + Sync {
    async fn check(&self) -> Result<bool>;
}

/// Outcome of a single capability check
#[derive(Debug, Clone, PartialEq)]
pub enum CapabilityValue {
    Known(bool),
    /// The check failed or timed out
    Unknown(String),
}

impl CapabilityValue {
    /// Value to advertise: unknown capabilities are advertised as absent
    pub fn advertised(&self) -> bool {
        matches!(self, CapabilityValue::Known(true))
    }
}

/// Capability facts produced by one probe run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapabilitySet {
    values: BTreeMap<String, CapabilityValue>,
}

impl CapabilitySet {
    pub fn get(&self, name: &str) -> Option<&CapabilityValue> {
        self.values.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: CapabilityValue) {
        self.values.insert(name.into(), value);
    }

    /// Boolean facts for the advertisement
    pub fn advertised(&self) -> BTreeMap<String, bool> {
        self.values
            .iter()
            .map(|(name, value)| (name.clone(), value.advertised()))
            .collect()
    }

    /// Capabilities that could not be determined, with the reason
    pub fn failures(&self) -> Vec<(String, String)> {
        self.values
            .iter()
            .filter_map(|(name, value)| match value {
                CapabilityValue::Unknown(reason) => Some((name.clone(), reason.clone())),
                CapabilityValue::Known(_) => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Result of probing: static facts plus the live metrics to keep refreshing
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub capabilities: CapabilitySet,
    pub metrics: LiveMetrics,
}

/// Runs the configured capability checks and seeds the live metrics
#[derive(Clone)]
pub struct ResourceProbe {
    checks: Vec<(String, Arc<dyn CapabilityCheck>)>,
    metrics: Vec<String>,
    check_timeout: Duration,
    benchmark_rounds: u32,
}

impl ResourceProbe {
    pub fn builder() -> ResourceProbeBuilder {
        ResourceProbeBuilder::new()
    }

    pub fn capability_names(&self) -> impl Iterator<Item = &str> {
        self.checks.iter().map(|(name, _)| name.as_str())
    }

    pub fn metric_names(&self) -> impl Iterator<Item = &str> {
        self.metrics.iter().map(String::as_str)
    }

    /// Run every check concurrently, each bounded by the check timeout
    pub async fn probe(&self) -> ProbeReport {
        let mut tasks = JoinSet::new();
        for (name, check) in &self.checks {
            let name = name.clone();
            let check = Arc::clone(check);
            let timeout = self.check_timeout;
            tasks.spawn(async move {
                let value = run_check(&name, check.as_ref(), timeout).await;
                (name, value)
            });
        }

        let mut capabilities = CapabilitySet::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, value)) => capabilities.insert(name, value),
                Err(e) => warn!(error = %e, "Capability check task aborted"),
            }
        }
        // a panicked check still has to be advertised as unknown
        for (name, _) in &self.checks {
            if capabilities.get(name).is_none() {
                capabilities.insert(name.clone(), CapabilityValue::Unknown("check panicked".into()));
            }
        }

        let metrics = self.seed_metrics().await;
        ProbeReport {
            capabilities,
            metrics,
        }
    }

    async fn seed_metrics(&self) -> LiveMetrics {
        let live = LiveMetrics::new();
        for name in &self.metrics {
            live.track(name);
        }
        if self.metrics.is_empty() {
            return live;
        }

        let rounds = self.benchmark_rounds;
        let benchmark = tokio::task::spawn_blocking(move || benchmark_seconds_per_unit(rounds));
        match tokio::time::timeout(self.check_timeout, benchmark).await {
            Ok(Ok(per_unit)) => {
                for name in &self.metrics {
                    live.record(name, per_unit);
                }
            }
            Ok(Err(e)) => warn!(error = %e, "Benchmark task failed, metrics unseeded"),
            Err(_) => warn!(
                timeout_ms = self.check_timeout.as_millis() as u64,
                "Benchmark timed out, metrics unseeded"
            ),
        }
        live
    }
}

async fn run_check(name: &str, check: &dyn CapabilityCheck, timeout: Duration) -> CapabilityValue {
    match tokio::time::timeout(timeout, check.check()).await {
        Ok(Ok(present)) => {
            debug!(capability = %name, present, "Capability checked");
            CapabilityValue::Known(present)
        }
        Ok(Err(e)) => {
            let err = GlideinError::ProbeFailed {
                capability: name.to_string(),
                reason: format!("{e:#}"),
            };
            CapabilityValue::Unknown(err.to_string())
        }
        Err(_) => {
            let err = GlideinError::ProbeTimeout {
                capability: name.to_string(),
                timeout,
            };
            CapabilityValue::Unknown(err.to_string())
        }
    }
}

pub struct ResourceProbeBuilder {
    checks: Vec<(String, Arc<dyn CapabilityCheck>)>,
    metrics: Vec<String>,
    check_timeout: Duration,
    benchmark_rounds: u32,
}

impl ResourceProbeBuilder {
    pub fn new() -> Self {
        Self {
            checks: Vec::new(),
            metrics: Vec::new(),
            check_timeout: Duration::from_secs(10),
            benchmark_rounds: 8,
        }
    }

    pub fn check(mut self, name: impl Into<String>, check: impl CapabilityCheck + 'static) -> Self {
        self.checks.push((name.into(), Arc::new(check)));
        self
    }

    pub fn metric(mut self, name: impl Into<String>) -> Self {
        self.metrics.push(name.into());
        self
    }

    pub fn check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }

    pub fn benchmark_rounds(mut self, rounds: u32) -> Self {
        self.benchmark_rounds = rounds;
        self
    }

    pub fn build(self) -> ResourceProbe {
        ResourceProbe {
            checks: self.checks,
            metrics: self.metrics,
            check_timeout: self.check_timeout,
            benchmark_rounds: self.benchmark_rounds,
        }
    }
}

impl Default for ResourceProbeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingCheck;

    #[async_trait]
    impl CapabilityCheck for FailingCheck {
        async fn check(&self) -> Result<bool> {
            anyhow::bail!("permission denied")
        }
    }

    struct HangingCheck;

    #[async_trait]
    impl CapabilityCheck for HangingCheck {
        async fn check(&self) -> Result<bool> {
            std::future::pending::<()>().await;
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_probe_distinguishes_unknown_from_absent() {
        let probe = ResourceProbe::builder()
            .check("GPU", StaticCheck(false))
            .check("CVMFS", StaticCheck(true))
            .check("GRIDFTP", FailingCheck)
            .check_timeout(Duration::from_millis(200))
            .build();

        let report = probe.probe().await;
        let caps = &report.capabilities;

        assert_eq!(caps.get("GPU"), Some(&CapabilityValue::Known(false)));
        assert_eq!(caps.get("CVMFS"), Some(&CapabilityValue::Known(true)));
        assert!(matches!(caps.get("GRIDFTP"), Some(CapabilityValue::Unknown(_))));

        let advertised = caps.advertised();
        assert_eq!(advertised["GRIDFTP"], false);
        assert_eq!(advertised["CVMFS"], true);

        let failures = caps.failures();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].1.contains("permission denied"));
    }

    #[tokio::test]
    async fn test_probe_times_out_hanging_check() {
        let probe = ResourceProbe::builder()
            .check("GRIDFTP", HangingCheck)
            .check_timeout(Duration::from_millis(50))
            .build();

        let report = probe.probe().await;
        match report.capabilities.get("GRIDFTP") {
            Some(CapabilityValue::Unknown(reason)) => assert!(reason.contains("timed out")),
            other => panic!("expected unknown, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_probe_seeds_metrics_with_positive_value() {
        let probe = ResourceProbe::builder()
            .metric("TIME_PER_PHOTON")
            .benchmark_rounds(1)
            .build();

        let report = probe.probe().await;
        let snapshot = report.metrics.snapshot();
        assert!(snapshot["TIME_PER_PHOTON"] > 0.0);
    }
}
