//! Continuously updated work metrics
//!
//! A metric such as `TIME_PER_PHOTON` is seeded by a short CPU benchmark at
//! probe time and then tracks a rolling average of completed work.

use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Number of observations kept per metric
const DEFAULT_WINDOW: usize = 32;

/// Bytes hashed per benchmark unit
const BENCHMARK_UNIT_BYTES: usize = 1 << 20;

/// Rolling mean over the most recent observations
#[derive(Debug, Clone)]
pub struct RollingAverage {
    samples: VecDeque<f64>,
    capacity: usize,
    sum: f64,
}

impl RollingAverage {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            sum: 0.0,
        }
    }

    pub fn push(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        if self.samples.len() == self.capacity {
            if let Some(old) = self.samples.pop_front() {
                self.sum -= old;
            }
        }
        self.samples.push_back(value);
        self.sum += value;
    }

    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            None
        } else {
            Some(self.sum / self.samples.len() as f64)
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Shared set of live metrics; the agent reads a snapshot on each refresh
#[derive(Debug, Clone, Default)]
pub struct LiveMetrics {
    inner: Arc<Mutex<BTreeMap<String, RollingAverage>>>,
}

impl LiveMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an observation for `metric`
    pub fn record(&self, metric: &str, value: f64) {
        let mut metrics = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        metrics
            .entry(metric.to_string())
            .or_insert_with(|| RollingAverage::new(DEFAULT_WINDOW))
            .push(value);
    }

    /// Record a completed unit of work against every tracked metric
    pub fn record_work(&self, elapsed: Duration, units: u64) {
        let per_unit = elapsed.as_secs_f64() / units.max(1) as f64;
        let names: Vec<String> = {
            let metrics = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            metrics.keys().cloned().collect()
        };
        for name in names {
            self.record(&name, per_unit);
        }
    }

    /// Metrics with at least one observation. Unseeded metrics stay absent.
    pub fn snapshot(&self) -> BTreeMap<String, f64> {
        let metrics = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        metrics
            .iter()
            .filter_map(|(name, avg)| avg.mean().map(|m| (name.clone(), m)))
            .collect()
    }

    /// Start tracking `metric` without an observation yet
    pub fn track(&self, metric: &str) {
        let mut metrics = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        metrics
            .entry(metric.to_string())
            .or_insert_with(|| RollingAverage::new(DEFAULT_WINDOW));
    }
}

/// Hash `rounds` one-megabyte buffers and return seconds per round.
///
/// Blocking; run it through `spawn_blocking`.
pub fn benchmark_seconds_per_unit(rounds: u32) -> f64 {
    let rounds = rounds.max(1);
    let buffer = vec![0x5au8; BENCHMARK_UNIT_BYTES];
    let start = Instant::now();
    let mut digest = [0u8; 32];
    for _ in 0..rounds {
        let mut hasher = Sha256::new();
        hasher.update(digest);
        hasher.update(&buffer);
        digest.copy_from_slice(&hasher.finalize());
    }
    // keep the loop from being optimised away
    std::hint::black_box(digest);
    let elapsed = start.elapsed().as_secs_f64() / rounds as f64;
    elapsed.max(f64::MIN_POSITIVE)
}
