//! In-process leased registry
//!
//! Per-identity operations are serialized by the map shard lock, so a refresh
//! racing an expiry either renews a live entry or observes it as expired and
//! fails; an expired entry is never renewed.
//!
//! Withdrawn and expired records are retained in a bounded list of retired
//! records so observers can inspect how a glidein ended.

use super::{AdvertisementRegistry, RecordFilter};
use crate::error::{GlideinError, Result};
use crate::models::{Activity, CapabilitySchema, GlideinRecord, RecordDelta};
use crate::observability::GlideinMetrics;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant};
use tracing::{debug, info};

/// Lease durations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseConfig {
    /// Validity of a record after each publish/refresh
    pub lease_timeout: Duration,
    /// Validity granted to a record in `Draining`, long enough to upload logs
    pub drain_lease: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_timeout: Duration::from_secs(90),
            drain_lease: Duration::from_secs(360),
        }
    }
}

impl LeaseConfig {
    fn lease_for(&self, activity: Activity) -> Duration {
        match activity {
            Activity::Draining => self.drain_lease.max(self.lease_timeout),
            Activity::Idle | Activity::Busy => self.lease_timeout,
        }
    }
}

#[derive(Debug, Clone)]
struct LeaseEntry {
    record: GlideinRecord,
    expires_at: Instant,
}

impl LeaseEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Internally synchronized registry owned by the controller process
pub struct InMemoryRegistry {
    entries: DashMap<String, LeaseEntry>,
    schema: CapabilitySchema,
    lease: LeaseConfig,
    sequence: AtomicU64,
    retired: Mutex<VecDeque<GlideinRecord>>,
    retired_limit: usize,
    metrics: GlideinMetrics,
}

impl InMemoryRegistry {
    pub fn new(schema: CapabilitySchema, lease: LeaseConfig) -> Self {
        Self {
            entries: DashMap::new(),
            schema,
            lease,
            sequence: AtomicU64::new(0),
            retired: Mutex::new(VecDeque::new()),
            retired_limit: 1024,
            metrics: GlideinMetrics::new(),
        }
    }

    /// Keep at most `limit` retired records
    pub fn with_retired_limit(mut self, limit: usize) -> Self {
        self.retired_limit = limit;
        self
    }

    fn retire(&self, record: GlideinRecord) {
        let mut retired = self.retired.lock().unwrap_or_else(|e| e.into_inner());
        retired.retain(|r| r.identity != record.identity);
        retired.push_front(record);
        retired.truncate(self.retired_limit);
    }

    pub fn schema(&self) -> &CapabilitySchema {
        &self.schema
    }

    pub fn lease(&self) -> LeaseConfig {
        self.lease
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn stamp(&self, mut record: GlideinRecord, now: Instant) -> LeaseEntry {
        record.sequence = self.next_sequence();
        let expires_at = now + self.lease.lease_for(record.activity);
        LeaseEntry { record, expires_at }
    }

    /// Live record for `identity`
    pub fn get(&self, identity: &str) -> Option<GlideinRecord> {
        let now = Instant::now();
        self.entries
            .get(identity)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.record.clone())
    }

    /// Number of live records
    pub fn live_count(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.is_live(now)).count()
    }

    /// Drop every entry whose lease has run out. Returns how many were removed.
    pub fn expire_stale(&self) -> usize {
        let now = Instant::now();
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| !entry.is_live(now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for identity in stale {
            if let Some((_, entry)) = self.entries.remove_if(&identity, |_, e| !e.is_live(now)) {
                debug!(identity = %identity, "Advertisement lease expired");
                self.retire(entry.record);
                removed += 1;
            }
        }
        if removed > 0 {
            self.metrics.inc_leases_expired(removed as u64);
        }
        removed
    }

    /// Periodically purge expired entries until shutdown
    pub async fn run_reaper(&self, period: Duration, mut shutdown: broadcast::Receiver<()>) {
        info!(period_secs = period.as_secs(), "Starting registry lease reaper");
        let mut ticker = interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = self.expire_stale();
                    if removed > 0 {
                        info!(removed, "Expired stale advertisements");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down registry lease reaper");
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl AdvertisementRegistry for InMemoryRegistry {
    async fn publish(&self, record: GlideinRecord) -> Result<u64> {
        self.schema.validate(&record)?;
        let now = Instant::now();

        match self.entries.entry(record.identity.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    return Err(GlideinError::DuplicateIdentity(record.identity));
                }
                // an expired identity may be claimed again
                let entry = self.stamp(record, now);
                let sequence = entry.record.sequence;
                occupied.insert(entry);
                Ok(sequence)
            }
            Entry::Vacant(vacant) => {
                let entry = self.stamp(record, now);
                let sequence = entry.record.sequence;
                vacant.insert(entry);
                Ok(sequence)
            }
        }
    }

    async fn refresh(&self, identity: &str, delta: RecordDelta) -> Result<u64> {
        self.schema.validate_delta(&delta)?;
        let now = Instant::now();

        {
            let Some(mut entry) = self.entries.get_mut(identity) else {
                return Err(GlideinError::UnknownRecord(identity.to_string()));
            };
            if entry.is_live(now) {
                delta.apply(&mut entry.record);
                entry.record.sequence = self.next_sequence();
                entry.expires_at = now + self.lease.lease_for(entry.record.activity);
                self.metrics.inc_registry_refresh();
                return Ok(entry.record.sequence);
            }
        }

        // shard lock released above; only remove if still expired
        if let Some((_, entry)) = self
            .entries
            .remove_if(identity, |_, entry| !entry.is_live(now))
        {
            self.retire(entry.record);
            self.metrics.inc_leases_expired(1);
        }
        Err(GlideinError::UnknownRecord(identity.to_string()))
    }

    async fn withdraw(&self, identity: &str) -> Result<bool> {
        let now = Instant::now();
        let Some((_, entry)) = self.entries.remove(identity) else {
            return Ok(false);
        };
        let live = entry.is_live(now);
        self.retire(entry.record);
        Ok(live)
    }

    async fn list_all(&self, filter: &RecordFilter) -> Result<Vec<GlideinRecord>> {
        let now = Instant::now();
        let mut records: Vec<GlideinRecord> = self
            .entries
            .iter()
            .filter(|entry| entry.is_live(now) && filter.matches(&entry.record))
            .map(|entry| entry.record.clone())
            .collect();
        records.sort_by(|a, b| a.identity.cmp(&b.identity));
        Ok(records)
    }

    async fn list_retired(&self, filter: &RecordFilter) -> Result<Vec<GlideinRecord>> {
        let retired = self.retired.lock().unwrap_or_else(|e| e.into_inner());
        Ok(retired
            .iter()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect())
    }
}
