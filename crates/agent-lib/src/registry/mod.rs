//! Advertisement registry
//!
//! The pool-wide directory of live glideins. Agents publish and refresh their
//! own record; the controller and observers enumerate records by filter.
//! Records are leased: without a refresh they expire on their own, so a
//! crashed glidein disappears without an explicit withdraw.

mod memory;
mod wait;

pub use memory::{InMemoryRegistry, LeaseConfig};
pub use wait::{wait_for_records, Availability, RetryPolicy};

use crate::error::Result;
use crate::models::{Activity, GlideinRecord, RecordDelta};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Client contract of the registry
#[async_trait]
pub trait AdvertisementRegistry: Send + Sync {
    /// Advertise a new record; fails with `DuplicateIdentity` while another
    /// live record holds the identity. Returns the stamped sequence number.
    async fn publish(&self, record: GlideinRecord) -> Result<u64>;

    /// Apply `delta` and renew the lease; fails with `UnknownRecord` once the
    /// lease has expired.
    async fn refresh(&self, identity: &str, delta: RecordDelta) -> Result<u64>;

    /// Remove the record. Returns whether a live record was removed; calling
    /// it again is a no-op.
    async fn withdraw(&self, identity: &str) -> Result<bool>;

    /// Live records matching `filter`
    async fn list_all(&self, filter: &RecordFilter) -> Result<Vec<GlideinRecord>>;

    /// Last known state of withdrawn or expired records, newest first
    async fn list_retired(&self, _filter: &RecordFilter) -> Result<Vec<GlideinRecord>> {
        Ok(Vec::new())
    }
}

/// Selection criteria for `list_all`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordFilter {
    #[serde(default)]
    pub site: Option<String>,
    #[serde(default)]
    pub partition: Option<String>,
    /// Capabilities that must be advertised as true
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub activity: Option<Activity>,
    #[serde(default)]
    pub accepting_work: Option<bool>,
}

impl RecordFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn site(mut self, site: impl Into<String>) -> Self {
        self.site = Some(site.into());
        self
    }

    pub fn partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = Some(partition.into());
        self
    }

    pub fn resource(mut self, name: impl Into<String>) -> Self {
        self.resources.push(name.into());
        self
    }

    pub fn activity(mut self, activity: Activity) -> Self {
        self.activity = Some(activity);
        self
    }

    pub fn accepting_work(mut self, accepting: bool) -> Self {
        self.accepting_work = Some(accepting);
        self
    }

    pub fn matches(&self, record: &GlideinRecord) -> bool {
        if let Some(site) = &self.site {
            if &record.site != site {
                return false;
            }
        }
        if let Some(partition) = &self.partition {
            if &record.partition != partition {
                return false;
            }
        }
        if let Some(activity) = self.activity {
            if record.activity != activity {
                return false;
            }
        }
        if let Some(accepting) = self.accepting_work {
            if record.accepts_work() != accepting {
                return false;
            }
        }
        self.resources
            .iter()
            .all(|name| record.resource(name) == Some(true))
    }
}
