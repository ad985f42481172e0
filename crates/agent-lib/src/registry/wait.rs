//! Bounded waiting for advertisements to appear

use super::{AdvertisementRegistry, RecordFilter};
use crate::models::GlideinRecord;
use std::time::Duration;
use tracing::debug;

/// Exponential backoff bounded by a number of attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt `attempt` (1-based, attempt 1 has none)
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 1u32 << (attempt - 2).min(16);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Result of waiting for matching records
#[derive(Debug, Clone, PartialEq)]
pub enum Availability {
    Available(Vec<GlideinRecord>),
    NotYetAvailable { attempts: u32 },
}

impl Availability {
    pub fn records(&self) -> &[GlideinRecord] {
        match self {
            Availability::Available(records) => records,
            Availability::NotYetAvailable { .. } => &[],
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Availability::Available(_))
    }
}

/// Poll `list_all` until at least one record matches or the policy runs out.
/// Registry errors count as an empty attempt.
pub async fn wait_for_records(
    registry: &dyn AdvertisementRegistry,
    filter: &RecordFilter,
    policy: &RetryPolicy,
) -> Availability {
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        tokio::time::sleep(policy.backoff(attempt)).await;
        match registry.list_all(filter).await {
            Ok(records) if !records.is_empty() => return Availability::Available(records),
            Ok(_) => debug!(attempt, "No matching advertisements yet"),
            Err(e) => debug!(attempt, error = %e, "Registry query failed"),
        }
    }
    Availability::NotYetAvailable { attempts }
}
