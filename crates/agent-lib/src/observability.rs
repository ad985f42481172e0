//! Observability infrastructure for the glidein pool
//!
//! Provides:
//! - Prometheus counters for every failure kind the lifecycle can hit
//! - Structured JSON lifecycle events via tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Buckets for log upload latency (seconds)
const UPLOAD_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

static GLOBAL_METRICS: OnceLock<GlideinMetricsInner> = OnceLock::new();

struct GlideinMetricsInner {
    probe_failures: IntCounterVec,
    duplicate_identities: IntCounter,
    upload_failures: IntCounter,
    traversal_rejections: IntCounter,
    registry_refreshes: IntCounter,
    leases_expired: IntCounter,
    stale_samples: IntCounter,
    live_glideins: IntGauge,
    jobs_completed: IntCounterVec,
    upload_latency_seconds: Histogram,
}

impl GlideinMetricsInner {
    fn new() -> Self {
        Self {
            probe_failures: register_int_counter_vec!(
                "glidein_probe_failures_total",
                "Capability checks that could not determine an answer",
                &["capability"]
            )
            .expect("Failed to register probe_failures"),

            duplicate_identities: register_int_counter!(
                "glidein_duplicate_identities_total",
                "Publish attempts rejected because the identity was live"
            )
            .expect("Failed to register duplicate_identities"),

            upload_failures: register_int_counter!(
                "glidein_log_upload_failures_total",
                "Log bundles that could not be persisted"
            )
            .expect("Failed to register upload_failures"),

            traversal_rejections: register_int_counter!(
                "glidein_archive_traversal_rejections_total",
                "Archive extractions aborted because an entry escaped the target"
            )
            .expect("Failed to register traversal_rejections"),

            registry_refreshes: register_int_counter!(
                "glidein_registry_refreshes_total",
                "Advertisement refreshes accepted by the registry"
            )
            .expect("Failed to register registry_refreshes"),

            leases_expired: register_int_counter!(
                "glidein_leases_expired_total",
                "Advertisements removed because their lease ran out"
            )
            .expect("Failed to register leases_expired"),

            stale_samples: register_int_counter!(
                "glidein_stale_samples_total",
                "Metric samples dropped for falling outside the aggregation window"
            )
            .expect("Failed to register stale_samples"),

            live_glideins: register_int_gauge!(
                "glidein_live_glideins",
                "Glideins currently launched by this controller"
            )
            .expect("Failed to register live_glideins"),

            jobs_completed: register_int_counter_vec!(
                "glidein_jobs_completed_total",
                "Jobs finished by glideins, by outcome",
                &["outcome"]
            )
            .expect("Failed to register jobs_completed"),

            upload_latency_seconds: register_histogram!(
                "glidein_log_upload_latency_seconds",
                "Time spent uploading a log bundle",
                UPLOAD_BUCKETS.to_vec()
            )
            .expect("Failed to register upload_latency_seconds"),
        }
    }
}

/// Lightweight handle to the process-wide glidein metrics.
/// Clones share the same underlying Prometheus collectors.
#[derive(Clone)]
pub struct GlideinMetrics {
    _private: (),
}

impl Default for GlideinMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GlideinMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(GlideinMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &GlideinMetricsInner {
        GLOBAL_METRICS.get_or_init(GlideinMetricsInner::new)
    }

    pub fn inc_probe_failure(&self, capability: &str) {
        self.inner()
            .probe_failures
            .with_label_values(&[capability])
            .inc();
    }

    pub fn inc_duplicate_identity(&self) {
        self.inner().duplicate_identities.inc();
    }

    pub fn inc_upload_failure(&self) {
        self.inner().upload_failures.inc();
    }

    pub fn inc_traversal_rejection(&self) {
        self.inner().traversal_rejections.inc();
    }

    pub fn inc_registry_refresh(&self) {
        self.inner().registry_refreshes.inc();
    }

    pub fn inc_leases_expired(&self, count: u64) {
        self.inner().leases_expired.inc_by(count);
    }

    pub fn inc_stale_samples(&self) {
        self.inner().stale_samples.inc();
    }

    pub fn set_live_glideins(&self, count: i64) {
        self.inner().live_glideins.set(count);
    }

    pub fn inc_job_completed(&self, outcome: &str) {
        self.inner()
            .jobs_completed
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn observe_upload_latency(&self, duration_secs: f64) {
        self.inner().upload_latency_seconds.observe(duration_secs);
    }

    pub fn upload_failures(&self) -> u64 {
        self.inner().upload_failures.get()
    }

    pub fn traversal_rejections(&self) -> u64 {
        self.inner().traversal_rejections.get()
    }
}

/// Structured logger for glidein lifecycle events
#[derive(Clone)]
pub struct StructuredLogger {
    site: String,
}

impl StructuredLogger {
    pub fn new(site: impl Into<String>) -> Self {
        Self { site: site.into() }
    }

    pub fn log_startup(&self, version: &str, partition: &str) {
        info!(
            event = "controller_started",
            site = %self.site,
            partition = %partition,
            version = %version,
            "Glidein controller started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "controller_shutdown",
            site = %self.site,
            reason = %reason,
            "Glidein controller shutting down"
        );
    }

    pub fn log_glidein_started(&self, identity: &str, partition: &str) {
        info!(
            event = "glidein_started",
            site = %self.site,
            identity = %identity,
            partition = %partition,
            "Glidein started"
        );
    }

    pub fn log_advertised(&self, identity: &str, sequence: u64, attempts: u32) {
        info!(
            event = "glidein_advertised",
            site = %self.site,
            identity = %identity,
            sequence = sequence,
            attempts = attempts,
            "Glidein advertised"
        );
    }

    pub fn log_probe_failure(&self, identity: &str, capability: &str, reason: &str) {
        warn!(
            event = "probe_failed",
            site = %self.site,
            identity = %identity,
            capability = %capability,
            reason = %reason,
            "Capability could not be determined, advertising false"
        );
    }

    pub fn log_draining(&self, identity: &str, in_flight: usize, reason: &str) {
        info!(
            event = "glidein_draining",
            site = %self.site,
            identity = %identity,
            in_flight = in_flight,
            reason = %reason,
            "Glidein draining"
        );
    }

    pub fn log_upload(&self, identity: &str, object_key: &str, bytes: usize, elapsed_secs: f64) {
        info!(
            event = "log_uploaded",
            site = %self.site,
            identity = %identity,
            object_key = %object_key,
            bytes = bytes,
            elapsed_secs = elapsed_secs,
            "Glidein log bundle uploaded"
        );
    }

    pub fn log_upload_failure(&self, identity: &str, reason: &str) {
        warn!(
            event = "log_upload_failed",
            site = %self.site,
            identity = %identity,
            reason = %reason,
            "Glidein log bundle was not persisted"
        );
    }

    pub fn log_terminated(&self, identity: &str, log_url_present: bool, failures: usize) {
        info!(
            event = "glidein_terminated",
            site = %self.site,
            identity = %identity,
            log_url_present = log_url_present,
            failures = failures,
            "Glidein terminated"
        );
    }

    pub fn log_scaling_decision(&self, decision: &str, demand: u32, supply: u32, count: usize) {
        info!(
            event = "scaling_decision",
            site = %self.site,
            decision = %decision,
            demand = demand,
            supply = supply,
            count = count,
            "Fleet scaling decision"
        );
    }
}
