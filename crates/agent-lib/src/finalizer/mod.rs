//! Terminal log capture for draining glideins
//!
//! Packages a glidein's log directory, uploads it through the object store
//! and returns a time-limited retrieval URL. Failures are returned to the
//! caller as `UploadFailure`; they never block termination.

mod archive;
mod storage;

pub use archive::{entry_names, safe_extract, LogBundle};
pub use storage::{LocalObjectStore, ObjectStore, SignedObject};

use crate::error::{GlideinError, Result};
use crate::observability::GlideinMetrics;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;
use url::Url;

/// Name of the agent's lifecycle log inside every bundle
pub const MASTER_LOG: &str = "MasterLog";

#[derive(Debug, Clone)]
pub struct FinalizerConfig {
    pub bucket: String,
    /// Validity of the retrieval URL
    pub url_ttl: Duration,
    /// Bound on one upload attempt
    pub upload_timeout: Duration,
}

impl Default for FinalizerConfig {
    fn default() -> Self {
        Self {
            bucket: "pyglidein-logs".to_string(),
            url_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            upload_timeout: Duration::from_secs(60),
        }
    }
}

/// A persisted bundle and where to fetch it
#[derive(Debug, Clone)]
pub struct FinalizedLog {
    pub url: Url,
    pub object_key: String,
    pub bytes: usize,
    pub elapsed: Duration,
}

#[derive(Clone)]
pub struct LogFinalizer {
    store: Arc<dyn ObjectStore>,
    config: FinalizerConfig,
    metrics: GlideinMetrics,
}

impl LogFinalizer {
    pub fn new(store: Arc<dyn ObjectStore>, config: FinalizerConfig) -> Self {
        Self {
            store,
            config,
            metrics: GlideinMetrics::new(),
        }
    }

    /// Top-level directory of the bundle for `identity`
    pub fn bundle_root(identity: &str) -> String {
        format!("log.{identity}")
    }

    fn object_key(identity: &str) -> String {
        format!("logs/{identity}.tar.gz")
    }

    /// Capture, upload and presign. Any failure is an `UploadFailure`.
    pub async fn finalize(&self, identity: &str, log_dir: &Path) -> Result<FinalizedLog> {
        let start = Instant::now();
        let result = self.capture_and_upload(identity, log_dir).await;
        match &result {
            Ok(log) => self.metrics.observe_upload_latency(log.elapsed.as_secs_f64()),
            Err(_) => self.metrics.inc_upload_failure(),
        }
        debug!(
            identity = %identity,
            elapsed_ms = start.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "Log finalization finished"
        );
        result
    }

    async fn capture_and_upload(&self, identity: &str, log_dir: &Path) -> Result<FinalizedLog> {
        let start = Instant::now();
        let root = Self::bundle_root(identity);
        let dir = log_dir.to_path_buf();

        let bundle = tokio::task::spawn_blocking(move || LogBundle::capture(&dir, &root))
            .await
            .map_err(|e| GlideinError::UploadFailure {
                reason: format!("capture task failed: {e}"),
            })?
            .map_err(|e| GlideinError::UploadFailure {
                reason: e.to_string(),
            })?;

        let key = Self::object_key(identity);
        let bytes = bundle.len();
        let upload = self.store.put(&self.config.bucket, &key, bundle.bytes);
        match tokio::time::timeout(self.config.upload_timeout, upload).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(GlideinError::UploadFailure {
                    reason: format!("{e:#}"),
                })
            }
            Err(_) => {
                return Err(GlideinError::UploadFailure {
                    reason: format!("upload timed out after {:?}", self.config.upload_timeout),
                })
            }
        }

        let url = self
            .store
            .presign_get(&self.config.bucket, &key, self.config.url_ttl)
            .map_err(|e| GlideinError::UploadFailure {
                reason: format!("presign failed: {e:#}"),
            })?;

        Ok(FinalizedLog {
            url,
            object_key: key,
            bytes,
            elapsed: start.elapsed(),
        })
    }
}
