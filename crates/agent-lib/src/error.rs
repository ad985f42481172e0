//! Error taxonomy for the glidein lifecycle
//!
//! Every failure kind here leaves an externally observable trace: a `false`
//! capability, a warning on the advertised record, a missing log URL or a
//! Prometheus counter. Nothing is swallowed.

use std::path::PathBuf;
use std::time::Duration;

use crate::agent::AgentState;

/// Errors raised by the glidein components
#[derive(Debug, thiserror::Error)]
pub enum GlideinError {
    /// A capability check exceeded its time bound
    #[error("probe for {capability} timed out after {timeout:?}")]
    ProbeTimeout {
        capability: String,
        timeout: Duration,
    },

    /// A capability check could not determine an answer
    #[error("probe for {capability} failed: {reason}")]
    ProbeFailed { capability: String, reason: String },

    /// Another live record already uses this identity
    #[error("identity {0} is already advertised")]
    DuplicateIdentity(String),

    /// Every regenerated identity collided
    #[error("gave up advertising after {attempts} identity collisions")]
    IdentityExhausted { attempts: u32 },

    /// The record is unknown or its lease already expired
    #[error("no live record for {0}")]
    UnknownRecord(String),

    /// A resource or metric key outside the configured schema
    #[error("{kind} {key} is not declared in the capability schema")]
    SchemaViolation { kind: &'static str, key: String },

    /// An archive entry would land outside the extraction directory
    #[error("archive entry {entry} escapes {}", dest.display())]
    PathTraversal { entry: String, dest: PathBuf },

    /// The log bundle could not be persisted
    #[error("log upload failed: {reason}")]
    UploadFailure { reason: String },

    /// Every datapoint of a series in the observed window is zero
    #[error("all datapoints of {series} are zero")]
    AllZeroMetric { series: String },

    /// A series was reported with no datapoints at all
    #[error("no datapoints found for {series}")]
    NoDatapoints { series: String },

    /// The agent state machine rejected a transition
    #[error("invalid agent transition {from} -> {to}")]
    InvalidTransition { from: AgentState, to: AgentState },

    /// A signed URL was malformed, tampered with or expired
    #[error("rejected signed url: {0}")]
    InvalidSignature(String),

    /// The queue rejected an operation
    #[error("queue error: {0}")]
    Queue(String),

    /// Archive creation or reading failed
    #[error("archive error: {0}")]
    Archive(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GlideinError {
    /// Short stable name used in logs, warnings and metric labels
    pub fn kind(&self) -> &'static str {
        match self {
            GlideinError::ProbeTimeout { .. } => "probe_timeout",
            GlideinError::ProbeFailed { .. } => "probe_failed",
            GlideinError::DuplicateIdentity(_) => "duplicate_identity",
            GlideinError::IdentityExhausted { .. } => "identity_exhausted",
            GlideinError::UnknownRecord(_) => "unknown_record",
            GlideinError::SchemaViolation { .. } => "schema_violation",
            GlideinError::PathTraversal { .. } => "path_traversal",
            GlideinError::UploadFailure { .. } => "upload_failure",
            GlideinError::AllZeroMetric { .. } => "all_zero_metric",
            GlideinError::NoDatapoints { .. } => "no_datapoints",
            GlideinError::InvalidTransition { .. } => "invalid_transition",
            GlideinError::InvalidSignature(_) => "invalid_signature",
            GlideinError::Queue(_) => "queue",
            GlideinError::Archive(_) => "archive",
            GlideinError::Io(_) => "io",
        }
    }
}

pub type Result<T> = std::result::Result<T, GlideinError>;
