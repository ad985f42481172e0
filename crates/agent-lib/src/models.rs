//! Core data models for the glidein pool

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{GlideinError, Result};

/// Advertised prefix for capability facts
pub const RESOURCE_PREFIX: &str = "PYGLIDEIN_RESOURCE_";

/// Advertised prefix for live metrics
pub const METRIC_PREFIX: &str = "PYGLIDEIN_METRIC_";

/// Immutable description of one unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub executable: String,
    #[serde(default)]
    pub arguments: String,
    /// File that receives the job's stdout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Requested memory in MB
    #[serde(default)]
    pub request_memory: u64,
    /// Capabilities that must be advertised as true by the matched glidein
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requirements: Vec<String>,
}

impl JobSpec {
    pub fn new(executable: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            arguments: arguments.into(),
            output: None,
            request_memory: 0,
            requirements: Vec::new(),
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn with_memory(mut self, megabytes: u64) -> Self {
        self.request_memory = megabytes;
        self
    }

    pub fn with_requirement(mut self, capability: impl Into<String>) -> Self {
        self.requirements.push(capability.into());
        self
    }

    /// Arguments split the way a submit description splits them
    pub fn argv(&self) -> Vec<&str> {
        self.arguments.split_whitespace().collect()
    }
}

/// Identifier allocated per submit transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(pub u64);

impl std::fmt::Display for ClusterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One queued instance of a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId {
    pub cluster: ClusterId,
    pub proc: u32,
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.cluster, self.proc)
    }
}

/// What an advertised glidein is currently doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activity {
    Idle,
    Busy,
    Draining,
}

impl Activity {
    /// Whether new work may be routed to a glidein in this activity
    pub fn accepts_work(&self) -> bool {
        !matches!(self, Activity::Draining)
    }
}

/// Self-advertised state of one running glidein
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlideinRecord {
    /// Pool-wide unique worker identity
    pub identity: String,
    /// Configured site label
    pub site: String,
    pub partition: String,
    pub resources: BTreeMap<String, bool>,
    pub metrics: BTreeMap<String, f64>,
    pub activity: Activity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Stamped by the registry on every publish and refresh
    #[serde(default)]
    pub sequence: u64,
}

impl GlideinRecord {
    pub fn new(
        identity: impl Into<String>,
        site: impl Into<String>,
        partition: impl Into<String>,
    ) -> Self {
        Self {
            identity: identity.into(),
            site: site.into(),
            partition: partition.into(),
            resources: BTreeMap::new(),
            metrics: BTreeMap::new(),
            activity: Activity::Idle,
            log_url: None,
            warnings: Vec::new(),
            sequence: 0,
        }
    }

    /// Look up a capability by bare name or advertised `PYGLIDEIN_RESOURCE_*` key.
    /// `None` means the capability is not advertised at all.
    pub fn resource(&self, name: &str) -> Option<bool> {
        let bare = name.strip_prefix(RESOURCE_PREFIX).unwrap_or(name);
        self.resources.get(bare).copied()
    }

    /// Look up a metric by bare name or advertised `PYGLIDEIN_METRIC_*` key
    pub fn metric(&self, name: &str) -> Option<f64> {
        let bare = name.strip_prefix(METRIC_PREFIX).unwrap_or(name);
        self.metrics.get(bare).copied()
    }

    pub fn accepts_work(&self) -> bool {
        self.activity.accepts_work()
    }

    /// Flatten into the classad-style attribute map observers expect
    pub fn attributes(&self) -> BTreeMap<String, serde_json::Value> {
        let mut attrs = BTreeMap::new();
        attrs.insert("Name".to_string(), self.identity.clone().into());
        attrs.insert("GLIDEIN_Site".to_string(), self.site.clone().into());
        attrs.insert("GLIDEIN_Partition".to_string(), self.partition.clone().into());
        attrs.insert("Activity".to_string(), format!("{:?}", self.activity).into());
        for (name, value) in &self.resources {
            attrs.insert(format!("{RESOURCE_PREFIX}{name}"), (*value).into());
        }
        for (name, value) in &self.metrics {
            attrs.insert(format!("{METRIC_PREFIX}{name}"), (*value).into());
        }
        if let Some(url) = &self.log_url {
            attrs.insert("PRESIGNED_GET_URL".to_string(), url.clone().into());
        }
        attrs
    }
}

/// Partial update applied by `refresh`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordDelta {
    #[serde(default)]
    pub resources: BTreeMap<String, bool>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub activity: Option<Activity>,
    #[serde(default)]
    pub log_url: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl RecordDelta {
    pub fn activity(activity: Activity) -> Self {
        Self {
            activity: Some(activity),
            ..Default::default()
        }
    }

    pub fn log_url(url: impl Into<String>) -> Self {
        Self {
            log_url: Some(url.into()),
            ..Default::default()
        }
    }

    pub fn with_metrics(mut self, metrics: BTreeMap<String, f64>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn apply(self, record: &mut GlideinRecord) {
        record.resources.extend(self.resources);
        record.metrics.extend(self.metrics);
        if let Some(activity) = self.activity {
            record.activity = activity;
        }
        if self.log_url.is_some() {
            record.log_url = self.log_url;
        }
        record.warnings.extend(self.warnings);
    }
}

/// Closed set of capability and metric names a record may carry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySchema {
    pub resources: BTreeSet<String>,
    pub metrics: BTreeSet<String>,
}

impl CapabilitySchema {
    pub fn new<R, M>(resources: R, metrics: M) -> Self
    where
        R: IntoIterator,
        R::Item: Into<String>,
        M: IntoIterator,
        M::Item: Into<String>,
    {
        Self {
            resources: resources.into_iter().map(Into::into).collect(),
            metrics: metrics.into_iter().map(Into::into).collect(),
        }
    }

    fn check_keys<'a>(
        &self,
        resources: impl Iterator<Item = &'a String>,
        metrics: impl Iterator<Item = &'a String>,
    ) -> Result<()> {
        for key in resources {
            if !self.resources.contains(key) {
                return Err(GlideinError::SchemaViolation {
                    kind: "resource",
                    key: key.clone(),
                });
            }
        }
        for key in metrics {
            if !self.metrics.contains(key) {
                return Err(GlideinError::SchemaViolation {
                    kind: "metric",
                    key: key.clone(),
                });
            }
        }
        Ok(())
    }

    /// Validate a full record at publish time
    pub fn validate(&self, record: &GlideinRecord) -> Result<()> {
        self.check_keys(record.resources.keys(), record.metrics.keys())
    }

    pub fn validate_delta(&self, delta: &RecordDelta) -> Result<()> {
        self.check_keys(delta.resources.keys(), delta.metrics.keys())
    }
}

/// One metric observation emitted by an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub namespace: String,
    pub worker_id: String,
    pub partition: String,
    pub metric: String,
    /// Unix timestamp in seconds
    pub timestamp: i64,
    pub value: f64,
}

/// Lifecycle change of one worker, as seen by the aggregator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionKind {
    Launched,
    Idle,
    Busy,
    Draining,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerTransition {
    pub worker_id: String,
    pub partition: String,
    pub kind: TransitionKind,
    pub timestamp: i64,
}

impl WorkerTransition {
    pub fn now(
        worker_id: impl Into<String>,
        partition: impl Into<String>,
        kind: TransitionKind,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            partition: partition.into(),
            kind,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

/// Event consumed by the metrics aggregator
#[derive(Debug, Clone, PartialEq)]
pub enum AggregatorEvent {
    Transition(WorkerTransition),
    Sample(MetricSample),
}

/// Rolled-up value ready for the time-series backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedMetric {
    /// `{namespace}.{source}.{partition}.{metric}`
    pub series: String,
    pub timestamp: i64,
    pub value: f64,
}

/// Build the stable series name
pub fn series_name(namespace: &str, source: &str, partition: &str, metric: &str) -> String {
    [namespace, source, partition, metric].join(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_lookup_by_prefixed_key() {
        let mut record = GlideinRecord::new("g-1", "Site", "Cluster");
        record.resources.insert("GPU".to_string(), false);
        record.metrics.insert("TIME_PER_PHOTON".to_string(), 0.0);

        assert_eq!(record.resource("PYGLIDEIN_RESOURCE_GPU"), Some(false));
        assert_eq!(record.resource("CVMFS"), None);
        // zero is a value, not absence
        assert_eq!(record.metric("PYGLIDEIN_METRIC_TIME_PER_PHOTON"), Some(0.0));
    }

    #[test]
    fn test_attributes_use_classad_names() {
        let mut record = GlideinRecord::new("g-1", "Site", "Cluster");
        record.resources.insert("CVMFS".to_string(), true);
        record.log_url = Some("http://store/log".to_string());

        let attrs = record.attributes();
        assert_eq!(attrs["GLIDEIN_Site"], "Site");
        assert_eq!(attrs["PYGLIDEIN_RESOURCE_CVMFS"], true);
        assert_eq!(attrs["PRESIGNED_GET_URL"], "http://store/log");
    }

    #[test]
    fn test_schema_rejects_undeclared_keys() {
        let schema = CapabilitySchema::new(["GPU", "CVMFS"], ["TIME_PER_PHOTON"]);
        let mut record = GlideinRecord::new("g-1", "Site", "Cluster");
        record.resources.insert("GPU".to_string(), true);
        assert!(schema.validate(&record).is_ok());

        record.resources.insert("TAPE".to_string(), true);
        let err = schema.validate(&record).unwrap_err();
        assert!(matches!(err, GlideinError::SchemaViolation { kind: "resource", .. }));

        let mut delta = RecordDelta::default();
        delta.metrics.insert("FLOPS".to_string(), 1.0);
        assert!(schema.validate_delta(&delta).is_err());
    }

    #[test]
    fn test_delta_apply_keeps_unset_fields() {
        let mut record = GlideinRecord::new("g-1", "Site", "Cluster");
        record.metrics.insert("TIME_PER_PHOTON".to_string(), 2.0);

        RecordDelta::activity(Activity::Draining).apply(&mut record);
        assert_eq!(record.activity, Activity::Draining);
        assert_eq!(record.metric("TIME_PER_PHOTON"), Some(2.0));
        assert!(record.log_url.is_none());

        RecordDelta::log_url("http://x").apply(&mut record);
        assert_eq!(record.log_url.as_deref(), Some("http://x"));
    }

    #[test]
    fn test_job_spec_argv_and_series_name() {
        let job = JobSpec::new("/bin/echo", "hello pyglidein").with_memory(500);
        assert_eq!(job.argv(), vec!["hello", "pyglidein"]);
        assert_eq!(
            series_name("ns", "client", "Cluster", "glideins.idle"),
            "ns.client.Cluster.glideins.idle"
        );
    }
}
