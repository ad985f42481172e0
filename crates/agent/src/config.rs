//! Controller configuration
//!
//! Read once at startup from an optional TOML file (path in `GLIDEIN_CONFIG`)
//! overlaid with `GLIDEIN_*` environment variables, `__` separating
//! sections, e.g. `GLIDEIN_REGISTRY__LEASE_TIMEOUT_SECS=30`.

use anyhow::{bail, Context, Result};
use glidein_lib::agent::AgentConfig;
use glidein_lib::controller::ControllerConfig;
use glidein_lib::finalizer::FinalizerConfig;
use glidein_lib::metrics::AggregatorConfig;
use glidein_lib::models::CapabilitySchema;
use glidein_lib::probe::{DeviceFileCheck, MountCheck, ResourceProbe, StaticCheck, TcpEndpointCheck};
use glidein_lib::registry::LeaseConfig;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;
use url::Url;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/pyglidein/glidein.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct GlideinConfig {
    /// Site label advertised by every glidein
    #[serde(default = "default_site")]
    pub site: String,

    #[serde(default = "default_partition")]
    pub partition: String,

    /// Source component of partition rollup series
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// API server port for health, metrics, jobs and objects
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Base of presigned URLs; defaults to `http://localhost:{api_port}`
    #[serde(default)]
    pub public_url: Option<String>,

    #[serde(default)]
    pub glidein: GlideinSection,

    #[serde(default)]
    pub registry: RegistrySection,

    #[serde(default)]
    pub probe: ProbeSection,

    #[serde(default)]
    pub storage: StorageSection,

    #[serde(default)]
    pub metrics: MetricsSection,

    #[serde(default)]
    pub controller: ControllerSection,
}

/// Per-glidein settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GlideinSection {
    pub slots: usize,
    pub memory_mb: u64,
    pub refresh_interval_secs: u64,
    pub poll_interval_secs: u64,
    pub max_identity_retries: u32,
    pub max_refresh_failures: u32,
    pub log_dir: PathBuf,
    /// Base of relative job output paths; the working directory when unset
    pub output_dir: Option<PathBuf>,
}

impl Default for GlideinSection {
    fn default() -> Self {
        Self {
            slots: 1,
            memory_mb: 2000,
            refresh_interval_secs: 30,
            poll_interval_secs: 5,
            max_identity_retries: 3,
            max_refresh_failures: 3,
            log_dir: std::env::temp_dir().join("pyglidein").join("logs"),
            output_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    pub lease_timeout_secs: u64,
    /// Lease of a draining record; four lease timeouts when unset
    pub drain_lease_secs: Option<u64>,
    pub reaper_interval_secs: u64,
    /// Capability names a record may advertise
    pub resources: Vec<String>,
    /// Metric names a record may advertise
    pub metrics: Vec<String>,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            lease_timeout_secs: 90,
            drain_lease_secs: None,
            reaper_interval_secs: 15,
            resources: vec!["GPU".into(), "CVMFS".into(), "GRIDFTP".into()],
            metrics: vec!["TIME_PER_PHOTON".into()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbeSection {
    pub check_timeout_secs: u64,
    pub benchmark_rounds: u32,
    pub gpu_devices: Vec<PathBuf>,
    pub cvmfs_mount: PathBuf,
    /// `host:port` probed for GRIDFTP; unset advertises false
    pub gridftp_endpoint: Option<String>,
    /// Forced capability values, bypassing their checks
    pub overrides: BTreeMap<String, bool>,
}

impl Default for ProbeSection {
    fn default() -> Self {
        Self {
            check_timeout_secs: 10,
            benchmark_rounds: 8,
            gpu_devices: vec!["/dev/nvidia0".into(), "/dev/nvidiactl".into()],
            cvmfs_mount: "/cvmfs/icecube.opensciencegrid.org".into(),
            gridftp_endpoint: None,
            overrides: BTreeMap::new(),
        }
    }
}

impl ProbeSection {
    /// Forced value for a capability. Table keys arrive lowercased from the
    /// config layer, so names match case-insensitively.
    pub fn override_for(&self, capability: &str) -> Option<bool> {
        self.overrides
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(capability))
            .map(|(_, value)| *value)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub root: PathBuf,
    pub bucket: String,
    /// URL signing secret; a random one is used when empty
    pub secret: String,
    pub url_ttl_secs: u64,
    pub upload_timeout_secs: u64,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            root: std::env::temp_dir().join("pyglidein").join("objects"),
            bucket: "pyglidein-logs".to_string(),
            secret: String::new(),
            url_ttl_secs: 7 * 24 * 60 * 60,
            upload_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsSection {
    pub namespace: String,
    /// Graphite plaintext `host:port`; unset keeps series in memory only
    pub graphite_server: Option<String>,
    pub window_secs: u64,
    pub retention_secs: u64,
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self {
            namespace: "pyglidein".to_string(),
            graphite_server: None,
            window_secs: 60,
            retention_secs: 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerSection {
    pub max_glideins: u32,
    pub poll_interval_secs: u64,
    pub scale_down_margin: u32,
    pub shutdown_grace_secs: u64,
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self {
            max_glideins: 10,
            poll_interval_secs: 10,
            scale_down_margin: 1,
            shutdown_grace_secs: 120,
        }
    }
}

fn default_site() -> String {
    std::env::var("SITE").unwrap_or_else(|_| "local".to_string())
}

fn default_partition() -> String {
    "default".to_string()
}

fn default_client_id() -> String {
    "pyglideinclient".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl GlideinConfig {
    /// Load configuration from the config file and environment
    pub fn load() -> Result<Self> {
        let path =
            std::env::var("GLIDEIN_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("GLIDEIN")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .with_context(|| format!("Failed to read configuration from {path}"))?;

        let config: GlideinConfig = config
            .try_deserialize()
            .context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.site.trim().is_empty() {
            bail!("site must not be empty");
        }
        if self.glidein.slots == 0 {
            bail!("glidein.slots must be at least 1");
        }
        if self.glidein.refresh_interval_secs == 0 || self.glidein.poll_interval_secs == 0 {
            bail!("glidein intervals must be at least one second");
        }
        if self.registry.lease_timeout_secs <= self.glidein.refresh_interval_secs {
            bail!(
                "registry.lease_timeout_secs ({}) must exceed glidein.refresh_interval_secs ({})",
                self.registry.lease_timeout_secs,
                self.glidein.refresh_interval_secs
            );
        }
        if self.controller.poll_interval_secs == 0 || self.metrics.window_secs == 0 {
            bail!("controller.poll_interval_secs and metrics.window_secs must be non-zero");
        }
        self.public_url()?;
        Ok(())
    }

    pub fn public_url(&self) -> Result<Url> {
        let raw = self
            .public_url
            .clone()
            .unwrap_or_else(|| format!("http://localhost:{}", self.api_port));
        Url::parse(&raw).with_context(|| format!("Invalid public_url {raw}"))
    }

    pub fn schema(&self) -> CapabilitySchema {
        CapabilitySchema::new(
            self.registry.resources.iter().cloned(),
            self.registry.metrics.iter().cloned(),
        )
    }

    pub fn lease(&self) -> LeaseConfig {
        let lease_timeout = Duration::from_secs(self.registry.lease_timeout_secs);
        LeaseConfig {
            lease_timeout,
            drain_lease: self
                .registry
                .drain_lease_secs
                .map(Duration::from_secs)
                .unwrap_or(lease_timeout * 4),
        }
    }

    /// One check per declared capability
    pub fn probe(&self) -> ResourceProbe {
        let mut builder = ResourceProbe::builder()
            .check_timeout(Duration::from_secs(self.probe.check_timeout_secs))
            .benchmark_rounds(self.probe.benchmark_rounds);

        for name in &self.registry.resources {
            if let Some(value) = self.probe.override_for(name) {
                builder = builder.check(name.clone(), StaticCheck(value));
                continue;
            }
            builder = match name.as_str() {
                "GPU" => builder.check(name.clone(), DeviceFileCheck::new(self.probe.gpu_devices.clone())),
                "CVMFS" => builder.check(name.clone(), MountCheck::new(self.probe.cvmfs_mount.clone())),
                "GRIDFTP" => match &self.probe.gridftp_endpoint {
                    Some(endpoint) => builder.check(name.clone(), TcpEndpointCheck::new(endpoint.clone())),
                    None => builder.check(name.clone(), StaticCheck(false)),
                },
                other => {
                    warn!(capability = %other, "No check for capability, advertising false");
                    builder.check(name.clone(), StaticCheck(false))
                }
            };
        }
        for metric in &self.registry.metrics {
            builder = builder.metric(metric.clone());
        }
        builder.build()
    }

    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            site: self.site.clone(),
            partition: self.partition.clone(),
            namespace: self.metrics.namespace.clone(),
            identity: None,
            slots: self.glidein.slots,
            memory_mb: self.glidein.memory_mb,
            refresh_interval: Duration::from_secs(self.glidein.refresh_interval_secs),
            poll_interval: Duration::from_secs(self.glidein.poll_interval_secs),
            max_identity_retries: self.glidein.max_identity_retries,
            max_refresh_failures: self.glidein.max_refresh_failures,
            log_root: self.glidein.log_dir.clone(),
        }
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            site: self.site.clone(),
            partition: self.partition.clone(),
            max_glideins: self.controller.max_glideins,
            slots_per_glidein: self.glidein.slots as u32,
            poll_interval: Duration::from_secs(self.controller.poll_interval_secs),
            scale_down_margin: self.controller.scale_down_margin,
            shutdown_grace: Duration::from_secs(self.controller.shutdown_grace_secs),
        }
    }

    pub fn aggregator_config(&self) -> AggregatorConfig {
        AggregatorConfig {
            namespace: self.metrics.namespace.clone(),
            reporter_id: self.client_id.clone(),
            window: Duration::from_secs(self.metrics.window_secs),
        }
    }

    pub fn finalizer_config(&self) -> FinalizerConfig {
        FinalizerConfig {
            bucket: self.storage.bucket.clone(),
            url_ttl: Duration::from_secs(self.storage.url_ttl_secs),
            upload_timeout: Duration::from_secs(self.storage.upload_timeout_secs),
        }
    }
}
