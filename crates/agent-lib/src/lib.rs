//! Glidein lifecycle library
//!
//! This crate provides the core functionality for:
//! - Host capability probing and live metrics
//! - The leased advertisement registry
//! - The glidein agent state machine and job execution
//! - Metrics aggregation and time-series push
//! - Log bundle capture, upload and safe extraction
//! - The fleet controller and its scaling policy
//! - Health checks and observability

pub mod agent;
pub mod controller;
pub mod error;
pub mod finalizer;
pub mod health;
pub mod metrics;
pub mod models;
pub mod observability;
pub mod probe;
pub mod queue;
pub mod registry;

pub use agent::{AgentConfig, AgentReport, AgentState, GlideinAgent};
pub use controller::{ControllerConfig, FleetController, ScalingDecision};
pub use error::{GlideinError, Result};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{GlideinMetrics, StructuredLogger};
pub use registry::{AdvertisementRegistry, InMemoryRegistry, RecordFilter};
