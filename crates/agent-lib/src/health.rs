//! Component health for the glidein controller
//!
//! Backs the `/healthz` and `/readyz` endpoints. Components report the
//! outcome of their last operation; the worst status wins.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Operating with reduced fidelity (e.g. a probe check unknown)
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    fn with(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: BTreeMap<String, ComponentHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names for health tracking
pub mod components {
    pub const PROBE: &str = "probe";
    pub const REGISTRY: &str = "registry";
    pub const AGGREGATOR: &str = "aggregator";
    pub const CONTROLLER: &str = "controller";
    pub const FINALIZER: &str = "finalizer";
}

#[derive(Debug, Default)]
struct HealthState {
    components: BTreeMap<String, ComponentHealth>,
    ready: bool,
}

/// Shared health registry; clones observe the same state
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    state: Arc<RwLock<HealthState>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, name: &str) {
        self.set(name, ComponentStatus::Healthy, None).await;
    }

    pub async fn set(&self, name: &str, status: ComponentStatus, message: Option<String>) {
        self.state
            .write()
            .await
            .components
            .insert(name.to_string(), ComponentHealth::with(status, message));
    }

    /// Record the outcome of one operation: errors degrade the component
    pub async fn observe<T, E: std::fmt::Display>(&self, name: &str, outcome: &Result<T, E>) {
        match outcome {
            Ok(_) => self.set(name, ComponentStatus::Healthy, None).await,
            Err(e) => {
                self.set(name, ComponentStatus::Degraded, Some(e.to_string()))
                    .await
            }
        }
    }

    pub async fn set_ready(&self, ready: bool) {
        self.state.write().await.ready = ready;
    }

    pub async fn health(&self) -> HealthResponse {
        let state = self.state.read().await;
        let status = state
            .components
            .values()
            .map(|c| c.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy);
        HealthResponse {
            status,
            components: state.components.clone(),
        }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let ready = self.state.read().await.ready;
        let health = self.health().await;

        let reason = if !ready {
            Some("Controller not yet initialized".to_string())
        } else if health.status == ComponentStatus::Unhealthy {
            Some("Critical component unhealthy".to_string())
        } else {
            None
        };

        ReadinessResponse {
            ready: reason.is_none(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_worst_status_wins() {
        let registry = HealthRegistry::new();
        registry.register(components::PROBE).await;
        registry.register(components::REGISTRY).await;
        assert_eq!(registry.health().await.status, ComponentStatus::Healthy);

        registry
            .set(components::PROBE, ComponentStatus::Degraded, Some("GPU unknown".into()))
            .await;
        assert_eq!(registry.health().await.status, ComponentStatus::Degraded);

        registry
            .set(components::REGISTRY, ComponentStatus::Unhealthy, None)
            .await;
        assert_eq!(registry.health().await.status, ComponentStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_observe_maps_errors_to_degraded() {
        let registry = HealthRegistry::new();
        let failed: Result<(), String> = Err("upload timed out".to_string());
        registry.observe(components::FINALIZER, &failed).await;

        let health = registry.health().await;
        let finalizer = &health.components[components::FINALIZER];
        assert_eq!(finalizer.status, ComponentStatus::Degraded);
        assert_eq!(finalizer.message.as_deref(), Some("upload timed out"));
    }

    #[tokio::test]
    async fn test_readiness_requires_init_and_no_unhealthy() {
        let registry = HealthRegistry::new();
        assert!(!registry.readiness().await.ready);

        registry.set_ready(true).await;
        assert!(registry.readiness().await.ready);

        registry
            .set(components::CONTROLLER, ComponentStatus::Unhealthy, None)
            .await;
        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert!(readiness.reason.is_some());
    }
}
