//! Health tracking for the control agent
//!
//! Component health and readiness reporting behind the `/healthz` and
//! `/readyz` endpoints. The control loop's phase feeds the registry so a
//! missing model or a failed engine shows up in probes.

use crate::control::{LoopPhase, LoopStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::debug;

/// Health status of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Operational but not doing useful work (e.g. waiting for a model)
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_operational(&self) -> bool {
        matches!(self, ComponentStatus::Healthy | ComponentStatus::Degraded)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    fn with_status(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn healthy() -> Self {
        Self::with_status(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with_status(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::with_status(ComponentStatus::Unhealthy, Some(message.into()))
    }
}

/// Overall health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Worst status across components
    pub fn compute_status(components: &HashMap<String, ComponentHealth>) -> ComponentStatus {
        let mut has_degraded = false;

        for health in components.values() {
            match health.status {
                ComponentStatus::Unhealthy => return ComponentStatus::Unhealthy,
                ComponentStatus::Degraded => has_degraded = true,
                ComponentStatus::Healthy => {}
            }
        }

        if has_degraded {
            ComponentStatus::Degraded
        } else {
            ComponentStatus::Healthy
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names for health tracking
pub mod components {
    pub const ENGINE: &str = "engine";
    pub const CONTROL_LOOP: &str = "control_loop";
    pub const TRAINING: &str = "training";
}

/// Health registry shared between the agent tasks and the HTTP API
#[derive(Debug, Clone)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentHealth>>>,
    ready: Arc<RwLock<bool>>,
    loop_status: Arc<RwLock<LoopStatus>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            components: Arc::new(RwLock::new(HashMap::new())),
            ready: Arc::new(RwLock::new(false)),
            loop_status: Arc::new(RwLock::new(LoopStatus::default())),
        }
    }

    /// Register a component with initial healthy status
    pub async fn register(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn update(&self, name: &str, health: ComponentHealth) {
        let mut components = self.components.write().await;
        components.insert(name.to_string(), health);
    }

    pub async fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message)).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message)).await;
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// Reflect a loop phase in the engine and control loop components
    pub async fn apply_loop_status(&self, status: &LoopStatus) {
        *self.loop_status.write().await = *status;
        match status.phase {
            LoopPhase::AwaitingModel => {
                self.set_degraded(components::ENGINE, "no trained model available")
                    .await;
                self.set_degraded(components::CONTROL_LOOP, "awaiting model")
                    .await;
                self.set_ready(false).await;
            }
            LoopPhase::Failed => {
                self.set_unhealthy(components::CONTROL_LOOP, "engine call failed")
                    .await;
                self.set_ready(false).await;
            }
            LoopPhase::Warming | LoopPhase::Active => {
                self.set_healthy(components::ENGINE).await;
                self.set_healthy(components::CONTROL_LOOP).await;
                self.set_ready(true).await;
            }
            LoopPhase::Idle | LoopPhase::Done | LoopPhase::Stopped => {
                self.set_healthy(components::CONTROL_LOOP).await;
            }
        }
    }

    /// Follow a loop's status channel until its sender is dropped
    pub async fn track_loop(&self, mut status: watch::Receiver<LoopStatus>) {
        loop {
            let current = *status.borrow_and_update();
            self.apply_loop_status(&current).await;
            if status.changed().await.is_err() {
                debug!("Loop status channel closed");
                break;
            }
        }
    }

    /// Last loop status seen by the registry
    pub async fn loop_status(&self) -> LoopStatus {
        *self.loop_status.read().await
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        let status = HealthResponse::compute_status(&components);
        HealthResponse { status, components }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let ready = *self.ready.read().await;
        let health = self.health().await;

        if !ready {
            ReadinessResponse {
                ready: false,
                reason: Some("Control loop not running".to_string()),
            }
        } else if health.status == ComponentStatus::Unhealthy {
            ReadinessResponse {
                ready: false,
                reason: Some("Critical component unhealthy".to_string()),
            }
        } else {
            ReadinessResponse {
                ready: true,
                reason: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(phase: LoopPhase) -> LoopStatus {
        LoopStatus {
            phase,
            tick: 0,
            iterations: 0,
        }
    }

    #[tokio::test]
    async fn test_health_registry_initial_state() {
        let registry = HealthRegistry::new();
        let health = registry.health().await;

        assert_eq!(health.status, ComponentStatus::Healthy);
        assert!(health.components.is_empty());
    }

    #[tokio::test]
    async fn test_worst_component_wins() {
        let registry = HealthRegistry::new();
        registry.register(components::ENGINE).await;
        registry.register(components::CONTROL_LOOP).await;

        registry.set_degraded(components::ENGINE, "slow").await;
        assert_eq!(registry.health().await.status, ComponentStatus::Degraded);

        registry.set_unhealthy(components::CONTROL_LOOP, "failed").await;
        assert_eq!(registry.health().await.status, ComponentStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_readiness_not_ready_initially() {
        let registry = HealthRegistry::new();
        let readiness = registry.readiness().await;

        assert!(!readiness.ready);
        assert!(readiness.reason.is_some());
    }

    #[tokio::test]
    async fn test_awaiting_model_is_degraded_and_not_ready() {
        let registry = HealthRegistry::new();
        registry
            .apply_loop_status(&status(LoopPhase::AwaitingModel))
            .await;

        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Degraded);
        assert!(health.status.is_operational());
        assert!(!registry.readiness().await.ready);
    }

    #[tokio::test]
    async fn test_active_loop_is_ready() {
        let registry = HealthRegistry::new();
        registry.apply_loop_status(&status(LoopPhase::Active)).await;
        assert!(registry.readiness().await.ready);

        registry.apply_loop_status(&status(LoopPhase::Failed)).await;
        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(registry.health().await.status, ComponentStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_track_loop_follows_channel() {
        let registry = HealthRegistry::new();
        let (tx, rx) = watch::channel(status(LoopPhase::Warming));

        let tracker = tokio::spawn({
            let registry = registry.clone();
            async move { registry.track_loop(rx).await }
        });

        tx.send_replace(status(LoopPhase::Failed));
        drop(tx);
        tracker.await.unwrap();

        // the final value is always applied before the channel is seen closed
        assert_eq!(registry.health().await.status, ComponentStatus::Unhealthy);
        assert_eq!(registry.loop_status().await.phase, LoopPhase::Failed);
    }
}
