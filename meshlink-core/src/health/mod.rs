//! Health reporting for the signaling server and client node

use crate::core_signaling::RegistryStats;
use crate::types::Timestamp;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> u16 {
        match self {
            HealthStatus::Healthy => 200,
            HealthStatus::Degraded => 200,
            HealthStatus::Unhealthy => 503,
        }
    }
}

/// Component health status
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check: Timestamp,
}

impl ComponentHealth {
    pub fn healthy(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Healthy,
            message: None,
            last_check: Timestamp::now(),
        }
    }

    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Degraded,
            message: Some(message.into()),
            last_check: Timestamp::now(),
        }
    }

    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
            last_check: Timestamp::now(),
        }
    }
}

/// Body of `GET /health`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub total_peers: usize,
    pub total_rooms: usize,
    pub active_rooms: usize,
    pub components: Vec<ComponentHealth>,
}

/// Health checker service
#[derive(Clone)]
pub struct HealthChecker {
    start_time: Instant,
    version: String,
    components: Arc<RwLock<Vec<ComponentHealth>>>,
}

impl HealthChecker {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            start_time: Instant::now(),
            version: version.into(),
            components: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Register a component for health checking
    pub async fn register_component(&self, name: impl Into<String>) {
        let name = name.into();
        let mut components = self.components.write().await;
        if !components.iter().any(|c| c.name == name) {
            components.push(ComponentHealth::healthy(name));
        }
    }

    /// Replace a component's status with a fresh check result
    pub async fn record(&self, check: ComponentHealth) {
        let mut components = self.components.write().await;
        match components.iter_mut().find(|c| c.name == check.name) {
            Some(existing) => *existing = check,
            None => components.push(check),
        }
    }

    /// Update component health status
    pub async fn update_component(
        &self,
        name: &str,
        status: HealthStatus,
        message: Option<String>,
    ) {
        let mut components = self.components.write().await;
        if let Some(component) = components.iter_mut().find(|c| c.name == name) {
            component.status = status;
            component.message = message;
            component.last_check = Timestamp::now();
        }
    }

    /// Worst status across all components
    pub async fn overall_status(&self) -> HealthStatus {
        let components = self.components.read().await;
        if components.iter().any(|c| c.status == HealthStatus::Unhealthy) {
            HealthStatus::Unhealthy
        } else if components.iter().any(|c| c.status == HealthStatus::Degraded) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Build the health report, folding in the registry counts
    pub async fn report(&self, stats: RegistryStats) -> HealthReport {
        self.record(checks::check_registry(&stats)).await;

        HealthReport {
            status: self.overall_status().await,
            version: self.version.clone(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            total_peers: stats.total_peers,
            total_rooms: stats.total_rooms,
            active_rooms: stats.active_rooms,
            components: self.components.read().await.clone(),
        }
    }

    /// Can accept traffic
    pub async fn readiness_check(&self) -> bool {
        self.overall_status().await != HealthStatus::Unhealthy
    }
}

/// Built-in health checks
pub mod checks {
    use super::*;

    /// The registry is reachable; an empty registry is still healthy
    pub fn check_registry(stats: &RegistryStats) -> ComponentHealth {
        if stats.active_rooms > stats.total_rooms {
            ComponentHealth::unhealthy("registry", "Room accounting is inconsistent")
        } else {
            ComponentHealth::healthy("registry")
        }
    }

    /// Check the store's write queue and flush outcomes
    pub fn check_store(queue_depth: usize, failed_flushes: u64, max_queue: usize) -> ComponentHealth {
        if queue_depth > max_queue {
            ComponentHealth::unhealthy(
                "store",
                format!("Write queue backed up ({} pending)", queue_depth),
            )
        } else if failed_flushes > 0 {
            ComponentHealth::degraded(
                "store",
                format!("{} flushes failed since start", failed_flushes),
            )
        } else {
            ComponentHealth::healthy("store")
        }
    }

    /// Check the client's signaling link
    pub fn check_link(connected: bool) -> ComponentHealth {
        if connected {
            ComponentHealth::healthy("signaling_link")
        } else {
            ComponentHealth::degraded("signaling_link", "Reconnecting to signaling server")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(peers: usize, rooms: usize, active: usize) -> RegistryStats {
        RegistryStats {
            total_peers: peers,
            total_rooms: rooms,
            active_rooms: active,
        }
    }

    #[tokio::test]
    async fn test_report_carries_registry_counts() {
        let checker = HealthChecker::new("0.1.0");

        let report = checker.report(stats(3, 2, 1)).await;
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.total_peers, 3);
        assert_eq!(report.total_rooms, 2);
        assert_eq!(report.active_rooms, 1);
        assert_eq!(report.components.len(), 1);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["totalPeers"], 3);
        assert!(json.get("uptimeSeconds").is_some());
    }

    #[tokio::test]
    async fn test_component_health() {
        let checker = HealthChecker::new("0.1.0");

        checker.register_component("store").await;
        checker
            .update_component("store", HealthStatus::Degraded, Some("slow disk".to_string()))
            .await;

        assert_eq!(checker.overall_status().await, HealthStatus::Degraded);
        assert!(checker.readiness_check().await);
    }

    #[tokio::test]
    async fn test_readiness_check() {
        let checker = HealthChecker::new("0.1.0");
        assert!(checker.readiness_check().await);

        checker.record(checks::check_store(5_000, 0, 1_000)).await;
        assert!(!checker.readiness_check().await);
        assert_eq!(HealthStatus::Unhealthy.to_http_status(), 503);
    }

    #[test]
    fn test_link_check() {
        assert_eq!(checks::check_link(true).status, HealthStatus::Healthy);
        assert_eq!(checks::check_link(false).status, HealthStatus::Degraded);
    }
}
