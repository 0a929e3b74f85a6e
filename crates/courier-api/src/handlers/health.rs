//! Health check handlers for service monitoring.
//!
//! Provides liveness, readiness, and health endpoints with storage
//! connectivity checks for orchestration systems.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use courier_core::{Clock, HealthProbe};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument};

use crate::AppState;

/// Health check response structure.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Overall service health status
    pub status: HealthStatus,
    /// Timestamp when health check was performed
    pub timestamp: DateTime<Utc>,
    /// Individual component health checks
    pub checks: HealthChecks,
    /// Service version information
    pub version: String,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational
    Healthy,
    /// Critical systems failing
    Unhealthy,
}

/// Individual component health check results.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthChecks {
    /// Backing store connectivity
    pub storage: ComponentHealth,
}

/// Health status for individual components.
#[derive(Debug, Serialize, Deserialize)]
pub struct ComponentHealth {
    /// Component status
    pub status: ComponentStatus,
    /// Error message if unhealthy
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
    /// Response time in milliseconds
    pub response_time_ms: u64,
}

/// Component-level health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Component is healthy
    Up,
    /// Component is failing
    Down,
}

/// Runs health checks against a clock, so timestamps are testable.
pub struct HealthService {
    clock: Arc<dyn Clock>,
}

impl HealthService {
    /// Creates a new health service with the given clock.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Checks every component.
    pub async fn health_check(&self, probe: &dyn HealthProbe) -> HealthResponse {
        debug!("performing health check");

        let timestamp = self.clock.now_utc();
        let start_time = self.clock.now();

        let (status, message) = match probe.health_check().await {
            Ok(()) => (ComponentStatus::Up, None),
            Err(e) => {
                error!("storage health check failed: {}", e);
                (ComponentStatus::Down, Some(format!("storage check failed: {e}")))
            },
        };
        let elapsed = self.clock.now().saturating_duration_since(start_time);

        let overall = match status {
            ComponentStatus::Up => HealthStatus::Healthy,
            ComponentStatus::Down => HealthStatus::Unhealthy,
        };

        HealthResponse {
            status: overall,
            timestamp,
            checks: HealthChecks {
                storage: ComponentHealth {
                    status,
                    message,
                    response_time_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                },
            },
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// `GET /health`
#[instrument(name = "health_check", skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Response {
    let response = HealthService::new(state.clock.clone()).health_check(state.health.as_ref()).await;

    let status_code = match response.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(response)).into_response()
}

/// `GET /ready`
///
/// Same checks as `/health`: the service can take traffic exactly when its
/// store answers.
#[instrument(name = "readiness_check", skip(state))]
pub async fn readiness_check(State(state): State<AppState>) -> Response {
    health_check(State(state)).await
}

/// `GET /live`
///
/// Answers as long as the process serves HTTP; touches no dependency.
#[instrument(name = "liveness_check", skip(state))]
pub async fn liveness_check(State(state): State<AppState>) -> Response {
    let response = serde_json::json!({
        "status": "alive",
        "timestamp": state.clock.now_utc(),
        "service": "courier"
    });

    (StatusCode::OK, Json(response)).into_response()
}
