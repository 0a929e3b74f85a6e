//! Courier HTTP API.
//!
//! Destination registration, message acceptance and health probes over
//! axum. Handlers delegate to [`courier_delivery::Intake`]; accepting a
//! message never waits for its delivery.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;

use courier_core::{Clock, HealthProbe};
use courier_delivery::Intake;

pub mod config;
pub mod error;
pub mod handlers;
pub mod server;

pub use config::{Config, StorageBackend};
pub use error::ApiError;
pub use server::{create_router, shutdown_signal, start_server};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// Inbound façade over the stores and the immediate trigger.
    pub intake: Intake,
    /// Backing store liveness check.
    pub health: Arc<dyn HealthProbe>,
    /// Clock for response timestamps.
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Creates application state.
    pub fn new(intake: Intake, health: Arc<dyn HealthProbe>, clock: Arc<dyn Clock>) -> Self {
        Self { intake, health, clock }
    }
}
