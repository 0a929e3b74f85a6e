//! HTTP request handlers.
//!
//! - `destinations`: register, list and delete destinations
//! - `messages`: accept a message for delivery
//! - `health`: health, readiness and liveness probes

pub mod destinations;
pub mod health;
pub mod messages;

pub use destinations::{delete_destination, list_destinations, register_destination};
pub use health::{health_check, liveness_check, readiness_check};
pub use messages::accept_message;
