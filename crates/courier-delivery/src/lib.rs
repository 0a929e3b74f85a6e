//! Message delivery engine and its trigger sources.
//!
//! Messages wait in a per-destination backlog until a delivery round sends
//! them. Rounds are started two ways:
//!
//! - **Immediate trigger**: every accepted message enqueues its destination
//!   and a dispatcher task runs a round for it
//! - **Periodic sweep**: at the top of every sixth UTC hour (configurable),
//!   every destination gets a round, one after another
//!
//! # Round semantics
//!
//! A round marks the destination online, walks its backlog oldest first,
//! discards messages older than the TTL, and POSTs the rest after a fixed
//! pacing delay. Only an exact `200 OK` counts as delivered. The first failed
//! attempt marks the destination offline and ends the round; the failed
//! message and everything after it wait for the next round.
//!
//! Rounds for the same destination are serialized, so a sweep and an
//! immediate trigger never deliver the same message concurrently.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use courier_core::{storage::memory::InMemoryStorage, RealClock};
//! use courier_delivery::{DeliveryConfig, DeliveryEngine, DeliveryService, Intake};
//!
//! # async fn example() -> courier_delivery::Result<()> {
//! let storage = InMemoryStorage::new();
//! let clock = Arc::new(RealClock::new());
//! let engine = Arc::new(DeliveryEngine::new(
//!     Arc::new(storage.clone()),
//!     Arc::new(storage.clone()),
//!     DeliveryConfig::default(),
//!     clock.clone(),
//! )?);
//!
//! let service = DeliveryService::start(engine);
//! let intake =
//!     Intake::new(Arc::new(storage.clone()), Arc::new(storage), service.trigger_handle(), clock);
//! # let _ = intake;
//!
//! service.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod engine;
pub mod error;
pub mod intake;
pub mod schedule;
pub mod service;
pub mod trigger;

pub use client::{ClientConfig, DeliveryClient};
pub use engine::{DeliveryConfig, DeliveryEngine, EngineStats, RoundOutcome, RoundReport, SweepReport};
pub use error::{DeliveryError, Result};
pub use intake::Intake;
pub use schedule::SweepSchedule;
pub use service::DeliveryService;
pub use trigger::{ImmediateTrigger, TriggerHandle};

/// Default message TTL in seconds (24 hours).
pub const DEFAULT_MESSAGE_TTL_SECONDS: u64 = 24 * 60 * 60;

/// Default pause before every delivery attempt, in milliseconds.
pub const DEFAULT_PACING_DELAY_MS: u64 = 500;

/// Default HTTP request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

/// Default capacity of the immediate trigger queue.
pub const DEFAULT_TRIGGER_QUEUE_SIZE: usize = 1024;

/// Default hours between periodic sweeps.
pub const DEFAULT_SWEEP_EVERY_HOURS: u32 = 6;
