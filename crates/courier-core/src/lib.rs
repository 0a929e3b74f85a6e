//! Core domain models, clock abstraction and storage contracts.
//!
//! Every other courier crate builds on the types defined here: typed ids for
//! destinations and messages, the `Clock` used for TTL and pacing decisions,
//! and the `Directory` / `Backlog` traits the delivery engine talks to.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{Destination, DestinationId, Message, MessageId, NewDestination, NewMessage};
pub use storage::{Backlog, Directory, HealthProbe, StorageFuture};
pub use time::{Clock, RealClock, TestClock};
