//! Per-destination delivery rounds.
//!
//! A round drains one destination's backlog in acceptance order:
//!
//! 1. mark the destination online
//! 2. list its backlog, oldest first
//! 3. discard every message whose age reached the TTL, without sending it
//! 4. otherwise wait the pacing delay and POST the message; exactly 200
//!    deletes it, anything else marks the destination offline and ends the
//!    round with the rest of the backlog untouched
//!
//! Rounds never fail outward. Whatever goes wrong is logged and summarized in
//! the returned [`RoundReport`]. Rounds for the same destination are
//! serialized; rounds for different destinations run independently.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use courier_core::{Backlog, Clock, Destination, DestinationId, Directory, Message, MessageId};
use tokio::sync::{OwnedMutexGuard, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    client::{ClientConfig, DeliveryClient, DeliveryRequest},
    error::{DeliveryError, ErrorCategory, Result},
    schedule::SweepSchedule,
};

/// Configuration for the delivery engine and its trigger sources.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Age at which a pending message is discarded unsent.
    pub message_ttl: Duration,

    /// Unconditional wait before every delivery attempt.
    pub pacing_delay: Duration,

    /// HTTP client configuration.
    pub client_config: ClientConfig,

    /// Capacity of the immediate trigger queue.
    pub trigger_queue_size: usize,

    /// When periodic sweeps run.
    pub sweep_schedule: SweepSchedule,

    /// Maximum time to wait for background tasks on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            message_ttl: Duration::from_secs(crate::DEFAULT_MESSAGE_TTL_SECONDS),
            pacing_delay: Duration::from_millis(crate::DEFAULT_PACING_DELAY_MS),
            client_config: ClientConfig::default(),
            trigger_queue_size: crate::DEFAULT_TRIGGER_QUEUE_SIZE,
            sweep_schedule: SweepSchedule::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// How a round ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    /// Every pending message was delivered or discarded.
    Drained,
    /// The round stopped early on a failed attempt or a storage error.
    Halted,
    /// Nothing was attempted: the destination is gone or its backlog could
    /// not be read.
    Skipped,
}

/// Summary of one round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundReport {
    /// Destination the round processed.
    pub destination_id: DestinationId,
    /// Messages delivered and removed.
    pub delivered: usize,
    /// Messages discarded for exceeding the TTL.
    pub expired: usize,
    /// Message the round stopped on, if it stopped early.
    pub halted_on: Option<MessageId>,
    /// How the round ended.
    pub outcome: RoundOutcome,
}

impl RoundReport {
    fn new(destination_id: DestinationId) -> Self {
        Self {
            destination_id,
            delivered: 0,
            expired: 0,
            halted_on: None,
            outcome: RoundOutcome::Drained,
        }
    }

    fn skipped(destination_id: DestinationId) -> Self {
        Self { outcome: RoundOutcome::Skipped, ..Self::new(destination_id) }
    }

    fn halt(&mut self, message_id: MessageId) {
        self.halted_on = Some(message_id);
        self.outcome = RoundOutcome::Halted;
    }
}

/// Summary of a sweep over every destination.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Destinations processed.
    pub destinations: usize,
    /// Messages delivered across all rounds.
    pub delivered: usize,
    /// Messages discarded across all rounds.
    pub expired: usize,
    /// Rounds that ended early.
    pub halted: usize,
}

/// Counters for engine monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Rounds completed since startup.
    pub rounds: u64,
    /// Messages delivered.
    pub delivered: u64,
    /// Messages discarded for exceeding the TTL.
    pub expired: u64,
    /// Failed delivery attempts.
    pub failed_attempts: u64,
    /// Storage errors absorbed by rounds.
    pub storage_errors: u64,
    /// Sweeps completed.
    pub sweeps: u64,
}

/// Keyed async mutex serializing rounds per destination.
///
/// Entries are created on first use and dropped again once no round holds or
/// waits on them, so the map only ever contains destinations with a round in
/// flight.
#[derive(Debug, Default)]
struct RoundLocks {
    inner: Mutex<HashMap<DestinationId, Arc<tokio::sync::Mutex<()>>>>,
}

struct RoundGuard<'a> {
    locks: &'a RoundLocks,
    id: DestinationId,
    lock: Arc<tokio::sync::Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl RoundLocks {
    async fn acquire(&self, id: DestinationId) -> RoundGuard<'_> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(map.entry(id).or_default())
        };

        // Built before waiting so a cancelled waiter still prunes the entry.
        let mut round = RoundGuard { locks: self, id, lock, guard: None };
        round.guard = Some(Arc::clone(&round.lock).lock_owned().await);
        round
    }

    fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Drop for RoundGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());

        let mut map = self.locks.inner.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one here: nobody else holds or awaits it.
        // Also runs for a waiter dropped before it got the lock.
        if Arc::strong_count(&self.lock) == 2 {
            map.remove(&self.id);
        }
    }
}

/// Delivers pending messages, one destination round at a time.
///
/// Shared behind an `Arc` by the immediate trigger dispatcher and the sweep
/// task.
pub struct DeliveryEngine {
    directory: Arc<dyn Directory>,
    backlog: Arc<dyn Backlog>,
    client: DeliveryClient,
    config: DeliveryConfig,
    clock: Arc<dyn Clock>,
    locks: RoundLocks,
    stats: RwLock<EngineStats>,
}

impl std::fmt::Debug for DeliveryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryEngine").field("config", &self.config).finish_non_exhaustive()
    }
}

enum Attempt {
    Delivered,
    Failed(DeliveryError),
}

impl DeliveryEngine {
    /// Creates an engine over the given stores.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be built from `config.client_config`.
    pub fn new(
        directory: Arc<dyn Directory>,
        backlog: Arc<dyn Backlog>,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let client = DeliveryClient::new(config.client_config.clone())?;

        Ok(Self {
            directory,
            backlog,
            client,
            config,
            clock,
            locks: RoundLocks::default(),
            stats: RwLock::new(EngineStats::default()),
        })
    }

    /// Returns the engine configuration.
    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Returns the clock the engine runs on.
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Returns current engine statistics.
    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }

    /// Number of destinations with a round running or waiting.
    pub fn active_rounds(&self) -> usize {
        self.locks.len()
    }

    /// Runs one delivery round for a destination.
    ///
    /// Waits for any round already running for the same destination, then
    /// re-reads the backlog, so messages accepted meanwhile are included.
    /// Never fails: errors are logged and reflected in the report.
    pub async fn process_destination(&self, id: DestinationId) -> RoundReport {
        let _guard = self.locks.acquire(id).await;

        let span = info_span!("delivery_round", destination_id = %id);
        let report = self.run_round(id).instrument(span).await;

        let mut stats = self.stats.write().await;
        stats.rounds += 1;
        stats.delivered += report.delivered as u64;
        stats.expired += report.expired as u64;

        report
    }

    /// Runs a round for every registered destination, one after another.
    pub async fn sweep(&self) -> SweepReport {
        self.sweep_until(&CancellationToken::new()).await
    }

    /// Like [`sweep`](Self::sweep), but stops before the next destination
    /// once `token` is cancelled. A round already running always completes.
    pub async fn sweep_until(&self, token: &CancellationToken) -> SweepReport {
        let destinations = match self.directory.all().await {
            Ok(destinations) => destinations,
            Err(e) => {
                let error = DeliveryError::from(e);
                self.record_error(&error, None, "failed to enumerate destinations for sweep").await;
                return SweepReport::default();
            },
        };

        info!(destinations = destinations.len(), "starting sweep");

        let mut report = SweepReport::default();
        for destination in destinations {
            if token.is_cancelled() {
                info!(processed = report.destinations, "sweep cancelled");
                break;
            }

            let round = self.process_destination(destination.id).await;

            report.destinations += 1;
            report.delivered += round.delivered;
            report.expired += round.expired;
            if round.outcome == RoundOutcome::Halted {
                report.halted += 1;
            }
        }

        self.stats.write().await.sweeps += 1;

        info!(
            destinations = report.destinations,
            delivered = report.delivered,
            expired = report.expired,
            halted = report.halted,
            "sweep completed"
        );

        report
    }

    async fn run_round(&self, id: DestinationId) -> RoundReport {
        let destination = match self.directory.get(id).await {
            Ok(Some(destination)) => destination,
            Ok(None) => {
                debug!("destination not found, skipping round");
                return RoundReport::skipped(id);
            },
            Err(e) => {
                let error = DeliveryError::from(e);
                self.record_error(&error, None, "failed to load destination").await;
                return RoundReport::skipped(id);
            },
        };

        if let Err(e) = self.directory.set_online(id).await {
            let error = DeliveryError::from(e);
            self.record_error(&error, None, "failed to mark destination online").await;
        }

        let backlog = match self.backlog.list_by_destination(id).await {
            Ok(backlog) => backlog,
            Err(e) => {
                let error = DeliveryError::from(e);
                self.record_error(&error, None, "failed to list backlog").await;
                return RoundReport::skipped(id);
            },
        };

        debug!(pending = backlog.len(), "processing backlog");

        let mut report = RoundReport::new(id);
        for message in backlog {
            if message.is_expired(self.clock.now_utc(), self.config.message_ttl) {
                if let Err(e) = self.backlog.delete(message.id).await {
                    let error = DeliveryError::from(e);
                    self.record_error(&error, Some(message.id), "failed to discard expired message")
                        .await;
                    report.halt(message.id);
                    break;
                }
                debug!(message_id = %message.id, "discarded expired message");
                report.expired += 1;
                continue;
            }

            match self.attempt(&destination, &message).await {
                Attempt::Delivered => {
                    if let Err(e) = self.backlog.delete(message.id).await {
                        let error = DeliveryError::from(e);
                        self.record_error(
                            &error,
                            Some(message.id),
                            "failed to remove delivered message",
                        )
                        .await;
                        report.halt(message.id);
                        break;
                    }
                    report.delivered += 1;
                },
                Attempt::Failed(error) => {
                    self.record_error(
                        &error,
                        Some(message.id),
                        "delivery failed, marking destination offline",
                    )
                    .await;

                    if let Err(e) = self.directory.set_offline(id).await {
                        let error = DeliveryError::from(e);
                        self.record_error(&error, None, "failed to mark destination offline").await;
                    }

                    report.halt(message.id);
                    break;
                },
            }
        }

        info!(
            delivered = report.delivered,
            expired = report.expired,
            outcome = ?report.outcome,
            "round completed"
        );

        report
    }

    async fn attempt(&self, destination: &Destination, message: &Message) -> Attempt {
        self.clock.sleep(self.config.pacing_delay).await;

        let request = DeliveryRequest::for_message(message, destination.url.clone());
        match self.client.deliver(request).await {
            Ok(response) if response.is_ok() => {
                info!(message_id = %message.id, status = response.status_code, "message delivered");
                Attempt::Delivered
            },
            Ok(response) => Attempt::Failed(DeliveryError::unexpected_status(
                response.status_code,
                response.body,
            )),
            Err(error) => Attempt::Failed(error),
        }
    }

    /// Logs an error absorbed by a round and counts it.
    async fn record_error(
        &self,
        error: &DeliveryError,
        message_id: Option<MessageId>,
        context: &'static str,
    ) {
        warn!(
            message_id = message_id.map(|id| id.0),
            category = %ErrorCategory::from(error),
            error = %error,
            "{context}"
        );

        let mut stats = self.stats.write().await;
        if error.is_delivery_failure() {
            stats.failed_attempts += 1;
        } else {
            stats.storage_errors += 1;
        }
    }
}
