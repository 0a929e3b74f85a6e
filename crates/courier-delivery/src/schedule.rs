//! Periodic sweep schedule.
//!
//! Sweeps fire at the top of every `every_hours`-th hour of the UTC day,
//! the equivalent of the cron expression `0 0 */N * * *`. Because `N`
//! divides 24, those instants are exactly the multiples of `N` hours since
//! the Unix epoch.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use courier_core::Clock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    engine::DeliveryEngine,
    error::{DeliveryError, Result},
};

const SECONDS_PER_HOUR: i64 = 3_600;

/// Hour-aligned sweep schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct SweepSchedule {
    every_hours: u32,
}

impl SweepSchedule {
    /// Creates a schedule firing every `every_hours` hours.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` unless `every_hours` is a
    /// non-zero divisor of 24.
    pub fn new(every_hours: u32) -> Result<Self> {
        if every_hours == 0 || 24 % every_hours != 0 {
            return Err(DeliveryError::configuration(format!(
                "sweep interval must divide 24 hours, got {every_hours}"
            )));
        }
        Ok(Self { every_hours })
    }

    /// Hours between sweeps.
    pub fn every_hours(&self) -> u32 {
        self.every_hours
    }

    /// First firing instant strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let period = i64::from(self.every_hours) * SECONDS_PER_HOUR;
        let seconds = now.timestamp();
        let next = seconds - seconds.rem_euclid(period) + period;

        DateTime::from_timestamp(next, 0).unwrap_or(now)
    }

    /// Time left until the next firing instant.
    pub fn until_next(&self, now: DateTime<Utc>) -> Duration {
        (self.next_after(now) - now).to_std().unwrap_or(Duration::ZERO)
    }
}

impl Default for SweepSchedule {
    fn default() -> Self {
        Self { every_hours: crate::DEFAULT_SWEEP_EVERY_HOURS }
    }
}

impl TryFrom<u32> for SweepSchedule {
    type Error = DeliveryError;

    fn try_from(every_hours: u32) -> Result<Self> {
        Self::new(every_hours)
    }
}

impl From<SweepSchedule> for u32 {
    fn from(schedule: SweepSchedule) -> Self {
        schedule.every_hours
    }
}

/// Sweeps every destination on `schedule` until `token` is cancelled.
///
/// Cancellation stops a sweep between destinations; the round in progress
/// always finishes.
///
/// Sleeps through `clock`, so a `TestClock` makes every sleep return at once;
/// drive sweeps directly through [`DeliveryEngine::sweep`] in that case.
pub async fn run_sweeper(
    engine: Arc<DeliveryEngine>,
    schedule: SweepSchedule,
    clock: Arc<dyn Clock>,
    token: CancellationToken,
) {
    info!(every_hours = schedule.every_hours(), "sweeper started");

    loop {
        let now = clock.now_utc();
        let wait = schedule.until_next(now);
        debug!(next = %schedule.next_after(now), "waiting for next sweep");

        tokio::select! {
            biased;
            () = token.cancelled() => break,
            () = clock.sleep(wait) => {}
        }

        // Not raced against the token: a round cut off after a 200 would
        // leave the delivered message queued.
        engine.sweep_until(&token).await;
    }

    info!("sweeper stopped");
}
