//! Background delivery service.
//!
//! Owns the two trigger sources, the immediate trigger dispatcher and the
//! periodic sweeper, and stops both on shutdown.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    engine::DeliveryEngine,
    error::{DeliveryError, Result},
    schedule::run_sweeper,
    trigger::{ImmediateTrigger, TriggerHandle},
};

/// Running trigger sources around a shared engine.
#[derive(Debug)]
pub struct DeliveryService {
    engine: Arc<DeliveryEngine>,
    trigger: TriggerHandle,
    cancellation_token: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl DeliveryService {
    /// Spawns the trigger dispatcher and the sweeper.
    ///
    /// Queue size, sweep schedule and shutdown timeout come from the engine's
    /// configuration. Must be called from within a tokio runtime.
    pub fn start(engine: Arc<DeliveryEngine>) -> Self {
        let config = engine.config().clone();
        let cancellation_token = CancellationToken::new();

        info!(
            trigger_queue_size = config.trigger_queue_size,
            sweep_every_hours = config.sweep_schedule.every_hours(),
            ttl_seconds = config.message_ttl.as_secs(),
            "starting delivery service"
        );

        let (trigger, dispatcher) = ImmediateTrigger::new(config.trigger_queue_size);

        let dispatcher_task =
            tokio::spawn(dispatcher.run(Arc::clone(&engine), cancellation_token.child_token()));

        let sweeper_task = tokio::spawn(run_sweeper(
            Arc::clone(&engine),
            config.sweep_schedule,
            engine.clock(),
            cancellation_token.child_token(),
        ));

        Self {
            engine,
            trigger,
            cancellation_token,
            tasks: vec![("dispatcher", dispatcher_task), ("sweeper", sweeper_task)],
        }
    }

    /// Handle for firing the immediate trigger.
    pub fn trigger_handle(&self) -> TriggerHandle {
        self.trigger.clone()
    }

    /// The engine both trigger sources drive.
    pub fn engine(&self) -> Arc<DeliveryEngine> {
        Arc::clone(&self.engine)
    }

    /// Stops both trigger sources, letting rounds in flight finish.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownTimeout` if the tasks do not stop
    /// within the configured shutdown timeout, in which case they are
    /// aborted, or `DeliveryError::TaskPanic` if one of them panicked.
    pub async fn shutdown(self) -> Result<()> {
        let timeout = self.engine.config().shutdown_timeout;
        info!(timeout_seconds = timeout.as_secs(), "shutting down delivery service");

        self.cancellation_token.cancel();

        let aborts: Vec<_> = self.tasks.iter().map(|(_, handle)| handle.abort_handle()).collect();

        let shutdown_future = async {
            let mut first_error = None;

            for (task, handle) in self.tasks {
                if let Err(join_error) = handle.await {
                    error!(task, error = %join_error, "task panicked during shutdown");
                    first_error
                        .get_or_insert(DeliveryError::TaskPanic { task, error: join_error.to_string() });
                }
            }

            first_error
        };

        match tokio::time::timeout(timeout, shutdown_future).await {
            Ok(None) => {
                info!("delivery service stopped");
                Ok(())
            },
            Ok(Some(error)) => Err(error),
            Err(_) => {
                warn!(timeout_seconds = timeout.as_secs(), "shutdown timed out, aborting tasks");
                for abort in aborts {
                    abort.abort();
                }
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        }
    }
}
