//! Inbound façade over the stores and the immediate trigger.
//!
//! The HTTP layer talks only to [`Intake`]. Accepting a message validates
//! it, persists it and fires the immediate trigger; the caller never waits
//! for delivery.

use std::sync::Arc;

use courier_core::{
    Backlog, Clock, CoreError, Destination, DestinationId, Directory, Message, NewDestination,
    NewMessage, Result,
};
use tracing::{info, instrument};

use crate::trigger::TriggerHandle;

/// Accepts messages and manages destination registrations.
#[derive(Clone)]
pub struct Intake {
    directory: Arc<dyn Directory>,
    backlog: Arc<dyn Backlog>,
    trigger: TriggerHandle,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Intake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Intake").finish_non_exhaustive()
    }
}

impl Intake {
    /// Creates an intake over the given stores.
    pub fn new(
        directory: Arc<dyn Directory>,
        backlog: Arc<dyn Backlog>,
        trigger: TriggerHandle,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { directory, backlog, trigger, clock }
    }

    /// Queues a message for delivery and fires the immediate trigger.
    ///
    /// A blank content type is stored as `application/octet-stream`.
    ///
    /// # Errors
    ///
    /// - `CoreError::InvalidArgument` if `body` is empty
    /// - `CoreError::NotFound` if the destination does not exist
    /// - `CoreError::Database` if persisting fails
    #[instrument(skip(self, body), fields(bytes = tracing::field::Empty))]
    pub async fn accept_message(
        &self,
        destination_id: DestinationId,
        body: impl Into<Vec<u8>>,
        content_type: &str,
    ) -> Result<Message> {
        let new_message = NewMessage::new(destination_id, body, content_type);
        tracing::Span::current().record("bytes", new_message.body.len());
        new_message.validate()?;

        if self.directory.get(destination_id).await?.is_none() {
            return Err(not_found(destination_id));
        }

        let message = self.backlog.insert(new_message, self.clock.now_utc()).await?;
        info!(message_id = %message.id, "message accepted");

        self.trigger.fire(&message);

        Ok(message)
    }

    /// Registers a destination. It starts online.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidArgument` for an empty URL, or
    /// `CoreError::Database` if persisting fails.
    pub async fn register_destination(&self, url: impl Into<String>) -> Result<Destination> {
        let destination = self.directory.create(NewDestination::new(url)).await?;
        info!(destination_id = %destination.id, url = %destination.url, "destination registered");
        Ok(destination)
    }

    /// Lists every destination, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the query fails.
    pub async fn list_destinations(&self) -> Result<Vec<Destination>> {
        self.directory.all().await
    }

    /// Removes a destination together with its pending messages.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the destination does not exist, or
    /// `CoreError::Database` if the delete fails.
    pub async fn delete_destination(&self, id: DestinationId) -> Result<()> {
        if !self.directory.delete(id).await? {
            return Err(not_found(id));
        }
        info!(destination_id = %id, "destination deleted");
        Ok(())
    }
}

fn not_found(id: DestinationId) -> CoreError {
    CoreError::NotFound(format!("destination {id} not found"))
}
