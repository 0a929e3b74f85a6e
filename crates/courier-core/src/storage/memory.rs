//! In-memory storage.
//!
//! Implements every storage trait over `RwLock`-guarded ordered maps. Used by
//! the test suites and by the `memory` storage backend, where losing the
//! backlog on restart is acceptable. Supports injecting one-shot failures
//! into backlog listing and message deletion to exercise the engine's
//! storage error paths.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{Backlog, Directory, HealthProbe, StorageFuture};
use crate::{
    error::CoreError,
    models::{Destination, DestinationId, Message, MessageId, NewDestination, NewMessage},
};

/// In-memory implementation of `Directory`, `Backlog` and `HealthProbe`.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStorage {
    destinations: Arc<RwLock<BTreeMap<DestinationId, Destination>>>,
    messages: Arc<RwLock<BTreeMap<MessageId, Message>>>,
    next_destination_id: Arc<AtomicI64>,
    next_message_id: Arc<AtomicI64>,
    list_error: Arc<RwLock<Option<String>>>,
    delete_error: Arc<RwLock<Option<String>>>,
}

impl InMemoryStorage {
    /// Creates empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `list_by_destination` call fail with `message`.
    pub async fn inject_list_error(&self, message: impl Into<String>) {
        *self.list_error.write().await = Some(message.into());
    }

    /// Makes the next `Backlog::delete` call fail with `message`.
    pub async fn inject_delete_error(&self, message: impl Into<String>) {
        *self.delete_error.write().await = Some(message.into());
    }

    /// Returns a snapshot of a destination, bypassing the trait.
    pub async fn destination(&self, id: DestinationId) -> Option<Destination> {
        self.destinations.read().await.get(&id).cloned()
    }

    /// Returns whether a message is still pending.
    pub async fn contains_message(&self, id: MessageId) -> bool {
        self.messages.read().await.contains_key(&id)
    }

    /// Total number of pending messages across all destinations.
    pub async fn message_count(&self) -> usize {
        self.messages.read().await.len()
    }

    async fn write_flag(&self, id: DestinationId, online: bool) {
        if let Some(destination) = self.destinations.write().await.get_mut(&id) {
            destination.online = online;
        }
    }
}

impl Directory for InMemoryStorage {
    fn create(&self, destination: NewDestination) -> StorageFuture<'_, Destination> {
        Box::pin(async move {
            destination.validate()?;

            let id = DestinationId(self.next_destination_id.fetch_add(1, Ordering::SeqCst) + 1);
            let stored =
                Destination { id, url: destination.url, online: true, created_at: Utc::now() };

            self.destinations.write().await.insert(id, stored.clone());
            Ok(stored)
        })
    }

    fn get(&self, id: DestinationId) -> StorageFuture<'_, Option<Destination>> {
        Box::pin(async move { Ok(self.destinations.read().await.get(&id).cloned()) })
    }

    fn all(&self) -> StorageFuture<'_, Vec<Destination>> {
        Box::pin(async move { Ok(self.destinations.read().await.values().cloned().collect()) })
    }

    fn delete(&self, id: DestinationId) -> StorageFuture<'_, bool> {
        Box::pin(async move {
            let removed = self.destinations.write().await.remove(&id).is_some();
            if removed {
                self.messages.write().await.retain(|_, message| message.destination_id != id);
            }
            Ok(removed)
        })
    }

    fn set_online(&self, id: DestinationId) -> StorageFuture<'_, ()> {
        Box::pin(async move {
            self.write_flag(id, true).await;
            Ok(())
        })
    }

    fn set_offline(&self, id: DestinationId) -> StorageFuture<'_, ()> {
        Box::pin(async move {
            self.write_flag(id, false).await;
            Ok(())
        })
    }
}

impl Backlog for InMemoryStorage {
    fn insert(
        &self,
        message: NewMessage,
        created_at: DateTime<Utc>,
    ) -> StorageFuture<'_, Message> {
        Box::pin(async move {
            message.validate()?;

            if !self.destinations.read().await.contains_key(&message.destination_id) {
                return Err(CoreError::NotFound(format!(
                    "destination {} not found",
                    message.destination_id
                )));
            }

            // Id assignment and insert happen under one write lock so ids
            // enter the map in the order they were handed out.
            let mut messages = self.messages.write().await;
            let id = MessageId(self.next_message_id.fetch_add(1, Ordering::SeqCst) + 1);
            let stored = Message {
                id,
                destination_id: message.destination_id,
                body: message.body,
                content_type: message.content_type,
                created_at,
            };
            messages.insert(id, stored.clone());

            Ok(stored)
        })
    }

    fn list_by_destination(&self, id: DestinationId) -> StorageFuture<'_, Vec<Message>> {
        Box::pin(async move {
            if let Some(error) = self.list_error.write().await.take() {
                return Err(CoreError::Database(error));
            }

            Ok(self
                .messages
                .read()
                .await
                .values()
                .filter(|message| message.destination_id == id)
                .cloned()
                .collect())
        })
    }

    fn delete(&self, id: MessageId) -> StorageFuture<'_, bool> {
        Box::pin(async move {
            if let Some(error) = self.delete_error.write().await.take() {
                return Err(CoreError::Database(error));
            }

            Ok(self.messages.write().await.remove(&id).is_some())
        })
    }

    fn count_by_destination(&self, id: DestinationId) -> StorageFuture<'_, u64> {
        Box::pin(async move {
            let count = self
                .messages
                .read()
                .await
                .values()
                .filter(|message| message.destination_id == id)
                .count();
            Ok(u64::try_from(count).unwrap_or(u64::MAX))
        })
    }
}

impl HealthProbe for InMemoryStorage {
    fn health_check(&self) -> StorageFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}
