//! Storage contracts and their implementations.
//!
//! The delivery engine and the intake path only ever see the `Directory`
//! and `Backlog` traits. Two implementations exist:
//!
//! - [`Storage`] on PostgreSQL, one repository per table
//! - [`memory::InMemoryStorage`] for tests and database-less deployments
//!
//! Every flag update and every delete touches a single row and is atomic with
//! respect to concurrent writers of that row.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::info;

pub mod destinations;
pub mod memory;
pub mod messages;

use crate::{
    error::Result,
    models::{Destination, DestinationId, Message, MessageId, NewDestination, NewMessage},
};

/// Boxed future returned by storage trait methods.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Registered destinations and their health flags.
pub trait Directory: Send + Sync + 'static {
    /// Registers a destination. New destinations start online.
    fn create(&self, destination: NewDestination) -> StorageFuture<'_, Destination>;

    /// Looks up a destination by id.
    fn get(&self, id: DestinationId) -> StorageFuture<'_, Option<Destination>>;

    /// Lists every destination in ascending id order.
    fn all(&self) -> StorageFuture<'_, Vec<Destination>>;

    /// Removes a destination and its backlog. Returns whether a row existed.
    fn delete(&self, id: DestinationId) -> StorageFuture<'_, bool>;

    /// Marks a destination online. Missing destinations are ignored.
    fn set_online(&self, id: DestinationId) -> StorageFuture<'_, ()>;

    /// Marks a destination offline. Missing destinations are ignored.
    fn set_offline(&self, id: DestinationId) -> StorageFuture<'_, ()>;
}

/// Pending messages, keyed by destination and ordered by id.
pub trait Backlog: Send + Sync + 'static {
    /// Persists an accepted message and assigns its id.
    fn insert(
        &self,
        message: NewMessage,
        created_at: DateTime<Utc>,
    ) -> StorageFuture<'_, Message>;

    /// Returns the destination's backlog in ascending id order.
    fn list_by_destination(&self, id: DestinationId) -> StorageFuture<'_, Vec<Message>>;

    /// Removes a message. Returns whether a row existed.
    fn delete(&self, id: MessageId) -> StorageFuture<'_, bool>;

    /// Number of pending messages for a destination.
    fn count_by_destination(&self, id: DestinationId) -> StorageFuture<'_, u64>;
}

/// Liveness check for the backing store, used by readiness probes.
pub trait HealthProbe: Send + Sync + 'static {
    /// Succeeds when the store answers a trivial query.
    fn health_check(&self) -> StorageFuture<'_, ()>;
}

/// PostgreSQL-backed storage.
#[derive(Clone)]
pub struct Storage {
    /// Repository for destination rows.
    pub destinations: Arc<destinations::Repository>,

    /// Repository for message rows.
    pub messages: Arc<messages::Repository>,

    pool: Arc<PgPool>,
}

impl Storage {
    /// Creates storage over a shared connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            destinations: Arc::new(destinations::Repository::new(pool.clone())),
            messages: Arc::new(messages::Repository::new(pool.clone())),
            pool,
        }
    }

    /// Creates the `destinations` and `messages` tables if absent.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if any DDL statement fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS destinations (
                id BIGSERIAL PRIMARY KEY,
                url TEXT NOT NULL CHECK (url <> ''),
                online BOOLEAN NOT NULL DEFAULT TRUE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            ",
        )
        .execute(&*self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS messages (
                id BIGSERIAL PRIMARY KEY,
                destination_id BIGINT NOT NULL REFERENCES destinations(id) ON DELETE CASCADE,
                body BYTEA NOT NULL,
                content_type TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            ",
        )
        .execute(&*self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_messages_destination
            ON messages(destination_id, id)
            ",
        )
        .execute(&*self.pool)
        .await?;

        info!("storage schema is up to date");
        Ok(())
    }
}

impl Directory for Storage {
    fn create(&self, destination: NewDestination) -> StorageFuture<'_, Destination> {
        let repo = self.destinations.clone();
        Box::pin(async move { repo.create(&destination).await })
    }

    fn get(&self, id: DestinationId) -> StorageFuture<'_, Option<Destination>> {
        let repo = self.destinations.clone();
        Box::pin(async move { repo.find_by_id(id).await })
    }

    fn all(&self) -> StorageFuture<'_, Vec<Destination>> {
        let repo = self.destinations.clone();
        Box::pin(async move { repo.find_all().await })
    }

    fn delete(&self, id: DestinationId) -> StorageFuture<'_, bool> {
        let repo = self.destinations.clone();
        Box::pin(async move { repo.delete(id).await })
    }

    fn set_online(&self, id: DestinationId) -> StorageFuture<'_, ()> {
        let repo = self.destinations.clone();
        Box::pin(async move { repo.set_online(id, true).await })
    }

    fn set_offline(&self, id: DestinationId) -> StorageFuture<'_, ()> {
        let repo = self.destinations.clone();
        Box::pin(async move { repo.set_online(id, false).await })
    }
}

impl Backlog for Storage {
    fn insert(
        &self,
        message: NewMessage,
        created_at: DateTime<Utc>,
    ) -> StorageFuture<'_, Message> {
        let repo = self.messages.clone();
        Box::pin(async move { repo.insert(&message, created_at).await })
    }

    fn list_by_destination(&self, id: DestinationId) -> StorageFuture<'_, Vec<Message>> {
        let repo = self.messages.clone();
        Box::pin(async move { repo.find_by_destination(id).await })
    }

    fn delete(&self, id: MessageId) -> StorageFuture<'_, bool> {
        let repo = self.messages.clone();
        Box::pin(async move { repo.delete(id).await })
    }

    fn count_by_destination(&self, id: DestinationId) -> StorageFuture<'_, u64> {
        let repo = self.messages.clone();
        Box::pin(async move { repo.count_by_destination(id).await })
    }
}

impl HealthProbe for Storage {
    fn health_check(&self) -> StorageFuture<'_, ()> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*pool).await?;
            Ok(())
        })
    }
}
