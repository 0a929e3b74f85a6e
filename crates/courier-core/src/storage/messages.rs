//! Repository for the `messages` table.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::Result,
    models::{DestinationId, Message, MessageId, NewMessage},
};

/// Repository for message rows.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a repository over the shared pool.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts a message. The `BIGSERIAL` id preserves acceptance order.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidArgument` for an empty body, or
    /// `CoreError::Database` if the insert fails (including a dangling
    /// destination reference).
    pub async fn insert(&self, message: &NewMessage, created_at: DateTime<Utc>) -> Result<Message> {
        message.validate()?;

        let row = sqlx::query_as::<_, Message>(
            r"
            INSERT INTO messages (destination_id, body, content_type, created_at)
            VALUES ($1, $2, $3, $4)
            RETURNING id, destination_id, body, content_type, created_at
            ",
        )
        .bind(message.destination_id)
        .bind(&message.body)
        .bind(&message.content_type)
        .bind(created_at)
        .fetch_one(&*self.pool)
        .await?;

        Ok(row)
    }

    /// Returns a destination's backlog in acceptance order.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_destination(&self, destination_id: DestinationId) -> Result<Vec<Message>> {
        let rows = sqlx::query_as::<_, Message>(
            r"
            SELECT id, destination_id, body, content_type, created_at
            FROM messages
            WHERE destination_id = $1
            ORDER BY id ASC
            ",
        )
        .bind(destination_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(rows)
    }

    /// Deletes a message by id.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn delete(&self, id: MessageId) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM messages WHERE id = $1").bind(id).execute(&*self.pool).await?;

        Ok(result.rows_affected() > 0)
    }

    /// Counts a destination's pending messages.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count_by_destination(&self, destination_id: DestinationId) -> Result<u64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM messages WHERE destination_id = $1")
                .bind(destination_id)
                .fetch_one(&*self.pool)
                .await?;

        Ok(u64::try_from(count).unwrap_or(0))
    }
}
