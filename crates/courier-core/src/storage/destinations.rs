//! Repository for the `destinations` table.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::Result,
    models::{Destination, DestinationId, NewDestination},
};

/// Repository for destination rows.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a repository over the shared pool.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts a destination and returns the stored row.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidArgument` for an empty URL, or
    /// `CoreError::Database` if the insert fails.
    pub async fn create(&self, destination: &NewDestination) -> Result<Destination> {
        destination.validate()?;

        let row = sqlx::query_as::<_, Destination>(
            r"
            INSERT INTO destinations (url, online)
            VALUES ($1, TRUE)
            RETURNING id, url, online, created_at
            ",
        )
        .bind(&destination.url)
        .fetch_one(&*self.pool)
        .await?;

        Ok(row)
    }

    /// Finds a destination by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: DestinationId) -> Result<Option<Destination>> {
        let row = sqlx::query_as::<_, Destination>(
            "SELECT id, url, online, created_at FROM destinations WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(row)
    }

    /// Lists all destinations, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_all(&self) -> Result<Vec<Destination>> {
        let rows = sqlx::query_as::<_, Destination>(
            "SELECT id, url, online, created_at FROM destinations ORDER BY id ASC",
        )
        .fetch_all(&*self.pool)
        .await?;

        Ok(rows)
    }

    /// Deletes a destination. Its messages go with it via `ON DELETE CASCADE`.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn delete(&self, id: DestinationId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM destinations WHERE id = $1")
            .bind(id)
            .execute(&*self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Writes the health flag in a single-row update.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn set_online(&self, id: DestinationId, online: bool) -> Result<()> {
        sqlx::query("UPDATE destinations SET online = $2 WHERE id = $1")
            .bind(id)
            .bind(online)
            .execute(&*self.pool)
            .await?;

        Ok(())
    }
}
