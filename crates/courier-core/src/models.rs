//! Domain models and strongly-typed identifiers.
//!
//! A `Destination` is a registered delivery URL with a health flag. A
//! `Message` is a payload waiting in a destination's backlog. Both are
//! identified by store-assigned 64-bit ids; message ids increase strictly in
//! acceptance order and double as the backlog ordering key.

use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    std::result::Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Content type used when the inbound request does not carry one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Strongly-typed destination identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DestinationId(pub i64);

impl fmt::Display for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for DestinationId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl sqlx::Type<PgDb> for DestinationId {
    fn type_info() -> PgTypeInfo {
        <i64 as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for DestinationId {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let id = <i64 as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(id))
    }
}

impl sqlx::Encode<'_, PgDb> for DestinationId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <i64 as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Strongly-typed message identifier.
///
/// Assigned by the store in acceptance order. Ordering on `MessageId` is the
/// order in which a backlog must be attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for MessageId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl sqlx::Type<PgDb> for MessageId {
    fn type_info() -> PgTypeInfo {
        <i64 as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for MessageId {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let id = <i64 as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(id))
    }
}

impl sqlx::Encode<'_, PgDb> for MessageId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <i64 as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// A registered delivery target.
///
/// `url` never changes after registration. `online` is written only by the
/// delivery engine: set at the start of every round, cleared when an attempt
/// fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Destination {
    /// Store-assigned identifier.
    pub id: DestinationId,

    /// URL every message for this destination is POSTed to.
    pub url: String,

    /// Health flag maintained by the delivery engine.
    pub online: bool,

    /// When the destination was registered.
    pub created_at: DateTime<Utc>,
}

/// Registration request for a new destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDestination {
    /// Delivery URL.
    pub url: String,
}

impl NewDestination {
    /// Creates a registration request.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Rejects an empty or whitespace-only URL.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidArgument` when `url` is blank.
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(CoreError::InvalidArgument("'url' must not be empty".to_string()));
        }
        Ok(())
    }
}

/// A payload queued for delivery to exactly one destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Message {
    /// Store-assigned identifier, increasing in acceptance order.
    pub id: MessageId,

    /// Owning destination.
    pub destination_id: DestinationId,

    /// Raw payload, forwarded verbatim as the request body.
    pub body: Vec<u8>,

    /// Forwarded verbatim as the outbound `Content-Type` header.
    pub content_type: String,

    /// Acceptance time, the reference point for TTL expiry.
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Age of the message at `now`. Zero if `now` precedes acceptance.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Whether the message has reached `ttl` and must be discarded unsent.
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        self.age(now) >= ttl
    }
}

/// Acceptance request for a new message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    /// Destination the message is addressed to.
    pub destination_id: DestinationId,

    /// Raw payload.
    pub body: Vec<u8>,

    /// Content type of the payload.
    pub content_type: String,
}

impl NewMessage {
    /// Creates an acceptance request. A blank content type falls back to
    /// [`DEFAULT_CONTENT_TYPE`].
    pub fn new(
        destination_id: DestinationId,
        body: impl Into<Vec<u8>>,
        content_type: impl Into<String>,
    ) -> Self {
        let content_type = content_type.into();
        let content_type = if content_type.trim().is_empty() {
            DEFAULT_CONTENT_TYPE.to_string()
        } else {
            content_type
        };

        Self { destination_id, body: body.into(), content_type }
    }

    /// Rejects an empty body.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidArgument` when `body` is empty.
    pub fn validate(&self) -> Result<()> {
        if self.body.is_empty() {
            return Err(CoreError::InvalidArgument("'body' must not be empty".to_string()));
        }
        Ok(())
    }
}
