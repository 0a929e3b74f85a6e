//! Message acceptance handler.

use axum::{
    extract::{rejection::PathRejection, Path, State},
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use courier_core::{DestinationId, MessageId};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::{error::ApiError, AppState};

/// Response for an accepted message.
#[derive(Debug, Serialize, Deserialize)]
pub struct AcceptedResponse {
    /// Identifier assigned to the message
    pub message_id: MessageId,
    /// Destination the message is queued for
    pub destination_id: DestinationId,
}

/// `POST /destinations/{id}/message`
///
/// The raw request body is the payload; the request's `Content-Type` is
/// stored and replayed on delivery. Responds as soon as the message is
/// persisted.
///
/// # Errors
///
/// - 400 when the id is not an integer or the body is empty
/// - 404 when the destination does not exist
/// - 500 on storage failure
#[instrument(
    name = "accept_message",
    skip(state, path, headers, body),
    fields(content_length = body.len(), destination_id = tracing::field::Empty)
)]
pub async fn accept_message(
    State(state): State<AppState>,
    path: Result<Path<i64>, PathRejection>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let Path(id) = path?;
    tracing::Span::current().record("destination_id", id);

    let content_type = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()).unwrap_or_default();

    let message = state.intake.accept_message(DestinationId(id), body.to_vec(), content_type).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse { message_id: message.id, destination_id: message.destination_id }),
    )
        .into_response())
}
