//! Destination registration handlers.

use axum::{
    extract::{rejection::PathRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use courier_core::{Destination, DestinationId};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::{error::ApiError, AppState};

/// Query parameters for registration.
#[derive(Debug, Deserialize)]
pub struct RegisterParams {
    /// Delivery URL. Missing and empty are both rejected.
    #[serde(default)]
    pub url: String,
}

/// A destination as returned by the API.
#[derive(Debug, Serialize, Deserialize)]
pub struct DestinationResponse {
    /// Destination identifier
    pub id: DestinationId,
    /// Delivery URL
    pub url: String,
    /// Whether the last delivery round found it reachable
    pub online: bool,
}

impl From<Destination> for DestinationResponse {
    fn from(destination: Destination) -> Self {
        Self { id: destination.id, url: destination.url, online: destination.online }
    }
}

/// `POST /destinations?url=...`
///
/// # Errors
///
/// - 400 when `url` is missing or empty
/// - 500 on storage failure
#[instrument(name = "register_destination", skip(state))]
pub async fn register_destination(
    State(state): State<AppState>,
    Query(params): Query<RegisterParams>,
) -> Result<Response, ApiError> {
    let destination = state.intake.register_destination(params.url).await?;

    Ok((StatusCode::CREATED, Json(DestinationResponse::from(destination))).into_response())
}

/// `GET /destinations`
///
/// # Errors
///
/// Returns 500 on storage failure.
#[instrument(name = "list_destinations", skip(state))]
pub async fn list_destinations(
    State(state): State<AppState>,
) -> Result<Json<Vec<DestinationResponse>>, ApiError> {
    let destinations = state.intake.list_destinations().await?;

    Ok(Json(destinations.into_iter().map(DestinationResponse::from).collect()))
}

/// `DELETE /destinations/{id}`
///
/// Pending messages for the destination are dropped with it.
///
/// # Errors
///
/// - 400 when the id is not an integer
/// - 404 when the destination does not exist
/// - 500 on storage failure
#[instrument(
    name = "delete_destination",
    skip(state, path),
    fields(destination_id = tracing::field::Empty)
)]
pub async fn delete_destination(
    State(state): State<AppState>,
    path: Result<Path<i64>, PathRejection>,
) -> Result<StatusCode, ApiError> {
    let Path(id) = path?;
    tracing::Span::current().record("destination_id", id);

    state.intake.delete_destination(DestinationId(id)).await?;

    Ok(StatusCode::NO_CONTENT)
}
