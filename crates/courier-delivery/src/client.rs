//! HTTP client for message delivery.
//!
//! One attempt is one `POST` of the stored body to the destination URL with
//! the stored content type. The client never retries and never follows a
//! failed attempt with anything: deciding what a response means is the
//! engine's job.

use std::time::{Duration, Instant};

use bytes::Bytes;
use courier_core::{DestinationId, Message, MessageId};
use reqwest::Response;
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};

use crate::error::{DeliveryError, Result};

/// Upper bound on the response body retained for logging.
const MAX_RESPONSE_BODY_SIZE: usize = 1024;

/// Configuration for the delivery client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Timeout for a single delivery attempt.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: u32,
    /// Whether to verify TLS certificates.
    pub verify_tls: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECONDS),
            user_agent: "Courier-Delivery/1.0".to_string(),
            max_redirects: 3,
            verify_tls: true,
        }
    }
}

/// HTTP client shared by every delivery round.
///
/// Cheap to clone; clones share the underlying connection pool.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
}

/// A single delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Message being delivered.
    pub message_id: MessageId,
    /// Destination the message belongs to.
    pub destination_id: DestinationId,
    /// Destination URL.
    pub url: String,
    /// Opaque payload, sent unchanged.
    pub body: Bytes,
    /// Sent as the `Content-Type` header.
    pub content_type: String,
}

impl DeliveryRequest {
    /// Builds the attempt for `message` against `url`.
    pub fn for_message(message: &Message, url: impl Into<String>) -> Self {
        Self {
            message_id: message.id,
            destination_id: message.destination_id,
            url: url.into(),
            body: Bytes::copy_from_slice(&message.body),
            content_type: message.content_type.clone(),
        }
    }
}

/// Response to a delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response body, truncated.
    pub body: String,
    /// Wall time spent on the request.
    pub duration: Duration,
}

impl DeliveryResponse {
    /// Whether the attempt counts as delivered. Only an exact 200 does;
    /// every other status, 2xx included, is a failure.
    pub fn is_ok(&self) -> bool {
        self.status_code == 200
    }
}

impl DeliveryClient {
    /// Creates a new delivery client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be built from the provided settings.
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.timeout.is_zero() {
            return Err(DeliveryError::configuration("client timeout must be non-zero"));
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects as usize))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Creates a new delivery client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be built.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Returns the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Sends one attempt and returns whatever the destination answered.
    ///
    /// Any HTTP response, whatever its status, is `Ok`. Callers decide
    /// success with [`DeliveryResponse::is_ok`].
    ///
    /// # Errors
    ///
    /// - `Timeout` when the request exceeds the client timeout
    /// - `NetworkError` for connection, DNS, TLS and other transport failures
    pub async fn deliver(&self, request: DeliveryRequest) -> Result<DeliveryResponse> {
        let start_time = Instant::now();

        let span = info_span!(
            "message_delivery",
            message_id = %request.message_id,
            destination_id = %request.destination_id,
            url = %request.url,
        );

        async move {
            tracing::debug!(bytes = request.body.len(), "starting delivery attempt");

            let result = self
                .client
                .post(&request.url)
                .header(reqwest::header::CONTENT_TYPE, &request.content_type)
                .body(request.body)
                .send()
                .await;

            let response = match result {
                Ok(response) => response,
                Err(e) => {
                    let duration = start_time.elapsed();
                    tracing::warn!(duration_ms = duration.as_millis(), "request failed: {}", e);

                    if e.is_timeout() {
                        return Err(DeliveryError::timeout(self.config.timeout.as_secs()));
                    }
                    if e.is_connect() {
                        return Err(DeliveryError::network(format!("connection failed: {e}")));
                    }
                    return Err(DeliveryError::network(e.to_string()));
                },
            };

            let delivery_response = read_response(response, start_time).await;

            tracing::debug!(
                status = delivery_response.status_code,
                duration_ms = delivery_response.duration.as_millis(),
                "received response"
            );

            Ok(delivery_response)
        }
        .instrument(span)
        .await
    }
}

async fn read_response(response: Response, start_time: Instant) -> DeliveryResponse {
    let status_code = response.status().as_u16();

    let body = match response.bytes().await {
        Ok(bytes) if bytes.len() > MAX_RESPONSE_BODY_SIZE => {
            let truncated = String::from_utf8_lossy(&bytes[..MAX_RESPONSE_BODY_SIZE]);
            format!("{truncated}... (truncated)")
        },
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            tracing::warn!("failed to read response body: {}", e);
            String::new()
        },
    };

    DeliveryResponse { status_code, body, duration: start_time.elapsed() }
}
