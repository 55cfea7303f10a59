//! SFU error types.
//!
//! Every request-level failure maps to one [`SfuError`] variant. Variants are
//! grouped into an [`ErrorCategory`] which decides the HTTP status. Internal
//! details are logged server-side; engine rejections are returned verbatim so
//! the caller can correct malformed parameters.

use crate::engine::EngineError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// SFU error type.
#[derive(Debug, Error)]
pub enum SfuError {
    /// Room is not registered.
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// Client has no session in the room.
    #[error("Client not found: {0}")]
    ClientNotFound(String),

    /// Transport is not owned by the client.
    #[error("Transport not found: {0}")]
    TransportNotFound(String),

    /// Producer is unknown to the room or already closed.
    #[error("Producer not found: {0}")]
    ProducerNotFound(String),

    /// Consumer is not owned by the client.
    #[error("Consumer not found: {0}")]
    ConsumerNotFound(String),

    /// Produce or consume attempted before the transport finished DTLS connect.
    #[error("Transport not connected: {0}")]
    TransportNotConnected(String),

    /// The router rejected the producer/capabilities pairing.
    #[error("Incompatible RTP capabilities for producer {0}")]
    IncompatibleCapabilities(String),

    /// Resume attempted on a closed consumer.
    #[error("Consumer closed: {0}")]
    ConsumerClosed(String),

    /// Room was torn down while the request was in flight.
    #[error("Room gone: {0}")]
    RoomGone(String),

    /// No engine workers are available.
    #[error("Worker pool exhausted")]
    PoolExhausted,

    /// The media engine rejected a call.
    #[error("Engine error: {0}")]
    Engine(String),

    /// Request body could not be interpreted.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error (actor channel failures and the like).
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse error taxonomy shared by logging, metrics and HTTP mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    NotFound,
    PreconditionFailed,
    PoolExhausted,
    EngineFailure,
    InvalidRequest,
    Internal,
}

impl SfuError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            SfuError::RoomNotFound(_)
            | SfuError::ClientNotFound(_)
            | SfuError::TransportNotFound(_)
            | SfuError::ProducerNotFound(_)
            | SfuError::ConsumerNotFound(_)
            | SfuError::RoomGone(_) => ErrorCategory::NotFound,
            SfuError::TransportNotConnected(_)
            | SfuError::IncompatibleCapabilities(_)
            | SfuError::ConsumerClosed(_) => ErrorCategory::PreconditionFailed,
            SfuError::PoolExhausted => ErrorCategory::PoolExhausted,
            SfuError::Engine(_) => ErrorCategory::EngineFailure,
            SfuError::InvalidRequest(_) => ErrorCategory::InvalidRequest,
            SfuError::Config(_) | SfuError::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Returns the HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self.category() {
            ErrorCategory::NotFound => 404,
            ErrorCategory::PreconditionFailed | ErrorCategory::InvalidRequest => 400,
            ErrorCategory::PoolExhausted => 503,
            ErrorCategory::EngineFailure | ErrorCategory::Internal => 500,
        }
    }

    /// Stable machine-readable code returned in the response body.
    pub fn error_code(&self) -> &'static str {
        match self {
            SfuError::RoomNotFound(_) => "ROOM_NOT_FOUND",
            SfuError::ClientNotFound(_) => "CLIENT_NOT_FOUND",
            SfuError::TransportNotFound(_) => "TRANSPORT_NOT_FOUND",
            SfuError::ProducerNotFound(_) => "PRODUCER_NOT_FOUND",
            SfuError::ConsumerNotFound(_) => "CONSUMER_NOT_FOUND",
            SfuError::TransportNotConnected(_) => "TRANSPORT_NOT_CONNECTED",
            SfuError::IncompatibleCapabilities(_) => "INCOMPATIBLE_CAPABILITIES",
            SfuError::ConsumerClosed(_) => "CONSUMER_CLOSED",
            SfuError::RoomGone(_) => "ROOM_GONE",
            SfuError::PoolExhausted => "POOL_EXHAUSTED",
            SfuError::Engine(_) => "ENGINE_ERROR",
            SfuError::InvalidRequest(_) => "BAD_REQUEST",
            SfuError::Config(_) | SfuError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns the error type label for metrics.
    ///
    /// Bounded cardinality: one label per variant.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            SfuError::RoomNotFound(_) => "room_not_found",
            SfuError::ClientNotFound(_) => "client_not_found",
            SfuError::TransportNotFound(_) => "transport_not_found",
            SfuError::ProducerNotFound(_) => "producer_not_found",
            SfuError::ConsumerNotFound(_) => "consumer_not_found",
            SfuError::TransportNotConnected(_) => "transport_not_connected",
            SfuError::IncompatibleCapabilities(_) => "incompatible_capabilities",
            SfuError::ConsumerClosed(_) => "consumer_closed",
            SfuError::RoomGone(_) => "room_gone",
            SfuError::PoolExhausted => "pool_exhausted",
            SfuError::Engine(_) => "engine",
            SfuError::InvalidRequest(_) => "invalid_request",
            SfuError::Config(_) => "config",
            SfuError::Internal(_) => "internal",
        }
    }

    /// Returns a client-safe error message.
    pub fn client_message(&self) -> String {
        match self {
            SfuError::RoomNotFound(_) => "Room not found".to_string(),
            SfuError::ClientNotFound(_) => "Client not found in room".to_string(),
            SfuError::TransportNotFound(_) => "Transport not found".to_string(),
            SfuError::ProducerNotFound(_) => "Producer not found or closed".to_string(),
            SfuError::ConsumerNotFound(_) => "Consumer not found".to_string(),
            SfuError::TransportNotConnected(_) => "Transport not DTLS connected".to_string(),
            SfuError::IncompatibleCapabilities(_) => {
                "Cannot consume producer with the given RTP capabilities".to_string()
            }
            SfuError::ConsumerClosed(_) => "Consumer is closed".to_string(),
            SfuError::RoomGone(_) => "Room was closed, please retry".to_string(),
            SfuError::PoolExhausted => "No media workers available".to_string(),
            SfuError::Engine(msg) | SfuError::InvalidRequest(msg) => msg.clone(),
            SfuError::Config(_) | SfuError::Internal(_) => {
                "An internal error occurred".to_string()
            }
        }
    }
}

impl From<EngineError> for SfuError {
    fn from(err: EngineError) -> Self {
        SfuError::Engine(err.to_string())
    }
}

/// Error body. `error` stays a plain message string, which is what the
/// signaling backend reads; `code` is the machine-readable form.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
}

impl IntoResponse for SfuError {
    fn into_response(self) -> Response {
        match self.category() {
            ErrorCategory::Internal => {
                tracing::error!(target: "sfu.errors", error = %self, "Internal error");
            }
            ErrorCategory::PoolExhausted => {
                tracing::warn!(target: "sfu.errors", error = %self, "Service unavailable");
            }
            _ => {}
        }

        let status = StatusCode::from_u16(self.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let error_response = ErrorResponse {
            error: self.client_message(),
            code: self.error_code(),
        };

        (status, Json(error_response)).into_response()
    }
}
