//! Room signaling handlers.
//!
//! One handler per signaling operation:
//!
//! - `GET /rooms/{room_id}/router-rtp-capabilities`
//! - `POST /rooms/{room_id}/clients/{client_id}/transports`
//! - `POST /rooms/{room_id}/clients/{client_id}/transports/{transport_id}/connect`
//! - `POST /rooms/{room_id}/clients/{client_id}/transports/{transport_id}/produce`
//! - `GET /rooms/{room_id}/clients/{client_id}/producers`
//! - `POST /rooms/{room_id}/clients/{client_id}/transports/{transport_id}/consume`
//! - `POST /rooms/{room_id}/clients/{client_id}/consumers/{consumer_id}/resume`
//! - `POST /rooms/{room_id}/clients/{client_id}/disconnected`
//!
//! Bodies are parsed by hand so malformed JSON yields a 400 with the service's
//! error shape instead of axum's default 422. Ids in the path that are not
//! valid identifiers can never name a live resource and map to 404.

use crate::actors::{ConsumerDescriptor, ProducerDescriptor};
use crate::engine::TransportParameters;
use crate::errors::SfuError;
use crate::routes::AppState;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::Json;
use common::types::{ConsumerId, MediaKind, ProducerId, TransportId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{field, instrument, Span};

#[derive(Debug, Deserialize)]
pub struct RoomPath {
    pub room_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ClientPath {
    pub room_id: String,
    pub client_id: String,
}

#[derive(Debug, Deserialize)]
pub struct TransportPath {
    pub room_id: String,
    pub client_id: String,
    pub transport_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ConsumerPath {
    pub room_id: String,
    pub client_id: String,
    pub consumer_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportRequest {
    pub dtls_parameters: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest {
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    #[serde(default)]
    pub app_data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest {
    pub producer_id: String,
    pub rtp_capabilities: Value,
    #[serde(default)]
    pub app_data: Value,
}

#[derive(Debug, Serialize)]
pub struct ProduceResponse {
    pub id: ProducerId,
}

/// Empty acknowledgement body (`{}`).
#[derive(Debug, Serialize)]
pub struct Ack {}

/// Handler for GET /rooms/{room_id}/router-rtp-capabilities
///
/// Creates the room on first use.
#[instrument(skip_all, name = "sfu.http.capabilities", fields(room_id = field::Empty))]
pub async fn get_router_rtp_capabilities(
    State(state): State<Arc<AppState>>,
    Path(path): Path<RoomPath>,
) -> Result<Json<Value>, SfuError> {
    Span::current().record("room_id", path.room_id.as_str());
    let capabilities = state.orchestrator.get_capabilities(&path.room_id).await?;
    Ok(Json(capabilities))
}

/// Handler for POST /rooms/{room_id}/clients/{client_id}/transports
#[instrument(
    skip_all,
    name = "sfu.http.create_transport",
    fields(room_id = field::Empty, client_id = field::Empty)
)]
pub async fn create_transport(
    State(state): State<Arc<AppState>>,
    Path(path): Path<ClientPath>,
) -> Result<Json<TransportParameters>, SfuError> {
    record_client(&path.room_id, &path.client_id);
    let params = state
        .orchestrator
        .create_transport(&path.room_id, &path.client_id)
        .await?;
    Ok(Json(params))
}

/// Handler for POST /rooms/{room_id}/clients/{client_id}/transports/{transport_id}/connect
///
/// Repeating a successful connect is acknowledged again.
#[instrument(
    skip_all,
    name = "sfu.http.connect_transport",
    fields(room_id = field::Empty, client_id = field::Empty)
)]
pub async fn connect_transport(
    State(state): State<Arc<AppState>>,
    Path(path): Path<TransportPath>,
    body: Bytes,
) -> Result<Json<Ack>, SfuError> {
    record_client(&path.room_id, &path.client_id);
    let request: ConnectTransportRequest = parse_body(&body)?;
    let transport_id = parse_transport_id(&path.transport_id)?;
    state
        .orchestrator
        .connect_transport(
            &path.room_id,
            &path.client_id,
            transport_id,
            request.dtls_parameters,
        )
        .await?;
    Ok(Json(Ack {}))
}

/// Handler for POST /rooms/{room_id}/clients/{client_id}/transports/{transport_id}/produce
#[instrument(
    skip_all,
    name = "sfu.http.produce",
    fields(room_id = field::Empty, client_id = field::Empty)
)]
pub async fn produce(
    State(state): State<Arc<AppState>>,
    Path(path): Path<TransportPath>,
    body: Bytes,
) -> Result<Json<ProduceResponse>, SfuError> {
    record_client(&path.room_id, &path.client_id);
    let request: ProduceRequest = parse_body(&body)?;
    let transport_id = parse_transport_id(&path.transport_id)?;
    let producer = state
        .orchestrator
        .produce(
            &path.room_id,
            &path.client_id,
            transport_id,
            request.kind,
            request.rtp_parameters,
            request.app_data,
        )
        .await?;
    Ok(Json(ProduceResponse {
        id: producer.producer_id,
    }))
}

/// Handler for GET /rooms/{room_id}/clients/{client_id}/producers
///
/// Always 200. Unknown rooms and clients have no producers.
#[instrument(
    skip_all,
    name = "sfu.http.list_producers",
    fields(room_id = field::Empty, client_id = field::Empty)
)]
pub async fn list_producers(
    State(state): State<Arc<AppState>>,
    Path(path): Path<ClientPath>,
) -> Json<Vec<ProducerDescriptor>> {
    record_client(&path.room_id, &path.client_id);
    Json(
        state
            .orchestrator
            .list_producers(&path.room_id, &path.client_id)
            .await,
    )
}

/// Handler for POST /rooms/{room_id}/clients/{client_id}/transports/{transport_id}/consume
///
/// Video consumers start paused, audio consumers flow immediately.
#[instrument(
    skip_all,
    name = "sfu.http.consume",
    fields(room_id = field::Empty, client_id = field::Empty)
)]
pub async fn consume(
    State(state): State<Arc<AppState>>,
    Path(path): Path<TransportPath>,
    body: Bytes,
) -> Result<Json<ConsumerDescriptor>, SfuError> {
    record_client(&path.room_id, &path.client_id);
    let request: ConsumeRequest = parse_body(&body)?;
    let transport_id = parse_transport_id(&path.transport_id)?;
    let producer_id: ProducerId = request
        .producer_id
        .parse()
        .map_err(|_| SfuError::ProducerNotFound(request.producer_id.clone()))?;
    let consumer = state
        .orchestrator
        .consume(
            &path.room_id,
            &path.client_id,
            transport_id,
            producer_id,
            request.rtp_capabilities,
            request.app_data,
        )
        .await?;
    Ok(Json(consumer))
}

/// Handler for POST /rooms/{room_id}/clients/{client_id}/consumers/{consumer_id}/resume
#[instrument(
    skip_all,
    name = "sfu.http.resume_consumer",
    fields(room_id = field::Empty, client_id = field::Empty)
)]
pub async fn resume_consumer(
    State(state): State<Arc<AppState>>,
    Path(path): Path<ConsumerPath>,
) -> Result<Json<Ack>, SfuError> {
    record_client(&path.room_id, &path.client_id);
    let consumer_id: ConsumerId = path
        .consumer_id
        .parse()
        .map_err(|_| SfuError::ConsumerNotFound(path.consumer_id.clone()))?;
    state
        .orchestrator
        .resume_consumer(&path.room_id, &path.client_id, consumer_id)
        .await?;
    Ok(Json(Ack {}))
}

/// Handler for POST /rooms/{room_id}/clients/{client_id}/disconnected
///
/// Always answers `OK`.
#[instrument(
    skip_all,
    name = "sfu.http.disconnect",
    fields(room_id = field::Empty, client_id = field::Empty)
)]
pub async fn disconnect(
    State(state): State<Arc<AppState>>,
    Path(path): Path<ClientPath>,
) -> &'static str {
    record_client(&path.room_id, &path.client_id);
    state
        .orchestrator
        .disconnect(&path.room_id, &path.client_id)
        .await;
    "OK"
}

fn record_client(room_id: &str, client_id: &str) {
    let span = Span::current();
    span.record("room_id", room_id);
    span.record("client_id", client_id);
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, SfuError> {
    serde_json::from_slice(body).map_err(|e| {
        tracing::debug!(target: "sfu.handlers.rooms", error = %e, "Invalid request body");
        SfuError::InvalidRequest(format!("Invalid request body: {e}"))
    })
}

fn parse_transport_id(raw: &str) -> Result<TransportId, SfuError> {
    raw.parse()
        .map_err(|_| SfuError::TransportNotFound(raw.to_string()))
}
