//! Message types for actor communication.
//!
//! All inter-actor communication uses strongly-typed message passing via `tokio::sync::mpsc`.
//! Request/reply uses `tokio::sync::oneshot`. Notifications (`ProducerOpened`,
//! `ProducerClosed`, `RoomClosed`, `ResourceClosed`) carry no reply channel.

use crate::engine::{CloseReason, EngineProducer, TransportParameters};
use crate::errors::SfuError;

use super::room::RoomActorHandle;
use super::session::ClientSessionActorHandle;

use common::types::{ConsumerId, MediaKind, ProducerId, RouterId, TransportId};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Messages sent to `RoomControllerActor`.
#[derive(Debug)]
pub enum ControllerMessage {
    /// Return the live room for `room_id`, spawning it if needed.
    GetOrCreateRoom {
        room_id: String,
        respond_to: oneshot::Sender<Result<RoomActorHandle, SfuError>>,
    },

    /// Look up a room without creating it.
    GetRoom {
        room_id: String,
        respond_to: oneshot::Sender<Option<RoomActorHandle>>,
    },

    /// Unregister a room after its last client left.
    ///
    /// Only removes the entry if it still belongs to `instance_id`; a newer
    /// room registered under the same id is left alone.
    RemoveRoom {
        room_id: String,
        instance_id: Uuid,
        /// `true` if the entry was removed.
        respond_to: oneshot::Sender<bool>,
    },

    /// A room shut itself down (router creation failed or its worker closed).
    RoomClosed { room_id: String, instance_id: Uuid },

    /// Get registry status (for health checks and tests).
    GetStatus {
        respond_to: oneshot::Sender<ControllerStatus>,
    },

    /// Stop every room and exit.
    Shutdown { respond_to: oneshot::Sender<()> },
}

/// Messages sent to `RoomActor`.
#[derive(Debug)]
pub enum RoomMessage {
    GetRtpCapabilities {
        respond_to: oneshot::Sender<Result<Value, SfuError>>,
    },

    /// Return the client's session, spawning it if needed.
    GetOrCreateSession {
        client_id: String,
        respond_to: oneshot::Sender<Result<ClientSessionActorHandle, SfuError>>,
    },

    GetSession {
        client_id: String,
        respond_to: oneshot::Sender<Result<Option<ClientSessionActorHandle>, SfuError>>,
    },

    /// Look up a live producer owned by any client of the room.
    FindProducer {
        producer_id: ProducerId,
        respond_to: oneshot::Sender<Result<Option<ProducerEntry>, SfuError>>,
    },

    /// A session registered a new producer.
    ProducerOpened { entry: ProducerEntry },

    /// A session retired one of its producers.
    ProducerClosed { producer_id: ProducerId },

    /// Remove a client's session from the room (disconnect).
    DetachSession {
        client_id: String,
        respond_to: oneshot::Sender<Result<DetachOutcome, SfuError>>,
    },

    /// Close the router and stop the room if no client is left.
    CloseIfEmpty {
        /// `true` if the room closed.
        respond_to: oneshot::Sender<Result<bool, SfuError>>,
    },

    GetState {
        respond_to: oneshot::Sender<Result<RoomState, SfuError>>,
    },
}

impl RoomMessage {
    /// Fail a request with `error`. Notifications are dropped.
    pub(crate) fn reject(self, error: SfuError) {
        match self {
            RoomMessage::GetRtpCapabilities { respond_to } => {
                let _ = respond_to.send(Err(error));
            }
            RoomMessage::GetOrCreateSession { respond_to, .. } => {
                let _ = respond_to.send(Err(error));
            }
            RoomMessage::GetSession { respond_to, .. } => {
                let _ = respond_to.send(Err(error));
            }
            RoomMessage::FindProducer { respond_to, .. } => {
                let _ = respond_to.send(Err(error));
            }
            RoomMessage::DetachSession { respond_to, .. } => {
                let _ = respond_to.send(Err(error));
            }
            RoomMessage::CloseIfEmpty { respond_to } => {
                let _ = respond_to.send(Err(error));
            }
            RoomMessage::GetState { respond_to } => {
                let _ = respond_to.send(Err(error));
            }
            RoomMessage::ProducerOpened { .. } | RoomMessage::ProducerClosed { .. } => {}
        }
    }
}

/// Messages sent to `ClientSessionActor`.
#[derive(Debug)]
pub enum SessionMessage {
    CreateTransport {
        respond_to: oneshot::Sender<Result<TransportParameters, SfuError>>,
    },

    /// DTLS-connect a transport. Succeeds without an engine call if already connected.
    ConnectTransport {
        transport_id: TransportId,
        dtls_parameters: Value,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    Produce {
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: Value,
        app_data: Value,
        respond_to: oneshot::Sender<Result<ProducerDescriptor, SfuError>>,
    },

    /// Producers of this client that are not closed.
    ListProducers {
        respond_to: oneshot::Sender<Vec<ProducerDescriptor>>,
    },

    Consume {
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: Value,
        app_data: Value,
        /// Result of the room-wide producer lookup.
        producer: Option<ProducerEntry>,
        respond_to: oneshot::Sender<Result<ConsumerDescriptor, SfuError>>,
    },

    ResumeConsumer {
        consumer_id: ConsumerId,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    /// The engine closed one of the session's resources.
    ResourceClosed {
        resource: SessionResource,
        reason: CloseReason,
    },

    GetState {
        respond_to: oneshot::Sender<SessionState>,
    },

    /// Retire every resource and stop the session (disconnect).
    Close {
        respond_to: oneshot::Sender<CloseSummary>,
    },
}

/// Identifies one engine resource owned by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionResource {
    Transport(TransportId),
    Producer(ProducerId),
    Consumer(ConsumerId),
}

/// Room-wide directory entry for a producer.
#[derive(Clone)]
pub struct ProducerEntry {
    pub producer_id: ProducerId,
    pub owner_client_id: String,
    pub kind: MediaKind,
    pub handle: Arc<dyn EngineProducer>,
}

impl ProducerEntry {
    pub fn is_closed(&self) -> bool {
        self.handle.closed()
    }
}

impl fmt::Debug for ProducerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerEntry")
            .field("producer_id", &self.producer_id)
            .field("owner_client_id", &self.owner_client_id)
            .field("kind", &self.kind)
            .field("closed", &self.handle.closed())
            .finish()
    }
}

/// Registry status.
#[derive(Debug, Clone)]
pub struct ControllerStatus {
    pub room_count: usize,
    pub session_count: usize,
    pub mailbox_depth: usize,
}

/// Snapshot of a room.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room_id: String,
    pub router_id: RouterId,
    /// Client ids, sorted.
    pub clients: Vec<String>,
    /// Live producers in the room directory.
    pub producer_count: usize,
}

/// Snapshot of a client session.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub room_id: String,
    pub client_id: String,
    pub transports: Vec<TransportSummary>,
    pub producers: Vec<ProducerId>,
    pub consumers: Vec<ConsumerSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSummary {
    pub transport_id: TransportId,
    pub dtls_connected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerSummary {
    pub consumer_id: ConsumerId,
    pub producer_id: ProducerId,
    pub paused: bool,
}

/// Result of detaching a session from its room.
#[derive(Debug)]
pub struct DetachOutcome {
    /// The detached session, if the client had one.
    pub session: Option<ClientSessionActorHandle>,
    /// Whether the room has no clients left.
    pub room_empty: bool,
}

/// Resources retired by an explicit session close.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloseSummary {
    pub producers: usize,
    pub consumers: usize,
    pub transports: usize,
}

/// Producer as reported to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerDescriptor {
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub app_data: Value,
}

/// Consumer as reported to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerDescriptor {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    pub paused: bool,
    pub app_data: Value,
}
