//! `ClientSessionActor` - one per client in a room.
//!
//! Owns the client's transports, producers and consumers and serializes every
//! mutation of them: requests from the orchestrator and close events reported
//! by the engine go through the same mailbox.
//!
//! Every removal path ends in `retire_transport`, `retire_producer` or
//! `retire_consumer`. These are keyed by resource id and idempotent, so an
//! engine-driven close and an explicit disconnect may arrive in either order.

use crate::engine::{
    CloseReason, CloseSignal, EngineConsumer, EngineProducer, EngineRouter, EngineTransport,
    MediaSettings, TransportParameters,
};
use crate::errors::SfuError;
use crate::observability::metrics as prom;

use super::messages::{
    CloseSummary, ConsumerDescriptor, ConsumerSummary, ProducerDescriptor, ProducerEntry,
    SessionMessage, SessionResource, SessionState, TransportSummary,
};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::room::RoomLink;

use common::types::{ConsumerId, MediaKind, ProducerId, TransportId};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for session mailboxes.
const SESSION_CHANNEL_BUFFER: usize = 200;

/// Handle to a `ClientSessionActor`.
///
/// A closed mailbox means the session was detached or its room stopped, so
/// channel failures surface as `ClientNotFound`.
#[derive(Debug, Clone)]
pub struct ClientSessionActorHandle {
    client_id: String,
    sender: mpsc::Sender<SessionMessage>,
    cancel_token: CancellationToken,
}

impl ClientSessionActorHandle {
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SessionMessage,
    ) -> Result<T, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| SfuError::ClientNotFound(self.client_id.clone()))?;

        rx.await
            .map_err(|_| SfuError::ClientNotFound(self.client_id.clone()))
    }

    pub async fn create_transport(&self) -> Result<TransportParameters, SfuError> {
        self.request(|respond_to| SessionMessage::CreateTransport { respond_to })
            .await?
    }

    pub async fn connect_transport(
        &self,
        transport_id: TransportId,
        dtls_parameters: Value,
    ) -> Result<(), SfuError> {
        self.request(|respond_to| SessionMessage::ConnectTransport {
            transport_id,
            dtls_parameters,
            respond_to,
        })
        .await?
    }

    pub async fn produce(
        &self,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: Value,
        app_data: Value,
    ) -> Result<ProducerDescriptor, SfuError> {
        self.request(|respond_to| SessionMessage::Produce {
            transport_id,
            kind,
            rtp_parameters,
            app_data,
            respond_to,
        })
        .await?
    }

    pub async fn list_producers(&self) -> Result<Vec<ProducerDescriptor>, SfuError> {
        self.request(|respond_to| SessionMessage::ListProducers { respond_to })
            .await
    }

    pub async fn consume(
        &self,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: Value,
        app_data: Value,
        producer: Option<ProducerEntry>,
    ) -> Result<ConsumerDescriptor, SfuError> {
        self.request(|respond_to| SessionMessage::Consume {
            transport_id,
            producer_id,
            rtp_capabilities,
            app_data,
            producer,
            respond_to,
        })
        .await?
    }

    pub async fn resume_consumer(&self, consumer_id: ConsumerId) -> Result<(), SfuError> {
        self.request(|respond_to| SessionMessage::ResumeConsumer {
            consumer_id,
            respond_to,
        })
        .await?
    }

    pub async fn get_state(&self) -> Result<SessionState, SfuError> {
        self.request(|respond_to| SessionMessage::GetState { respond_to })
            .await
    }

    /// Retire every resource and stop the actor.
    pub async fn close(&self) -> Result<CloseSummary, SfuError> {
        self.request(|respond_to| SessionMessage::Close { respond_to })
            .await
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// Server-side metadata of a transport.
#[derive(Debug, Clone)]
pub struct TransportMeta {
    pub room_id: String,
    pub client_id: String,
    /// Monotonic: never reset once set.
    pub dtls_connected: bool,
}

/// Server-side metadata of a producer.
#[derive(Debug, Clone)]
pub struct ProducerMeta {
    pub room_id: String,
    pub owner_client_id: String,
    pub kind: MediaKind,
    pub transport_id: TransportId,
    /// Caller-supplied `appData`, kept verbatim.
    pub app_data: Value,
}

impl ProducerMeta {
    /// `appData` as reported to clients.
    pub fn app_data_view(&self) -> Value {
        merge_app_data(
            &self.app_data,
            [
                ("roomId", self.room_id.as_str()),
                ("clientId", self.owner_client_id.as_str()),
            ],
        )
    }
}

/// Server-side metadata of a consumer.
#[derive(Debug, Clone)]
pub struct ConsumerMeta {
    pub room_id: String,
    pub consuming_client_id: String,
    pub producer_owner_id: String,
    pub transport_id: TransportId,
    pub app_data: Value,
}

impl ConsumerMeta {
    pub fn app_data_view(&self) -> Value {
        merge_app_data(
            &self.app_data,
            [
                ("roomId", self.room_id.as_str()),
                ("consumingClientId", self.consuming_client_id.as_str()),
                ("producerOwnerId", self.producer_owner_id.as_str()),
            ],
        )
    }
}

/// Server fields overwrite caller keys of the same name. Non-object
/// `appData` is dropped.
fn merge_app_data<const N: usize>(caller: &Value, server: [(&str, &str); N]) -> Value {
    let mut merged = match caller {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    for (key, value) in server {
        merged.insert(key.to_string(), Value::String(value.to_string()));
    }
    Value::Object(merged)
}

/// Why a resource is being retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireCause {
    /// The engine reported the resource closed.
    Engine(CloseReason),
    /// The client disconnected.
    Disconnect,
    /// The room is shutting down.
    Shutdown,
}

impl RetireCause {
    pub fn as_str(self) -> &'static str {
        match self {
            RetireCause::Engine(reason) => reason.as_str(),
            RetireCause::Disconnect => "disconnect",
            RetireCause::Shutdown => "shutdown",
        }
    }
}

struct TransportRecord {
    handle: Arc<dyn EngineTransport>,
    meta: TransportMeta,
}

struct ProducerRecord {
    handle: Arc<dyn EngineProducer>,
    meta: ProducerMeta,
}

impl ProducerRecord {
    fn descriptor(&self) -> ProducerDescriptor {
        ProducerDescriptor {
            producer_id: self.handle.id(),
            kind: self.meta.kind,
            app_data: self.meta.app_data_view(),
        }
    }
}

struct ConsumerRecord {
    handle: Arc<dyn EngineConsumer>,
    meta: ConsumerMeta,
}

/// The `ClientSessionActor` implementation.
pub struct ClientSessionActor {
    room_id: String,
    client_id: String,
    receiver: mpsc::Receiver<SessionMessage>,
    /// Given to close watchers; weak so watchers never keep the mailbox open.
    self_sender: mpsc::WeakSender<SessionMessage>,
    cancel_token: CancellationToken,
    router: Arc<dyn EngineRouter>,
    media: Arc<MediaSettings>,
    room: RoomLink,
    transports: HashMap<TransportId, TransportRecord>,
    producers: HashMap<ProducerId, ProducerRecord>,
    consumers: HashMap<ConsumerId, ConsumerRecord>,
    /// Set by `Close`; the loop exits after the reply is sent.
    closed: bool,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl ClientSessionActor {
    /// Spawn a session actor for `client_id`.
    ///
    /// `cancel_token` should be a child of the room's token.
    pub fn spawn(
        room_id: String,
        client_id: String,
        router: Arc<dyn EngineRouter>,
        media: Arc<MediaSettings>,
        room: RoomLink,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (ClientSessionActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(SESSION_CHANNEL_BUFFER);
        let mailbox = MailboxMonitor::new(ActorType::Session, format!("{room_id}/{client_id}"));

        let actor = Self {
            room_id,
            client_id: client_id.clone(),
            receiver,
            self_sender: sender.downgrade(),
            cancel_token: cancel_token.clone(),
            router,
            media,
            room,
            transports: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
            closed: false,
            metrics,
            mailbox,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = ClientSessionActorHandle {
            client_id,
            sender,
            cancel_token,
        };

        (handle, task_handle)
    }

    #[instrument(
        skip_all,
        name = "sfu.actor.session",
        fields(room_id = %self.room_id, client_id = %self.client_id)
    )]
    async fn run(mut self) {
        debug!(
            target: "sfu.actor.session",
            room_id = %self.room_id,
            client_id = %self.client_id,
            "ClientSessionActor started"
        );

        loop {
            tokio::select! {
                biased;

                () = self.cancel_token.cancelled() => {
                    self.retire_all(RetireCause::Shutdown);
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_received(self.receiver.len());
                            self.handle_message(message).await;
                            self.mailbox.record_processed();
                            self.metrics.record_message_processed();
                        }
                        None => break,
                    }
                }
            }

            if self.closed {
                break;
            }
        }

        debug!(
            target: "sfu.actor.session",
            room_id = %self.room_id,
            client_id = %self.client_id,
            messages_processed = self.mailbox.messages_processed(),
            "ClientSessionActor stopped"
        );
    }

    async fn handle_message(&mut self, message: SessionMessage) {
        match message {
            SessionMessage::CreateTransport { respond_to } => {
                let result = self.create_transport().await;
                let _ = respond_to.send(result);
            }

            SessionMessage::ConnectTransport {
                transport_id,
                dtls_parameters,
                respond_to,
            } => {
                let result = self.connect_transport(transport_id, &dtls_parameters).await;
                let _ = respond_to.send(result);
            }

            SessionMessage::Produce {
                transport_id,
                kind,
                rtp_parameters,
                app_data,
                respond_to,
            } => {
                let result = self
                    .produce(transport_id, kind, &rtp_parameters, app_data)
                    .await;
                let _ = respond_to.send(result);
            }

            SessionMessage::ListProducers { respond_to } => {
                let _ = respond_to.send(self.list_producers());
            }

            SessionMessage::Consume {
                transport_id,
                producer_id,
                rtp_capabilities,
                app_data,
                producer,
                respond_to,
            } => {
                let result = self
                    .consume(transport_id, producer_id, &rtp_capabilities, app_data, producer)
                    .await;
                let _ = respond_to.send(result);
            }

            SessionMessage::ResumeConsumer {
                consumer_id,
                respond_to,
            } => {
                let result = self.resume_consumer(consumer_id).await;
                let _ = respond_to.send(result);
            }

            SessionMessage::ResourceClosed { resource, reason } => {
                let cause = RetireCause::Engine(reason);
                match resource {
                    SessionResource::Transport(id) => {
                        self.retire_transport(id, cause);
                    }
                    SessionResource::Producer(id) => {
                        self.retire_producer(id, cause);
                    }
                    SessionResource::Consumer(id) => {
                        self.retire_consumer(id, cause);
                    }
                }
            }

            SessionMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.get_state());
            }

            SessionMessage::Close { respond_to } => {
                let summary = self.retire_all(RetireCause::Disconnect);
                self.closed = true;
                self.cancel_token.cancel();
                info!(
                    target: "sfu.actor.session",
                    room_id = %self.room_id,
                    client_id = %self.client_id,
                    producers = summary.producers,
                    consumers = summary.consumers,
                    transports = summary.transports,
                    "Client session closed"
                );
                let _ = respond_to.send(summary);
            }
        }
    }

    async fn create_transport(&mut self) -> Result<TransportParameters, SfuError> {
        let transport = self
            .router
            .create_webrtc_transport(&self.media.webrtc_transport)
            .await?;
        let transport_id = transport.id();

        self.watch_close(SessionResource::Transport(transport_id), transport.on_close());
        self.transports.insert(
            transport_id,
            TransportRecord {
                handle: Arc::clone(&transport),
                meta: TransportMeta {
                    room_id: self.room_id.clone(),
                    client_id: self.client_id.clone(),
                    dtls_connected: false,
                },
            },
        );

        debug!(
            target: "sfu.actor.session",
            room_id = %self.room_id,
            client_id = %self.client_id,
            transport_id = %transport_id,
            "Transport created"
        );

        Ok(transport.parameters())
    }

    async fn connect_transport(
        &mut self,
        transport_id: TransportId,
        dtls_parameters: &Value,
    ) -> Result<(), SfuError> {
        let record = self
            .transports
            .get_mut(&transport_id)
            .ok_or_else(|| SfuError::TransportNotFound(transport_id.to_string()))?;

        if record.meta.dtls_connected {
            debug!(
                target: "sfu.actor.session",
                transport_id = %transport_id,
                "Transport already connected"
            );
            return Ok(());
        }

        record.handle.connect(dtls_parameters).await?;
        record.meta.dtls_connected = true;

        debug!(
            target: "sfu.actor.session",
            room_id = %self.room_id,
            client_id = %self.client_id,
            transport_id = %transport_id,
            "Transport connected"
        );
        Ok(())
    }

    /// Connected transport by id.
    fn connected_transport(
        &self,
        transport_id: TransportId,
    ) -> Result<Arc<dyn EngineTransport>, SfuError> {
        let record = self
            .transports
            .get(&transport_id)
            .ok_or_else(|| SfuError::TransportNotFound(transport_id.to_string()))?;
        if !record.meta.dtls_connected {
            return Err(SfuError::TransportNotConnected(transport_id.to_string()));
        }
        Ok(Arc::clone(&record.handle))
    }

    async fn produce(
        &mut self,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: &Value,
        app_data: Value,
    ) -> Result<ProducerDescriptor, SfuError> {
        let transport = self.connected_transport(transport_id)?;
        let producer = transport.produce(kind, rtp_parameters).await?;
        let producer_id = producer.id();

        let entry = ProducerEntry {
            producer_id,
            owner_client_id: self.client_id.clone(),
            kind,
            handle: Arc::clone(&producer),
        };
        if !self.room.producer_opened(entry).await {
            producer.close();
            return Err(SfuError::RoomGone(self.room_id.clone()));
        }

        let record = ProducerRecord {
            handle: Arc::clone(&producer),
            meta: ProducerMeta {
                room_id: self.room_id.clone(),
                owner_client_id: self.client_id.clone(),
                kind,
                transport_id,
                app_data,
            },
        };
        let descriptor = record.descriptor();

        self.watch_close(SessionResource::Producer(producer_id), producer.on_close());
        self.producers.insert(producer_id, record);

        info!(
            target: "sfu.actor.session",
            room_id = %self.room_id,
            client_id = %self.client_id,
            producer_id = %producer_id,
            kind = %kind,
            "Producer created"
        );

        Ok(descriptor)
    }

    fn list_producers(&self) -> Vec<ProducerDescriptor> {
        self.producers
            .values()
            .filter(|record| !record.handle.closed())
            .map(ProducerRecord::descriptor)
            .collect()
    }

    async fn consume(
        &mut self,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: &Value,
        app_data: Value,
        producer: Option<ProducerEntry>,
    ) -> Result<ConsumerDescriptor, SfuError> {
        let transport = self.connected_transport(transport_id)?;

        let producer = producer
            .filter(|entry| !entry.is_closed())
            .ok_or_else(|| SfuError::ProducerNotFound(producer_id.to_string()))?;

        if !self.router.can_consume(producer_id, rtp_capabilities) {
            return Err(SfuError::IncompatibleCapabilities(producer_id.to_string()));
        }

        // Video starts paused until the client resumes it.
        let start_paused = producer.kind == MediaKind::Video;
        let consumer = transport
            .consume(producer_id, rtp_capabilities, start_paused)
            .await?;
        let consumer_id = consumer.id();

        let meta = ConsumerMeta {
            room_id: self.room_id.clone(),
            consuming_client_id: self.client_id.clone(),
            producer_owner_id: producer.owner_client_id.clone(),
            transport_id,
            app_data,
        };
        let descriptor = ConsumerDescriptor {
            id: consumer_id,
            producer_id,
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
            paused: consumer.paused() || consumer.producer_paused(),
            app_data: meta.app_data_view(),
        };

        self.watch_close(SessionResource::Consumer(consumer_id), consumer.on_close());
        self.consumers.insert(
            consumer_id,
            ConsumerRecord {
                handle: consumer,
                meta,
            },
        );

        info!(
            target: "sfu.actor.session",
            room_id = %self.room_id,
            client_id = %self.client_id,
            consumer_id = %consumer_id,
            producer_id = %producer_id,
            paused = descriptor.paused,
            "Consumer created"
        );

        Ok(descriptor)
    }

    async fn resume_consumer(&mut self, consumer_id: ConsumerId) -> Result<(), SfuError> {
        let record = self
            .consumers
            .get(&consumer_id)
            .ok_or_else(|| SfuError::ConsumerNotFound(consumer_id.to_string()))?;

        if record.handle.closed() {
            return Err(SfuError::ConsumerClosed(consumer_id.to_string()));
        }
        // Resumed only once neither side is paused.
        if !record.handle.paused() && !record.handle.producer_paused() {
            return Ok(());
        }

        record.handle.resume().await?;

        debug!(
            target: "sfu.actor.session",
            room_id = %self.room_id,
            client_id = %self.client_id,
            consumer_id = %consumer_id,
            "Consumer resumed"
        );
        Ok(())
    }

    fn get_state(&self) -> SessionState {
        let mut transports: Vec<TransportSummary> = self
            .transports
            .iter()
            .map(|(id, record)| TransportSummary {
                transport_id: *id,
                dtls_connected: record.meta.dtls_connected,
            })
            .collect();
        transports.sort_by_key(|t| t.transport_id);

        let mut producers: Vec<ProducerId> = self.producers.keys().copied().collect();
        producers.sort();

        let mut consumers: Vec<ConsumerSummary> = self
            .consumers
            .iter()
            .map(|(id, record)| ConsumerSummary {
                consumer_id: *id,
                producer_id: record.handle.producer_id(),
                paused: record.handle.paused(),
            })
            .collect();
        consumers.sort_by_key(|c| c.consumer_id);

        SessionState {
            room_id: self.room_id.clone(),
            client_id: self.client_id.clone(),
            transports,
            producers,
            consumers,
        }
    }

    /// Forward the engine's close event for `resource` into this mailbox.
    fn watch_close(&self, resource: SessionResource, signal: CloseSignal) {
        let cancel_token = self.cancel_token.clone();
        let sender = self.self_sender.clone();

        tokio::spawn(async move {
            let reason = tokio::select! {
                () = cancel_token.cancelled() => return,
                reason = signal.closed() => reason,
            };
            let (Some(reason), Some(sender)) = (reason, sender.upgrade()) else {
                return;
            };
            let _ = sender
                .send(SessionMessage::ResourceClosed { resource, reason })
                .await;
        });
    }

    /// Retire producers, then consumers, then transports.
    fn retire_all(&mut self, cause: RetireCause) -> CloseSummary {
        let producer_ids: Vec<ProducerId> = self.producers.keys().copied().collect();
        let consumer_ids: Vec<ConsumerId> = self.consumers.keys().copied().collect();
        let transport_ids: Vec<TransportId> = self.transports.keys().copied().collect();

        CloseSummary {
            producers: producer_ids
                .into_iter()
                .filter(|id| self.retire_producer(*id, cause))
                .count(),
            consumers: consumer_ids
                .into_iter()
                .filter(|id| self.retire_consumer(*id, cause))
                .count(),
            transports: transport_ids
                .into_iter()
                .filter(|id| self.retire_transport(*id, cause))
                .count(),
        }
    }

    /// Returns `false` if the transport was already retired.
    fn retire_transport(&mut self, transport_id: TransportId, cause: RetireCause) -> bool {
        let Some(record) = self.transports.remove(&transport_id) else {
            return false;
        };
        if !record.handle.closed() {
            record.handle.close();
        }
        prom::record_resource_retired("transport", cause.as_str());
        debug!(
            target: "sfu.actor.session",
            room_id = %self.room_id,
            client_id = %self.client_id,
            transport_id = %transport_id,
            cause = cause.as_str(),
            "Transport retired"
        );
        true
    }

    /// Returns `false` if the producer was already retired.
    fn retire_producer(&mut self, producer_id: ProducerId, cause: RetireCause) -> bool {
        let Some(record) = self.producers.remove(&producer_id) else {
            return false;
        };
        if !record.handle.closed() {
            record.handle.close();
        }
        self.room.producer_closed(producer_id);
        prom::record_resource_retired("producer", cause.as_str());
        debug!(
            target: "sfu.actor.session",
            room_id = %self.room_id,
            client_id = %self.client_id,
            producer_id = %producer_id,
            transport_id = %record.meta.transport_id,
            cause = cause.as_str(),
            "Producer retired"
        );
        true
    }

    /// Returns `false` if the consumer was already retired.
    fn retire_consumer(&mut self, consumer_id: ConsumerId, cause: RetireCause) -> bool {
        let Some(record) = self.consumers.remove(&consumer_id) else {
            return false;
        };
        if !record.handle.closed() {
            record.handle.close();
        }
        prom::record_resource_retired("consumer", cause.as_str());
        if cause == RetireCause::Engine(CloseReason::ProducerClosed) {
            warn!(
                target: "sfu.actor.session",
                room_id = %self.room_id,
                client_id = %self.client_id,
                consumer_id = %consumer_id,
                producer_owner_id = %record.meta.producer_owner_id,
                "Consumed producer closed"
            );
        } else {
            debug!(
                target: "sfu.actor.session",
                room_id = %self.room_id,
                client_id = %self.client_id,
                consumer_id = %consumer_id,
                transport_id = %record.meta.transport_id,
                cause = cause.as_str(),
                "Consumer retired"
            );
        }
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::messages::RoomMessage;
    use crate::actors::testing::{caps, dtls, local_router, rtp};
    use crate::engine::local::LocalEngine;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        engine: LocalEngine,
        router: Arc<dyn EngineRouter>,
        media: Arc<MediaSettings>,
        room_tx: mpsc::Sender<RoomMessage>,
        room_rx: mpsc::Receiver<RoomMessage>,
        token: CancellationToken,
    }

    async fn fixture() -> Fixture {
        let engine = LocalEngine::new();
        let (router, media) = local_router(&engine).await;
        let (room_tx, room_rx) = mpsc::channel(64);
        Fixture {
            engine,
            router,
            media,
            room_tx,
            room_rx,
            token: CancellationToken::new(),
        }
    }

    impl Fixture {
        fn spawn(&self, client_id: &str) -> (ClientSessionActorHandle, JoinHandle<()>) {
            ClientSessionActor::spawn(
                "room-1".to_string(),
                client_id.to_string(),
                Arc::clone(&self.router),
                Arc::clone(&self.media),
                RoomLink::new("room-1".to_string(), self.room_tx.downgrade()),
                self.token.child_token(),
                ActorMetrics::new(),
            )
        }
    }

    async fn connected_transport(session: &ClientSessionActorHandle) -> TransportId {
        let params = session.create_transport().await.unwrap();
        session.connect_transport(params.id, dtls()).await.unwrap();
        params.id
    }

    fn entry_for(engine: &LocalEngine, descriptor: &ProducerDescriptor, owner: &str) -> ProducerEntry {
        let producer = engine.find_producer(descriptor.producer_id).unwrap();
        ProducerEntry {
            producer_id: descriptor.producer_id,
            owner_client_id: owner.to_string(),
            kind: descriptor.kind,
            handle: producer,
        }
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let fx = fixture().await;
        let (session, _task) = fx.spawn("alice");

        let params = session.create_transport().await.unwrap();
        session.connect_transport(params.id, dtls()).await.unwrap();
        session.connect_transport(params.id, dtls()).await.unwrap();

        assert_eq!(fx.engine.stats().snapshot().connect_calls, 1);
        let state = session.get_state().await.unwrap();
        assert!(state.transports.first().unwrap().dtls_connected);

        fx.token.cancel();
    }

    #[tokio::test]
    async fn test_connect_unknown_transport() {
        let fx = fixture().await;
        let (session, _task) = fx.spawn("alice");

        let result = session.connect_transport(TransportId::new(), dtls()).await;
        assert!(matches!(result, Err(SfuError::TransportNotFound(_))));

        fx.token.cancel();
    }

    #[tokio::test]
    async fn test_failed_connect_leaves_transport_unconnected() {
        let fx = fixture().await;
        let (session, _task) = fx.spawn("alice");

        let params = session.create_transport().await.unwrap();
        let result = session.connect_transport(params.id, json!({})).await;
        assert!(matches!(result, Err(SfuError::Engine(_))));

        let state = session.get_state().await.unwrap();
        assert!(!state.transports.first().unwrap().dtls_connected);

        fx.token.cancel();
    }

    #[tokio::test]
    async fn test_produce_requires_connected_transport() {
        let fx = fixture().await;
        let (session, _task) = fx.spawn("alice");

        let params = session.create_transport().await.unwrap();
        let result = session
            .produce(params.id, MediaKind::Audio, rtp("audio/opus"), json!({}))
            .await;
        assert!(matches!(result, Err(SfuError::TransportNotConnected(_))));
        assert_eq!(fx.engine.stats().snapshot().producers_created, 0);

        fx.token.cancel();
    }

    #[tokio::test]
    async fn test_produce_registers_with_room_and_merges_app_data() {
        let mut fx = fixture().await;
        let (session, _task) = fx.spawn("alice");
        let transport_id = connected_transport(&session).await;

        let descriptor = session
            .produce(
                transport_id,
                MediaKind::Video,
                rtp("video/VP8"),
                json!({"source": "webcam", "clientId": "spoofed"}),
            )
            .await
            .unwrap();

        assert_eq!(descriptor.app_data["source"], "webcam");
        assert_eq!(descriptor.app_data["clientId"], "alice");
        assert_eq!(descriptor.app_data["roomId"], "room-1");

        let msg = fx.room_rx.recv().await.unwrap();
        assert!(matches!(
            msg,
            RoomMessage::ProducerOpened { ref entry }
                if entry.producer_id == descriptor.producer_id && entry.owner_client_id == "alice"
        ));

        let listed = session.list_producers().await.unwrap();
        assert_eq!(listed, vec![descriptor]);

        fx.token.cancel();
    }

    #[tokio::test]
    async fn test_produce_fails_when_room_is_gone() {
        let fx = fixture().await;
        let Fixture {
            engine,
            router,
            media,
            room_tx,
            room_rx,
            token,
        } = fx;
        drop(room_rx);
        let (session, _task) = ClientSessionActor::spawn(
            "room-1".to_string(),
            "alice".to_string(),
            router,
            media,
            RoomLink::new("room-1".to_string(), room_tx.downgrade()),
            token.child_token(),
            ActorMetrics::new(),
        );
        let transport_id = connected_transport(&session).await;

        let result = session
            .produce(transport_id, MediaKind::Audio, rtp("audio/opus"), json!({}))
            .await;
        assert!(matches!(result, Err(SfuError::RoomGone(_))));
        assert!(session.list_producers().await.unwrap().is_empty());
        assert_eq!(engine.stats().snapshot().producer_closes, 1);

        token.cancel();
    }

    #[tokio::test]
    async fn test_consume_precondition_order() {
        let fx = fixture().await;
        let (alice, _a) = fx.spawn("alice");
        let (bob, _b) = fx.spawn("bob");

        let send = connected_transport(&alice).await;
        let produced = alice
            .produce(send, MediaKind::Video, rtp("video/VP8"), json!({}))
            .await
            .unwrap();
        let entry = entry_for(&fx.engine, &produced, "alice");

        let recv = bob.create_transport().await.unwrap().id;
        let not_connected = bob
            .consume(recv, produced.producer_id, caps(&["video/VP8"]), json!({}), None)
            .await;
        assert!(matches!(not_connected, Err(SfuError::TransportNotConnected(_))));

        bob.connect_transport(recv, dtls()).await.unwrap();
        let missing = bob
            .consume(recv, produced.producer_id, caps(&["video/VP8"]), json!({}), None)
            .await;
        assert!(matches!(missing, Err(SfuError::ProducerNotFound(_))));

        let incompatible = bob
            .consume(
                recv,
                produced.producer_id,
                caps(&["audio/opus"]),
                json!({}),
                Some(entry),
            )
            .await;
        assert!(matches!(incompatible, Err(SfuError::IncompatibleCapabilities(_))));
        assert_eq!(fx.engine.stats().snapshot().consumers_created, 0);

        fx.token.cancel();
    }

    #[tokio::test]
    async fn test_video_consumer_starts_paused_and_resumes() {
        let fx = fixture().await;
        let (alice, _a) = fx.spawn("alice");
        let (bob, _b) = fx.spawn("bob");

        let send = connected_transport(&alice).await;
        let video = alice
            .produce(send, MediaKind::Video, rtp("video/VP8"), json!({}))
            .await
            .unwrap();
        let audio = alice
            .produce(send, MediaKind::Audio, rtp("audio/opus"), json!({}))
            .await
            .unwrap();

        let recv = connected_transport(&bob).await;
        let video_consumer = bob
            .consume(
                recv,
                video.producer_id,
                caps(&["video/VP8", "audio/opus"]),
                json!({"hint": 1}),
                Some(entry_for(&fx.engine, &video, "alice")),
            )
            .await
            .unwrap();
        let audio_consumer = bob
            .consume(
                recv,
                audio.producer_id,
                caps(&["video/VP8", "audio/opus"]),
                json!({}),
                Some(entry_for(&fx.engine, &audio, "alice")),
            )
            .await
            .unwrap();

        assert!(video_consumer.paused);
        assert!(!audio_consumer.paused);
        assert_eq!(video_consumer.app_data["producerOwnerId"], "alice");
        assert_eq!(video_consumer.app_data["consumingClientId"], "bob");
        assert_eq!(video_consumer.app_data["hint"], 1);

        bob.resume_consumer(video_consumer.id).await.unwrap();
        bob.resume_consumer(video_consumer.id).await.unwrap();
        bob.resume_consumer(audio_consumer.id).await.unwrap();
        assert_eq!(fx.engine.stats().snapshot().resume_calls, 1);

        let state = bob.get_state().await.unwrap();
        assert!(state.consumers.iter().all(|c| !c.paused));

        fx.token.cancel();
    }

    #[tokio::test]
    async fn test_resume_reaches_engine_while_producer_paused() {
        let fx = fixture().await;
        let (alice, _a) = fx.spawn("alice");
        let (bob, _b) = fx.spawn("bob");

        let send = connected_transport(&alice).await;
        let audio = alice
            .produce(send, MediaKind::Audio, rtp("audio/opus"), json!({}))
            .await
            .unwrap();
        let producer = fx.engine.find_producer(audio.producer_id).unwrap();
        producer.pause();

        let recv = connected_transport(&bob).await;
        let consumer = bob
            .consume(
                recv,
                audio.producer_id,
                caps(&["audio/opus"]),
                json!({}),
                Some(entry_for(&fx.engine, &audio, "alice")),
            )
            .await
            .unwrap();
        assert!(consumer.paused);

        bob.resume_consumer(consumer.id).await.unwrap();
        assert_eq!(fx.engine.stats().snapshot().resume_calls, 1);

        producer.resume();
        bob.resume_consumer(consumer.id).await.unwrap();
        assert_eq!(fx.engine.stats().snapshot().resume_calls, 1);

        fx.token.cancel();
    }

    #[tokio::test]
    async fn test_resume_unknown_and_closed_consumer() {
        let fx = fixture().await;
        let (alice, _a) = fx.spawn("alice");
        let (bob, _b) = fx.spawn("bob");

        let missing = bob.resume_consumer(ConsumerId::new()).await;
        assert!(matches!(missing, Err(SfuError::ConsumerNotFound(_))));

        let send = connected_transport(&alice).await;
        let video = alice
            .produce(send, MediaKind::Video, rtp("video/VP8"), json!({}))
            .await
            .unwrap();
        let recv = connected_transport(&bob).await;
        let consumer = bob
            .consume(
                recv,
                video.producer_id,
                caps(&["video/VP8"]),
                json!({}),
                Some(entry_for(&fx.engine, &video, "alice")),
            )
            .await
            .unwrap();

        // Close the engine consumer behind the session's back; the resume
        // may race the close event.
        fx.engine.find_consumer(consumer.id).unwrap().close();
        let result = bob.resume_consumer(consumer.id).await;
        assert!(matches!(
            result,
            Err(SfuError::ConsumerClosed(_) | SfuError::ConsumerNotFound(_))
        ));

        fx.token.cancel();
    }

    #[tokio::test]
    async fn test_engine_close_events_retire_resources() {
        let mut fx = fixture().await;
        let (alice, _a) = fx.spawn("alice");
        let (bob, _b) = fx.spawn("bob");

        let send = connected_transport(&alice).await;
        let video = alice
            .produce(send, MediaKind::Video, rtp("video/VP8"), json!({}))
            .await
            .unwrap();
        let recv = connected_transport(&bob).await;
        bob.consume(
            recv,
            video.producer_id,
            caps(&["video/VP8"]),
            json!({}),
            Some(entry_for(&fx.engine, &video, "alice")),
        )
        .await
        .unwrap();

        // Producer close cascades to bob's consumer.
        fx.engine.find_producer(video.producer_id).unwrap().close();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(alice.list_producers().await.unwrap().is_empty());
        assert!(alice.get_state().await.unwrap().producers.is_empty());
        assert!(bob.get_state().await.unwrap().consumers.is_empty());

        let mut saw_closed = false;
        while let Ok(msg) = fx.room_rx.try_recv() {
            if matches!(msg, RoomMessage::ProducerClosed { producer_id } if producer_id == video.producer_id) {
                saw_closed = true;
            }
        }
        assert!(saw_closed);

        fx.token.cancel();
    }

    #[tokio::test]
    async fn test_close_retires_everything_once() {
        let fx = fixture().await;
        let (alice, task) = fx.spawn("alice");

        let send = connected_transport(&alice).await;
        alice
            .produce(send, MediaKind::Audio, rtp("audio/opus"), json!({}))
            .await
            .unwrap();
        alice.create_transport().await.unwrap();

        let summary = alice.close().await.unwrap();
        assert_eq!(
            summary,
            CloseSummary {
                producers: 1,
                consumers: 0,
                transports: 2,
            }
        );

        task.await.unwrap();
        let stats = fx.engine.stats().snapshot();
        assert_eq!(stats.producer_closes, 1);
        assert_eq!(stats.transport_closes, 2);

        // The mailbox is gone once the session stopped.
        let after = alice.list_producers().await;
        assert!(matches!(after, Err(SfuError::ClientNotFound(_))));
    }

    #[test]
    fn test_app_data_view_drops_non_object_input() {
        let meta = ProducerMeta {
            room_id: "r".to_string(),
            owner_client_id: "c".to_string(),
            kind: MediaKind::Audio,
            transport_id: TransportId::new(),
            app_data: json!("not an object"),
        };
        assert_eq!(meta.app_data_view(), json!({"roomId": "r", "clientId": "c"}));
    }

    #[test]
    fn test_retire_cause_labels() {
        assert_eq!(
            RetireCause::Engine(CloseReason::TransportClosed).as_str(),
            "transport_closed"
        );
        assert_eq!(RetireCause::Disconnect.as_str(), "disconnect");
        assert_eq!(RetireCause::Shutdown.as_str(), "shutdown");
    }
}
