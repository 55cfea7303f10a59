//! `RoomActor` - one per room.
//!
//! Owns the room's router, the client session registry and the room-wide
//! producer directory used for cross-client producer discovery.
//!
//! The router is created as the first step of the run loop so the
//! controller never waits on the engine. Requests queued meanwhile are served
//! once the router exists, or all fail with the engine error if creation
//! failed.
//!
//! The room never awaits its sessions. Sessions talk back through a
//! [`RoomLink`] (producer opened/closed notifications) and the orchestrator
//! drives disconnect across both actors.

use crate::engine::{CloseReason, EngineError, EngineRouter, EngineWorker, MediaSettings};
use crate::errors::SfuError;
use crate::observability::metrics as prom;

use super::messages::{ControllerMessage, DetachOutcome, ProducerEntry, RoomMessage, RoomState};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::session::{ClientSessionActor, ClientSessionActorHandle};

use common::types::ProducerId;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Default channel buffer size for room mailboxes.
const ROOM_CHANNEL_BUFFER: usize = 500;

/// How long shutdown waits for each session task.
const SESSION_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to a `RoomActor`.
///
/// `instance_id` tells apart successive rooms registered under the same id.
#[derive(Debug, Clone)]
pub struct RoomActorHandle {
    room_id: String,
    instance_id: Uuid,
    sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
}

impl RoomActorHandle {
    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    #[must_use]
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Send a request. A dead mailbox means the room closed under us.
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, SfuError>>) -> RoomMessage,
    ) -> Result<T, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| SfuError::RoomGone(self.room_id.clone()))?;

        rx.await
            .map_err(|_| SfuError::RoomGone(self.room_id.clone()))?
    }

    pub async fn get_rtp_capabilities(&self) -> Result<Value, SfuError> {
        self.request(|respond_to| RoomMessage::GetRtpCapabilities { respond_to })
            .await
    }

    pub async fn get_or_create_session(
        &self,
        client_id: String,
    ) -> Result<ClientSessionActorHandle, SfuError> {
        self.request(|respond_to| RoomMessage::GetOrCreateSession {
            client_id,
            respond_to,
        })
        .await
    }

    pub async fn get_session(
        &self,
        client_id: String,
    ) -> Result<Option<ClientSessionActorHandle>, SfuError> {
        self.request(|respond_to| RoomMessage::GetSession {
            client_id,
            respond_to,
        })
        .await
    }

    pub async fn find_producer(
        &self,
        producer_id: ProducerId,
    ) -> Result<Option<ProducerEntry>, SfuError> {
        self.request(|respond_to| RoomMessage::FindProducer {
            producer_id,
            respond_to,
        })
        .await
    }

    pub async fn detach_session(&self, client_id: String) -> Result<DetachOutcome, SfuError> {
        self.request(|respond_to| RoomMessage::DetachSession {
            client_id,
            respond_to,
        })
        .await
    }

    /// Returns `true` if the room had no clients and is now closing.
    pub async fn close_if_empty(&self) -> Result<bool, SfuError> {
        self.request(|respond_to| RoomMessage::CloseIfEmpty { respond_to })
            .await
    }

    pub async fn get_state(&self) -> Result<RoomState, SfuError> {
        self.request(|respond_to| RoomMessage::GetState { respond_to })
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

/// Session-side view of its room.
///
/// Holds a weak sender so sessions never keep a stopped room's mailbox open.
#[derive(Debug, Clone)]
pub struct RoomLink {
    room_id: String,
    sender: mpsc::WeakSender<RoomMessage>,
}

impl RoomLink {
    pub(crate) fn new(room_id: String, sender: mpsc::WeakSender<RoomMessage>) -> Self {
        Self { room_id, sender }
    }

    /// Publish a producer in the room directory. Returns `false` if the
    /// room is gone.
    pub async fn producer_opened(&self, entry: ProducerEntry) -> bool {
        let Some(sender) = self.sender.upgrade() else {
            return false;
        };
        sender
            .send(RoomMessage::ProducerOpened { entry })
            .await
            .is_ok()
    }

    /// Best effort: a full or closed mailbox drops the notification, lookups
    /// skip closed producers anyway.
    pub fn producer_closed(&self, producer_id: ProducerId) {
        if let Some(sender) = self.sender.upgrade() {
            if sender
                .try_send(RoomMessage::ProducerClosed { producer_id })
                .is_err()
            {
                debug!(
                    target: "sfu.actor.room",
                    room_id = %self.room_id,
                    producer_id = %producer_id,
                    "Dropped producer close notification"
                );
            }
        }
    }
}

/// Internal state for a managed session.
struct ManagedSession {
    handle: ClientSessionActorHandle,
    task_handle: JoinHandle<()>,
    created_at: i64,
}

/// The `RoomActor` implementation.
pub struct RoomActor {
    room_id: String,
    instance_id: Uuid,
    receiver: mpsc::Receiver<RoomMessage>,
    /// Handed to sessions through `RoomLink`.
    self_sender: mpsc::WeakSender<RoomMessage>,
    cancel_token: CancellationToken,
    worker: Arc<dyn EngineWorker>,
    media: Arc<MediaSettings>,
    controller: mpsc::WeakSender<ControllerMessage>,
    sessions: HashMap<String, ManagedSession>,
    /// Producers of every session in the room.
    producers: HashMap<ProducerId, ProducerEntry>,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomActor {
    /// Spawn a room actor bound to `worker`.
    pub fn spawn(
        room_id: String,
        worker: Arc<dyn EngineWorker>,
        media: Arc<MediaSettings>,
        controller: mpsc::WeakSender<ControllerMessage>,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (RoomActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_BUFFER);
        let instance_id = Uuid::new_v4();

        let actor = Self {
            room_id: room_id.clone(),
            instance_id,
            receiver,
            self_sender: sender.downgrade(),
            cancel_token: cancel_token.clone(),
            worker,
            media,
            controller,
            sessions: HashMap::new(),
            producers: HashMap::new(),
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Room, &room_id),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RoomActorHandle {
            room_id,
            instance_id,
            sender,
            cancel_token,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "sfu.actor.room", fields(room_id = %self.room_id))]
    async fn run(mut self) {
        let started = Instant::now();
        let router = match self.worker.create_router(&self.media.router).await {
            Ok(router) => router,
            Err(e) => {
                error!(
                    target: "sfu.actor.room",
                    room_id = %self.room_id,
                    worker_id = %self.worker.id(),
                    error = %e,
                    "Router creation failed"
                );
                self.fail_pending(e).await;
                return;
            }
        };
        prom::record_room_creation(started.elapsed());

        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            router_id = %router.id(),
            worker_id = %self.worker.id(),
            "RoomActor started"
        );

        let router_closed = router.on_close().closed();
        tokio::pin!(router_closed);

        loop {
            self.check_session_health().await;

            tokio::select! {
                biased;

                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "sfu.actor.room",
                        room_id = %self.room_id,
                        "RoomActor received cancellation signal"
                    );
                    self.graceful_shutdown(&router).await;
                    break;
                }

                reason = &mut router_closed => {
                    warn!(
                        target: "sfu.actor.room",
                        room_id = %self.room_id,
                        router_id = %router.id(),
                        reason = reason.map_or("dropped", CloseReason::as_str),
                        "Router closed by engine"
                    );
                    self.cancel_token.cancel();
                    self.notify_closed().await;
                    self.graceful_shutdown(&router).await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_received(self.receiver.len());
                            self.handle_message(&router, message);
                            self.mailbox.record_processed();
                            self.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "sfu.actor.room",
                                room_id = %self.room_id,
                                "RoomActor channel closed, exiting"
                            );
                            self.graceful_shutdown(&router).await;
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            messages_processed = self.mailbox.messages_processed(),
            "RoomActor stopped"
        );
    }

    /// Handle a single message. Never awaits: sessions and the engine are
    /// only touched through synchronous calls.
    fn handle_message(&mut self, router: &Arc<dyn EngineRouter>, message: RoomMessage) {
        match message {
            RoomMessage::GetRtpCapabilities { respond_to } => {
                let _ = respond_to.send(Ok(router.rtp_capabilities()));
            }

            RoomMessage::GetOrCreateSession {
                client_id,
                respond_to,
            } => {
                let handle = self.get_or_create_session(router, client_id);
                let _ = respond_to.send(Ok(handle));
            }

            RoomMessage::GetSession {
                client_id,
                respond_to,
            } => {
                let handle = self
                    .sessions
                    .get(&client_id)
                    .map(|managed| managed.handle.clone());
                let _ = respond_to.send(Ok(handle));
            }

            RoomMessage::FindProducer {
                producer_id,
                respond_to,
            } => {
                let entry = self
                    .producers
                    .get(&producer_id)
                    .filter(|entry| !entry.is_closed())
                    .cloned();
                let _ = respond_to.send(Ok(entry));
            }

            RoomMessage::ProducerOpened { entry } => {
                self.producers.insert(entry.producer_id, entry);
            }

            RoomMessage::ProducerClosed { producer_id } => {
                self.producers.remove(&producer_id);
            }

            RoomMessage::DetachSession {
                client_id,
                respond_to,
            } => {
                let outcome = self.detach_session(&client_id);
                let _ = respond_to.send(Ok(outcome));
            }

            RoomMessage::CloseIfEmpty { respond_to } => {
                let closing = self.sessions.is_empty();
                if closing {
                    info!(
                        target: "sfu.actor.room",
                        room_id = %self.room_id,
                        router_id = %router.id(),
                        "Last client left, closing room"
                    );
                    router.close();
                    self.cancel_token.cancel();
                }
                let _ = respond_to.send(Ok(closing));
            }

            RoomMessage::GetState { respond_to } => {
                let mut clients: Vec<String> = self.sessions.keys().cloned().collect();
                clients.sort();
                let state = RoomState {
                    room_id: self.room_id.clone(),
                    router_id: router.id(),
                    clients,
                    producer_count: self.producers.values().filter(|e| !e.is_closed()).count(),
                };
                let _ = respond_to.send(Ok(state));
            }
        }
    }

    fn get_or_create_session(
        &mut self,
        router: &Arc<dyn EngineRouter>,
        client_id: String,
    ) -> ClientSessionActorHandle {
        if let Some(managed) = self.sessions.get(&client_id) {
            if !managed.handle.is_cancelled() && !managed.task_handle.is_finished() {
                return managed.handle.clone();
            }
        }
        if self.sessions.remove(&client_id).is_some() {
            self.metrics.session_closed();
        }

        let (handle, task_handle) = ClientSessionActor::spawn(
            self.room_id.clone(),
            client_id.clone(),
            Arc::clone(router),
            Arc::clone(&self.media),
            RoomLink::new(self.room_id.clone(), self.self_sender.clone()),
            self.cancel_token.child_token(),
            Arc::clone(&self.metrics),
        );

        self.sessions.insert(
            client_id.clone(),
            ManagedSession {
                handle: handle.clone(),
                task_handle,
                created_at: chrono::Utc::now().timestamp(),
            },
        );
        self.metrics.session_created();

        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            client_id = %client_id,
            total_clients = self.sessions.len(),
            "Client session created"
        );

        handle
    }

    fn detach_session(&mut self, client_id: &str) -> DetachOutcome {
        let session = self.sessions.remove(client_id).map(|managed| {
            self.metrics.session_closed();
            debug!(
                target: "sfu.actor.room",
                room_id = %self.room_id,
                client_id = %client_id,
                session_age_secs = chrono::Utc::now().timestamp() - managed.created_at,
                "Client session detached"
            );
            managed.handle
        });
        self.producers
            .retain(|_, entry| entry.owner_client_id != client_id);

        DetachOutcome {
            session,
            room_empty: self.sessions.is_empty(),
        }
    }

    /// Answer everything queued with the router creation failure.
    async fn fail_pending(&mut self, error: EngineError) {
        self.receiver.close();
        self.cancel_token.cancel();

        let message = error.to_string();
        while let Some(pending) = self.receiver.recv().await {
            pending.reject(SfuError::Engine(message.clone()));
        }

        self.notify_closed().await;
    }

    async fn notify_closed(&self) {
        let Some(controller) = self.controller.upgrade() else {
            return;
        };
        let _ = controller
            .send(ControllerMessage::RoomClosed {
                room_id: self.room_id.clone(),
                instance_id: self.instance_id,
            })
            .await;
    }

    async fn graceful_shutdown(&mut self, router: &Arc<dyn EngineRouter>) {
        // Fails senders blocked on a full mailbox instead of leaving them
        // waiting on a room that no longer reads it.
        self.receiver.close();
        router.close();

        for managed in self.sessions.values() {
            managed.handle.cancel();
        }

        for (client_id, managed) in self.sessions.drain() {
            match tokio::time::timeout(SESSION_SHUTDOWN_TIMEOUT, managed.task_handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(
                        target: "sfu.actor.room",
                        room_id = %self.room_id,
                        client_id = %client_id,
                        error = ?e,
                        "Session task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "sfu.actor.room",
                        room_id = %self.room_id,
                        client_id = %client_id,
                        "Session shutdown timed out"
                    );
                }
            }
            self.metrics.session_closed();
        }
        self.producers.clear();

        while let Ok(pending) = self.receiver.try_recv() {
            pending.reject(SfuError::RoomGone(self.room_id.clone()));
        }
    }

    /// Drop sessions whose task ended without a disconnect.
    async fn check_session_health(&mut self) {
        let finished: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(client_id, _)| client_id.clone())
            .collect();

        for client_id in finished {
            let Some(managed) = self.sessions.remove(&client_id) else {
                continue;
            };
            if let Err(join_error) = managed.task_handle.await {
                if join_error.is_panic() {
                    error!(
                        target: "sfu.actor.room",
                        room_id = %self.room_id,
                        client_id = %client_id,
                        error = ?join_error,
                        "Session actor panicked"
                    );
                    self.metrics.record_panic(ActorType::Session);
                }
            }
            self.producers
                .retain(|_, entry| entry.owner_client_id != client_id);
            self.metrics.session_closed();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::testing::{dtls, local_worker, rtp, test_config};
    use crate::engine::local::LocalEngine;
    use common::types::MediaKind;
    use serde_json::json;

    struct Fixture {
        engine: LocalEngine,
        controller_tx: mpsc::Sender<ControllerMessage>,
        controller_rx: mpsc::Receiver<ControllerMessage>,
        metrics: Arc<ActorMetrics>,
    }

    fn fixture() -> Fixture {
        let (controller_tx, controller_rx) = mpsc::channel(16);
        Fixture {
            engine: LocalEngine::new(),
            controller_tx,
            controller_rx,
            metrics: ActorMetrics::new(),
        }
    }

    impl Fixture {
        async fn spawn_room(&self, room_id: &str) -> (RoomActorHandle, JoinHandle<()>) {
            let worker = local_worker(&self.engine).await;
            self.spawn_on(room_id, worker)
        }

        fn spawn_on(
            &self,
            room_id: &str,
            worker: Arc<dyn EngineWorker>,
        ) -> (RoomActorHandle, JoinHandle<()>) {
            RoomActor::spawn(
                room_id.to_string(),
                worker,
                Arc::new(test_config().media_settings()),
                self.controller_tx.downgrade(),
                CancellationToken::new(),
                Arc::clone(&self.metrics),
            )
        }
    }

    #[tokio::test]
    async fn test_capabilities_come_from_router() {
        let fx = fixture();
        let (room, _task) = fx.spawn_room("room-1").await;

        let caps = room.get_rtp_capabilities().await.unwrap();
        assert_eq!(caps["codecs"].as_array().unwrap().len(), 2);
        assert_eq!(fx.engine.stats().snapshot().routers_created, 1);

        room.cancel();
    }

    #[tokio::test]
    async fn test_get_or_create_session_returns_single_instance() {
        let fx = fixture();
        let (room, _task) = fx.spawn_room("room-1").await;

        let (a, b) = tokio::join!(
            room.get_or_create_session("alice".to_string()),
            room.get_or_create_session("alice".to_string())
        );
        let a = a.unwrap();
        let b = b.unwrap();
        a.create_transport().await.unwrap();

        // Both handles reach the same actor.
        assert_eq!(b.get_state().await.unwrap().transports.len(), 1);
        assert_eq!(room.get_state().await.unwrap().clients, vec!["alice".to_string()]);
        assert_eq!(fx.metrics.session_count(), 1);

        room.cancel();
    }

    #[tokio::test]
    async fn test_get_session_does_not_create() {
        let fx = fixture();
        let (room, _task) = fx.spawn_room("room-1").await;

        assert!(room.get_session("ghost".to_string()).await.unwrap().is_none());
        assert!(room.get_state().await.unwrap().clients.is_empty());

        room.cancel();
    }

    #[tokio::test]
    async fn test_producer_directory_follows_sessions() {
        let fx = fixture();
        let (room, _task) = fx.spawn_room("room-1").await;

        let alice = room.get_or_create_session("alice".to_string()).await.unwrap();
        let transport = alice.create_transport().await.unwrap();
        alice.connect_transport(transport.id, dtls()).await.unwrap();
        let produced = alice
            .produce(transport.id, MediaKind::Audio, rtp("audio/opus"), json!({}))
            .await
            .unwrap();

        let found = room.find_producer(produced.producer_id).await.unwrap().unwrap();
        assert_eq!(found.owner_client_id, "alice");
        assert!(room.find_producer(ProducerId::new()).await.unwrap().is_none());

        let outcome = room.detach_session("alice".to_string()).await.unwrap();
        assert!(outcome.session.is_some());
        assert!(outcome.room_empty);
        assert!(room.find_producer(produced.producer_id).await.unwrap().is_none());

        room.cancel();
    }

    #[tokio::test]
    async fn test_detach_unknown_client() {
        let fx = fixture();
        let (room, _task) = fx.spawn_room("room-1").await;
        room.get_or_create_session("alice".to_string()).await.unwrap();

        let outcome = room.detach_session("bob".to_string()).await.unwrap();
        assert!(outcome.session.is_none());
        assert!(!outcome.room_empty);

        room.cancel();
    }

    #[tokio::test]
    async fn test_close_if_empty_closes_router_once() {
        let fx = fixture();
        let (room, task) = fx.spawn_room("room-1").await;
        room.get_or_create_session("alice".to_string()).await.unwrap();

        assert!(!room.close_if_empty().await.unwrap());

        let outcome = room.detach_session("alice".to_string()).await.unwrap();
        outcome.session.unwrap().close().await.unwrap();
        assert!(room.close_if_empty().await.unwrap());

        task.await.unwrap();
        assert!(room.is_cancelled());
        assert_eq!(fx.engine.stats().snapshot().router_closes, 1);

        let after = room.get_rtp_capabilities().await;
        assert!(matches!(after, Err(SfuError::RoomGone(_))));
    }

    #[tokio::test]
    async fn test_worker_close_reports_room_closed() {
        let mut fx = fixture();
        let (room, task) = fx.spawn_room("room-1").await;
        room.get_rtp_capabilities().await.unwrap();

        fx.engine.workers().first().unwrap().kill("segfault");

        let msg = fx.controller_rx.recv().await.unwrap();
        assert!(matches!(
            msg,
            ControllerMessage::RoomClosed { ref room_id, instance_id }
                if room_id == "room-1" && instance_id == room.instance_id()
        ));
        task.await.unwrap();
        assert!(room.is_cancelled());
    }

    #[tokio::test]
    async fn test_router_failure_rejects_queued_requests() {
        let mut fx = fixture();
        let worker = local_worker(&fx.engine).await;
        worker.close();
        let (room, task) = fx.spawn_on("room-1", worker);

        let result = room.get_rtp_capabilities().await;
        assert!(matches!(
            result,
            Err(SfuError::Engine(_) | SfuError::RoomGone(_))
        ));

        let msg = fx.controller_rx.recv().await.unwrap();
        assert!(matches!(msg, ControllerMessage::RoomClosed { .. }));
        task.await.unwrap();
        assert_eq!(fx.metrics.session_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_sessions_and_router() {
        let fx = fixture();
        let (room, task) = fx.spawn_room("room-1").await;
        let alice = room.get_or_create_session("alice".to_string()).await.unwrap();
        alice.create_transport().await.unwrap();

        room.cancel();
        task.await.unwrap();

        assert!(alice.is_cancelled());
        assert_eq!(fx.metrics.session_count(), 0);
        let stats = fx.engine.stats().snapshot();
        assert_eq!(stats.router_closes, 1);
        assert_eq!(stats.transport_closes, 1);
    }
}
