//! Signaling operations.
//!
//! [`SessionOrchestrator`] is the context object every request goes through.
//! It resolves rooms and sessions through the actor hierarchy and records
//! per-operation metrics. It holds no state of its own besides the
//! controller handle, so it is cheap to clone into request handlers.

use crate::actors::{
    ClientSessionActorHandle, ConsumerDescriptor, ProducerDescriptor, RoomActorHandle,
    RoomControllerActorHandle,
};
use crate::engine::TransportParameters;
use crate::errors::SfuError;
use crate::observability::metrics as prom;

use common::types::{ConsumerId, MediaKind, ProducerId, TransportId};
use serde_json::Value;
use std::future::Future;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Attempts made when a room disappears between lookup and use.
const ROOM_RETRY_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct SessionOrchestrator {
    controller: RoomControllerActorHandle,
}

impl SessionOrchestrator {
    #[must_use]
    pub fn new(controller: RoomControllerActorHandle) -> Self {
        Self { controller }
    }

    #[must_use]
    pub fn controller(&self) -> &RoomControllerActorHandle {
        &self.controller
    }

    /// Router RTP capabilities of the room, creating the room if needed.
    pub async fn get_capabilities(&self, room_id: &str) -> Result<Value, SfuError> {
        observe("get_capabilities", async {
            for attempt in 1..=ROOM_RETRY_ATTEMPTS {
                let room = self.controller.get_or_create_room(room_id.to_string()).await?;
                match room.get_rtp_capabilities().await {
                    Err(SfuError::RoomGone(_)) if attempt < ROOM_RETRY_ATTEMPTS => {
                        debug!(target: "sfu.orchestrator", room_id, attempt, "Room gone, retrying");
                    }
                    result => return result,
                }
            }
            Err(SfuError::RoomGone(room_id.to_string()))
        })
        .await
    }

    /// Create a WebRTC transport for the client, creating room and session
    /// if needed.
    pub async fn create_transport(
        &self,
        room_id: &str,
        client_id: &str,
    ) -> Result<TransportParameters, SfuError> {
        observe("create_transport", async {
            let session = self.get_or_create_session(room_id, client_id).await?;
            let params = session.create_transport().await?;
            info!(
                target: "sfu.orchestrator",
                room_id,
                client_id,
                transport_id = %params.id,
                "Transport created"
            );
            Ok(params)
        })
        .await
    }

    pub async fn connect_transport(
        &self,
        room_id: &str,
        client_id: &str,
        transport_id: TransportId,
        dtls_parameters: Value,
    ) -> Result<(), SfuError> {
        observe("connect_transport", async {
            let (_room, session) = self.resolve(room_id, client_id).await?;
            session
                .connect_transport(transport_id, dtls_parameters)
                .await
        })
        .await
    }

    pub async fn produce(
        &self,
        room_id: &str,
        client_id: &str,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: Value,
        app_data: Value,
    ) -> Result<ProducerDescriptor, SfuError> {
        observe("produce", async {
            // The room handle stays alive until the producer is published.
            let (_room, session) = self.resolve(room_id, client_id).await?;
            session
                .produce(transport_id, kind, rtp_parameters, app_data)
                .await
        })
        .await
    }

    /// Live producers of `client_id`. Unknown rooms or clients yield an empty list.
    pub async fn list_producers(&self, room_id: &str, client_id: &str) -> Vec<ProducerDescriptor> {
        let started = Instant::now();
        let producers = match self.resolve(room_id, client_id).await {
            Ok((_room, session)) => session.list_producers().await.unwrap_or_default(),
            Err(e) => {
                debug!(
                    target: "sfu.orchestrator",
                    room_id,
                    client_id,
                    error = %e,
                    "Listing producers of unknown client"
                );
                Vec::new()
            }
        };
        prom::record_operation("list_producers", "success", started.elapsed());
        producers
    }

    pub async fn consume(
        &self,
        room_id: &str,
        client_id: &str,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: Value,
        app_data: Value,
    ) -> Result<ConsumerDescriptor, SfuError> {
        observe("consume", async {
            let (room, session) = self.resolve(room_id, client_id).await?;
            let producer = room.find_producer(producer_id).await?;
            session
                .consume(transport_id, producer_id, rtp_capabilities, app_data, producer)
                .await
        })
        .await
    }

    pub async fn resume_consumer(
        &self,
        room_id: &str,
        client_id: &str,
        consumer_id: ConsumerId,
    ) -> Result<(), SfuError> {
        observe("resume_consumer", async {
            let (_room, session) = self.resolve(room_id, client_id).await?;
            session.resume_consumer(consumer_id).await
        })
        .await
    }

    /// Tear down everything the client owns. Never fails: unknown rooms and
    /// clients, closed resources and rooms closing concurrently are all fine.
    pub async fn disconnect(&self, room_id: &str, client_id: &str) {
        let started = Instant::now();
        if let Err(e) = self.try_disconnect(room_id, client_id).await {
            warn!(
                target: "sfu.orchestrator",
                room_id,
                client_id,
                error = %e,
                "Disconnect cleanup incomplete"
            );
        }
        prom::record_operation("disconnect", "success", started.elapsed());
    }

    async fn try_disconnect(&self, room_id: &str, client_id: &str) -> Result<(), SfuError> {
        let Some(room) = self.controller.get_room(room_id.to_string()).await? else {
            debug!(target: "sfu.orchestrator", room_id, client_id, "Disconnect for unknown room");
            return Ok(());
        };

        let outcome = match room.detach_session(client_id.to_string()).await {
            Ok(outcome) => outcome,
            Err(SfuError::RoomGone(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        if let Some(session) = outcome.session {
            match session.close().await {
                Ok(summary) => {
                    info!(
                        target: "sfu.orchestrator",
                        room_id,
                        client_id,
                        producers = summary.producers,
                        consumers = summary.consumers,
                        transports = summary.transports,
                        "Client disconnected"
                    );
                }
                // Session already stopped with its room.
                Err(SfuError::ClientNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        if outcome.room_empty && room.close_if_empty().await.unwrap_or(false) {
            let removed = self
                .controller
                .remove_room(room_id.to_string(), room.instance_id())
                .await?;
            info!(
                target: "sfu.orchestrator",
                room_id,
                removed,
                "Last client left, room closed"
            );
        }
        Ok(())
    }

    async fn get_or_create_session(
        &self,
        room_id: &str,
        client_id: &str,
    ) -> Result<ClientSessionActorHandle, SfuError> {
        for attempt in 1..=ROOM_RETRY_ATTEMPTS {
            let room = self.controller.get_or_create_room(room_id.to_string()).await?;
            match room.get_or_create_session(client_id.to_string()).await {
                Err(SfuError::RoomGone(_)) if attempt < ROOM_RETRY_ATTEMPTS => {
                    debug!(target: "sfu.orchestrator", room_id, attempt, "Room gone, retrying");
                }
                result => return result,
            }
        }
        Err(SfuError::RoomGone(room_id.to_string()))
    }

    /// Existing room and session, without creating either.
    async fn resolve(
        &self,
        room_id: &str,
        client_id: &str,
    ) -> Result<(RoomActorHandle, ClientSessionActorHandle), SfuError> {
        let room = self
            .controller
            .get_room(room_id.to_string())
            .await?
            .ok_or_else(|| SfuError::RoomNotFound(room_id.to_string()))?;
        let session = match room.get_session(client_id.to_string()).await {
            Ok(Some(session)) => session,
            Ok(None) => return Err(SfuError::ClientNotFound(client_id.to_string())),
            Err(SfuError::RoomGone(_)) => return Err(SfuError::RoomNotFound(room_id.to_string())),
            Err(e) => return Err(e),
        };
        Ok((room, session))
    }
}

/// Run one operation and record its outcome.
async fn observe<T>(
    operation: &'static str,
    fut: impl Future<Output = Result<T, SfuError>>,
) -> Result<T, SfuError> {
    let started = Instant::now();
    let result = fut.await;
    match &result {
        Ok(_) => prom::record_operation(operation, "success", started.elapsed()),
        Err(e) => {
            prom::record_operation(operation, "error", started.elapsed());
            prom::record_operation_error(operation, e.error_type_label());
            debug!(
                target: "sfu.orchestrator",
                operation,
                error = %e,
                "Operation failed"
            );
        }
    }
    result
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::testing::{caps, dtls, local_worker, rtp, test_config};
    use crate::actors::ActorMetrics;
    use crate::engine::local::LocalEngine;
    use crate::pool::WorkerPool;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    async fn orchestrator(engine: &LocalEngine) -> SessionOrchestrator {
        let worker = local_worker(engine).await;
        let controller = RoomControllerActorHandle::new(
            Arc::new(WorkerPool::from_workers(vec![worker])),
            Arc::new(test_config().media_settings()),
            ActorMetrics::new(),
        );
        SessionOrchestrator::new(controller)
    }

    async fn connected(orch: &SessionOrchestrator, room: &str, client: &str) -> TransportId {
        let transport = orch.create_transport(room, client).await.unwrap();
        orch.connect_transport(room, client, transport.id, dtls())
            .await
            .unwrap();
        transport.id
    }

    #[tokio::test]
    async fn test_capabilities_create_room() {
        let engine = LocalEngine::new();
        let orch = orchestrator(&engine).await;

        let caps = orch.get_capabilities("r1").await.unwrap();
        assert!(caps["codecs"].is_array());
        assert_eq!(orch.controller().get_status().await.unwrap().room_count, 1);

        orch.controller().cancel();
    }

    #[tokio::test]
    async fn test_operations_on_unknown_room_and_client() {
        let engine = LocalEngine::new();
        let orch = orchestrator(&engine).await;

        let result = orch
            .connect_transport("nope", "a", TransportId::new(), dtls())
            .await;
        assert!(matches!(result, Err(SfuError::RoomNotFound(_))));

        orch.get_capabilities("r1").await.unwrap();
        let result = orch.resume_consumer("r1", "ghost", ConsumerId::new()).await;
        assert!(matches!(result, Err(SfuError::ClientNotFound(_))));

        assert!(orch.list_producers("nope", "a").await.is_empty());
        assert!(orch.list_producers("r1", "ghost").await.is_empty());

        orch.controller().cancel();
    }

    #[tokio::test]
    async fn test_produce_consume_resume_flow() {
        let engine = LocalEngine::new();
        let orch = orchestrator(&engine).await;

        let send = connected(&orch, "r1", "alice").await;
        let produced = orch
            .produce("r1", "alice", send, MediaKind::Video, rtp("video/VP8"), json!({}))
            .await
            .unwrap();

        let listed = orch.list_producers("r1", "alice").await;
        assert_eq!(listed.len(), 1);

        let recv = connected(&orch, "r1", "bob").await;
        let consumer = orch
            .consume(
                "r1",
                "bob",
                recv,
                produced.producer_id,
                caps(&["video/VP8"]),
                json!({}),
            )
            .await
            .unwrap();
        assert!(consumer.paused);

        orch.resume_consumer("r1", "bob", consumer.id).await.unwrap();
        let consumer_state = engine.find_consumer(consumer.id).unwrap();
        assert!(!crate::engine::EngineConsumer::paused(consumer_state.as_ref()));

        orch.controller().cancel();
    }

    #[tokio::test]
    async fn test_disconnect_last_client_removes_room() {
        let engine = LocalEngine::new();
        let orch = orchestrator(&engine).await;

        let send = connected(&orch, "r1", "alice").await;
        orch.produce("r1", "alice", send, MediaKind::Audio, rtp("audio/opus"), json!({}))
            .await
            .unwrap();

        orch.disconnect("r1", "alice").await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let stats = engine.stats().snapshot();
        assert_eq!(stats.producer_closes, 1);
        assert_eq!(stats.transport_closes, 1);
        assert_eq!(stats.router_closes, 1);
        assert_eq!(orch.controller().get_status().await.unwrap().room_count, 0);

        // Same room id gets a fresh router.
        orch.get_capabilities("r1").await.unwrap();
        assert_eq!(engine.stats().snapshot().routers_created, 2);

        orch.controller().cancel();
    }

    #[tokio::test]
    async fn test_disconnect_unknown_is_noop() {
        let engine = LocalEngine::new();
        let orch = orchestrator(&engine).await;

        orch.disconnect("nope", "a").await;
        orch.get_capabilities("r1").await.unwrap();
        orch.disconnect("r1", "ghost").await;

        // A room without clients closes when anyone disconnects from it.
        assert_eq!(orch.controller().get_status().await.unwrap().room_count, 0);

        orch.controller().cancel();
    }
}
