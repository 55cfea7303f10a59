//! `RoomControllerActor` - singleton registry of rooms.
//!
//! The `RoomControllerActor` is the top-level actor of the SFU:
//!
//! - Owns the room registry (`room_id` -> `RoomActor`)
//! - Assigns each new room a worker from the pool
//! - Owns the root `CancellationToken` for graceful shutdown
//! - Monitors room actor health (panic detection via `JoinHandle`)
//!
//! Get-or-create is serialized through the controller mailbox and never
//! awaits the engine (the room creates its router itself), so concurrent
//! callers for one unknown room id always converge on the same room.

use crate::engine::MediaSettings;
use crate::errors::SfuError;
use crate::pool::WorkerPool;

use super::messages::{ControllerMessage, ControllerStatus};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::room::{RoomActor, RoomActorHandle};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Default channel buffer size for the controller mailbox.
const CONTROLLER_CHANNEL_BUFFER: usize = 1000;

/// How long shutdown waits for each room task.
const ROOM_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Handle to the `RoomControllerActor`.
///
/// This is the public interface for interacting with the controller.
/// All methods are async and return results via oneshot channels.
#[derive(Debug, Clone)]
pub struct RoomControllerActorHandle {
    sender: mpsc::Sender<ControllerMessage>,
    cancel_token: CancellationToken,
}

impl RoomControllerActorHandle {
    /// Create a new `RoomControllerActor` and return a handle to it.
    ///
    /// This spawns the actor task and returns immediately.
    #[must_use]
    pub fn new(
        pool: Arc<WorkerPool>,
        media: Arc<MediaSettings>,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(CONTROLLER_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();

        let actor = RoomControllerActor::new(
            receiver,
            sender.downgrade(),
            cancel_token.clone(),
            pool,
            media,
            metrics,
        );

        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
        }
    }

    /// Return the room for `room_id`, creating it on a pool worker if needed.
    pub async fn get_or_create_room(&self, room_id: String) -> Result<RoomActorHandle, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::GetOrCreateRoom {
                room_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))?
    }

    /// Look up a room without creating it.
    pub async fn get_room(&self, room_id: String) -> Result<Option<RoomActorHandle>, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::GetRoom {
                room_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    /// Remove a room if the registry still holds `instance_id` under `room_id`.
    pub async fn remove_room(&self, room_id: String, instance_id: Uuid) -> Result<bool, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::RemoveRoom {
                room_id,
                instance_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    /// Get the current controller status.
    pub async fn get_status(&self) -> Result<ControllerStatus, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::GetStatus { respond_to: tx })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    /// Initiate graceful shutdown.
    pub async fn shutdown(&self) -> Result<(), SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::Shutdown { respond_to: tx })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    /// Cancel the actor (for immediate shutdown).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Get a child token for spawning child tasks.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

/// Internal state for a managed room.
struct ManagedRoom {
    handle: RoomActorHandle,
    task_handle: JoinHandle<()>,
    created_at: i64,
}

impl ManagedRoom {
    /// A room that was cancelled or whose task ended must not be handed out.
    fn is_live(&self) -> bool {
        !self.handle.is_cancelled() && !self.task_handle.is_finished()
    }
}

/// The `RoomControllerActor` implementation.
pub struct RoomControllerActor {
    receiver: mpsc::Receiver<ControllerMessage>,
    /// Given to rooms so they can report themselves closed.
    self_sender: mpsc::WeakSender<ControllerMessage>,
    /// Cancellation token (root).
    cancel_token: CancellationToken,
    pool: Arc<WorkerPool>,
    media: Arc<MediaSettings>,
    rooms: HashMap<String, ManagedRoom>,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomControllerActor {
    fn new(
        receiver: mpsc::Receiver<ControllerMessage>,
        self_sender: mpsc::WeakSender<ControllerMessage>,
        cancel_token: CancellationToken,
        pool: Arc<WorkerPool>,
        media: Arc<MediaSettings>,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        Self {
            receiver,
            self_sender,
            cancel_token,
            pool,
            media,
            rooms: HashMap::new(),
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Controller, "controller"),
        }
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "sfu.actor.controller", fields(workers = self.pool.len()))]
    async fn run(mut self) {
        info!(
            target: "sfu.actor.controller",
            workers = self.pool.len(),
            "RoomControllerActor started"
        );

        loop {
            // Check for terminated room actors
            self.check_room_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sfu.actor.controller",
                        "RoomControllerActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_received(self.receiver.len());
                            self.handle_message(message);
                            self.mailbox.record_processed();
                            self.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "sfu.actor.controller",
                                "RoomControllerActor channel closed, exiting"
                            );
                            self.graceful_shutdown().await;
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "sfu.actor.controller",
            messages_processed = self.mailbox.messages_processed(),
            "RoomControllerActor stopped"
        );
    }

    /// Handle a single message.
    fn handle_message(&mut self, message: ControllerMessage) {
        match message {
            ControllerMessage::GetOrCreateRoom {
                room_id,
                respond_to,
            } => {
                let result = self.get_or_create_room(room_id);
                let _ = respond_to.send(result);
            }

            ControllerMessage::GetRoom {
                room_id,
                respond_to,
            } => {
                let handle = self
                    .rooms
                    .get(&room_id)
                    .filter(|managed| managed.is_live())
                    .map(|managed| managed.handle.clone());
                let _ = respond_to.send(handle);
            }

            ControllerMessage::RemoveRoom {
                room_id,
                instance_id,
                respond_to,
            } => {
                let removed = self.remove_room(&room_id, instance_id);
                let _ = respond_to.send(removed);
            }

            ControllerMessage::RoomClosed {
                room_id,
                instance_id,
            } => {
                if self.remove_room(&room_id, instance_id) {
                    warn!(
                        target: "sfu.actor.controller",
                        room_id = %room_id,
                        "Room closed itself, removed from registry"
                    );
                }
            }

            ControllerMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.get_status());
            }

            ControllerMessage::Shutdown { respond_to } => {
                info!(
                    target: "sfu.actor.controller",
                    room_count = self.rooms.len(),
                    "Initiating graceful shutdown"
                );
                self.cancel_token.cancel();
                let _ = respond_to.send(());
            }
        }
    }

    fn get_or_create_room(&mut self, room_id: String) -> Result<RoomActorHandle, SfuError> {
        if let Some(managed) = self.rooms.get(&room_id) {
            if managed.is_live() {
                return Ok(managed.handle.clone());
            }
        }

        // A stale entry (room closing or crashed) is replaced.
        if let Some(stale) = self.rooms.remove(&room_id) {
            debug!(
                target: "sfu.actor.controller",
                room_id = %room_id,
                instance_id = %stale.handle.instance_id(),
                "Replacing stale room"
            );
            stale.handle.cancel();
            self.metrics.room_removed();
        }

        let worker = self.pool.acquire()?;
        let worker_id = worker.id();
        let (handle, task_handle) = RoomActor::spawn(
            room_id.clone(),
            worker,
            Arc::clone(&self.media),
            self.self_sender.clone(),
            self.cancel_token.child_token(),
            Arc::clone(&self.metrics),
        );

        self.rooms.insert(
            room_id.clone(),
            ManagedRoom {
                handle: handle.clone(),
                task_handle,
                created_at: chrono::Utc::now().timestamp(),
            },
        );
        self.metrics.room_created();

        info!(
            target: "sfu.actor.controller",
            room_id = %room_id,
            worker_id = %worker_id,
            total_rooms = self.rooms.len(),
            "Room actor created"
        );

        Ok(handle)
    }

    /// Remove `room_id` if it is still `instance_id`.
    ///
    /// Does not wait for the room task; a background task logs how it ended.
    fn remove_room(&mut self, room_id: &str, instance_id: Uuid) -> bool {
        let matches = self
            .rooms
            .get(room_id)
            .is_some_and(|managed| managed.handle.instance_id() == instance_id);
        if !matches {
            return false;
        }
        let Some(managed) = self.rooms.remove(room_id) else {
            return false;
        };

        let ManagedRoom {
            handle,
            task_handle,
            created_at,
        } = managed;
        handle.cancel();
        self.metrics.room_removed();

        let room_id_owned = room_id.to_string();
        tokio::spawn(async move {
            match tokio::time::timeout(Duration::from_secs(5), task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "sfu.actor.controller",
                        room_id = %room_id_owned,
                        "Room actor task completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "sfu.actor.controller",
                        room_id = %room_id_owned,
                        error = ?e,
                        "Room actor task panicked during removal"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "sfu.actor.controller",
                        room_id = %room_id_owned,
                        "Room actor task cleanup timed out"
                    );
                }
            }
        });

        info!(
            target: "sfu.actor.controller",
            room_id = %room_id,
            room_age_secs = chrono::Utc::now().timestamp() - created_at,
            total_rooms = self.rooms.len(),
            "Room actor removed"
        );
        true
    }

    fn get_status(&self) -> ControllerStatus {
        ControllerStatus {
            room_count: self.rooms.len(),
            session_count: self.metrics.session_count(),
            mailbox_depth: self.mailbox.current_depth(),
        }
    }

    async fn graceful_shutdown(&mut self) {
        info!(
            target: "sfu.actor.controller",
            room_count = self.rooms.len(),
            "Performing graceful shutdown"
        );

        for managed in self.rooms.values() {
            managed.handle.cancel();
        }

        for (room_id, managed) in self.rooms.drain() {
            match tokio::time::timeout(ROOM_SHUTDOWN_TIMEOUT, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "sfu.actor.controller",
                        room_id = %room_id,
                        "Room actor completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "sfu.actor.controller",
                        room_id = %room_id,
                        error = ?e,
                        "Room actor task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "sfu.actor.controller",
                        room_id = %room_id,
                        "Room actor shutdown timed out"
                    );
                }
            }
            self.metrics.room_removed();
        }

        info!(
            target: "sfu.actor.controller",
            "Graceful shutdown complete"
        );
    }

    /// Check health of managed room actors.
    async fn check_room_health(&mut self) {
        let finished: Vec<String> = self
            .rooms
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(room_id, _)| room_id.clone())
            .collect();

        for room_id in finished {
            let Some(managed) = self.rooms.remove(&room_id) else {
                continue;
            };
            match managed.task_handle.await {
                Ok(()) => {
                    info!(
                        target: "sfu.actor.controller",
                        room_id = %room_id,
                        "Room actor exited, removed from registry"
                    );
                }
                Err(join_error) => {
                    if join_error.is_panic() {
                        error!(
                            target: "sfu.actor.controller",
                            room_id = %room_id,
                            error = ?join_error,
                            "Room actor panicked - triggering investigation"
                        );
                        self.metrics.record_panic(ActorType::Room);
                    }
                }
            }
            self.metrics.room_removed();
        }
    }
}
