//! Actor model implementation for the SFU orchestration layer.
//!
//! ```text
//! RoomControllerActor (singleton)
//! └── supervises N RoomActors
//!     └── RoomActor (one per room, owns the router and producer directory)
//!         └── supervises N ClientSessionActors
//!             └── ClientSessionActor (one per client, owns transports/producers/consumers)
//! ```
//!
//! # Key Design Decisions
//!
//! - **Per-key mutual exclusion**: the controller mailbox serializes room creation, the room
//!   mailbox serializes session creation, the session mailbox serializes resource mutations
//! - **Engine events are messages**: close events are forwarded into the owning session's
//!   mailbox and applied like any request
//! - **No upward awaits**: the controller never awaits rooms and rooms never await sessions
//! - **CancellationToken propagation**: parents pass child tokens for shutdown
//!
//! # Modules
//!
//! - [`controller`] - `RoomControllerActor`, the room registry
//! - [`room`] - `RoomActor` per room
//! - [`session`] - `ClientSessionActor` per client
//! - [`messages`] - Message types for actor communication
//! - [`metrics`] - Mailbox monitoring and actor metrics

pub mod controller;
pub mod messages;
pub mod metrics;
pub mod room;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

// Re-export primary types
pub use controller::{RoomControllerActor, RoomControllerActorHandle};
pub use messages::*;
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
pub use room::{RoomActor, RoomActorHandle, RoomLink};
pub use session::{
    ClientSessionActor, ClientSessionActorHandle, ConsumerMeta, ProducerMeta, RetireCause,
    TransportMeta,
};
