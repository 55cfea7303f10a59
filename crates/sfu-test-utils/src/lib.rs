//! # SFU Test Utilities
//!
//! Shared test utilities for the SFU service.
//!
//! ## Modules
//!
//! - `fixtures` - Configuration and signaling payload builders
//! - `faulty_engine` - Engine wrapper injecting failures and latency
//! - `harness` - A full controller/orchestrator stack on an in-process engine
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sfu_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let harness = TestHarness::start(2).await;
//!     let transport = harness.connected_transport("room-1", "alice").await;
//!
//!     let producer = harness
//!         .orchestrator
//!         .produce("room-1", "alice", transport, MediaKind::Audio, rtp_parameters("audio/opus"), json!({}))
//!         .await
//!         .unwrap();
//! }
//! ```

pub mod faulty_engine;
pub mod fixtures;
pub mod harness;

pub use faulty_engine::*;
pub use fixtures::*;
pub use harness::*;
