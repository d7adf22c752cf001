//! Blockgraph Collab - Real-time Collaborative Editing Hub
//!
//! This crate lets several users edit the same model-design canvas at once
//! and see each other's changes and cursors live:
//! - Protocol: collaboration message types and discriminator routing
//! - Document: in-memory graph of blocks and edges
//! - Transport: abstract duplex connection, with axum WebSocket and
//!   in-memory adapters
//! - Session: per-connection read/write units and ephemeral identity
//! - Room: single-writer control loop owning one document
//! - Hub: registry of rooms keyed by document identifier
//! - Config: mailbox, queue and eviction settings
//! - Error: error types for collaboration operations
//!
//! ## Ordering
//!
//! Each room handles registrations, departures and messages one at a time
//! on its own task, so every member observes the same mutation order.
//! Mutations are relayed to everyone except their sender, who is expected
//! to have applied them locally already.
//!
//! ## Usage
//!
//! ```ignore
//! use blockgraph_collab::{EmptySnapshot, Hub, HubConfig};
//! use std::sync::Arc;
//!
//! let hub = Arc::new(Hub::new(HubConfig::default()));
//!
//! // In a WebSocket upgrade callback:
//! let user = hub
//!     .connect_or_load(&project_key, &EmptySnapshot, socket, display_name)
//!     .await?;
//! ```
//!
//! ## Configuration
//!
//! ```toml
//! [hub]
//! mailbox_capacity = 256
//! room_queue_capacity = 1024
//! # idle_eviction_secs = 3600
//! eviction_interval_secs = 60
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod document;
pub mod error;
pub mod hub;
pub mod protocol;
pub mod room;
pub mod session;
pub mod transport;

// Re-export main types
pub use config::HubConfig;
pub use document::{Block, Document, Edge, Edit, Element, Position};
pub use error::{Error, Result};
pub use hub::{EmptySnapshot, Hub, SnapshotLoader};
pub use protocol::{decode, decode_as, peek_kind, Decoded, Message, MessageKind};
pub use room::{RoomHandle, RoomStats};
pub use session::{SessionId, UserInfo};
pub use transport::memory::{memory_pair, MemoryConnection, MemoryPeer};
pub use transport::{Connection, MessageSink, MessageSource};
