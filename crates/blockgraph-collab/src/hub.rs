//! Room registry
//!
//! The hub maps room keys to running rooms. Lookup and creation go through a
//! single guarded map so two simultaneous first connections to the same key
//! end up in the same room. Inside a room everything is single-writer; the
//! map is the only state shared across connections.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HubConfig;
use crate::document::Document;
use crate::error::{Error, Result};
use crate::room::RoomHandle;
use crate::session::UserInfo;
use crate::transport::{split_boxed, Connection};

/// Source of a room's initial document, consulted only when the room is new
#[async_trait]
pub trait SnapshotLoader: Send + Sync {
    /// Produce the starting document for `room_key`
    async fn load(&self, room_key: &str) -> Result<Document>;
}

#[async_trait]
impl SnapshotLoader for Document {
    async fn load(&self, _room_key: &str) -> Result<Document> {
        Ok(self.clone())
    }
}

/// Loader that seeds every room with an empty document
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptySnapshot;

#[async_trait]
impl SnapshotLoader for EmptySnapshot {
    async fn load(&self, _room_key: &str) -> Result<Document> {
        Ok(Document::new())
    }
}

/// Process-wide directory of rooms
pub struct Hub {
    rooms: Mutex<HashMap<String, RoomHandle>>,
    config: HubConfig,
}

impl Hub {
    /// Create an empty hub
    #[must_use]
    pub fn new(config: HubConfig) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Hub configuration
    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Join `room_key`, creating the room from `initial` if it does not exist
    pub async fn connect_or_create<C: Connection>(
        &self,
        room_key: &str,
        initial: Document,
        conn: C,
        name: impl Into<String>,
    ) -> Result<UserInfo> {
        self.connect_or_load(room_key, &initial, conn, name).await
    }

    /// Join `room_key`, creating the room from `loader` if it does not exist.
    ///
    /// The loader runs outside the registry lock. If another connection
    /// creates the room meanwhile, the loaded document is discarded. Nothing
    /// is awaited while the lock is held.
    pub async fn connect_or_load<C, L>(
        &self,
        room_key: &str,
        loader: &L,
        conn: C,
        name: impl Into<String>,
    ) -> Result<UserInfo>
    where
        C: Connection,
        L: SnapshotLoader + ?Sized,
    {
        let (sink, source) = split_boxed(conn);
        let mut seed: Option<Document> = None;

        let (room, ticket) = loop {
            if seed.is_none() && self.room(room_key).await.is_none() {
                seed = Some(loader.load(room_key).await?);
            }

            let mut rooms = self.rooms.lock().await;
            if let Some(room) = rooms.get(room_key).filter(|room| !room.is_closed()) {
                if seed.is_some() {
                    debug!(room_key, "Room created concurrently, discarding loaded snapshot");
                }
                // Admitted under the lock so eviction cannot slip between
                // lookup and join.
                break (room.clone(), room.admit());
            }
            if let Some(document) = seed.take() {
                let room = RoomHandle::spawn(room_key, document, &self.config);
                let ticket = room.admit();
                rooms.insert(room_key.to_string(), room.clone());
                info!(room_key, rooms = rooms.len(), "Room created");
                break (room, ticket);
            }
            // The room went away after the first lookup; load again unlocked.
        };

        let reply = room
            .enqueue_register(name.into(), sink, source, ticket)
            .await?;
        reply
            .await
            .map_err(|_| Error::RoomClosed(room_key.to_string()))
    }

    /// Look up a running room
    pub async fn room(&self, room_key: &str) -> Option<RoomHandle> {
        let rooms = self.rooms.lock().await;
        rooms.get(room_key).filter(|room| !room.is_closed()).cloned()
    }

    /// Keys of all registered rooms, sorted
    pub async fn room_keys(&self) -> Vec<String> {
        let rooms = self.rooms.lock().await;
        let mut keys: Vec<String> = rooms.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of registered rooms
    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.len()
    }

    /// Tear a room down explicitly. Returns whether it existed.
    pub async fn close_room(&self, room_key: &str) -> bool {
        let room = self.rooms.lock().await.remove(room_key);
        match room {
            Some(room) => {
                room.shutdown().await;
                info!(room_key, "Room closed");
                true
            }
            None => false,
        }
    }

    /// Tear down rooms that have had no members for at least `max_idle`.
    ///
    /// Rooms with a join in flight are kept. Returns the evicted keys, sorted.
    pub async fn evict_idle(&self, max_idle: Duration) -> Vec<String> {
        let removed: Vec<RoomHandle> = {
            let mut rooms = self.rooms.lock().await;
            let keys: Vec<String> = rooms
                .iter()
                .filter(|(_, room)| room.is_closed() || room.is_idle_for(max_idle))
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter().filter_map(|key| rooms.remove(key)).collect()
        };

        let mut evicted = Vec::with_capacity(removed.len());
        for room in removed {
            room.shutdown().await;
            info!(room_key = %room.key(), "Evicted idle room");
            evicted.push(room.key().to_string());
        }
        evicted.sort();
        evicted
    }

    /// Run `evict_idle` periodically when idle eviction is configured.
    ///
    /// Returns `None` when rooms are kept forever.
    pub fn spawn_idle_eviction(self: &Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let max_idle = self.config.idle_eviction()?;
        let period = self.config.eviction_interval();
        let hub = Arc::clone(self);

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = hub.evict_idle(max_idle).await;
                        if !evicted.is_empty() {
                            debug!(count = evicted.len(), "Idle sweep evicted rooms");
                        }
                    }
                }
            }
        }))
    }

    /// Tear down every room
    pub async fn shutdown(&self) {
        let rooms: Vec<RoomHandle> = self.rooms.lock().await.drain().map(|(_, r)| r).collect();
        if !rooms.is_empty() {
            warn!(count = rooms.len(), "Shutting down rooms");
        }
        for room in rooms {
            room.shutdown().await;
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}
