//! Room control loop
//!
//! A room owns one document and the sessions editing it. Every registration,
//! unregistration and inbound message goes through a single queue and is
//! handled to completion before the next, so all sessions observe the same
//! mutation order and the document never has more than one writer.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::HubConfig;
use crate::document::Document;
use crate::error::{Error, Result};
use crate::protocol::{self, Message, MessageKind};
use crate::session::{SessionHandle, SessionId, UserInfo};
use crate::transport::{split_boxed, BoxSink, BoxSource, Connection};

/// Events processed by a room's control loop
pub(crate) enum RoomEvent {
    /// Attach a new session
    Register {
        name: String,
        sink: BoxSink,
        source: BoxSource,
        reply: oneshot::Sender<UserInfo>,
        ticket: JoinTicket,
    },
    /// Detach a session
    Unregister { id: SessionId },
    /// Raw message read from a session
    Inbound { from: SessionId, raw: String },
    /// Read the current document
    Document {
        reply: oneshot::Sender<(Document, u64)>,
    },
    /// Read room statistics
    Stats { reply: oneshot::Sender<RoomStats> },
    /// Close every session and stop the loop
    Shutdown,
}

impl fmt::Debug for RoomEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Register { name, .. } => f.debug_struct("Register").field("name", name).finish(),
            Self::Unregister { id } => f.debug_struct("Unregister").field("id", id).finish(),
            Self::Inbound { from, raw } => f
                .debug_struct("Inbound")
                .field("from", from)
                .field("raw", raw)
                .finish(),
            Self::Document { .. } => f.write_str("Document"),
            Self::Stats { .. } => f.write_str("Stats"),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

const OCCUPIED: i64 = i64::MIN;

/// Membership counters a room publishes for the hub's eviction sweep.
///
/// Written by the control loop only; read without a round trip.
#[derive(Debug)]
pub(crate) struct Occupancy {
    members: AtomicUsize,
    joining: AtomicUsize,
    /// Epoch millis when the room last became empty, or `OCCUPIED`
    idle_since_ms: AtomicI64,
}

impl Occupancy {
    fn new() -> Self {
        Self {
            members: AtomicUsize::new(0),
            joining: AtomicUsize::new(0),
            idle_since_ms: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }

    fn set_members(&self, members: usize) {
        self.members.store(members, Ordering::SeqCst);
        if members == 0 {
            let _ = self.idle_since_ms.compare_exchange(
                OCCUPIED,
                Utc::now().timestamp_millis(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        } else {
            self.idle_since_ms.store(OCCUPIED, Ordering::SeqCst);
        }
    }

    fn idle_since(&self) -> Option<DateTime<Utc>> {
        match self.idle_since_ms.load(Ordering::SeqCst) {
            OCCUPIED => None,
            millis => DateTime::from_timestamp_millis(millis),
        }
    }

    /// No members, no registration in flight, and empty for at least `max_idle`
    fn is_idle_for(&self, max_idle: Duration) -> bool {
        if self.joining.load(Ordering::SeqCst) > 0 || self.members.load(Ordering::SeqCst) > 0 {
            return false;
        }
        match self.idle_since() {
            Some(since) => (Utc::now() - since)
                .to_std()
                .map(|idle| idle >= max_idle)
                .unwrap_or(max_idle.is_zero()),
            None => false,
        }
    }
}

/// A registration in flight. The room cannot be evicted while one is alive.
#[derive(Debug)]
pub(crate) struct JoinTicket(Arc<Occupancy>);

impl Drop for JoinTicket {
    fn drop(&mut self) {
        self.0.joining.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Point-in-time statistics of a room
#[derive(Debug, Clone, Serialize)]
pub struct RoomStats {
    /// Room key
    pub room_key: String,
    /// Registered sessions
    pub members: usize,
    /// Mutations applied so far
    pub version: u64,
    /// Elements in the document
    pub element_count: usize,
    /// When the room was created
    pub created_at: DateTime<Utc>,
    /// When the last member left (`None` while occupied)
    pub idle_since: Option<DateTime<Utc>>,
}

/// Handle to a running room
#[derive(Debug, Clone)]
pub struct RoomHandle {
    key: Arc<str>,
    events: mpsc::Sender<RoomEvent>,
    occupancy: Arc<Occupancy>,
}

impl RoomHandle {
    /// Create a room seeded with `document` and start its control loop.
    ///
    /// Duplicate element IDs in the seed collapse to their last value.
    #[must_use]
    pub fn spawn(key: impl Into<String>, mut document: Document, config: &HubConfig) -> Self {
        let key: Arc<str> = Arc::from(key.into());
        let before = document.element_count();
        document.dedup_ids();
        if document.element_count() != before {
            warn!(
                room_key = %key,
                dropped = before - document.element_count(),
                "Seed document repeated element IDs"
            );
        }

        let (events, rx) = mpsc::channel(config.room_queue_capacity.max(1));
        let occupancy = Arc::new(Occupancy::new());
        let room = Room {
            key: key.clone(),
            document,
            version: 0,
            sessions: BTreeMap::new(),
            next_id: 0,
            events_tx: events.downgrade(),
            events: rx,
            mailbox_capacity: config.effective_mailbox_capacity(),
            close_timeout: config.close_timeout(),
            created_at: Utc::now(),
            occupancy: occupancy.clone(),
        };
        tokio::spawn(room.run());
        Self {
            key,
            events,
            occupancy,
        }
    }

    /// Room key
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether the control loop has exited
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }

    /// Whether the room can be evicted
    pub(crate) fn is_idle_for(&self, max_idle: Duration) -> bool {
        self.occupancy.is_idle_for(max_idle)
    }

    /// Reserve a registration slot; see [`JoinTicket`]
    pub(crate) fn admit(&self) -> JoinTicket {
        self.occupancy.joining.fetch_add(1, Ordering::SeqCst);
        JoinTicket(self.occupancy.clone())
    }

    fn closed(&self) -> Error {
        Error::RoomClosed(self.key.to_string())
    }

    /// Queue a registration; the receiver resolves once the session is in
    /// the registry.
    pub(crate) async fn enqueue_register(
        &self,
        name: String,
        sink: BoxSink,
        source: BoxSource,
        ticket: JoinTicket,
    ) -> Result<oneshot::Receiver<UserInfo>> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(RoomEvent::Register {
                name,
                sink,
                source,
                reply,
                ticket,
            })
            .await
            .map_err(|_| self.closed())?;
        Ok(rx)
    }

    /// Attach a connection to this room and wait for its identity
    pub async fn join<C: Connection>(&self, conn: C, name: impl Into<String>) -> Result<UserInfo> {
        let (sink, source) = split_boxed(conn);
        let ticket = self.admit();
        let rx = self.enqueue_register(name.into(), sink, source, ticket).await?;
        rx.await.map_err(|_| self.closed())
    }

    /// Current document and version, in loop order
    pub async fn document(&self) -> Result<(Document, u64)> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(RoomEvent::Document { reply })
            .await
            .map_err(|_| self.closed())?;
        rx.await.map_err(|_| self.closed())
    }

    /// Current statistics, in loop order
    pub async fn stats(&self) -> Result<RoomStats> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(RoomEvent::Stats { reply })
            .await
            .map_err(|_| self.closed())?;
        rx.await.map_err(|_| self.closed())
    }

    /// Close every session and stop the control loop
    pub async fn shutdown(&self) {
        let _ = self.events.send(RoomEvent::Shutdown).await;
    }
}

struct Room {
    key: Arc<str>,
    document: Document,
    version: u64,
    sessions: BTreeMap<SessionId, SessionHandle>,
    next_id: u64,
    events_tx: mpsc::WeakSender<RoomEvent>,
    events: mpsc::Receiver<RoomEvent>,
    mailbox_capacity: usize,
    close_timeout: Duration,
    created_at: DateTime<Utc>,
    occupancy: Arc<Occupancy>,
}

impl Room {
    async fn run(mut self) {
        info!(room_key = %self.key, elements = self.document.element_count(), "Room started");

        while let Some(event) = self.events.recv().await {
            match event {
                RoomEvent::Register {
                    name,
                    sink,
                    source,
                    reply,
                    ticket,
                } => {
                    self.on_register(name, sink, source, reply);
                    drop(ticket);
                }
                RoomEvent::Unregister { id } => self.drop_sessions(vec![id]),
                RoomEvent::Inbound { from, raw } => self.on_inbound(from, raw),
                RoomEvent::Document { reply } => {
                    let _ = reply.send((self.document.clone(), self.version));
                }
                RoomEvent::Stats { reply } => {
                    let _ = reply.send(self.stats());
                }
                RoomEvent::Shutdown => break,
            }
        }

        for session in self.sessions.values() {
            session.close();
        }
        info!(room_key = %self.key, version = self.version, "Room terminated");
    }

    fn stats(&self) -> RoomStats {
        RoomStats {
            room_key: self.key.to_string(),
            members: self.sessions.len(),
            version: self.version,
            element_count: self.document.element_count(),
            created_at: self.created_at,
            idle_since: self.occupancy.idle_since(),
        }
    }

    fn on_register(
        &mut self,
        name: String,
        sink: BoxSink,
        source: BoxSource,
        reply: oneshot::Sender<UserInfo>,
    ) {
        let Some(events) = self.events_tx.upgrade() else {
            return;
        };

        self.next_id += 1;
        let info = UserInfo::new(SessionId(self.next_id), name);
        let session = SessionHandle::attach(
            info.clone(),
            sink,
            source,
            events,
            self.mailbox_capacity,
            self.close_timeout,
        );
        self.sessions.insert(info.id, session);
        self.occupancy.set_members(self.sessions.len());
        info!(
            room_key = %self.key,
            session_id = %info.id,
            name = %info.name,
            members = self.sessions.len(),
            "Session joined"
        );

        let mut failed = self.broadcast_roster();

        let welcome = Message::UserCreated {
            user: info.clone(),
            document: self.document.clone(),
            version: self.version,
        };
        match welcome.encode() {
            Ok(text) => {
                if let Some(session) = self.sessions.get(&info.id) {
                    if let Err(e) = session.send(Arc::from(text)) {
                        warn!(room_key = %self.key, session_id = %info.id, error = %e, "Failed to deliver snapshot");
                        failed.push(info.id);
                    }
                }
            }
            Err(e) => error!(room_key = %self.key, error = %e, "Failed to encode snapshot"),
        }

        let _ = reply.send(info);
        self.drop_sessions(failed);
    }

    fn on_inbound(&mut self, from: SessionId, raw: String) {
        if !self.sessions.contains_key(&from) {
            debug!(room_key = %self.key, session_id = %from, "Dropping message from detached session");
            return;
        }

        let kind = match protocol::peek_kind(&raw) {
            Ok(kind) => kind,
            Err(e) => {
                warn!(room_key = %self.key, session_id = %from, code = e.code(), error = %e, "Dropping undecodable message");
                return;
            }
        };

        if kind.is_server_only() {
            let e = Error::ProtocolViolation(kind.to_string());
            warn!(room_key = %self.key, session_id = %from, code = e.code(), error = %e, "Dropping message");
            return;
        }

        if kind.is_mutating() {
            let edit = match protocol::decode_as(&kind, &raw) {
                Ok(message) => message.into_edit(),
                Err(e) => {
                    warn!(room_key = %self.key, session_id = %from, code = e.code(), error = %e, "Dropping undecodable message");
                    return;
                }
            };
            if let Some(edit) = edit {
                let changed = self.document.apply(edit);
                self.version += 1;
                debug!(
                    room_key = %self.key,
                    session_id = %from,
                    kind = %kind,
                    changed,
                    version = self.version,
                    "Applied mutation"
                );
            }
        } else if let MessageKind::Unknown(name) = &kind {
            debug!(room_key = %self.key, session_id = %from, kind = %name, "Relaying unrecognized message");
        }

        let failed = self.fan_out(&Arc::from(raw), Some(from));
        self.drop_sessions(failed);
    }

    /// Enqueue `text` for every session except `except`; returns the sessions
    /// that could not take it.
    fn fan_out(&self, text: &Arc<str>, except: Option<SessionId>) -> Vec<SessionId> {
        self.sessions
            .iter()
            .filter(|(id, _)| Some(**id) != except)
            .filter_map(|(id, session)| match session.send(text.clone()) {
                Ok(()) => None,
                Err(e) => {
                    warn!(room_key = %self.key, session_id = %id, error = %e, "Disconnecting unresponsive session");
                    Some(*id)
                }
            })
            .collect()
    }

    fn broadcast_roster(&self) -> Vec<SessionId> {
        let users = self.sessions.values().map(|s| s.info().clone()).collect();
        match Message::roster(users).encode() {
            Ok(text) => self.fan_out(&Arc::from(text), None),
            Err(e) => {
                error!(room_key = %self.key, error = %e, "Failed to encode roster");
                Vec::new()
            }
        }
    }

    /// Remove sessions and announce the new roster. Sessions that fail to
    /// take the roster are removed in turn.
    fn drop_sessions(&mut self, mut pending: Vec<SessionId>) {
        while !pending.is_empty() {
            let mut removed = false;
            for id in pending.drain(..) {
                if let Some(session) = self.sessions.remove(&id) {
                    session.close();
                    removed = true;
                    info!(
                        room_key = %self.key,
                        session_id = %id,
                        members = self.sessions.len(),
                        "Session left"
                    );
                }
            }
            if removed {
                pending = self.broadcast_roster();
            }
        }

        self.occupancy.set_members(self.sessions.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Block, Position};
    use crate::transport::memory::memory_pair;

    #[tokio::test]
    async fn test_join_assigns_sequential_ids() {
        let room = RoomHandle::spawn("proj-1", Document::new(), &HubConfig::default());
        let (a, _pa) = memory_pair(16);
        let (b, _pb) = memory_pair(16);

        assert_eq!(room.join(a, "ada").await.unwrap().id, SessionId(1));
        assert_eq!(room.join(b, "grace").await.unwrap().id, SessionId(2));

        let stats = room.stats().await.unwrap();
        assert_eq!(stats.members, 2);
        assert!(stats.idle_since.is_none());
    }

    #[tokio::test]
    async fn test_ids_are_not_reused() {
        let room = RoomHandle::spawn("proj-1", Document::new(), &HubConfig::default());
        let (a, mut pa) = memory_pair(16);
        room.join(a, "ada").await.unwrap();
        pa.disconnect();

        // Wait for the unregister to land.
        loop {
            if room.stats().await.unwrap().members == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }

        let (b, _pb) = memory_pair(16);
        assert_eq!(room.join(b, "grace").await.unwrap().id, SessionId(2));
    }

    #[tokio::test]
    async fn test_seed_document_is_served() {
        let seed = Document::with_elements(vec![Block::new("b1", Position::default()).into()]);
        let room = RoomHandle::spawn("proj-1", seed.clone(), &HubConfig::default());
        let (document, version) = room.document().await.unwrap();
        assert_eq!(document, seed);
        assert_eq!(version, 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_sessions() {
        let room = RoomHandle::spawn("proj-1", Document::new(), &HubConfig::default());
        let (a, mut pa) = memory_pair(16);
        room.join(a, "ada").await.unwrap();
        assert!(pa.recv().await.unwrap().contains("user_joined_list"));
        assert!(pa.recv().await.unwrap().contains("user_created"));

        room.shutdown().await;

        assert!(pa.recv().await.is_none());
        assert!(room.stats().await.is_err());
        assert!(room.is_closed());
    }

    #[tokio::test]
    async fn test_seed_with_repeated_ids_is_deduplicated() {
        let seed: Document = serde_json::from_value(serde_json::json!({
            "elements": [
                { "id": "b1", "label": "first" },
                { "id": "b1", "label": "second" }
            ]
        }))
        .unwrap();
        let room = RoomHandle::spawn("proj-1", seed, &HubConfig::default());

        let (document, _) = room.document().await.unwrap();
        let ids: Vec<&str> = document.elements.iter().map(|e| e.id()).collect();
        assert_eq!(ids, vec!["b1"]);
        assert_eq!(document.get_block("b1").unwrap().label.as_deref(), Some("second"));
    }

    #[test]
    fn test_occupancy_idle_tracking() {
        let occupancy = Arc::new(Occupancy::new());
        assert!(occupancy.is_idle_for(Duration::ZERO));
        assert!(!occupancy.is_idle_for(Duration::from_secs(600)));

        occupancy.set_members(1);
        assert!(occupancy.idle_since().is_none());
        assert!(!occupancy.is_idle_for(Duration::ZERO));

        occupancy.set_members(0);
        assert!(occupancy.is_idle_for(Duration::ZERO));
    }

    #[tokio::test]
    async fn test_pending_join_blocks_idle() {
        let room = RoomHandle::spawn("proj-1", Document::new(), &HubConfig::default());
        assert!(room.is_idle_for(Duration::ZERO));

        let ticket = room.admit();
        assert!(!room.is_idle_for(Duration::ZERO));
        drop(ticket);
        assert!(room.is_idle_for(Duration::ZERO));
    }
}
