//! Client Sessions
//!
//! A session is one connected editor: a room-scoped identity plus two tasks
//! driving its connection. The read unit forwards every inbound message to
//! the room unmodified; the write unit drains the bounded outbound mailbox to
//! the connection in order. Sessions never touch the room registry; when
//! either unit ends they ask the room to unregister them.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::room::RoomEvent;
use crate::transport::{BoxSink, BoxSource};

/// Room-scoped session sequence number, starting at 1 and never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Public identity of a session, as shown in the roster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    /// Session sequence number
    pub id: SessionId,
    /// Display name supplied by the caller
    pub name: String,
    /// Presentation color, `#rrggbb`
    pub color: String,
}

impl UserInfo {
    /// Create an identity with a color derived from the ID
    #[must_use]
    pub fn new(id: SessionId, name: impl Into<String>) -> Self {
        let name = name.into();
        let name = if name.trim().is_empty() {
            "Anonymous".to_string()
        } else {
            name
        };
        Self {
            id,
            name,
            color: color_for(id),
        }
    }
}

/// Stable, visually distinct color for a session ID.
///
/// Hues are spaced by the golden ratio so consecutive joiners differ.
#[must_use]
pub fn color_for(id: SessionId) -> String {
    const GOLDEN_RATIO_CONJUGATE: f64 = 0.618_033_988_749_895;
    let hue = (id.0 as f64 * GOLDEN_RATIO_CONJUGATE).fract();
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.55);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn hsl_to_rgb(h: f64, s: f64, l: f64) -> (f64, f64, f64) {
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f64, q: f64, mut t: f64) -> f64 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Room-side handle to a running session
#[derive(Debug)]
pub struct SessionHandle {
    info: UserInfo,
    mailbox: mpsc::Sender<Arc<str>>,
    cancel: CancellationToken,
}

impl SessionHandle {
    /// Start the read and write units of a session.
    ///
    /// Called from the room control loop only.
    pub(crate) fn attach(
        info: UserInfo,
        sink: BoxSink,
        source: BoxSource,
        events: mpsc::Sender<RoomEvent>,
        mailbox_capacity: usize,
        close_timeout: Duration,
    ) -> Self {
        let (mailbox, outbox) = mpsc::channel(mailbox_capacity.max(2));
        let cancel = CancellationToken::new();

        tokio::spawn(read_unit(info.id, source, events.clone(), cancel.clone()));
        tokio::spawn(write_unit(info.id, sink, outbox, events, cancel.clone(), close_timeout));

        Self {
            info,
            mailbox,
            cancel,
        }
    }

    /// Public identity
    #[must_use]
    pub fn info(&self) -> &UserInfo {
        &self.info
    }

    /// Session ID
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.info.id
    }

    /// Enqueue an outbound message without waiting.
    ///
    /// A full mailbox marks the session unresponsive: it is closed and
    /// `MailboxFull` is returned so the room can unregister it.
    pub fn send(&self, message: Arc<str>) -> Result<()> {
        match self.mailbox.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.close();
                Err(Error::MailboxFull(self.info.id.0))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::ConnectionClosed),
        }
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Whether the session has been closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

async fn read_unit(
    id: SessionId,
    mut source: BoxSource,
    events: mpsc::Sender<RoomEvent>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = source.recv() => next,
        };
        let raw = match next {
            Some(Ok(raw)) => raw,
            Some(Err(e)) => {
                warn!(session_id = %id, error = %e, "Read failed, disconnecting");
                break;
            }
            None => {
                debug!(session_id = %id, "Peer closed connection");
                break;
            }
        };
        let forwarded = tokio::select! {
            _ = cancel.cancelled() => break,
            res = events.send(RoomEvent::Inbound { from: id, raw }) => res,
        };
        if forwarded.is_err() {
            break;
        }
    }

    cancel.cancel();
    let _ = events.send(RoomEvent::Unregister { id }).await;
}

async fn write_unit(
    id: SessionId,
    mut sink: BoxSink,
    mut outbox: mpsc::Receiver<Arc<str>>,
    events: mpsc::Sender<RoomEvent>,
    cancel: CancellationToken,
    close_timeout: Duration,
) {
    loop {
        let text = tokio::select! {
            _ = cancel.cancelled() => break,
            next = outbox.recv() => match next {
                Some(text) => text,
                None => break,
            },
        };
        let written = tokio::select! {
            _ = cancel.cancelled() => break,
            res = sink.send(text) => res,
        };
        if let Err(e) = written {
            warn!(session_id = %id, error = %e, "Write failed, disconnecting");
            break;
        }
    }

    cancel.cancel();
    if tokio::time::timeout(close_timeout, sink.close()).await.is_err() {
        debug!(session_id = %id, "Timed out closing connection");
    }
    let _ = events.send(RoomEvent::Unregister { id }).await;
}
