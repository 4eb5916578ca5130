use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::protocol::Frame;

/// One live controller connection. The writer mutex is the session's
/// exclusive write lock: concurrently firing delivery tasks serialize here
/// instead of interleaving partial frames.
pub struct Session {
    id: Uuid,
    writer: Mutex<SplitSink<WebSocket, Message>>,
}

impl Session {
    pub fn new(writer: SplitSink<WebSocket, Message>) -> Self {
        Self {
            id: Uuid::new_v4(),
            writer: Mutex::new(writer),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Writes one frame. A failed write is logged and swallowed; only the
    /// read loop decides that the controller is gone.
    pub async fn send(&self, frame: &Frame) {
        let payload = match serde_json::to_string(frame) {
            Ok(json) => json,
            Err(err) => {
                error!(error = %err, "unable to encode frame");
                return;
            }
        };

        let mut writer = self.writer.lock().await;
        if let Err(err) = writer.send(Message::Text(payload)).await {
            error!(session = %self.id, error = %err, "unable to write frame to controller");
        } else {
            debug!(session = %self.id, op = ?frame.op, "wrote frame to controller");
        }
    }
}

/// Holder of the single active session. Installing a new session replaces
/// the reference wholesale; the superseded transport, if still open, is left
/// to its own read loop to wind down.
#[derive(Clone, Default)]
pub struct SessionSlot {
    active: Arc<RwLock<Option<Arc<Session>>>>,
}

impl SessionSlot {
    pub fn install(&self, session: Arc<Session>) -> Uuid {
        let id = session.id();
        let previous = self.active.write().unwrap().replace(session);
        if let Some(previous) = previous {
            warn!(superseded = %previous.id(), session = %id, "controller session superseded");
        }
        id
    }

    /// Clears the slot only while `id` is still the installed session, so a
    /// superseded session's read loop cannot evict its successor. Returns
    /// whether the slot was cleared.
    pub fn clear_if_current(&self, id: Uuid) -> bool {
        let mut active = self.active.write().unwrap();
        if active.as_ref().is_some_and(|session| session.id() == id) {
            *active = None;
            true
        } else {
            false
        }
    }

    pub fn has_session(&self) -> bool {
        self.active.read().unwrap().is_some()
    }

    pub fn is_current(&self, id: Uuid) -> bool {
        self.active
            .read()
            .unwrap()
            .as_ref()
            .is_some_and(|session| session.id() == id)
    }

    pub fn current(&self) -> Option<Arc<Session>> {
        self.active.read().unwrap().clone()
    }

    /// Sends through the active session, if any.
    pub async fn send(&self, frame: &Frame) {
        match self.current() {
            Some(session) => session.send(frame).await,
            None => warn!(op = ?frame.op, "no controller session; frame dropped"),
        }
    }
}
