//! Slot holding the one active tunnel session.
//!
//! A newly authenticated Offramp supersedes whatever session was there;
//! the old session is closed and its streams fail.

use std::sync::Arc;
use std::time::Duration;

use apitunnel_core::{AuthState, TunnelSession};
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

/// Point-in-time view of the active session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: Uuid,
    pub auth_state: AuthState,
    pub active_streams: usize,
    pub connected_for: Duration,
    pub idle_for: Duration,
}

impl SessionInfo {
    fn of(session: &TunnelSession) -> Self {
        Self {
            id: session.id(),
            auth_state: session.auth_state(),
            active_streams: session.active_streams(),
            connected_for: session.created_at().elapsed(),
            idle_for: session.last_activity().elapsed(),
        }
    }
}

/// Thread-safe holder of the active session.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    current: Arc<RwLock<Option<TunnelSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `session` the active one, closing any session it replaces.
    pub async fn install(&self, session: TunnelSession) {
        let previous = self.current.write().await.replace(session.clone());
        if let Some(previous) = previous
            && previous.id() != session.id()
        {
            info!(
                old_session = %previous.id(),
                new_session = %session.id(),
                open_streams = previous.active_streams(),
                "Superseding tunnel session"
            );
            previous.close("superseded");
        }
        info!(session = %session.id(), "Tunnel session active");
    }

    /// Clear the slot if `id` still occupies it.
    pub async fn remove(&self, id: Uuid) -> bool {
        let mut current = self.current.write().await;
        if current.as_ref().is_some_and(|s| s.id() == id) {
            *current = None;
            info!(session = %id, "Tunnel session removed");
            true
        } else {
            false
        }
    }

    /// The active session, if one is connected and still open.
    pub async fn current(&self) -> Option<TunnelSession> {
        self.current
            .read()
            .await
            .as_ref()
            .filter(|s| !s.is_closed())
            .cloned()
    }

    pub async fn is_connected(&self) -> bool {
        self.current().await.is_some()
    }

    pub async fn info(&self) -> Option<SessionInfo> {
        self.current().await.as_ref().map(SessionInfo::of)
    }

    /// Close the active session, if any.
    pub async fn shutdown(&self, reason: &str) {
        if let Some(session) = self.current.write().await.take() {
            session.close(reason);
        }
    }
}
