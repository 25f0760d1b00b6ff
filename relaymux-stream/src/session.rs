//! Registry of live protocol sessions.
//!
//! Protocol servers register each connection/session here so the admin API
//! can enumerate and evict them. The registry never owns the connections:
//! kicking cancels the session's token and the owning server tears it down.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use relaymux_core::{Error, Result};

/// Kind of session, one per protocol inventory endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionKind {
    RtspConn,
    RtspSession,
    RtmpConn,
    SrtConn,
    WebrtcSession,
    HlsMuxer,
}

impl SessionKind {
    /// Whether this kind supports forced eviction.
    #[must_use]
    pub const fn kickable(&self) -> bool {
        !matches!(self, Self::RtspConn | Self::HlsMuxer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Idle,
    Publish,
    Read,
}

/// Snapshot of one session, as served by the admin API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: Uuid,
    pub created: DateTime<Utc>,
    pub remote_addr: String,
    pub state: SessionState,
    pub path: String,
    pub query: String,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

struct SessionEntry {
    kind: SessionKind,
    info: SessionInfo,
    token: CancellationToken,
}

/// Concurrent id→session map shared between protocol servers and the API.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<Uuid, SessionEntry>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session; the returned token is cancelled on kick.
    pub fn register(
        &self,
        kind: SessionKind,
        id: Uuid,
        remote_addr: String,
    ) -> CancellationToken {
        let token = CancellationToken::new();
        self.sessions.insert(
            id,
            SessionEntry {
                kind,
                info: SessionInfo {
                    id,
                    created: Utc::now(),
                    remote_addr,
                    state: SessionState::Idle,
                    path: String::new(),
                    query: String::new(),
                    bytes_received: 0,
                    bytes_sent: 0,
                },
                token: token.clone(),
            },
        );
        token
    }

    /// Update the mutable part of a session (state transition, counters).
    pub fn update<F>(&self, id: Uuid, f: F)
    where
        F: FnOnce(&mut SessionInfo),
    {
        if let Some(mut entry) = self.sessions.get_mut(&id) {
            f(&mut entry.info);
        }
    }

    pub fn unregister(&self, id: Uuid) {
        self.sessions.remove(&id);
    }

    /// Sessions of one kind, sorted by creation time.
    #[must_use]
    pub fn list(&self, kind: SessionKind) -> Vec<SessionInfo> {
        let mut out: Vec<SessionInfo> = self
            .sessions
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.info.clone())
            .collect();
        out.sort_by_key(|s| s.created);
        out
    }

    pub fn get(&self, kind: SessionKind, id: Uuid) -> Result<SessionInfo> {
        match self.sessions.get(&id) {
            Some(entry) if entry.kind == kind => Ok(entry.info.clone()),
            _ => Err(Error::NotFound(format!("session {id} not found"))),
        }
    }

    /// Forcibly close a session by cancelling its token. The owning server
    /// unregisters it during teardown.
    pub fn kick(&self, kind: SessionKind, id: Uuid) -> Result<()> {
        match self.sessions.get(&id) {
            Some(entry) if entry.kind == kind => {
                entry.token.cancel();
                Ok(())
            }
            _ => Err(Error::NotFound(format!("session {id} not found"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_list_unregister() {
        let registry = SessionRegistry::new();
        let id = Uuid::new_v4();
        registry.register(SessionKind::RtmpConn, id, "10.0.0.1:4321".to_string());

        assert_eq!(registry.list(SessionKind::RtmpConn).len(), 1);
        assert!(registry.list(SessionKind::SrtConn).is_empty());

        registry.unregister(id);
        assert!(registry.list(SessionKind::RtmpConn).is_empty());
    }

    #[test]
    fn test_get_requires_matching_kind() {
        let registry = SessionRegistry::new();
        let id = Uuid::new_v4();
        registry.register(SessionKind::RtmpConn, id, "10.0.0.1:4321".to_string());

        assert!(registry.get(SessionKind::RtmpConn, id).is_ok());
        assert!(registry.get(SessionKind::SrtConn, id).is_err());
        assert!(registry.get(SessionKind::RtmpConn, Uuid::new_v4()).is_err());
    }

    #[test]
    fn test_kick_cancels_token() {
        let registry = SessionRegistry::new();
        let id = Uuid::new_v4();
        let token = registry.register(SessionKind::WebrtcSession, id, String::new());

        assert!(!token.is_cancelled());
        registry.kick(SessionKind::WebrtcSession, id).unwrap();
        assert!(token.is_cancelled());

        assert!(registry.kick(SessionKind::WebrtcSession, Uuid::new_v4()).is_err());
    }

    #[test]
    fn test_update() {
        let registry = SessionRegistry::new();
        let id = Uuid::new_v4();
        registry.register(SessionKind::SrtConn, id, String::new());

        registry.update(id, |info| {
            info.state = SessionState::Publish;
            info.path = "cam1".to_string();
            info.bytes_received = 1024;
        });

        let info = registry.get(SessionKind::SrtConn, id).unwrap();
        assert_eq!(info.state, SessionState::Publish);
        assert_eq!(info.path, "cam1");
        assert_eq!(info.bytes_received, 1024);
    }
}
