//! Live connections, keyed by connection id

use super::session::PeerSession;
use super::WebRTCError;
use log::info;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of live peer sessions
pub struct ConnectionRegistry {
    sessions: RwLock<HashMap<String, Arc<PeerSession>>>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// `max_connections` of 0 means unlimited
    pub fn new(max_connections: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_connections,
        }
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Register a session under `id`
    pub fn add(&self, id: String, session: Arc<PeerSession>) -> Result<(), WebRTCError> {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&id) {
            return Err(WebRTCError::InvalidState(format!("connection {} already registered", id)));
        }
        if self.max_connections > 0 && sessions.len() >= self.max_connections {
            return Err(WebRTCError::ConnectionFailed(format!(
                "connection limit reached ({})",
                self.max_connections
            )));
        }
        sessions.insert(id, session);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<PeerSession>> {
        self.sessions.read().get(id).cloned()
    }

    /// Remove a session and close it. The close happens outside the lock.
    pub async fn remove(&self, id: &str) -> Option<Arc<PeerSession>> {
        let session = self.sessions.write().remove(id);
        if let Some(session) = &session {
            session.close().await;
            info!("Connection {} removed ({} remaining)", id, self.len());
        }
        session
    }

    /// Snapshot of the live sessions
    pub fn sessions(&self) -> Vec<Arc<PeerSession>> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every session, for process shutdown
    pub async fn close_all(&self) {
        let sessions: Vec<_> = self.sessions.write().drain().collect();
        if sessions.is_empty() {
            return;
        }
        info!("Closing {} connection(s)", sessions.len());
        futures::future::join_all(sessions.iter().map(|(_, session)| session.close())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, WebRTCConfig};
    use crate::webrtc::peer_connection::RtcEngine;
    use crate::webrtc::session::SessionPhase;
    use tokio::sync::mpsc;

    fn session(engine: &Arc<RtcEngine>, id: &str) -> Arc<PeerSession> {
        let (tx, _rx) = mpsc::unbounded_channel();
        PeerSession::new(id.to_string(), engine.clone(), Arc::new(Config::default()), tx)
    }

    fn engine() -> Arc<RtcEngine> {
        let config = WebRTCConfig {
            ice_servers: Vec::new(),
            ..Default::default()
        };
        Arc::new(RtcEngine::new(&config).unwrap())
    }

    #[tokio::test]
    async fn test_add_get_remove() {
        let engine = engine();
        let registry = ConnectionRegistry::new(0);
        registry.add("a".to_string(), session(&engine, "a")).unwrap();
        registry.add("b".to_string(), session(&engine, "b")).unwrap();
        assert!(registry.add("a".to_string(), session(&engine, "a")).is_err());
        assert_eq!(registry.len(), 2);

        assert_eq!(registry.sessions().len(), 2);
        let a = registry.get("a").unwrap();
        let removed = registry.remove("a").await.unwrap();
        assert!(Arc::ptr_eq(&a, &removed));
        assert_eq!(a.phase(), SessionPhase::Closed);
        assert!(registry.get("a").is_none());
        assert!(registry.remove("a").await.is_none());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let engine = engine();
        let registry = ConnectionRegistry::new(1);
        registry.add("a".to_string(), session(&engine, "a")).unwrap();
        assert!(matches!(
            registry.add("b".to_string(), session(&engine, "b")),
            Err(WebRTCError::ConnectionFailed(_))
        ));
        registry.remove("a").await;
        registry.add("b".to_string(), session(&engine, "b")).unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_remove_closes_once() {
        let engine = engine();
        let registry = Arc::new(ConnectionRegistry::new(0));
        let s = session(&engine, "a");
        registry.add("a".to_string(), s.clone()).unwrap();

        let (first, second) = tokio::join!(registry.remove("a"), registry.remove("a"));
        assert_eq!(first.is_some() as u8 + second.is_some() as u8, 1);
        assert_eq!(s.phase(), SessionPhase::Closed);

        // closing again after removal is a no-op
        s.close().await;
        assert_eq!(s.phase(), SessionPhase::Closed);
    }

    #[tokio::test]
    async fn test_close_all() {
        let engine = engine();
        let registry = ConnectionRegistry::new(0);
        let sessions: Vec<_> = (0..3).map(|i| session(&engine, &i.to_string())).collect();
        for s in &sessions {
            registry.add(s.id.clone(), s.clone()).unwrap();
        }
        registry.close_all().await;
        assert!(registry.is_empty());
        assert!(sessions.iter().all(|s| s.phase() == SessionPhase::Closed));
        registry.close_all().await;
    }
}
