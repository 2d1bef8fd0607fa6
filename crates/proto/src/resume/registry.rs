//! Process-wide registry of resumable sessions.
//!
//! One registry is owned by each server wrapper. It holds strong handles:
//! a session is only collected once it removes itself through the
//! [`RegistryHook`] on orderly close or detached-timeout expiry. The lock
//! is held only across O(1) map operations and is always taken before any
//! connection or buffer lock, never after.

use std::collections::HashMap;
use std::sync::Mutex;

use limpet_platform::{LimpetError, LimpetResult};
use tracing::debug;

use crate::resume::conn::ResumableConn;
use crate::resume::handshake::SessionToken;

/// Removal callback a connection holds back into its registry.
///
/// Passing the registry as an interface-typed hook keeps the ownership
/// edge one-directional: the registry owns connections, connections only
/// know how to remove themselves.
pub trait RegistryHook: Send + Sync {
    /// Removes the session, if present. Idempotent.
    fn remove_session(&self, token: &SessionToken);
}

/// Mapping from session token to resumable connection.
#[derive(Default)]
pub struct SessionRegistry {
    conns: Mutex<HashMap<SessionToken, ResumableConn>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new session.
    ///
    /// # Errors
    ///
    /// Returns [`LimpetError::Protocol`] if the token is already
    /// registered; the caller decides whether that is a collision to treat
    /// as a resumption.
    pub fn insert(&self, token: SessionToken, conn: ResumableConn) -> LimpetResult<()> {
        let mut conns = self.conns.lock().unwrap();
        if conns.contains_key(&token) {
            return Err(LimpetError::Protocol(format!(
                "session {} already registered",
                token
            )));
        }
        conns.insert(token, conn);
        debug!("Registered session {} ({} total)", token, conns.len());
        Ok(())
    }

    /// Looks up a session by token.
    pub fn lookup(&self, token: &SessionToken) -> Option<ResumableConn> {
        self.conns.lock().unwrap().get(token).cloned()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.conns.lock().unwrap().len()
    }

    /// Whether the registry holds no sessions.
    pub fn is_empty(&self) -> bool {
        self.conns.lock().unwrap().is_empty()
    }
}

impl RegistryHook for SessionRegistry {
    fn remove_session(&self, token: &SessionToken) {
        let mut conns = self.conns.lock().unwrap();
        if conns.remove(token).is_some() {
            debug!("Removed session {} ({} remain)", token, conns.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resume::config::ResumeConfig;
    use crate::resume::handshake::TOKEN_LEN;
    use std::sync::Arc;

    fn token(fill: u8) -> SessionToken {
        SessionToken::from_bytes([fill; TOKEN_LEN])
    }

    fn conn_for(registry: &Arc<SessionRegistry>, fill: u8) -> ResumableConn {
        ResumableConn::new(
            token(fill),
            ResumeConfig::default(),
            Arc::clone(registry) as Arc<dyn RegistryHook>,
            "SSH-2.0-Test\r\n".to_string(),
        )
    }

    #[tokio::test]
    async fn test_insert_lookup_remove() {
        let registry = Arc::new(SessionRegistry::new());
        let conn = conn_for(&registry, 1);

        registry.insert(token(1), conn.clone()).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup(&token(1)).is_some());
        assert!(registry.lookup(&token(2)).is_none());

        registry.remove_session(&token(1));
        assert!(registry.is_empty());
        conn.close().await;
    }

    #[tokio::test]
    async fn test_insert_refuses_duplicate() {
        let registry = Arc::new(SessionRegistry::new());
        let a = conn_for(&registry, 1);
        let b = conn_for(&registry, 1);

        registry.insert(token(1), a.clone()).unwrap();
        let result = registry.insert(token(1), b.clone());
        assert!(matches!(result, Err(LimpetError::Protocol(_))));

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let registry = Arc::new(SessionRegistry::new());
        let conn = conn_for(&registry, 3);
        registry.insert(token(3), conn.clone()).unwrap();

        registry.remove_session(&token(3));
        registry.remove_session(&token(3));
        assert!(registry.is_empty());
        conn.close().await;
    }
}
