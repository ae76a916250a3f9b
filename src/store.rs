//! The session key/value store is an injected capability (§9): `get`,
//! `put`, `delete_by_node_and_address`. The engine tolerates an empty store
//! at startup and never assumes anything about its persistence.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::session::Session;
use crate::types::NodeId;

pub type SessionKey = (NodeId, SocketAddr);

/// Capability trait for session persistence. Values are opaque to the
/// store itself; only the engine interprets them.
pub trait SessionStore: Send {
    fn get(&self, key: &SessionKey) -> Option<Session>;
    fn put(&mut self, key: SessionKey, session: Session);
    fn delete_by_node_and_address(&mut self, key: &SessionKey);
}

/// Default in-process store. Good enough for an empty-at-startup cache of
/// symmetric keys; a persistent implementation is an external collaborator.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: HashMap<SessionKey, Session>,
}

impl SessionStore for InMemorySessionStore {
    fn get(&self, key: &SessionKey) -> Option<Session> {
        self.sessions.get(key).cloned()
    }

    fn put(&mut self, key: SessionKey, session: Session) {
        self.sessions.insert(key, session);
    }

    fn delete_by_node_and_address(&mut self, key: &SessionKey) {
        self.sessions.remove(key);
    }
}
