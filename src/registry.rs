//! Connection registry
//!
//! Tracks every live connection together with its display name and its
//! outbound sink. The registry is the single shared resource of the server:
//! the dispatch loop mutates it on connect/rename/disconnect and the
//! broadcast path reads an atomic snapshot of it, so all access goes through
//! one mutex.

use std::collections::HashMap;
use std::fmt;
use std::sync::{ Arc, Mutex };
use tokio::sync::mpsc;
use uuid::Uuid;

/// Display name assigned to a connection until it sends a rename message
pub const DEFAULT_NAME: &str = "Anonymous";

/// Unique identifier for one live connection, assigned on transport accept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a fresh identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Outgoing sink for one connection: serialized text frames, drained into
/// the socket by the connection's writer task
pub type OutboundSink = mpsc::UnboundedSender<String>;

struct ClientConnection {
    name: String,
    sink: OutboundSink,
}

/// Registry of active connections
///
/// Cheap to clone; all clones share the same map.
#[derive(Clone)]
pub struct ConnectionRegistry {
    clients: Arc<Mutex<HashMap<ConnectionId, ClientConnection>>>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self { clients: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Add a connection with the default display name.
    ///
    /// Called exactly once per accepted transport; registering an id twice
    /// replaces the previous sink.
    pub fn register(&self, id: ConnectionId, sink: OutboundSink) {
        let mut clients = self.clients.lock().unwrap();
        clients.insert(id, ClientConnection { name: DEFAULT_NAME.to_string(), sink });
    }

    /// Update a connection's display name. Silently no-ops on unknown ids.
    pub fn rename(&self, id: ConnectionId, name: &str) {
        let mut clients = self.clients.lock().unwrap();
        if let Some(client) = clients.get_mut(&id) {
            client.name = name.to_string();
        }
    }

    /// Remove a connection. Idempotent; removing an absent id is a no-op.
    pub fn unregister(&self, id: ConnectionId) {
        let mut clients = self.clients.lock().unwrap();
        clients.remove(&id);
    }

    /// Whether the id belongs to a live connection
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.clients.lock().unwrap().contains_key(&id)
    }

    /// The outbound sink for one connection, if still registered
    pub fn sink(&self, id: ConnectionId) -> Option<OutboundSink> {
        self.clients.lock().unwrap().get(&id).map(|client| client.sink.clone())
    }

    /// A connection's current display name
    pub fn name(&self, id: ConnectionId) -> Option<String> {
        self.clients.lock().unwrap().get(&id).map(|client| client.name.clone())
    }

    /// Atomic snapshot of all live connections and their sinks, taken under
    /// the same lock that guards register/unregister
    pub fn snapshot(&self) -> Vec<(ConnectionId, OutboundSink)> {
        let clients = self.clients.lock().unwrap();
        clients.iter().map(|(id, client)| (*id, client.sink.clone())).collect()
    }

    /// Number of live connections
    pub fn len(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    /// Whether no connections are registered
    pub fn is_empty(&self) -> bool {
        self.clients.lock().unwrap().is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
