use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;

use parlor_core::ids::{ConnectionId, SessionId};
use parlor_core::protocol::ServerEnvelope;

use crate::connection::ClientConnection;

type Roster = Arc<parking_lot::Mutex<HashSet<ConnectionId>>>;

/// Registry of live connections and per-session membership.
///
/// Each session's roster has its own mutex. Membership changes and fan-out
/// for one session lock that mutex, so broadcast enumeration never races a
/// membership write, while sessions stay independent of each other.
pub struct SessionRegistry {
    connections: DashMap<ConnectionId, Arc<ClientConnection>>,
    members: DashMap<SessionId, Roster>,
    max_send_queue: usize,
}

impl SessionRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            connections: DashMap::new(),
            members: DashMap::new(),
            max_send_queue,
        }
    }

    /// Register a new connection and return it with its outbound queue.
    pub fn register(&self, client_key: String) -> (Arc<ClientConnection>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let conn = Arc::new(ClientConnection::new(ConnectionId::new(), tx, client_key));
        self.connections.insert(conn.id.clone(), Arc::clone(&conn));
        (conn, rx)
    }

    pub fn unregister(&self, id: &ConnectionId) {
        self.connections.remove(id);
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        self.connections.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of sessions with at least one member.
    pub fn session_count(&self) -> usize {
        self.members.len()
    }

    pub fn member_count(&self, session_id: &SessionId) -> usize {
        self.with_roster_if_present(session_id, |members| members.len())
            .unwrap_or(0)
    }

    /// Add a connection to a session's roster, creating the roster if absent.
    pub fn add_member(&self, session_id: &SessionId, conn_id: &ConnectionId) {
        self.with_roster(session_id, |members| {
            members.insert(conn_id.clone());
        });
    }

    /// Remove a connection from a session's roster. A no-op when the
    /// session or the connection is not present.
    pub fn remove_member(&self, session_id: &SessionId, conn_id: &ConnectionId) {
        self.with_roster_if_present(session_id, |members| {
            members.remove(conn_id);
        });
    }

    /// Add a connection to a session and deliver a one-off envelope to it,
    /// all under the roster guard. `fetch` runs before the insert; if it
    /// fails the roster and the connection are left untouched. Holding the
    /// guard across the fetch means no publish can slip between the
    /// snapshot `fetch` takes and the moment the joiner starts receiving
    /// live traffic. The connection is bound under the same guard, so a
    /// cleanup pass never sees a roster entry without its binding.
    pub fn join_member<E>(
        &self,
        session_id: &SessionId,
        conn: &Arc<ClientConnection>,
        fetch: impl FnOnce() -> Result<ServerEnvelope, E>,
    ) -> Result<(), E> {
        self.with_roster(session_id, |members| {
            let envelope = fetch()?;
            members.insert(conn.id.clone());
            conn.bind(session_id.clone());
            conn.send_envelope(&envelope);
            Ok(())
        })
    }

    /// Run `persist` and fan its envelope out to the session's members,
    /// both under the roster guard, so every member observes publishes in
    /// persistence order. Nothing is delivered when `persist` fails.
    pub fn publish<T, E>(
        &self,
        session_id: &SessionId,
        persist: impl FnOnce() -> Result<(T, ServerEnvelope), E>,
    ) -> Result<T, E> {
        self.with_roster(session_id, |members| {
            let (value, envelope) = persist()?;
            self.deliver(members, &envelope, None);
            Ok(value)
        })
    }

    /// Send an envelope to every member of a session except `exclude`.
    /// Returns the number of connections the envelope was queued for.
    pub fn broadcast(
        &self,
        session_id: &SessionId,
        envelope: &ServerEnvelope,
        exclude: Option<&ConnectionId>,
    ) -> usize {
        self.with_roster_if_present(session_id, |members| {
            self.deliver(members, envelope, exclude)
        })
        .unwrap_or(0)
    }

    /// Drop connections that missed their pong deadline, removing them
    /// from any session they were bound to.
    pub fn cleanup_dead(&self) -> usize {
        let dead: Vec<Arc<ClientConnection>> = self
            .connections
            .iter()
            .filter(|entry| !entry.value().is_alive())
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut removed = 0;
        for conn in dead {
            if let Some(session_id) = conn.unbind() {
                self.remove_member(&session_id, &conn.id);
            }
            self.connections.remove(&conn.id);
            removed += 1;
            tracing::info!(connection_id = %conn.id, "Cleaned up dead connection");
        }
        removed
    }

    fn deliver(
        &self,
        members: &HashSet<ConnectionId>,
        envelope: &ServerEnvelope,
        exclude: Option<&ConnectionId>,
    ) -> usize {
        let json = match serde_json::to_string(envelope) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(
                    event = envelope.event_type(),
                    error = %e,
                    "Failed to serialize envelope"
                );
                return 0;
            }
        };

        let mut delivered = 0;
        for conn_id in members {
            if exclude == Some(conn_id) {
                continue;
            }
            if let Some(conn) = self.connections.get(conn_id) {
                if conn.send(json.clone()) {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Lock the session's roster, creating it if absent. Empty rosters are
    /// unlinked before the lock is released, so the map never accumulates
    /// dead sessions.
    fn with_roster<T>(
        &self,
        session_id: &SessionId,
        f: impl FnOnce(&mut HashSet<ConnectionId>) -> T,
    ) -> T {
        loop {
            let roster = {
                let entry = self.members.entry(session_id.clone()).or_default();
                Arc::clone(&entry)
            };
            let mut guard = roster.lock();
            // A concurrent empty-roster unlink can orphan the Arc between
            // the map lookup and the lock; start over on a fresh one.
            let current = self
                .members
                .get(session_id)
                .is_some_and(|entry| Arc::ptr_eq(entry.value(), &roster));
            if !current {
                continue;
            }

            let result = f(&mut guard);
            if guard.is_empty() {
                self.members
                    .remove_if(session_id, |_, set| Arc::ptr_eq(set, &roster));
            }
            return result;
        }
    }

    /// Like [`with_roster`](Self::with_roster) but never creates a roster;
    /// returns `None` when the session has no members.
    fn with_roster_if_present<T>(
        &self,
        session_id: &SessionId,
        f: impl FnOnce(&mut HashSet<ConnectionId>) -> T,
    ) -> Option<T> {
        let roster = Arc::clone(self.members.get(session_id)?.value());
        let mut guard = roster.lock();
        let current = self
            .members
            .get(session_id)
            .is_some_and(|entry| Arc::ptr_eq(entry.value(), &roster));
        if !current {
            return None;
        }

        let result = f(&mut guard);
        if guard.is_empty() {
            self.members
                .remove_if(session_id, |_, set| Arc::ptr_eq(set, &roster));
        }
        Some(result)
    }
}

/// Start a background task that periodically reaps dead connections.
pub fn start_cleanup_task(
    registry: Arc<SessionRegistry>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = registry.cleanup_dead();
            if removed > 0 {
                tracing::info!(removed = removed, "Dead connection cleanup");
            }
        }
    })
}
