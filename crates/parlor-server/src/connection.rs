use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use parlor_core::ids::{ConnectionId, SessionId};
use parlor_core::protocol::ServerEnvelope;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(90);

/// One connected WebSocket client.
///
/// Mutable state lives behind atomics or a short-lived mutex, so the
/// connection is shared as a plain `Arc` with no outer lock.
pub struct ClientConnection {
    pub id: ConnectionId,
    tx: mpsc::Sender<String>,
    session: Mutex<Option<SessionId>>,
    admin: AtomicBool,
    client_key: String,
    dropped: AtomicU64,
    pub(crate) last_pong: AtomicU64,
}

impl ClientConnection {
    pub fn new(id: ConnectionId, tx: mpsc::Sender<String>, client_key: String) -> Self {
        Self {
            id,
            tx,
            session: Mutex::new(None),
            admin: AtomicBool::new(false),
            client_key,
            dropped: AtomicU64::new(0),
            last_pong: AtomicU64::new(now_secs()),
        }
    }

    /// Rate-limit key for this connection, derived from the peer address.
    pub fn client_key(&self) -> &str {
        &self.client_key
    }

    /// The session this connection is currently bound to, if any.
    pub fn session(&self) -> Option<SessionId> {
        self.session.lock().clone()
    }

    pub fn bind(&self, session_id: SessionId) {
        *self.session.lock() = Some(session_id);
    }

    /// Clear the session binding, returning the previous one.
    pub fn unbind(&self) -> Option<SessionId> {
        self.session.lock().take()
    }

    pub fn is_admin(&self) -> bool {
        self.admin.load(Ordering::Relaxed)
    }

    pub fn set_admin(&self, admin: bool) {
        self.admin.store(admin, Ordering::Relaxed);
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < CONNECTION_TIMEOUT.as_secs()
    }

    /// Queue a frame for delivery. Non-blocking; when the send queue is
    /// full the frame is dropped and the slow client falls behind.
    pub fn send(&self, message: String) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    connection_id = %self.id,
                    msg_len = msg.len(),
                    dropped_total = total,
                    "Send queue full, dropping frame"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Frames dropped on this connection because its queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn send_envelope(&self, envelope: &ServerEnvelope) -> bool {
        match serde_json::to_string(envelope) {
            Ok(json) => self.send(json),
            Err(e) => {
                tracing::error!(
                    connection_id = %self.id,
                    event = envelope.event_type(),
                    error = %e,
                    "Failed to serialize envelope"
                );
                false
            }
        }
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(queue: usize) -> (ClientConnection, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(queue);
        let conn = ClientConnection::new(ConnectionId::new(), tx, "127.0.0.1".into());
        (conn, rx)
    }

    #[test]
    fn starts_unbound_and_non_admin() {
        let (conn, _rx) = connection(8);
        assert!(conn.session().is_none());
        assert!(!conn.is_admin());
        assert_eq!(conn.client_key(), "127.0.0.1");
    }

    #[test]
    fn bind_and_unbind() {
        let (conn, _rx) = connection(8);
        let session_id = SessionId::new();
        conn.bind(session_id.clone());
        assert_eq!(conn.session(), Some(session_id.clone()));

        let previous = conn.unbind();
        assert_eq!(previous, Some(session_id));
        assert!(conn.session().is_none());
        assert!(conn.unbind().is_none());
    }

    #[test]
    fn admin_flag_toggles() {
        let (conn, _rx) = connection(8);
        conn.set_admin(true);
        assert!(conn.is_admin());
        conn.set_admin(false);
        assert!(!conn.is_admin());
    }

    #[test]
    fn send_queues_message() {
        let (conn, mut rx) = connection(8);
        assert!(conn.send("hello".into()));
        assert_eq!(rx.try_recv().unwrap(), "hello");
    }

    #[test]
    fn send_drops_when_queue_full() {
        let (conn, _rx) = connection(2);
        assert!(conn.send("one".into()));
        assert!(conn.send("two".into()));
        assert!(!conn.send("three".into()));
        assert_eq!(conn.dropped_count(), 1);
    }

    #[test]
    fn send_fails_when_receiver_gone() {
        let (conn, rx) = connection(2);
        drop(rx);
        assert!(!conn.send("hello".into()));
    }

    #[test]
    fn pong_tracking() {
        let (conn, _rx) = connection(2);
        assert!(conn.is_alive());

        conn.last_pong.store(0, Ordering::Relaxed);
        assert!(!conn.is_alive());

        conn.record_pong();
        assert!(conn.is_alive());
    }
}
