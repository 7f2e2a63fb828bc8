//! Inbound envelope handlers: the protocol state machine for one connection.

use std::sync::Arc;
use std::time::Duration;

use parlor_core::chat::{validate_content, MessageRole, ADMIN_MARKER};
use parlor_core::generator::{build_turns, ReplyGenerator, HISTORY_WINDOW};
use parlor_core::ids::SessionId;
use parlor_core::protocol::{ClientEnvelope, ServerEnvelope};
use parlor_core::{AdminKey, ChatError};
use parlor_store::{Database, MessageRepo, SessionRepo, StoreError};

use crate::connection::ClientConnection;
use crate::limiter::RateLimiter;
use crate::registry::SessionRegistry;

const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared state available to every connection's handlers.
pub struct ChatState {
    pub db: Database,
    pub sessions: SessionRepo,
    pub messages: MessageRepo,
    pub registry: Arc<SessionRegistry>,
    pub limiter: Arc<RateLimiter>,
    pub generator: Arc<dyn ReplyGenerator>,
    pub admin_key: Option<AdminKey>,
    pub reply_timeout: Duration,
}

impl ChatState {
    pub fn new(
        db: Database,
        registry: Arc<SessionRegistry>,
        limiter: Arc<RateLimiter>,
        generator: Arc<dyn ReplyGenerator>,
    ) -> Self {
        Self {
            sessions: SessionRepo::new(db.clone()),
            messages: MessageRepo::new(db.clone()),
            db,
            registry,
            limiter,
            generator,
            admin_key: None,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }

    pub fn with_admin_key(mut self, key: AdminKey) -> Self {
        self.admin_key = Some(key);
        self
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }
}

/// Parse one inbound frame and run the matching operation. Failures turn
/// into ERROR envelopes sent to the originating connection only; the
/// connection's bindings are left as they were, so retry is always safe.
pub fn dispatch(state: &Arc<ChatState>, conn: &Arc<ClientConnection>, raw: &str) {
    let envelope = match ClientEnvelope::parse(raw) {
        Ok(envelope) => envelope,
        Err(e) => {
            conn.send_envelope(&ServerEnvelope::error(&e));
            return;
        }
    };

    let result = match envelope {
        ClientEnvelope::JoinSession {
            session_id,
            is_admin,
            admin_key,
        } => join_session(state, conn, &session_id, is_admin, admin_key.as_deref()),
        ClientEnvelope::LeaveSession => leave_session(state, conn),
        ClientEnvelope::SendMessage { content } => send_message(state, conn, &content),
        ClientEnvelope::TypingStart => relay_typing(state, conn, true),
        ClientEnvelope::TypingStop => relay_typing(state, conn, false),
    };

    if let Err(e) = result {
        if matches!(e, ChatError::Internal(_)) {
            tracing::error!(connection_id = %conn.id, error = %e, "Operation failed");
        }
        conn.send_envelope(&ServerEnvelope::error(&e));
    }
}

fn join_session(
    state: &Arc<ChatState>,
    conn: &Arc<ClientConnection>,
    session_id: &str,
    is_admin: bool,
    admin_key: Option<&str>,
) -> Result<(), ChatError> {
    let admin = if is_admin {
        let expected = state.admin_key.as_ref().ok_or(ChatError::Unauthorized)?;
        let candidate = admin_key.ok_or(ChatError::Unauthorized)?;
        if !expected.verify(candidate) {
            return Err(ChatError::Unauthorized);
        }
        true
    } else {
        false
    };

    let session_id = SessionId::from_raw(session_id);
    let session = state
        .sessions
        .find(&session_id)
        .map_err(store_error)?
        .ok_or_else(|| ChatError::SessionNotFound(session_id.as_str().to_string()))?;

    // A connection is bound to at most one session; joining another one is
    // an implicit leave.
    if let Some(current) = conn.session() {
        if current != session_id {
            state.registry.remove_member(&current, &conn.id);
            conn.unbind();
        }
    }

    state.registry.join_member(&session_id, conn, || {
        let messages = state
            .messages
            .list(&session_id, None)
            .map_err(store_error)?;
        Ok(ServerEnvelope::SessionJoined { session, messages })
    })?;

    conn.set_admin(admin);
    tracing::info!(connection_id = %conn.id, session_id = %session_id, admin, "Connection joined session");
    Ok(())
}

fn leave_session(state: &Arc<ChatState>, conn: &Arc<ClientConnection>) -> Result<(), ChatError> {
    if let Some(session_id) = conn.unbind() {
        state.registry.remove_member(&session_id, &conn.id);
        conn.set_admin(false);
        tracing::info!(connection_id = %conn.id, session_id = %session_id, "Connection left session");
    }
    Ok(())
}

fn send_message(
    state: &Arc<ChatState>,
    conn: &Arc<ClientConnection>,
    content: &str,
) -> Result<(), ChatError> {
    let session_id = conn.session().ok_or(ChatError::NotInSession)?;
    validate_content(content)?;

    let decision = state.limiter.check(conn.client_key());
    if !decision.allowed {
        tracing::warn!(
            connection_id = %conn.id,
            client_key = conn.client_key(),
            "Rate limit exceeded"
        );
        return Err(ChatError::RateLimited);
    }

    // Re-fetch: the session may have been closed since the join.
    let session = state
        .sessions
        .find(&session_id)
        .map_err(store_error)?
        .ok_or_else(|| ChatError::SessionNotFound(session_id.as_str().to_string()))?;
    if !session.is_active() {
        return Err(ChatError::SessionClosed);
    }

    let admin = conn.is_admin();
    let (role, stored) = if admin {
        (MessageRole::Assistant, format!("{ADMIN_MARKER}{content}"))
    } else {
        (MessageRole::User, content.to_string())
    };

    state.registry.publish(&session_id, || {
        let message = state
            .messages
            .append(&session_id, role, &stored)
            .map_err(store_error)?;
        Ok(((), ServerEnvelope::MessageReceived { message }))
    })?;

    if let Err(e) = state.sessions.touch(&session_id) {
        tracing::warn!(session_id = %session_id, error = %e, "Failed to bump session activity");
    }

    // Admin replies are the human taking over; only visitor messages get a
    // generated response.
    if !admin {
        spawn_reply(state, &session_id);
    }
    Ok(())
}

fn relay_typing(
    state: &Arc<ChatState>,
    conn: &Arc<ClientConnection>,
    started: bool,
) -> Result<(), ChatError> {
    let session_id = conn.session().ok_or(ChatError::NotInSession)?;
    let envelope = if started {
        ServerEnvelope::TypingStart {
            is_admin: conn.is_admin(),
        }
    } else {
        ServerEnvelope::TypingStop {
            is_admin: conn.is_admin(),
        }
    };
    state.registry.broadcast(&session_id, &envelope, Some(&conn.id));
    Ok(())
}

/// Tear down a connection after its socket closes. Performs an implicit
/// leave; nothing is sent to the departing client.
pub fn disconnect(state: &Arc<ChatState>, conn: &Arc<ClientConnection>) {
    if let Some(session_id) = conn.unbind() {
        state.registry.remove_member(&session_id, &conn.id);
    }
    state.registry.unregister(&conn.id);
    let dropped = conn.dropped_count();
    if dropped > 0 {
        tracing::warn!(connection_id = %conn.id, dropped, "Connection closed after dropping frames");
    } else {
        tracing::info!(connection_id = %conn.id, "Connection closed");
    }
}

fn spawn_reply(state: &Arc<ChatState>, session_id: &SessionId) {
    let state = Arc::clone(state);
    let session_id = session_id.clone();
    tokio::spawn(async move {
        if let Err(e) = run_reply(&state, &session_id).await {
            tracing::error!(session_id = %session_id, error = %e, "Reply pipeline failed");
        }
    });
}

/// Generate and publish the assistant's reply to the latest visitor
/// message. Runs in its own task so a slow generator never blocks other
/// traffic; typing indicators bracket the generator call whatever its
/// outcome. Generator failures and timeouts degrade to "no reply";
/// only storage failures escalate.
async fn run_reply(state: &Arc<ChatState>, session_id: &SessionId) -> Result<(), ChatError> {
    let history = state
        .messages
        .recent(session_id, HISTORY_WINDOW as u32)
        .map_err(store_error)?;
    let turns = build_turns(&history);

    state.registry.broadcast(
        session_id,
        &ServerEnvelope::TypingStart { is_admin: false },
        None,
    );

    let outcome = tokio::time::timeout(state.reply_timeout, state.generator.generate(&turns)).await;

    state.registry.broadcast(
        session_id,
        &ServerEnvelope::TypingStop { is_admin: false },
        None,
    );

    let text = match outcome {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            tracing::warn!(
                session_id = %session_id,
                kind = e.kind(),
                error = %e,
                "Reply generator failed, no reply sent"
            );
            return Ok(());
        }
        Err(_) => {
            tracing::warn!(
                session_id = %session_id,
                timeout = ?state.reply_timeout,
                "Reply generator timed out, no reply sent"
            );
            return Ok(());
        }
    };

    let text = text.trim();
    if text.is_empty() {
        return Ok(());
    }

    let published = state.registry.publish(session_id, || {
        let message = state
            .messages
            .append(session_id, MessageRole::Assistant, text)
            .map_err(store_error)?;
        Ok(((), ServerEnvelope::AiResponse { message }))
    });
    match published {
        Ok(()) => {}
        Err(ChatError::SessionClosed) => {
            tracing::warn!(session_id = %session_id, "Session closed before the reply landed, dropping it");
            return Ok(());
        }
        Err(e) => return Err(e),
    }

    if let Err(e) = state.sessions.touch(session_id) {
        tracing::warn!(session_id = %session_id, error = %e, "Failed to bump session activity");
    }
    Ok(())
}

fn store_error(err: StoreError) -> ChatError {
    match err {
        StoreError::NotFound(detail) => ChatError::SessionNotFound(detail),
        StoreError::Conflict(_) => ChatError::SessionClosed,
        other => ChatError::Internal(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parlor_core::chat::{SessionStatus, MAX_MESSAGE_LEN};
    use parlor_core::ids::VisitorId;
    use parlor_core::GeneratorError;
    use parlor_llm::{MockGenerator, MockReply, SilentGenerator};
    use serde_json::{json, Value};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn state_with(generator: Arc<dyn ReplyGenerator>) -> Arc<ChatState> {
        let db = Database::in_memory().unwrap();
        let registry = Arc::new(SessionRegistry::new(256));
        let limiter = Arc::new(RateLimiter::new(100, Duration::from_secs(60)));
        Arc::new(ChatState::new(db, registry, limiter, generator))
    }

    fn silent_state() -> Arc<ChatState> {
        state_with(Arc::new(SilentGenerator))
    }

    fn state_with_admin(generator: Arc<dyn ReplyGenerator>, key: &str) -> Arc<ChatState> {
        let db = Database::in_memory().unwrap();
        let registry = Arc::new(SessionRegistry::new(256));
        let limiter = Arc::new(RateLimiter::new(100, Duration::from_secs(60)));
        Arc::new(
            ChatState::new(db, registry, limiter, generator).with_admin_key(AdminKey::new(key)),
        )
    }

    fn make_session(state: &Arc<ChatState>) -> SessionId {
        state
            .sessions
            .create(&VisitorId::new(), None, json!({}))
            .unwrap()
            .id
    }

    fn connect(state: &Arc<ChatState>) -> (Arc<ClientConnection>, mpsc::Receiver<String>) {
        state.registry.register("203.0.113.9".into())
    }

    fn join_frame(session_id: &SessionId) -> String {
        json!({"type": "JOIN_SESSION", "payload": {"sessionId": session_id.as_str()}}).to_string()
    }

    fn admin_join_frame(session_id: &SessionId, key: &str) -> String {
        json!({
            "type": "JOIN_SESSION",
            "payload": {"sessionId": session_id.as_str(), "isAdmin": true, "adminKey": key},
        })
        .to_string()
    }

    fn send_frame(content: &str) -> String {
        json!({"type": "SEND_MESSAGE", "payload": {"content": content}}).to_string()
    }

    fn next_json(rx: &mut mpsc::Receiver<String>) -> Value {
        serde_json::from_str(&rx.try_recv().expect("expected a queued envelope")).unwrap()
    }

    async fn recv_json(rx: &mut mpsc::Receiver<String>) -> Value {
        let raw = timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("timed out waiting for an envelope")
            .expect("channel closed");
        serde_json::from_str(&raw).unwrap()
    }

    #[tokio::test]
    async fn join_unknown_session_fails() {
        let state = silent_state();
        let (conn, mut rx) = connect(&state);

        dispatch(&state, &conn, &join_frame(&SessionId::new()));

        let v = next_json(&mut rx);
        assert_eq!(v["type"], "ERROR");
        assert_eq!(v["payload"]["code"], "SESSION_NOT_FOUND");
        assert!(conn.session().is_none());
    }

    #[tokio::test]
    async fn join_delivers_session_and_history() {
        let state = silent_state();
        let session_id = make_session(&state);
        state
            .messages
            .append(&session_id, MessageRole::Assistant, "welcome")
            .unwrap();
        state
            .messages
            .append(&session_id, MessageRole::User, "hi")
            .unwrap();
        let (conn, mut rx) = connect(&state);

        dispatch(&state, &conn, &join_frame(&session_id));

        let v = next_json(&mut rx);
        assert_eq!(v["type"], "SESSION_JOINED");
        assert_eq!(v["payload"]["session"]["id"], session_id.as_str());
        assert_eq!(v["payload"]["session"]["status"], "active");
        let messages = v["payload"]["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["content"], "welcome");
        assert_eq!(messages[1]["content"], "hi");

        assert_eq!(conn.session(), Some(session_id.clone()));
        assert_eq!(state.registry.member_count(&session_id), 1);
    }

    #[tokio::test]
    async fn join_other_session_implicitly_leaves() {
        let state = silent_state();
        let first = make_session(&state);
        let second = make_session(&state);
        let (conn, mut rx) = connect(&state);

        dispatch(&state, &conn, &join_frame(&first));
        let _ = next_json(&mut rx);
        dispatch(&state, &conn, &join_frame(&second));

        let v = next_json(&mut rx);
        assert_eq!(v["type"], "SESSION_JOINED");
        assert_eq!(state.registry.member_count(&first), 0);
        assert_eq!(state.registry.member_count(&second), 1);
        assert_eq!(conn.session(), Some(second));
    }

    #[tokio::test]
    async fn rejoining_same_session_redelivers_history() {
        let state = silent_state();
        let session_id = make_session(&state);
        state
            .messages
            .append(&session_id, MessageRole::User, "still here")
            .unwrap();
        let (conn, mut rx) = connect(&state);

        dispatch(&state, &conn, &join_frame(&session_id));
        let _ = next_json(&mut rx);
        dispatch(&state, &conn, &join_frame(&session_id));

        let v = next_json(&mut rx);
        assert_eq!(v["type"], "SESSION_JOINED");
        assert_eq!(v["payload"]["messages"].as_array().unwrap().len(), 1);
        assert_eq!(state.registry.member_count(&session_id), 1);
    }

    #[tokio::test]
    async fn admin_join_requires_valid_credential() {
        let state = state_with_admin(Arc::new(SilentGenerator), "sekrit");
        let session_id = make_session(&state);
        let (conn, mut rx) = connect(&state);

        dispatch(&state, &conn, &admin_join_frame(&session_id, "wrong"));
        let v = next_json(&mut rx);
        assert_eq!(v["payload"]["code"], "UNAUTHORIZED");
        assert!(conn.session().is_none());
        assert!(!conn.is_admin());

        dispatch(&state, &conn, &admin_join_frame(&session_id, "sekrit"));
        let v = next_json(&mut rx);
        assert_eq!(v["type"], "SESSION_JOINED");
        assert!(conn.is_admin());
    }

    #[tokio::test]
    async fn admin_join_without_configured_secret_fails() {
        let state = silent_state();
        let session_id = make_session(&state);
        let (conn, mut rx) = connect(&state);

        dispatch(&state, &conn, &admin_join_frame(&session_id, "anything"));

        let v = next_json(&mut rx);
        assert_eq!(v["payload"]["code"], "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn send_requires_binding() {
        let state = silent_state();
        let (conn, mut rx) = connect(&state);

        dispatch(&state, &conn, &send_frame("hello"));

        let v = next_json(&mut rx);
        assert_eq!(v["payload"]["code"], "NOT_IN_SESSION");
    }

    #[tokio::test]
    async fn send_validates_content() {
        let state = silent_state();
        let session_id = make_session(&state);
        let (conn, mut rx) = connect(&state);
        dispatch(&state, &conn, &join_frame(&session_id));
        let _ = next_json(&mut rx);

        dispatch(&state, &conn, &send_frame(""));
        assert_eq!(next_json(&mut rx)["payload"]["code"], "VALIDATION_ERROR");

        dispatch(&state, &conn, &send_frame(&"x".repeat(MAX_MESSAGE_LEN + 1)));
        assert_eq!(next_json(&mut rx)["payload"]["code"], "VALIDATION_ERROR");

        assert!(state.messages.list(&session_id, None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_applies_rate_limit() {
        let db = Database::in_memory().unwrap();
        let registry = Arc::new(SessionRegistry::new(256));
        let limiter = Arc::new(RateLimiter::new(1, Duration::from_secs(60)));
        let state = Arc::new(
            ChatState::new(db, registry, limiter, Arc::new(SilentGenerator))
                .with_admin_key(AdminKey::new("sekrit")),
        );
        let session_id = make_session(&state);
        let (conn, mut rx) = connect(&state);
        dispatch(&state, &conn, &admin_join_frame(&session_id, "sekrit"));
        let _ = next_json(&mut rx);

        dispatch(&state, &conn, &send_frame("first"));
        assert_eq!(next_json(&mut rx)["type"], "MESSAGE_RECEIVED");

        dispatch(&state, &conn, &send_frame("second"));
        assert_eq!(next_json(&mut rx)["payload"]["code"], "RATE_LIMITED");

        assert_eq!(state.messages.list(&session_id, None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn send_to_closed_session_fails_for_visitor_and_admin() {
        let state = state_with_admin(Arc::new(SilentGenerator), "sekrit");
        let session_id = make_session(&state);
        let (visitor, mut visitor_rx) = connect(&state);
        let (admin, mut admin_rx) = connect(&state);
        dispatch(&state, &visitor, &join_frame(&session_id));
        dispatch(&state, &admin, &admin_join_frame(&session_id, "sekrit"));
        let _ = next_json(&mut visitor_rx);
        let _ = next_json(&mut admin_rx);

        state
            .sessions
            .update_status(&session_id, SessionStatus::Closed)
            .unwrap();

        dispatch(&state, &visitor, &send_frame("too late"));
        assert_eq!(next_json(&mut visitor_rx)["payload"]["code"], "SESSION_CLOSED");

        dispatch(&state, &admin, &send_frame("also too late"));
        assert_eq!(next_json(&mut admin_rx)["payload"]["code"], "SESSION_CLOSED");

        assert!(state.messages.list(&session_id, None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn visitor_message_full_round_trip() {
        let mock = Arc::new(MockGenerator::new(vec![MockReply::text("Happy to help!")]));
        let state = state_with(mock.clone());
        let session_id = make_session(&state);
        state
            .messages
            .append(&session_id, MessageRole::Assistant, "Hi! How can I help?")
            .unwrap();
        let (conn, mut rx) = connect(&state);
        dispatch(&state, &conn, &join_frame(&session_id));
        let _ = next_json(&mut rx);

        dispatch(&state, &conn, &send_frame("hello"));

        let echo = next_json(&mut rx);
        assert_eq!(echo["type"], "MESSAGE_RECEIVED");
        assert_eq!(echo["payload"]["message"]["role"], "user");
        assert_eq!(echo["payload"]["message"]["content"], "hello");

        assert_eq!(recv_json(&mut rx).await["type"], "TYPING_START");
        assert_eq!(recv_json(&mut rx).await["type"], "TYPING_STOP");
        let reply = recv_json(&mut rx).await;
        assert_eq!(reply["type"], "AI_RESPONSE");
        assert_eq!(reply["payload"]["message"]["role"], "assistant");
        assert_eq!(reply["payload"]["message"]["content"], "Happy to help!");

        let turns = mock.received();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].len(), 3);
        assert_eq!(turns[0][0].role, MessageRole::System);
        assert_eq!(turns[0][1].role, MessageRole::Assistant);
        assert_eq!(turns[0][2].content, "hello");

        let stored = state.messages.list(&session_id, None).unwrap();
        assert_eq!(stored.len(), 3);
        assert_eq!(stored[2].role, MessageRole::Assistant);
        assert_eq!(stored[2].content, "Happy to help!");
    }

    #[tokio::test]
    async fn generator_failure_is_quiet() {
        let mock = Arc::new(MockGenerator::new(vec![MockReply::Failure(
            GeneratorError::Overloaded,
        )]));
        let state = state_with(mock.clone());
        let session_id = make_session(&state);
        let (conn, mut rx) = connect(&state);
        dispatch(&state, &conn, &join_frame(&session_id));
        let _ = next_json(&mut rx);

        dispatch(&state, &conn, &send_frame("anyone there?"));

        assert_eq!(next_json(&mut rx)["type"], "MESSAGE_RECEIVED");
        assert_eq!(recv_json(&mut rx).await["type"], "TYPING_START");
        assert_eq!(recv_json(&mut rx).await["type"], "TYPING_STOP");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(state.messages.list(&session_id, None).unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_generator_hits_timeout() {
        let mock = Arc::new(MockGenerator::new(vec![MockReply::delayed(
            Duration::from_secs(60),
            MockReply::text("way too slow"),
        )]));
        let db = Database::in_memory().unwrap();
        let registry = Arc::new(SessionRegistry::new(256));
        let limiter = Arc::new(RateLimiter::new(100, Duration::from_secs(60)));
        let state = Arc::new(
            ChatState::new(db, registry, limiter, mock)
                .with_reply_timeout(Duration::from_secs(5)),
        );
        let session_id = make_session(&state);
        let (conn, mut rx) = connect(&state);
        dispatch(&state, &conn, &join_frame(&session_id));
        let _ = next_json(&mut rx);

        dispatch(&state, &conn, &send_frame("hello?"));

        assert_eq!(next_json(&mut rx)["type"], "MESSAGE_RECEIVED");
        assert_eq!(recv_json(&mut rx).await["type"], "TYPING_START");
        assert_eq!(recv_json(&mut rx).await["type"], "TYPING_STOP");
        assert_eq!(state.messages.list(&session_id, None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn admin_message_gets_marker_and_no_reply() {
        let mock = Arc::new(MockGenerator::new(vec![MockReply::text("unused")]));
        let state = state_with_admin(mock.clone(), "sekrit");
        let session_id = make_session(&state);
        let (conn, mut rx) = connect(&state);
        dispatch(&state, &conn, &admin_join_frame(&session_id, "sekrit"));
        let _ = next_json(&mut rx);

        dispatch(&state, &conn, &send_frame("taking over from here"));

        let v = next_json(&mut rx);
        assert_eq!(v["type"], "MESSAGE_RECEIVED");
        assert_eq!(v["payload"]["message"]["role"], "assistant");
        assert_eq!(
            v["payload"]["message"]["content"],
            "[admin] taking over from here"
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn message_broadcasts_to_all_members() {
        let state = silent_state();
        let session_id = make_session(&state);
        let (sender, mut sender_rx) = connect(&state);
        let (other, mut other_rx) = connect(&state);
        dispatch(&state, &sender, &join_frame(&session_id));
        dispatch(&state, &other, &join_frame(&session_id));
        let _ = next_json(&mut sender_rx);
        let _ = next_json(&mut other_rx);

        dispatch(&state, &sender, &send_frame("ping"));

        assert_eq!(
            next_json(&mut sender_rx)["payload"]["message"]["content"],
            "ping"
        );
        assert_eq!(
            next_json(&mut other_rx)["payload"]["message"]["content"],
            "ping"
        );
    }

    #[tokio::test]
    async fn malformed_and_unknown_frames_are_rejected() {
        let state = silent_state();
        let (conn, mut rx) = connect(&state);

        dispatch(&state, &conn, "not json at all");
        assert_eq!(next_json(&mut rx)["payload"]["code"], "INVALID_MESSAGE");

        dispatch(&state, &conn, &json!({"type": "DANCE", "payload": {}}).to_string());
        assert_eq!(next_json(&mut rx)["payload"]["code"], "UNKNOWN_MESSAGE_TYPE");
    }

    #[tokio::test]
    async fn leave_before_join_is_a_noop() {
        let state = silent_state();
        let (conn, mut rx) = connect(&state);

        dispatch(&state, &conn, &json!({"type": "LEAVE_SESSION"}).to_string());

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn leave_unbinds_and_stops_delivery() {
        let state = silent_state();
        let session_id = make_session(&state);
        let (leaver, mut leaver_rx) = connect(&state);
        let (stayer, mut stayer_rx) = connect(&state);
        dispatch(&state, &leaver, &join_frame(&session_id));
        dispatch(&state, &stayer, &join_frame(&session_id));
        let _ = next_json(&mut leaver_rx);
        let _ = next_json(&mut stayer_rx);

        dispatch(&state, &leaver, &json!({"type": "LEAVE_SESSION"}).to_string());
        assert_eq!(state.registry.member_count(&session_id), 1);
        assert!(leaver.session().is_none());

        dispatch(&state, &stayer, &send_frame("anyone?"));
        assert_eq!(next_json(&mut stayer_rx)["type"], "MESSAGE_RECEIVED");
        assert!(leaver_rx.try_recv().is_err());

        dispatch(&state, &leaver, &send_frame("me!"));
        assert_eq!(next_json(&mut leaver_rx)["payload"]["code"], "NOT_IN_SESSION");
    }

    #[tokio::test]
    async fn typing_relays_to_others_excluding_sender() {
        let state = silent_state();
        let session_id = make_session(&state);
        let (typist, mut typist_rx) = connect(&state);
        let (watcher, mut watcher_rx) = connect(&state);
        dispatch(&state, &typist, &join_frame(&session_id));
        dispatch(&state, &watcher, &join_frame(&session_id));
        let _ = next_json(&mut typist_rx);
        let _ = next_json(&mut watcher_rx);

        dispatch(&state, &typist, &json!({"type": "TYPING_START"}).to_string());
        let v = next_json(&mut watcher_rx);
        assert_eq!(v["type"], "TYPING_START");
        assert_eq!(v["payload"]["isAdmin"], false);
        assert!(typist_rx.try_recv().is_err());

        dispatch(&state, &typist, &json!({"type": "TYPING_STOP"}).to_string());
        assert_eq!(next_json(&mut watcher_rx)["type"], "TYPING_STOP");
    }

    #[tokio::test]
    async fn admin_typing_carries_the_flag() {
        let state = state_with_admin(Arc::new(SilentGenerator), "sekrit");
        let session_id = make_session(&state);
        let (admin, mut admin_rx) = connect(&state);
        let (visitor, mut visitor_rx) = connect(&state);
        dispatch(&state, &admin, &admin_join_frame(&session_id, "sekrit"));
        dispatch(&state, &visitor, &join_frame(&session_id));
        let _ = next_json(&mut admin_rx);
        let _ = next_json(&mut visitor_rx);

        dispatch(&state, &admin, &json!({"type": "TYPING_START"}).to_string());

        let v = next_json(&mut visitor_rx);
        assert_eq!(v["type"], "TYPING_START");
        assert_eq!(v["payload"]["isAdmin"], true);
    }

    #[tokio::test]
    async fn typing_requires_binding() {
        let state = silent_state();
        let (conn, mut rx) = connect(&state);

        dispatch(&state, &conn, &json!({"type": "TYPING_START"}).to_string());

        assert_eq!(next_json(&mut rx)["payload"]["code"], "NOT_IN_SESSION");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sends_match_persisted_order() {
        let state = state_with_admin(Arc::new(SilentGenerator), "sekrit");
        let session_id = make_session(&state);
        let (observer, mut observer_rx) = connect(&state);
        dispatch(&state, &observer, &join_frame(&session_id));
        let _ = next_json(&mut observer_rx);

        let mut tasks = Vec::new();
        for task in 0..2 {
            let state = Arc::clone(&state);
            let session_id = session_id.clone();
            tasks.push(tokio::spawn(async move {
                let (conn, mut rx) = state.registry.register(format!("sender-{task}"));
                dispatch(&state, &conn, &admin_join_frame(&session_id, "sekrit"));
                let _ = rx.try_recv();
                for k in 0..10 {
                    dispatch(&state, &conn, &send_frame(&format!("{task}:{k}")));
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let stored: Vec<String> = state
            .messages
            .list(&session_id, None)
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(stored.len(), 20);

        let mut observed = Vec::new();
        while let Ok(raw) = observer_rx.try_recv() {
            let v: Value = serde_json::from_str(&raw).unwrap();
            if v["type"] == "MESSAGE_RECEIVED" {
                observed.push(v["payload"]["message"]["content"].as_str().unwrap().to_string());
            }
        }
        assert_eq!(observed, stored);
    }

    #[tokio::test]
    async fn broken_store_yields_internal_error() {
        let state = silent_state();
        let session_id = make_session(&state);
        let (conn, mut rx) = connect(&state);
        dispatch(&state, &conn, &join_frame(&session_id));
        let _ = next_json(&mut rx);

        state
            .db
            .with_conn(|c| {
                c.execute("DROP TABLE chat_messages", [])?;
                Ok(())
            })
            .unwrap();

        dispatch(&state, &conn, &send_frame("hello"));

        assert_eq!(next_json(&mut rx)["payload"]["code"], "INTERNAL_ERROR");
    }

    #[tokio::test]
    async fn disconnect_cleans_up() {
        let state = silent_state();
        let session_id = make_session(&state);
        let (conn, _rx) = connect(&state);
        dispatch(&state, &conn, &join_frame(&session_id));

        disconnect(&state, &conn);

        assert!(conn.session().is_none());
        assert_eq!(state.registry.member_count(&session_id), 0);
        assert_eq!(state.registry.connection_count(), 0);
    }
}
