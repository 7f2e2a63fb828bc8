use chrono::Utc;
use tracing::instrument;

use parlor_core::chat::{ChatMessage, MessageRole, SessionStatus};
use parlor_core::ids::{MessageId, SessionId};

use crate::database::Database;
use crate::decode;
use crate::error::StoreError;

pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a message to a session. The session's status is checked and
    /// the row inserted under the same connection lock, so a message can
    /// never land in a session that a concurrent close already closed.
    #[instrument(skip(self, content), fields(session_id = %session_id, role = %role))]
    pub fn append(
        &self,
        session_id: &SessionId,
        role: MessageRole,
        content: &str,
    ) -> Result<ChatMessage, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT status FROM chat_sessions WHERE id = ?1")?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let status: SessionStatus = match rows.next()? {
                Some(row) => decode::enum_column(row, "chat_sessions", "status")?,
                None => return Err(StoreError::NotFound(format!("session {session_id}"))),
            };
            if status == SessionStatus::Closed {
                return Err(StoreError::Conflict(format!("session {session_id} is closed")));
            }

            let id = MessageId::new();
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO chat_messages (id, session_id, role, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    id.as_str(),
                    session_id.as_str(),
                    role.to_string(),
                    content,
                    now,
                ],
            )?;

            Ok(ChatMessage {
                id,
                session_id: session_id.clone(),
                role,
                content: content.to_string(),
                created_at: now,
            })
        })
    }

    /// List messages for a session, oldest first. Ties on `created_at`
    /// break on message ID, which is time-ordered, so the result follows
    /// arrival order. `None` returns the full history.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list(
        &self,
        session_id: &SessionId,
        limit: Option<u32>,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        self.db.with_conn(|conn| {
            // SQLite treats a negative LIMIT as "no limit".
            let limit = limit.map_or(-1, i64::from);
            let mut stmt = conn.prepare(
                "SELECT id, session_id, role, content, created_at
                 FROM chat_messages WHERE session_id = ?1
                 ORDER BY created_at ASC, id ASC
                 LIMIT ?2",
            )?;
            let mut rows = stmt.query(rusqlite::params![session_id.as_str(), limit])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_message(row)?);
            }
            Ok(results)
        })
    }

    /// The last `n` messages of a session, oldest first.
    #[instrument(skip(self), fields(session_id = %session_id, n))]
    pub fn recent(&self, session_id: &SessionId, n: u32) -> Result<Vec<ChatMessage>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, role, content, created_at
                 FROM chat_messages WHERE session_id = ?1
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?2",
            )?;
            let mut rows = stmt.query(rusqlite::params![session_id.as_str(), n])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_message(row)?);
            }
            results.reverse();
            Ok(results)
        })
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<ChatMessage, StoreError> {
    Ok(ChatMessage {
        id: MessageId::from_raw(decode::column::<String>(row, "chat_messages", "id")?),
        session_id: SessionId::from_raw(decode::column::<String>(
            row,
            "chat_messages",
            "session_id",
        )?),
        role: decode::enum_column(row, "chat_messages", "role")?,
        content: decode::column(row, "chat_messages", "content")?,
        created_at: decode::column(row, "chat_messages", "created_at")?,
    })
}
