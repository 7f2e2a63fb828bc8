use chrono::Utc;
use tracing::instrument;

use parlor_core::chat::{ChatSession, SessionStatus};
use parlor_core::ids::{SessionId, VisitorId};

use crate::database::Database;
use crate::decode;
use crate::error::StoreError;

pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a new active session for a visitor.
    #[instrument(skip(self, metadata), fields(visitor_id = %visitor_id))]
    pub fn create(
        &self,
        visitor_id: &VisitorId,
        visitor_name: Option<&str>,
        metadata: serde_json::Value,
    ) -> Result<ChatSession, StoreError> {
        let id = SessionId::new();
        let now = Utc::now().to_rfc3339();
        let metadata_str = serde_json::to_string(&metadata)?;

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO chat_sessions (id, visitor_id, visitor_name, status, metadata, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'active', ?4, ?5, ?6)",
                rusqlite::params![
                    id.as_str(),
                    visitor_id.as_str(),
                    visitor_name,
                    metadata_str,
                    now,
                    now,
                ],
            )?;

            Ok(ChatSession {
                id,
                visitor_id: visitor_id.clone(),
                visitor_name: visitor_name.map(str::to_string),
                status: SessionStatus::Active,
                metadata,
                created_at: now.clone(),
                updated_at: now,
            })
        })
    }

    /// Look up a session by ID. Returns `None` when no such session exists.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn find(&self, id: &SessionId) -> Result<Option<ChatSession>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, visitor_id, visitor_name, status, metadata, created_at, updated_at
                 FROM chat_sessions WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_session(row).map(Some),
                None => Ok(None),
            }
        })
    }

    /// Update a session's status. Returns `true` if the status changed,
    /// `false` if it already had the requested value. Closed sessions never
    /// reopen: a closed-to-active request is rejected as a conflict.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn update_status(
        &self,
        id: &SessionId,
        status: SessionStatus,
    ) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT status FROM chat_sessions WHERE id = ?1")?;
            let mut rows = stmt.query([id.as_str()])?;
            let current: SessionStatus = match rows.next()? {
                Some(row) => decode::enum_column(row, "chat_sessions", "status")?,
                None => return Err(StoreError::NotFound(format!("session {id}"))),
            };
            if current == status {
                return Ok(false);
            }
            if current == SessionStatus::Closed {
                return Err(StoreError::Conflict(format!("session {id} is closed")));
            }

            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE chat_sessions SET status = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![status.to_string(), now, id.as_str()],
            )?;
            Ok(true)
        })
    }

    /// Bump a session's `updated_at` to now.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn touch(&self, id: &SessionId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE chat_sessions SET updated_at = ?1 WHERE id = ?2",
                rusqlite::params![now, id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("session {id}")));
            }
            Ok(())
        })
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<ChatSession, StoreError> {
    Ok(ChatSession {
        id: SessionId::from_raw(decode::column::<String>(row, "chat_sessions", "id")?),
        visitor_id: VisitorId::from_raw(decode::column::<String>(
            row,
            "chat_sessions",
            "visitor_id",
        )?),
        visitor_name: decode::column(row, "chat_sessions", "visitor_name")?,
        status: decode::enum_column(row, "chat_sessions", "status")?,
        metadata: decode::json_column(row, "chat_sessions", "metadata")?,
        created_at: decode::column(row, "chat_sessions", "created_at")?,
        updated_at: decode::column(row, "chat_sessions", "updated_at")?,
    })
}
