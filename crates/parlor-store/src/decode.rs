//! Column readers that tag every failure with the table and column it
//! came from, so a corrupt row names itself in the error.

use crate::error::StoreError;

fn corrupt(table: &'static str, column: &'static str, detail: impl Into<String>) -> StoreError {
    StoreError::CorruptRow {
        table,
        column,
        detail: detail.into(),
    }
}

/// Read a column by name. `Option<T>` targets map NULL to `None`.
pub fn column<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    table: &'static str,
    name: &'static str,
) -> Result<T, StoreError> {
    row.get(name).map_err(|e| corrupt(table, name, e.to_string()))
}

/// Read a TEXT column holding one of an enum's string forms.
pub fn enum_column<T: std::str::FromStr>(
    row: &rusqlite::Row<'_>,
    table: &'static str,
    name: &'static str,
) -> Result<T, StoreError> {
    let raw: String = column(row, table, name)?;
    raw.parse()
        .map_err(|_| corrupt(table, name, format!("unknown variant: {raw}")))
}

/// Read a TEXT column holding JSON.
pub fn json_column(
    row: &rusqlite::Row<'_>,
    table: &'static str,
    name: &'static str,
) -> Result<serde_json::Value, StoreError> {
    let raw: String = column(row, table, name)?;
    serde_json::from_str(&raw).map_err(|e| corrupt(table, name, format!("invalid JSON: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parlor_core::chat::{MessageRole, SessionStatus};
    use rusqlite::Connection;

    fn with_row<T>(sql: &str, f: impl FnOnce(&rusqlite::Row<'_>) -> T) -> T {
        let conn = Connection::open_in_memory().unwrap();
        let mut stmt = conn.prepare(sql).unwrap();
        let mut rows = stmt.query([]).unwrap();
        f(rows.next().unwrap().unwrap())
    }

    #[test]
    fn column_by_name() {
        with_row("SELECT 'hello' AS content, NULL AS visitor_name", |row| {
            let content: String = column(row, "chat_messages", "content").unwrap();
            assert_eq!(content, "hello");
            let name: Option<String> = column(row, "chat_sessions", "visitor_name").unwrap();
            assert_eq!(name, None);
        });
    }

    #[test]
    fn missing_column_is_corrupt() {
        with_row("SELECT 'x' AS other", |row| {
            let result: Result<String, _> = column(row, "chat_messages", "content");
            assert!(matches!(
                result,
                Err(StoreError::CorruptRow {
                    table: "chat_messages",
                    column: "content",
                    ..
                })
            ));
        });
    }

    #[test]
    fn enum_column_parses_known_variants() {
        with_row("SELECT 'closed' AS status, 'robot' AS role", |row| {
            let status: SessionStatus = enum_column(row, "chat_sessions", "status").unwrap();
            assert_eq!(status, SessionStatus::Closed);

            let role: Result<MessageRole, _> = enum_column(row, "chat_messages", "role");
            assert!(matches!(
                role,
                Err(StoreError::CorruptRow { column: "role", .. })
            ));
        });
    }

    #[test]
    fn json_column_parses() {
        with_row(r#"SELECT '{"page":"/"}' AS metadata, 'nope' AS broken"#, |row| {
            let value = json_column(row, "chat_sessions", "metadata").unwrap();
            assert_eq!(value["page"], "/");

            let bad = json_column(row, "chat_sessions", "broken");
            assert!(matches!(bad, Err(StoreError::CorruptRow { .. })));
        });
    }
}
