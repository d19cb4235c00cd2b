use rusqlite::Connection;

// Channel lists are sorted by last activity.
const UP_SQL: &str = r#"
ALTER TABLE channels ADD COLUMN updated_at TEXT;
UPDATE channels SET updated_at = created_at WHERE updated_at IS NULL;
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
