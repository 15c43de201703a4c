use rusqlite::Connection;
use std::collections::HashSet;

use crate::types::SchedulerError;

fn table_columns(conn: &Connection, table: &str) -> Result<HashSet<String>, SchedulerError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    let mut columns = HashSet::new();
    for row in rows {
        columns.insert(row?);
    }
    Ok(columns)
}

/// Gmail ids were first tracked only on `sent_emails`; older databases lack
/// them on the scheduled row.
pub(super) fn ensure_scheduled_email_columns(conn: &Connection) -> Result<(), SchedulerError> {
    let columns = table_columns(conn, "scheduled_emails")?;
    if !columns.contains("message_id") {
        conn.execute(
            "ALTER TABLE scheduled_emails ADD COLUMN message_id TEXT",
            [],
        )?;
    }
    if !columns.contains("thread_id") {
        conn.execute("ALTER TABLE scheduled_emails ADD COLUMN thread_id TEXT", [])?;
    }
    Ok(())
}

pub(super) fn ensure_sending_settings_columns(conn: &Connection) -> Result<(), SchedulerError> {
    let columns = table_columns(conn, "sending_settings")?;
    if !columns.contains("from_name") {
        conn.execute("ALTER TABLE sending_settings ADD COLUMN from_name TEXT", [])?;
    }
    if !columns.contains("signature") {
        conn.execute("ALTER TABLE sending_settings ADD COLUMN signature TEXT", [])?;
    }
    Ok(())
}
