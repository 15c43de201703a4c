use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::types::{AuditLogEntry, Notification, NotificationKind, SchedulerError};
use crate::utils::{bool_to_int, format_datetime, parse_datetime};

use super::OutreachStore;

pub(crate) fn insert_notification(
    conn: &Connection,
    notification: &Notification,
) -> Result<(), SchedulerError> {
    conn.execute(
        "INSERT INTO notifications (
            id, workspace_id, kind, severity, title, message, metadata, is_read, created_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            notification.id,
            notification.workspace_id,
            notification.kind.as_str(),
            notification.severity.as_str(),
            notification.title,
            notification.message,
            notification.metadata.to_string(),
            bool_to_int(notification.is_read),
            format_datetime(notification.created_at)
        ],
    )?;
    Ok(())
}

pub(crate) fn insert_audit_log(conn: &Connection, entry: &AuditLogEntry) -> Result<(), SchedulerError> {
    conn.execute(
        "INSERT INTO audit_logs (id, workspace_id, action, entity_type, entity_id, metadata, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            entry.id,
            entry.workspace_id,
            entry.action,
            entry.entity_type,
            entry.entity_id,
            entry.metadata.to_string(),
            format_datetime(entry.created_at)
        ],
    )?;
    Ok(())
}

impl OutreachStore {
    /// Whether a notification of `kind` about `campaign_id` was written at or
    /// after `since`.
    pub fn has_recent_notification(
        &self,
        workspace_id: &str,
        kind: NotificationKind,
        campaign_id: &str,
        since: DateTime<Utc>,
    ) -> Result<bool, SchedulerError> {
        let conn = self.open()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM notifications
                 WHERE workspace_id = ?1 AND kind = ?2
                   AND json_extract(metadata, '$.campaignId') = ?3
                   AND created_at >= ?4
                 LIMIT 1",
                params![workspace_id, kind.as_str(), campaign_id, format_datetime(since)],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Newest first.
    pub fn list_notifications(&self, workspace_id: &str) -> Result<Vec<Notification>, SchedulerError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, workspace_id, kind, severity, title, message, metadata, is_read, created_at
             FROM notifications WHERE workspace_id = ?1
             ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map(params![workspace_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, i64>(7)?,
                row.get::<_, String>(8)?,
            ))
        })?;
        let mut notifications = Vec::new();
        for row in rows {
            let (id, workspace_id, kind, severity, title, message, metadata, is_read, created_at) = row?;
            notifications.push(Notification {
                id,
                workspace_id,
                kind: kind.parse()?,
                severity: severity.parse()?,
                title,
                message,
                metadata: serde_json::from_str(&metadata)?,
                is_read: is_read != 0,
                created_at: parse_datetime(&created_at)?,
            });
        }
        Ok(notifications)
    }

    /// Entries for one entity, oldest first.
    pub fn list_audit_logs(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<AuditLogEntry>, SchedulerError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, workspace_id, action, entity_type, entity_id, metadata, created_at
             FROM audit_logs WHERE entity_type = ?1 AND entity_id = ?2
             ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![entity_type, entity_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;
        let mut entries = Vec::new();
        for row in rows {
            let (id, workspace_id, action, entity_type, entity_id, metadata, created_at) = row?;
            entries.push(AuditLogEntry {
                id,
                workspace_id,
                action,
                entity_type,
                entity_id,
                metadata: serde_json::from_str(&metadata)?,
                created_at: parse_datetime(&created_at)?,
            });
        }
        Ok(entries)
    }
}
