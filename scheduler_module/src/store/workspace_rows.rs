use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::sending_window::{parse_timezone, SendingSettings};
use crate::types::{GmailToken, Prospect, ProspectStatus, SchedulerError, Sequence, SequenceStep, Workspace};
use crate::utils::{bool_to_int, format_datetime, join_weekdays, parse_datetime, split_weekdays};

use super::OutreachStore;

impl OutreachStore {
    pub fn insert_workspace(&self, workspace: &Workspace) -> Result<(), SchedulerError> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO workspaces (id, name, onboarding_complete, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                workspace.id,
                workspace.name,
                bool_to_int(workspace.onboarding_complete),
                format_datetime(workspace.created_at)
            ],
        )?;
        Ok(())
    }

    pub fn load_workspace(&self, workspace_id: &str) -> Result<Option<Workspace>, SchedulerError> {
        let conn = self.open()?;
        let row = conn
            .query_row(
                "SELECT id, name, onboarding_complete, created_at FROM workspaces WHERE id = ?1",
                params![workspace_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;
        match row {
            Some((id, name, onboarding_raw, created_at_raw)) => Ok(Some(Workspace {
                id,
                name,
                onboarding_complete: onboarding_raw != 0,
                created_at: parse_datetime(&created_at_raw)?,
            })),
            None => Ok(None),
        }
    }

    pub fn set_onboarding_complete(
        &self,
        workspace_id: &str,
        complete: bool,
    ) -> Result<(), SchedulerError> {
        let conn = self.open()?;
        let updated = conn.execute(
            "UPDATE workspaces SET onboarding_complete = ?1 WHERE id = ?2",
            params![bool_to_int(complete), workspace_id],
        )?;
        if updated == 0 {
            return Err(SchedulerError::NotFound(format!("workspace {}", workspace_id)));
        }
        Ok(())
    }

    pub fn upsert_sending_settings(
        &self,
        workspace_id: &str,
        settings: &SendingSettings,
    ) -> Result<(), SchedulerError> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO sending_settings (
                workspace_id, sending_days, start_hour, end_hour, timezone, daily_quota,
                ramp_up_enabled, from_name, signature, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(workspace_id) DO UPDATE SET
                sending_days = excluded.sending_days,
                start_hour = excluded.start_hour,
                end_hour = excluded.end_hour,
                timezone = excluded.timezone,
                daily_quota = excluded.daily_quota,
                ramp_up_enabled = excluded.ramp_up_enabled,
                from_name = excluded.from_name,
                signature = excluded.signature,
                updated_at = excluded.updated_at",
            params![
                workspace_id,
                join_weekdays(&settings.sending_days),
                settings.start_hour,
                settings.end_hour,
                settings.timezone.name(),
                settings.daily_quota,
                bool_to_int(settings.ramp_up_enabled),
                settings.from_name,
                settings.signature,
                format_datetime(Utc::now())
            ],
        )?;
        Ok(())
    }

    /// Stored settings for the workspace, or the defaults when none were saved.
    pub fn load_sending_settings(
        &self,
        workspace_id: &str,
    ) -> Result<SendingSettings, SchedulerError> {
        let conn = self.open()?;
        let row = conn
            .query_row(
                "SELECT sending_days, start_hour, end_hour, timezone, daily_quota, ramp_up_enabled,
                        from_name, signature
                 FROM sending_settings WHERE workspace_id = ?1",
                params![workspace_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, u32>(1)?,
                        row.get::<_, u32>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, u32>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, Option<String>>(7)?,
                    ))
                },
            )
            .optional()?;
        let Some((days_raw, start_hour, end_hour, timezone_raw, daily_quota, ramp_raw, from_name, signature)) =
            row
        else {
            return Ok(SendingSettings::default());
        };
        Ok(SendingSettings {
            sending_days: split_weekdays(&days_raw)?.into_iter().collect(),
            start_hour,
            end_hour,
            timezone: parse_timezone(&timezone_raw)?,
            daily_quota,
            ramp_up_enabled: ramp_raw != 0,
            from_name,
            signature,
        })
    }

    pub fn upsert_gmail_token(&self, token: &GmailToken) -> Result<(), SchedulerError> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO gmail_tokens (workspace_id, email, access_token, refresh_token, expires_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(workspace_id) DO UPDATE SET
                email = excluded.email,
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at",
            params![
                token.workspace_id,
                token.email,
                token.access_token,
                token.refresh_token,
                format_datetime(token.expires_at),
                format_datetime(Utc::now())
            ],
        )?;
        Ok(())
    }

    pub fn load_gmail_token(&self, workspace_id: &str) -> Result<Option<GmailToken>, SchedulerError> {
        let conn = self.open()?;
        let row = conn
            .query_row(
                "SELECT workspace_id, email, access_token, refresh_token, expires_at
                 FROM gmail_tokens WHERE workspace_id = ?1",
                params![workspace_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;
        match row {
            Some((workspace_id, email, access_token, refresh_token, expires_at_raw)) => {
                Ok(Some(GmailToken {
                    workspace_id,
                    email,
                    access_token,
                    refresh_token,
                    expires_at: parse_datetime(&expires_at_raw)?,
                }))
            }
            None => Ok(None),
        }
    }

    pub fn update_gmail_access_token(
        &self,
        workspace_id: &str,
        access_token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE gmail_tokens SET access_token = ?1, expires_at = ?2, updated_at = ?3
             WHERE workspace_id = ?4",
            params![
                access_token,
                format_datetime(expires_at),
                format_datetime(Utc::now()),
                workspace_id
            ],
        )?;
        Ok(())
    }

    pub fn delete_gmail_token(&self, workspace_id: &str) -> Result<bool, SchedulerError> {
        let conn = self.open()?;
        let deleted = conn.execute(
            "DELETE FROM gmail_tokens WHERE workspace_id = ?1",
            params![workspace_id],
        )?;
        Ok(deleted > 0)
    }

    pub fn insert_prospect(&self, prospect: &Prospect) -> Result<(), SchedulerError> {
        let conn = self.open()?;
        let created_at = format_datetime(prospect.created_at);
        conn.execute(
            "INSERT INTO prospects (
                id, workspace_id, email, first_name, last_name, company, title, status,
                created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                prospect.id,
                prospect.workspace_id,
                prospect.email,
                prospect.first_name,
                prospect.last_name,
                prospect.company,
                prospect.title,
                prospect.status.as_str(),
                created_at
            ],
        )?;
        Ok(())
    }

    pub fn load_prospect(&self, prospect_id: &str) -> Result<Option<Prospect>, SchedulerError> {
        let conn = self.open()?;
        let row = conn
            .query_row(
                "SELECT id, workspace_id, email, first_name, last_name, company, title, status, created_at
                 FROM prospects WHERE id = ?1",
                params![prospect_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, String>(8)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, workspace_id, email, first_name, last_name, company, title, status_raw, created_at_raw)) =
            row
        else {
            return Ok(None);
        };
        Ok(Some(Prospect {
            id,
            workspace_id,
            email,
            first_name,
            last_name,
            company,
            title,
            status: status_raw.parse()?,
            created_at: parse_datetime(&created_at_raw)?,
        }))
    }

    pub fn update_prospect_status(
        &self,
        prospect_id: &str,
        status: ProspectStatus,
    ) -> Result<(), SchedulerError> {
        let conn = self.open()?;
        let updated = conn.execute(
            "UPDATE prospects SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), format_datetime(Utc::now()), prospect_id],
        )?;
        if updated == 0 {
            return Err(SchedulerError::NotFound(format!("prospect {}", prospect_id)));
        }
        Ok(())
    }

    pub fn insert_sequence(&self, sequence: &Sequence) -> Result<(), SchedulerError> {
        self.with_transaction(|tx| {
            tx.execute(
                "INSERT INTO sequences (id, workspace_id, name, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    sequence.id,
                    sequence.workspace_id,
                    sequence.name,
                    format_datetime(sequence.created_at)
                ],
            )?;
            for step in &sequence.steps {
                tx.execute(
                    "INSERT INTO sequence_steps (sequence_id, step_number, delay_days, subject, body)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        sequence.id,
                        step.step_number,
                        step.delay_days,
                        step.subject,
                        step.body
                    ],
                )?;
            }
            Ok::<_, SchedulerError>(())
        })
    }

    /// Steps ordered by step number.
    pub fn load_sequence_steps(&self, sequence_id: &str) -> Result<Vec<SequenceStep>, SchedulerError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT step_number, delay_days, subject, body
             FROM sequence_steps WHERE sequence_id = ?1
             ORDER BY step_number",
        )?;
        let rows = stmt.query_map(params![sequence_id], |row| {
            Ok(SequenceStep {
                step_number: row.get(0)?,
                delay_days: row.get(1)?,
                subject: row.get(2)?,
                body: row.get(3)?,
            })
        })?;
        let mut steps = Vec::new();
        for row in rows {
            steps.push(row?);
        }
        Ok(steps)
    }
}
