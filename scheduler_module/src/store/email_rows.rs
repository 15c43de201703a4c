use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::idempotency::cancelled_key;
use crate::types::{
    CampaignProspect, Conversation, InboxMessage, ScheduledEmail, ScheduledEmailStatus,
    SchedulerError, SentEmail,
};
use crate::utils::{format_datetime, format_optional_datetime, parse_datetime, parse_optional_datetime};

use super::OutreachStore;

const EMAIL_COLUMNS: &str = "id, workspace_id, campaign_id, campaign_prospect_id, prospect_id,
    sequence_id, step_number, idempotency_key, status, scheduled_for, sent_at, message_id,
    thread_id, last_error, attempt_count, next_retry_at, created_at, updated_at";

const SENT_COLUMNS: &str = "id, workspace_id, campaign_id, prospect_id, scheduled_email_id,
    step_number, message_id, thread_id, subject, headers, sent_at";

const PENDING_STATUSES: &str = "('SCHEDULED', 'RETRY_SCHEDULED')";

const SENT_OR_SENDING_COUNT: &str = "SELECT COUNT(*) FROM scheduled_emails
     WHERE workspace_id = ?1
       AND ((status = 'SENT' AND sent_at >= ?2 AND sent_at < ?3) OR status = 'SENDING')";

/// Result of [`OutreachStore::claim_within_quota`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    /// Another worker holds the row, or it left the pending states.
    AlreadyClaimed,
    /// The workspace already sent or is sending its cap for the day.
    QuotaExceeded,
}

struct EmailRow {
    id: String,
    workspace_id: String,
    campaign_id: String,
    campaign_prospect_id: String,
    prospect_id: String,
    sequence_id: String,
    step_number: u32,
    idempotency_key: String,
    status: String,
    scheduled_for: String,
    sent_at: Option<String>,
    message_id: Option<String>,
    thread_id: Option<String>,
    last_error: Option<String>,
    attempt_count: u32,
    next_retry_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl EmailRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            workspace_id: row.get(1)?,
            campaign_id: row.get(2)?,
            campaign_prospect_id: row.get(3)?,
            prospect_id: row.get(4)?,
            sequence_id: row.get(5)?,
            step_number: row.get(6)?,
            idempotency_key: row.get(7)?,
            status: row.get(8)?,
            scheduled_for: row.get(9)?,
            sent_at: row.get(10)?,
            message_id: row.get(11)?,
            thread_id: row.get(12)?,
            last_error: row.get(13)?,
            attempt_count: row.get(14)?,
            next_retry_at: row.get(15)?,
            created_at: row.get(16)?,
            updated_at: row.get(17)?,
        })
    }

    fn into_email(self) -> Result<ScheduledEmail, SchedulerError> {
        Ok(ScheduledEmail {
            status: self.status.parse()?,
            scheduled_for: parse_datetime(&self.scheduled_for)?,
            sent_at: parse_optional_datetime(self.sent_at.as_deref())?,
            next_retry_at: parse_optional_datetime(self.next_retry_at.as_deref())?,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
            id: self.id,
            workspace_id: self.workspace_id,
            campaign_id: self.campaign_id,
            campaign_prospect_id: self.campaign_prospect_id,
            prospect_id: self.prospect_id,
            sequence_id: self.sequence_id,
            step_number: self.step_number,
            idempotency_key: self.idempotency_key,
            message_id: self.message_id,
            thread_id: self.thread_id,
            last_error: self.last_error,
            attempt_count: self.attempt_count,
        })
    }
}

fn collect_emails(
    rows: impl Iterator<Item = rusqlite::Result<EmailRow>>,
) -> Result<Vec<ScheduledEmail>, SchedulerError> {
    let mut emails = Vec::new();
    for row in rows {
        emails.push(row?.into_email()?);
    }
    Ok(emails)
}

struct SentRow {
    email: SentEmail,
    headers_raw: String,
    sent_at_raw: String,
}

impl SentRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            email: SentEmail {
                id: row.get(0)?,
                workspace_id: row.get(1)?,
                campaign_id: row.get(2)?,
                prospect_id: row.get(3)?,
                scheduled_email_id: row.get(4)?,
                step_number: row.get(5)?,
                message_id: row.get(6)?,
                thread_id: row.get(7)?,
                subject: row.get(8)?,
                headers: BTreeMap::new(),
                sent_at: Utc::now(),
            },
            headers_raw: row.get(9)?,
            sent_at_raw: row.get(10)?,
        })
    }

    fn into_sent_email(self) -> Result<SentEmail, SchedulerError> {
        Ok(SentEmail {
            headers: serde_json::from_str(&self.headers_raw)?,
            sent_at: parse_datetime(&self.sent_at_raw)?,
            ..self.email
        })
    }
}

fn id_and_key(row: &Row<'_>) -> rusqlite::Result<(String, String)> {
    Ok((row.get(0)?, row.get(1)?))
}

/// Which pending rows a stop or reply cancels.
#[derive(Debug, Clone, Copy)]
pub(crate) enum CancelScope<'a> {
    Campaign(&'a str),
    Enrollment {
        campaign_id: &'a str,
        prospect_id: &'a str,
    },
}

/// Cancels every SCHEDULED or RETRY_SCHEDULED row in `scope`.
///
/// With a `key_suffix` the idempotency key is rewritten through
/// [`cancelled_key`] so the same step can be scheduled again later.
pub(crate) fn cancel_pending_emails(
    conn: &Connection,
    scope: CancelScope<'_>,
    reason: &str,
    key_suffix: Option<&str>,
    now: DateTime<Utc>,
) -> Result<usize, SchedulerError> {
    let (filter, campaign_id, prospect_id) = match scope {
        CancelScope::Campaign(campaign_id) => ("campaign_id = ?1", campaign_id, None),
        CancelScope::Enrollment {
            campaign_id,
            prospect_id,
        } => (
            "campaign_id = ?1 AND prospect_id = ?2",
            campaign_id,
            Some(prospect_id),
        ),
    };
    let pending: Vec<(String, String)> = {
        let mut stmt = conn.prepare(&format!(
            "SELECT id, idempotency_key FROM scheduled_emails
             WHERE {} AND status IN {}",
            filter, PENDING_STATUSES
        ))?;
        let rows = match prospect_id {
            Some(prospect_id) => stmt.query_map(params![campaign_id, prospect_id], id_and_key)?,
            None => stmt.query_map(params![campaign_id], id_and_key)?,
        };
        rows.collect::<rusqlite::Result<_>>()?
    };

    let now_raw = format_datetime(now);
    let mut cancelled = 0;
    for (id, key) in pending {
        let key = match key_suffix {
            Some(suffix) => cancelled_key(&key, suffix),
            None => key,
        };
        cancelled += conn.execute(
            &format!(
                "UPDATE scheduled_emails
                 SET status = 'CANCELLED', idempotency_key = ?1, last_error = ?2, updated_at = ?3
                 WHERE id = ?4 AND status IN {}",
                PENDING_STATUSES
            ),
            params![key, reason, now_raw, id],
        )?;
    }
    Ok(cancelled)
}

/// Moves every pending row of a campaign later by `delta`, used when a pause
/// ends so follow-up spacing is preserved.
pub(crate) fn shift_pending_emails(
    conn: &Connection,
    campaign_id: &str,
    delta: Duration,
    now: DateTime<Utc>,
) -> Result<usize, SchedulerError> {
    let pending: Vec<(String, String, Option<String>)> = {
        let mut stmt = conn.prepare(&format!(
            "SELECT id, scheduled_for, next_retry_at FROM scheduled_emails
             WHERE campaign_id = ?1 AND status IN {}",
            PENDING_STATUSES
        ))?;
        let rows = stmt.query_map(params![campaign_id], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?;
        rows.collect::<rusqlite::Result<_>>()?
    };

    let now_raw = format_datetime(now);
    for (id, scheduled_for_raw, next_retry_raw) in &pending {
        let scheduled_for = parse_datetime(scheduled_for_raw)? + delta;
        let next_retry_at = parse_optional_datetime(next_retry_raw.as_deref())?.map(|at| at + delta);
        conn.execute(
            "UPDATE scheduled_emails SET scheduled_for = ?1, next_retry_at = ?2, updated_at = ?3
             WHERE id = ?4",
            params![
                format_datetime(scheduled_for),
                format_optional_datetime(next_retry_at),
                now_raw,
                id
            ],
        )?;
    }
    Ok(pending.len())
}

/// Everything written after Gmail accepted a message.
#[derive(Debug)]
pub(crate) struct SendRecord<'a> {
    pub email: &'a ScheduledEmail,
    pub message_id: &'a str,
    pub thread_id: &'a str,
    pub subject: &'a str,
    pub body: &'a str,
    pub from_email: &'a str,
    pub to_email: &'a str,
    pub headers: &'a BTreeMap<String, String>,
    pub sent_at: DateTime<Utc>,
    /// Enrollment after advancing past this step; written only if nobody
    /// moved it in the meantime.
    pub next_enrollment: Option<&'a CampaignProspect>,
}

/// Raw counts behind the anomaly rates for one campaign window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct DeliveryStats {
    /// SENT rows last touched inside the window.
    pub sent_updated: u32,
    /// SENT rows whose `sent_at` falls inside the window.
    pub sent_in_window: u32,
    /// `last_error` of PERMANENTLY_FAILED rows touched inside the window.
    pub failure_errors: Vec<String>,
    /// Enrolled prospects now UNSUBSCRIBED, regardless of when.
    pub unsubscribed: u32,
}

impl OutreachStore {
    /// Inserts the row unless its idempotency key already exists.
    pub fn insert_scheduled_email(&self, email: &ScheduledEmail) -> Result<bool, SchedulerError> {
        let conn = self.open()?;
        let inserted = conn.execute(
            &format!(
                "INSERT INTO scheduled_emails ({})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
                 ON CONFLICT(idempotency_key) DO NOTHING",
                EMAIL_COLUMNS
            ),
            params![
                email.id,
                email.workspace_id,
                email.campaign_id,
                email.campaign_prospect_id,
                email.prospect_id,
                email.sequence_id,
                email.step_number,
                email.idempotency_key,
                email.status.as_str(),
                format_datetime(email.scheduled_for),
                format_optional_datetime(email.sent_at),
                email.message_id,
                email.thread_id,
                email.last_error,
                email.attempt_count,
                format_optional_datetime(email.next_retry_at),
                format_datetime(email.created_at),
                format_datetime(email.updated_at)
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn scheduled_email_exists(&self, idempotency_key: &str) -> Result<bool, SchedulerError> {
        let conn = self.open()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM scheduled_emails WHERE idempotency_key = ?1",
                params![idempotency_key],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn load_scheduled_email(&self, id: &str) -> Result<Option<ScheduledEmail>, SchedulerError> {
        let conn = self.open()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM scheduled_emails WHERE id = ?1", EMAIL_COLUMNS),
                params![id],
                EmailRow::from_row,
            )
            .optional()?;
        row.map(EmailRow::into_email).transpose()
    }

    /// All rows of a campaign ordered by prospect then step.
    pub fn scheduled_emails_for_campaign(
        &self,
        campaign_id: &str,
    ) -> Result<Vec<ScheduledEmail>, SchedulerError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM scheduled_emails WHERE campaign_id = ?1
             ORDER BY prospect_id, step_number, created_at",
            EMAIL_COLUMNS
        ))?;
        let rows = stmt.query_map(params![campaign_id], EmailRow::from_row)?;
        collect_emails(rows)
    }

    /// SCHEDULED rows that are due plus RETRY_SCHEDULED rows whose retry time
    /// has passed, earliest first.
    pub fn due_scheduled_emails(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledEmail>, SchedulerError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM scheduled_emails
             WHERE (status = 'SCHEDULED' AND scheduled_for <= ?1)
                OR (status = 'RETRY_SCHEDULED' AND next_retry_at IS NOT NULL AND next_retry_at <= ?1)
             ORDER BY scheduled_for, created_at
             LIMIT ?2",
            EMAIL_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![format_datetime(now), limit as i64],
            EmailRow::from_row,
        )?;
        collect_emails(rows)
    }

    /// Moves a pending row to SENDING. Returns false when another worker got
    /// there first or the row left the pending states.
    pub fn claim_for_sending(&self, id: &str, now: DateTime<Utc>) -> Result<bool, SchedulerError> {
        let conn = self.open()?;
        let updated = conn.execute(
            &format!(
                "UPDATE scheduled_emails SET status = 'SENDING', updated_at = ?1
                 WHERE id = ?2 AND status IN {}",
                PENDING_STATUSES
            ),
            params![format_datetime(now), id],
        )?;
        Ok(updated > 0)
    }

    /// Claims `email` only while its workspace has fewer than `daily_cap`
    /// rows SENT in `[day_start, day_end)` or SENDING. The count and the
    /// status flip share one write transaction.
    pub fn claim_within_quota(
        &self,
        email: &ScheduledEmail,
        day_start: DateTime<Utc>,
        day_end: DateTime<Utc>,
        daily_cap: u32,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, SchedulerError> {
        self.with_transaction(|tx| {
            let pending: bool = tx.query_row(
                &format!(
                    "SELECT EXISTS(SELECT 1 FROM scheduled_emails WHERE id = ?1 AND status IN {})",
                    PENDING_STATUSES
                ),
                params![email.id],
                |row| row.get(0),
            )?;
            if !pending {
                return Ok(ClaimOutcome::AlreadyClaimed);
            }
            let used: u32 = tx.query_row(
                SENT_OR_SENDING_COUNT,
                params![
                    email.workspace_id,
                    format_datetime(day_start),
                    format_datetime(day_end)
                ],
                |row| row.get(0),
            )?;
            if used >= daily_cap {
                return Ok(ClaimOutcome::QuotaExceeded);
            }
            tx.execute(
                "UPDATE scheduled_emails SET status = 'SENDING', updated_at = ?1 WHERE id = ?2",
                params![format_datetime(now), email.id],
            )?;
            Ok(ClaimOutcome::Claimed)
        })
    }

    /// Hands a SENDING row back to `status` (SCHEDULED or RETRY_SCHEDULED)
    /// when it was claimed but never reached the transport.
    pub fn release_claim(
        &self,
        id: &str,
        status: ScheduledEmailStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, SchedulerError> {
        if !status.is_pending() {
            return Err(SchedulerError::Storage(format!(
                "cannot release scheduled email {} to {}",
                id, status
            )));
        }
        let conn = self.open()?;
        let updated = conn.execute(
            "UPDATE scheduled_emails SET status = ?1, updated_at = ?2
             WHERE id = ?3 AND status = 'SENDING'",
            params![status.as_str(), format_datetime(now), id],
        )?;
        Ok(updated > 0)
    }

    pub fn mark_retry_scheduled(
        &self,
        id: &str,
        attempt_count: u32,
        next_retry_at: DateTime<Utc>,
        last_error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, SchedulerError> {
        let conn = self.open()?;
        let updated = conn.execute(
            "UPDATE scheduled_emails
             SET status = 'RETRY_SCHEDULED', attempt_count = ?1, next_retry_at = ?2,
                 last_error = ?3, updated_at = ?4
             WHERE id = ?5 AND status = 'SENDING'",
            params![
                attempt_count,
                format_datetime(next_retry_at),
                last_error,
                format_datetime(now),
                id
            ],
        )?;
        Ok(updated > 0)
    }

    pub fn mark_permanently_failed(
        &self,
        id: &str,
        attempt_count: u32,
        last_error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, SchedulerError> {
        let conn = self.open()?;
        let updated = conn.execute(
            "UPDATE scheduled_emails
             SET status = 'PERMANENTLY_FAILED', attempt_count = ?1, next_retry_at = NULL,
                 last_error = ?2, updated_at = ?3
             WHERE id = ?4 AND status = 'SENDING'",
            params![attempt_count, last_error, format_datetime(now), id],
        )?;
        Ok(updated > 0)
    }

    /// Cancels one pending row, keeping its idempotency key.
    pub fn cancel_scheduled_email(
        &self,
        id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, SchedulerError> {
        let conn = self.open()?;
        let updated = conn.execute(
            &format!(
                "UPDATE scheduled_emails SET status = 'CANCELLED', last_error = ?1, updated_at = ?2
                 WHERE id = ?3 AND status IN {}",
                PENDING_STATUSES
            ),
            params![reason, format_datetime(now), id],
        )?;
        Ok(updated > 0)
    }

    /// Rows of the workspace planned for `[start, end)` that still count
    /// against the daily quota.
    pub fn count_quota_usage(
        &self,
        workspace_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u32, SchedulerError> {
        let conn = self.open()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM scheduled_emails
             WHERE workspace_id = ?1 AND scheduled_for >= ?2 AND scheduled_for < ?3
               AND status NOT IN ('CANCELLED', 'PERMANENTLY_FAILED')",
            params![workspace_id, format_datetime(start), format_datetime(end)],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// SENT rows with `sent_at` in `[start, end)` plus every row currently
    /// SENDING for the workspace.
    pub fn count_sent_or_sending(
        &self,
        workspace_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u32, SchedulerError> {
        let conn = self.open()?;
        let count = conn.query_row(
            SENT_OR_SENDING_COUNT,
            params![workspace_id, format_datetime(start), format_datetime(end)],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Sent message for one step of an enrollment, if any.
    pub fn sent_email_for_step(
        &self,
        campaign_id: &str,
        prospect_id: &str,
        step_number: u32,
    ) -> Result<Option<SentEmail>, SchedulerError> {
        let conn = self.open()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM sent_emails
                     WHERE campaign_id = ?1 AND prospect_id = ?2 AND step_number = ?3
                     ORDER BY sent_at LIMIT 1",
                    SENT_COLUMNS
                ),
                params![campaign_id, prospect_id, step_number],
                SentRow::from_row,
            )
            .optional()?;
        row.map(SentRow::into_sent_email).transpose()
    }

    /// Distinct steps already sent to the prospect in this campaign.
    pub fn count_sent_steps(
        &self,
        campaign_id: &str,
        prospect_id: &str,
    ) -> Result<u32, SchedulerError> {
        let conn = self.open()?;
        let count = conn.query_row(
            "SELECT COUNT(DISTINCT step_number) FROM sent_emails
             WHERE campaign_id = ?1 AND prospect_id = ?2",
            params![campaign_id, prospect_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn sent_emails_for_campaign(
        &self,
        campaign_id: &str,
    ) -> Result<Vec<SentEmail>, SchedulerError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sent_emails WHERE campaign_id = ?1 ORDER BY sent_at, step_number",
            SENT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![campaign_id], SentRow::from_row)?;
        let mut sent = Vec::new();
        for row in rows {
            sent.push(row?.into_sent_email()?);
        }
        Ok(sent)
    }

    /// Marks the row SENT and records the message, its conversation and the
    /// enrollment advance in one transaction.
    pub(crate) fn record_successful_send(
        &self,
        record: &SendRecord<'_>,
    ) -> Result<(), SchedulerError> {
        let email = record.email;
        let sent_at = format_datetime(record.sent_at);
        self.with_transaction(|tx| {
            let updated = tx.execute(
                "UPDATE scheduled_emails
                 SET status = 'SENT', sent_at = ?1, message_id = ?2, thread_id = ?3,
                     last_error = NULL, next_retry_at = NULL, updated_at = ?1
                 WHERE id = ?4 AND status = 'SENDING'",
                params![sent_at, record.message_id, record.thread_id, email.id],
            )?;
            if updated == 0 {
                return Err(SchedulerError::Storage(format!(
                    "scheduled email {} is no longer SENDING",
                    email.id
                )));
            }

            tx.execute(
                &format!(
                    "INSERT INTO sent_emails ({})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    SENT_COLUMNS
                ),
                params![
                    Uuid::new_v4().to_string(),
                    email.workspace_id,
                    email.campaign_id,
                    email.prospect_id,
                    email.id,
                    email.step_number,
                    record.message_id,
                    record.thread_id,
                    record.subject,
                    serde_json::to_string(record.headers)?,
                    sent_at
                ],
            )?;

            tx.execute(
                "INSERT INTO conversations (
                    id, workspace_id, prospect_id, campaign_id, thread_id, subject, status,
                    last_message_at, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'OPEN', ?7, ?7)
                 ON CONFLICT(workspace_id, thread_id) DO UPDATE SET
                    last_message_at = excluded.last_message_at,
                    status = 'OPEN'",
                params![
                    Uuid::new_v4().to_string(),
                    email.workspace_id,
                    email.prospect_id,
                    email.campaign_id,
                    record.thread_id,
                    record.subject,
                    sent_at
                ],
            )?;
            let conversation_id: String = tx.query_row(
                "SELECT id FROM conversations WHERE workspace_id = ?1 AND thread_id = ?2",
                params![email.workspace_id, record.thread_id],
                |row| row.get(0),
            )?;

            tx.execute(
                "INSERT INTO inbox_messages (
                    id, conversation_id, gmail_message_id, direction, from_email, to_email,
                    subject, body, is_read, received_at
                 ) VALUES (?1, ?2, ?3, 'OUTBOUND', ?4, ?5, ?6, ?7, 1, ?8)
                 ON CONFLICT(conversation_id, gmail_message_id) DO UPDATE SET is_read = 1",
                params![
                    Uuid::new_v4().to_string(),
                    conversation_id,
                    record.message_id,
                    record.from_email,
                    record.to_email,
                    record.subject,
                    record.body,
                    sent_at
                ],
            )?;

            if let Some(enrollment) = record.next_enrollment {
                tx.execute(
                    "UPDATE campaign_prospects
                     SET current_step = ?1, enrollment_status = ?2, completed_at = ?3
                     WHERE id = ?4 AND current_step = ?5",
                    params![
                        enrollment.current_step,
                        enrollment.enrollment_status.as_str(),
                        format_optional_datetime(enrollment.completed_at),
                        enrollment.id,
                        email.step_number
                    ],
                )?;
            }
            Ok(())
        })
    }

    /// Fails rows stuck in SENDING since before `stale_before`. The message
    /// may or may not have left, so they are not retried.
    pub fn fail_stale_sending(
        &self,
        stale_before: DateTime<Utc>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, SchedulerError> {
        let conn = self.open()?;
        let updated = conn.execute(
            "UPDATE scheduled_emails
             SET status = 'PERMANENTLY_FAILED', last_error = ?1, updated_at = ?2
             WHERE status = 'SENDING' AND updated_at < ?3",
            params![reason, format_datetime(now), format_datetime(stale_before)],
        )?;
        Ok(updated)
    }

    pub(crate) fn delivery_stats(
        &self,
        campaign_id: &str,
        since: DateTime<Utc>,
    ) -> Result<DeliveryStats, SchedulerError> {
        let conn = self.open()?;
        let since_raw = format_datetime(since);
        let (sent_updated, sent_in_window) = conn.query_row(
            "SELECT
                COALESCE(SUM(CASE WHEN updated_at >= ?2 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN sent_at >= ?2 THEN 1 ELSE 0 END), 0)
             FROM scheduled_emails WHERE campaign_id = ?1 AND status = 'SENT'",
            params![campaign_id, since_raw],
            |row| Ok((row.get::<_, u32>(0)?, row.get::<_, u32>(1)?)),
        )?;
        let failure_errors = {
            let mut stmt = conn.prepare(
                "SELECT COALESCE(last_error, '') FROM scheduled_emails
                 WHERE campaign_id = ?1 AND status = 'PERMANENTLY_FAILED' AND updated_at >= ?2",
            )?;
            let rows = stmt.query_map(params![campaign_id, since_raw], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<Vec<String>>>()?
        };
        let unsubscribed = conn.query_row(
            "SELECT COUNT(DISTINCT p.id) FROM prospects p
             JOIN campaign_prospects cp ON cp.prospect_id = p.id
             WHERE cp.campaign_id = ?1 AND p.status = 'UNSUBSCRIBED'",
            params![campaign_id],
            |row| row.get(0),
        )?;
        Ok(DeliveryStats {
            sent_updated,
            sent_in_window,
            failure_errors,
            unsubscribed,
        })
    }

    pub fn load_conversation(
        &self,
        workspace_id: &str,
        thread_id: &str,
    ) -> Result<Option<Conversation>, SchedulerError> {
        let conn = self.open()?;
        let row = conn
            .query_row(
                "SELECT id, workspace_id, prospect_id, campaign_id, thread_id, subject, status,
                        last_message_at
                 FROM conversations WHERE workspace_id = ?1 AND thread_id = ?2",
                params![workspace_id, thread_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, workspace_id, prospect_id, campaign_id, thread_id, subject, status, last_message_raw)) =
            row
        else {
            return Ok(None);
        };
        Ok(Some(Conversation {
            id,
            workspace_id,
            prospect_id,
            campaign_id,
            thread_id,
            subject,
            status,
            last_message_at: parse_datetime(&last_message_raw)?,
        }))
    }

    pub fn inbox_messages(&self, conversation_id: &str) -> Result<Vec<InboxMessage>, SchedulerError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, gmail_message_id, direction, from_email, to_email,
                    subject, body, is_read, received_at
             FROM inbox_messages WHERE conversation_id = ?1 ORDER BY received_at",
        )?;
        let rows = stmt.query_map(params![conversation_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, i64>(8)?,
                row.get::<_, String>(9)?,
            ))
        })?;
        let mut messages = Vec::new();
        for row in rows {
            let (id, conversation_id, gmail_message_id, direction, from_email, to_email, subject, body, is_read, received_at) =
                row?;
            messages.push(InboxMessage {
                id,
                conversation_id,
                gmail_message_id,
                direction: direction.parse()?,
                from_email,
                to_email,
                subject,
                body,
                is_read: is_read != 0,
                received_at: parse_datetime(&received_at)?,
            });
        }
        Ok(messages)
    }
}
