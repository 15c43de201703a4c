use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::types::{Campaign, CampaignProspect, CampaignStatus, EnrollmentStatus, SchedulerError};
use crate::utils::{
    format_datetime, format_optional_datetime, parse_datetime, parse_optional_datetime,
};

use super::OutreachStore;

const CAMPAIGN_COLUMNS: &str = "id, workspace_id, sequence_id, name, status, started_at, paused_at,
    stopped_at, completed_at, auto_paused_reason, created_at";

const ENROLLMENT_COLUMNS: &str =
    "id, campaign_id, prospect_id, enrollment_status, current_step, enrolled_at, paused_at, completed_at";

struct CampaignRow {
    id: String,
    workspace_id: String,
    sequence_id: String,
    name: String,
    status: String,
    started_at: Option<String>,
    paused_at: Option<String>,
    stopped_at: Option<String>,
    completed_at: Option<String>,
    auto_paused_reason: Option<String>,
    created_at: String,
}

impl CampaignRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            workspace_id: row.get(1)?,
            sequence_id: row.get(2)?,
            name: row.get(3)?,
            status: row.get(4)?,
            started_at: row.get(5)?,
            paused_at: row.get(6)?,
            stopped_at: row.get(7)?,
            completed_at: row.get(8)?,
            auto_paused_reason: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    fn into_campaign(self) -> Result<Campaign, SchedulerError> {
        Ok(Campaign {
            status: self.status.parse()?,
            started_at: parse_optional_datetime(self.started_at.as_deref())?,
            paused_at: parse_optional_datetime(self.paused_at.as_deref())?,
            stopped_at: parse_optional_datetime(self.stopped_at.as_deref())?,
            completed_at: parse_optional_datetime(self.completed_at.as_deref())?,
            auto_paused_reason: self
                .auto_paused_reason
                .as_deref()
                .map(str::parse)
                .transpose()?,
            created_at: parse_datetime(&self.created_at)?,
            id: self.id,
            workspace_id: self.workspace_id,
            sequence_id: self.sequence_id,
            name: self.name,
        })
    }
}

struct EnrollmentRow {
    id: String,
    campaign_id: String,
    prospect_id: String,
    enrollment_status: String,
    current_step: u32,
    enrolled_at: String,
    paused_at: Option<String>,
    completed_at: Option<String>,
}

impl EnrollmentRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            campaign_id: row.get(1)?,
            prospect_id: row.get(2)?,
            enrollment_status: row.get(3)?,
            current_step: row.get(4)?,
            enrolled_at: row.get(5)?,
            paused_at: row.get(6)?,
            completed_at: row.get(7)?,
        })
    }

    fn into_enrollment(self) -> Result<CampaignProspect, SchedulerError> {
        Ok(CampaignProspect {
            enrollment_status: self.enrollment_status.parse()?,
            enrolled_at: parse_datetime(&self.enrolled_at)?,
            paused_at: parse_optional_datetime(self.paused_at.as_deref())?,
            completed_at: parse_optional_datetime(self.completed_at.as_deref())?,
            id: self.id,
            campaign_id: self.campaign_id,
            prospect_id: self.prospect_id,
            current_step: self.current_step,
        })
    }
}

pub(crate) fn load_campaign_row(
    conn: &Connection,
    campaign_id: &str,
) -> Result<Option<Campaign>, SchedulerError> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM campaigns WHERE id = ?1", CAMPAIGN_COLUMNS),
            params![campaign_id],
            CampaignRow::from_row,
        )
        .optional()?;
    row.map(CampaignRow::into_campaign).transpose()
}

/// Persists status, lifecycle timestamps and the auto-pause reason.
pub(crate) fn update_campaign_row(
    conn: &Connection,
    campaign: &Campaign,
    now: DateTime<Utc>,
) -> Result<(), SchedulerError> {
    conn.execute(
        "UPDATE campaigns SET status = ?1, started_at = ?2, paused_at = ?3, stopped_at = ?4,
            completed_at = ?5, auto_paused_reason = ?6, updated_at = ?7
         WHERE id = ?8",
        params![
            campaign.status.as_str(),
            format_optional_datetime(campaign.started_at),
            format_optional_datetime(campaign.paused_at),
            format_optional_datetime(campaign.stopped_at),
            format_optional_datetime(campaign.completed_at),
            campaign.auto_paused_reason.map(|reason| reason.as_str()),
            format_datetime(now),
            campaign.id
        ],
    )?;
    Ok(())
}

pub(crate) fn load_enrollment_row(
    conn: &Connection,
    campaign_id: &str,
    prospect_id: &str,
) -> Result<Option<CampaignProspect>, SchedulerError> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {} FROM campaign_prospects WHERE campaign_id = ?1 AND prospect_id = ?2",
                ENROLLMENT_COLUMNS
            ),
            params![campaign_id, prospect_id],
            EnrollmentRow::from_row,
        )
        .optional()?;
    row.map(EnrollmentRow::into_enrollment).transpose()
}

pub(crate) fn update_enrollment_row(
    conn: &Connection,
    enrollment: &CampaignProspect,
) -> Result<(), SchedulerError> {
    conn.execute(
        "UPDATE campaign_prospects SET enrollment_status = ?1, current_step = ?2, paused_at = ?3,
            completed_at = ?4
         WHERE id = ?5",
        params![
            enrollment.enrollment_status.as_str(),
            enrollment.current_step,
            format_optional_datetime(enrollment.paused_at),
            format_optional_datetime(enrollment.completed_at),
            enrollment.id
        ],
    )?;
    Ok(())
}

impl OutreachStore {
    pub fn insert_campaign(&self, campaign: &Campaign) -> Result<(), SchedulerError> {
        let conn = self.open()?;
        let created_at = format_datetime(campaign.created_at);
        conn.execute(
            "INSERT INTO campaigns (
                id, workspace_id, sequence_id, name, status, started_at, paused_at, stopped_at,
                completed_at, auto_paused_reason, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
            params![
                campaign.id,
                campaign.workspace_id,
                campaign.sequence_id,
                campaign.name,
                campaign.status.as_str(),
                format_optional_datetime(campaign.started_at),
                format_optional_datetime(campaign.paused_at),
                format_optional_datetime(campaign.stopped_at),
                format_optional_datetime(campaign.completed_at),
                campaign.auto_paused_reason.map(|reason| reason.as_str()),
                created_at
            ],
        )?;
        Ok(())
    }

    pub fn load_campaign(&self, campaign_id: &str) -> Result<Option<Campaign>, SchedulerError> {
        let conn = self.open()?;
        load_campaign_row(&conn, campaign_id)
    }

    pub fn campaigns_with_status(
        &self,
        status: CampaignStatus,
        workspace_id: Option<&str>,
    ) -> Result<Vec<Campaign>, SchedulerError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM campaigns
             WHERE status = ?1 AND (?2 IS NULL OR workspace_id = ?2)
             ORDER BY created_at",
            CAMPAIGN_COLUMNS
        ))?;
        let rows = stmt.query_map(params![status.as_str(), workspace_id], CampaignRow::from_row)?;
        let mut campaigns = Vec::new();
        for row in rows {
            campaigns.push(row?.into_campaign()?);
        }
        Ok(campaigns)
    }

    pub fn enroll_prospect(&self, enrollment: &CampaignProspect) -> Result<(), SchedulerError> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO campaign_prospects (
                id, campaign_id, prospect_id, enrollment_status, current_step, enrolled_at,
                paused_at, completed_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                enrollment.id,
                enrollment.campaign_id,
                enrollment.prospect_id,
                enrollment.enrollment_status.as_str(),
                enrollment.current_step,
                format_datetime(enrollment.enrolled_at),
                format_optional_datetime(enrollment.paused_at),
                format_optional_datetime(enrollment.completed_at)
            ],
        )?;
        Ok(())
    }

    pub fn load_enrollment(
        &self,
        campaign_id: &str,
        prospect_id: &str,
    ) -> Result<Option<CampaignProspect>, SchedulerError> {
        let conn = self.open()?;
        load_enrollment_row(&conn, campaign_id, prospect_id)
    }

    /// Enrollments of a campaign in the given status, oldest enrollment first.
    pub fn enrollments_with_status(
        &self,
        campaign_id: &str,
        status: EnrollmentStatus,
    ) -> Result<Vec<CampaignProspect>, SchedulerError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM campaign_prospects
             WHERE campaign_id = ?1 AND enrollment_status = ?2
             ORDER BY enrolled_at, id",
            ENROLLMENT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![campaign_id, status.as_str()], EnrollmentRow::from_row)?;
        let mut enrollments = Vec::new();
        for row in rows {
            enrollments.push(row?.into_enrollment()?);
        }
        Ok(enrollments)
    }

    /// `(total, open)` enrollment counts, where open means ENROLLED or PAUSED.
    pub fn enrollment_counts(&self, campaign_id: &str) -> Result<(u32, u32), SchedulerError> {
        let conn = self.open()?;
        let counts = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN enrollment_status IN ('ENROLLED', 'PAUSED') THEN 1 ELSE 0 END), 0)
             FROM campaign_prospects WHERE campaign_id = ?1",
            params![campaign_id],
            |row| Ok((row.get::<_, u32>(0)?, row.get::<_, u32>(1)?)),
        )?;
        Ok(counts)
    }
}
