//! SQLite persistence for the outreach pipeline.
//!
//! Every call opens its own connection, so one `OutreachStore` (a path) can be
//! cloned into any number of threads or processes. Multi-row writes go
//! through [`OutreachStore::with_transaction`], which takes the write lock up
//! front (`BEGIN IMMEDIATE`).

use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::SchedulerError;

mod activity_rows;
mod campaign_rows;
mod email_rows;
mod migrations;
mod schema;
mod workspace_rows;

pub(crate) use activity_rows::{insert_audit_log, insert_notification};
pub(crate) use campaign_rows::{
    load_campaign_row, load_enrollment_row, update_campaign_row, update_enrollment_row,
};
pub use email_rows::ClaimOutcome;
pub(crate) use email_rows::{
    cancel_pending_emails, shift_pending_emails, CancelScope, DeliveryStats, SendRecord,
};

use migrations::{ensure_scheduled_email_columns, ensure_sending_settings_columns};
use schema::OUTREACH_SCHEMA;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct OutreachStore {
    path: PathBuf,
}

impl OutreachStore {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, SchedulerError> {
        let store = Self { path: path.into() };
        let _ = store.open()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn open(&self) -> Result<Connection, SchedulerError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(OUTREACH_SCHEMA)?;
        ensure_scheduled_email_columns(&conn)?;
        ensure_sending_settings_columns(&conn)?;
        Ok(conn)
    }

    /// Runs `f` inside an immediate transaction, committing only when it
    /// returns `Ok`.
    pub(crate) fn with_transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, E>,
        E: From<SchedulerError>,
    {
        let mut conn = self.open()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(SchedulerError::from)?;
        let value = f(&tx)?;
        tx.commit().map_err(SchedulerError::from)?;
        Ok(value)
    }
}
