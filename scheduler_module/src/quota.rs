//! Workspace-wide daily quota with campaign ramp-up.
//!
//! Quota days are local calendar days in the workspace timezone, the same
//! days the sending window is evaluated in.

use chrono::{DateTime, Utc};
use tracing::error;

use crate::sending_window::{
    campaign_day_number, local_day_bounds, next_window_start, SendingSettings,
};
use crate::store::OutreachStore;
use crate::types::SchedulerError;

/// Daily caps for the first campaign days while ramp-up is enabled.
pub const RAMP_UP_SCHEDULE: [u32; 3] = [20, 30, 40];

const MAX_SLOT_SEARCH_DAYS: u32 = 30;

/// Cap for the given 1-based campaign day. Never above `daily_quota`.
pub fn effective_daily_quota(settings: &SendingSettings, day_number: u32) -> u32 {
    if !settings.ramp_up_enabled {
        return settings.daily_quota;
    }
    let index = day_number.max(1) as usize - 1;
    match RAMP_UP_SCHEDULE.get(index) {
        Some(ramp) => (*ramp).min(settings.daily_quota),
        None => settings.daily_quota,
    }
}

#[derive(Debug, Clone)]
pub struct QuotaService {
    store: OutreachStore,
}

impl QuotaService {
    pub fn new(store: OutreachStore) -> Self {
        Self { store }
    }

    /// Planning quota left on the local day containing `at`. Every row
    /// scheduled for that day counts unless it was cancelled or failed.
    pub fn remaining_quota(
        &self,
        workspace_id: &str,
        at: DateTime<Utc>,
        settings: &SendingSettings,
        day_number: u32,
    ) -> Result<u32, SchedulerError> {
        let (start, end) = local_day_bounds(settings.timezone, at)?;
        let used = self.store.count_quota_usage(workspace_id, start, end)?;
        Ok(effective_daily_quota(settings, day_number).saturating_sub(used))
    }

    /// Send-time quota left on the local day containing `at`: only messages
    /// that actually left today, or are leaving right now, count.
    pub fn remaining_send_quota(
        &self,
        workspace_id: &str,
        at: DateTime<Utc>,
        settings: &SendingSettings,
        day_number: u32,
    ) -> Result<u32, SchedulerError> {
        let (start, end) = local_day_bounds(settings.timezone, at)?;
        let used = self.store.count_sent_or_sending(workspace_id, start, end)?;
        Ok(effective_daily_quota(settings, day_number).saturating_sub(used))
    }

    /// Earliest window instant at or after `after` on a day that still has
    /// planning quota. `day_number` is the campaign day of `after`; each
    /// candidate slot is judged against the ramp-up cap of its own local day.
    ///
    /// After 30 days without room the window slot is returned anyway; the
    /// send-time check in the worker still holds the daily cap.
    pub fn next_available_slot(
        &self,
        workspace_id: &str,
        after: DateTime<Utc>,
        settings: &SendingSettings,
        day_number: u32,
    ) -> Result<DateTime<Utc>, SchedulerError> {
        let mut cursor = after;
        for _ in 0..MAX_SLOT_SEARCH_DAYS {
            let slot = next_window_start(settings, cursor)?;
            let slot_day = day_number
                .saturating_add(campaign_day_number(settings.timezone, after, slot))
                .saturating_sub(1);
            if self.remaining_quota(workspace_id, slot, settings, slot_day)? > 0 {
                return Ok(slot);
            }
            let (_, next_day) = local_day_bounds(settings.timezone, slot)?;
            cursor = next_day;
        }

        let slot = next_window_start(settings, cursor)?;
        error!(
            "no quota left within {} days for workspace {}; falling back to {}",
            MAX_SLOT_SEARCH_DAYS, workspace_id, slot
        );
        Ok(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::{all_day_settings, utc, Fixture};
    use crate::types::ScheduledEmailStatus;

    fn settings(daily_quota: u32, ramp_up_enabled: bool) -> SendingSettings {
        SendingSettings {
            daily_quota,
            ramp_up_enabled,
            ..SendingSettings::default()
        }
    }

    #[test]
    fn ramp_up_follows_schedule_then_full_quota() {
        let settings = settings(50, true);
        let observed: Vec<u32> = [1, 2, 3, 4, 10]
            .iter()
            .map(|day| effective_daily_quota(&settings, *day))
            .collect();
        assert_eq!(observed, vec![20, 30, 40, 50, 50]);
    }

    #[test]
    fn ramp_up_never_exceeds_daily_quota() {
        let settings = settings(25, true);
        for day in 0..40 {
            assert!(effective_daily_quota(&settings, day) <= 25);
        }
        assert_eq!(effective_daily_quota(&settings, 1), 20);
        assert_eq!(effective_daily_quota(&settings, 2), 25);
    }

    #[test]
    fn disabled_ramp_up_uses_daily_quota_every_day() {
        let settings = settings(50, false);
        assert_eq!(effective_daily_quota(&settings, 1), 50);
        assert_eq!(effective_daily_quota(&settings, 7), 50);
    }

    #[test]
    fn remaining_quota_ignores_cancelled_and_failed_rows() {
        let fixture = Fixture::new(2);
        let settings = SendingSettings {
            daily_quota: 5,
            ..all_day_settings()
        };
        let at = utc("2026-10-19T10:00:00Z");
        fixture.insert_email(1, at, ScheduledEmailStatus::Scheduled);
        fixture.insert_email(2, at, ScheduledEmailStatus::Sent);
        let other = fixture.add_prospect("grace@example.com");
        fixture.insert_email_for(&other, 1, at, ScheduledEmailStatus::Cancelled);
        fixture.insert_email_for(&other, 2, at, ScheduledEmailStatus::PermanentlyFailed);

        let quota = QuotaService::new(fixture.store.clone());
        let remaining = quota
            .remaining_quota(&fixture.workspace.id, at, &settings, 10)
            .expect("remaining quota");
        assert_eq!(remaining, 3);
    }

    #[test]
    fn next_available_slot_skips_exhausted_day_and_advances_ramp_day() {
        let fixture = Fixture::new(3);
        let settings = SendingSettings {
            daily_quota: 2,
            ..all_day_settings()
        };
        let monday = utc("2026-10-19T10:00:00Z");
        fixture.insert_email(1, monday, ScheduledEmailStatus::Scheduled);
        fixture.insert_email(2, monday, ScheduledEmailStatus::Scheduled);

        let quota = QuotaService::new(fixture.store.clone());
        let slot = quota
            .next_available_slot(&fixture.workspace.id, monday, &settings, 1)
            .expect("slot");
        assert_eq!(slot, utc("2026-10-20T00:00:00Z"));
    }

    #[test]
    fn next_available_slot_uses_ramp_cap_of_the_slot_day() {
        let fixture = Fixture::new(1);
        let settings = SendingSettings::new(1..=5, 9, 18, "UTC", 50, true).expect("settings");
        let thursday = utc("2026-10-22T10:00:00Z");
        for index in 0..40 {
            let enrollment = fixture.add_prospect(&format!("t{}@example.com", index));
            fixture.insert_email_for(&enrollment, 1, thursday, ScheduledEmailStatus::Scheduled);
        }

        // Wednesday evening is campaign day 3 (cap 40); Thursday is day 4 (cap 50).
        let quota = QuotaService::new(fixture.store.clone());
        let slot = quota
            .next_available_slot(&fixture.workspace.id, utc("2026-10-21T19:00:00Z"), &settings, 3)
            .expect("slot");
        assert_eq!(slot, utc("2026-10-22T09:00:00Z"));
    }

    #[test]
    fn next_available_slot_falls_back_after_search_horizon() {
        let fixture = Fixture::new(1);
        let settings = SendingSettings {
            daily_quota: 1,
            ..all_day_settings()
        };
        let start = utc("2026-10-19T10:00:00Z");
        let prospects: Vec<_> = (0..31)
            .map(|index| fixture.add_prospect(&format!("p{}@example.com", index)))
            .collect();
        for (offset, enrollment) in prospects.iter().enumerate() {
            let at = start + chrono::Duration::days(offset as i64);
            fixture.insert_email_for(enrollment, 1, at, ScheduledEmailStatus::Scheduled);
        }

        let quota = QuotaService::new(fixture.store.clone());
        let slot = quota
            .next_available_slot(&fixture.workspace.id, start, &settings, 10)
            .expect("slot");
        assert_eq!(slot, utc("2026-11-18T00:00:00Z"));
    }
}
