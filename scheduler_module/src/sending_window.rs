//! Weekly sending windows evaluated in the workspace's IANA timezone.

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use std::collections::BTreeSet;

pub const DEFAULT_SENDING_DAYS: [u32; 5] = [1, 2, 3, 4, 5];
pub const DEFAULT_START_HOUR: u32 = 9;
pub const DEFAULT_END_HOUR: u32 = 18;
pub const DEFAULT_TIMEZONE: Tz = chrono_tz::Europe::Paris;
pub const DEFAULT_DAILY_QUOTA: u32 = 30;

const MAX_WINDOW_SCAN_DAYS: i64 = 14;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendingWindowError {
    #[error("No sending days configured")]
    NoSendingDaysConfigured,
    #[error("no sending window found within {0} days")]
    NoWindowFound(i64),
    #[error("local midnight does not exist on {0}")]
    InvalidLocalDate(NaiveDate),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    #[error("weekday {0} is out of range (0 = Sunday .. 6 = Saturday)")]
    InvalidWeekday(u32),
    #[error("invalid hour range {start}h - {end}h: start must be before end and end at most 23")]
    InvalidHourRange { start: u32, end: u32 },
    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),
    #[error("daily quota must be positive")]
    InvalidDailyQuota,
}

/// Workspace sending configuration. Weekdays use 0 = Sunday.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendingSettings {
    pub sending_days: BTreeSet<u32>,
    pub start_hour: u32,
    pub end_hour: u32,
    pub timezone: Tz,
    pub daily_quota: u32,
    pub ramp_up_enabled: bool,
    pub from_name: Option<String>,
    pub signature: Option<String>,
}

impl Default for SendingSettings {
    fn default() -> Self {
        Self {
            sending_days: DEFAULT_SENDING_DAYS.into_iter().collect(),
            start_hour: DEFAULT_START_HOUR,
            end_hour: DEFAULT_END_HOUR,
            timezone: DEFAULT_TIMEZONE,
            daily_quota: DEFAULT_DAILY_QUOTA,
            ramp_up_enabled: true,
            from_name: None,
            signature: None,
        }
    }
}

impl SendingSettings {
    pub fn new(
        sending_days: impl IntoIterator<Item = u32>,
        start_hour: u32,
        end_hour: u32,
        timezone: &str,
        daily_quota: u32,
        ramp_up_enabled: bool,
    ) -> Result<Self, SettingsError> {
        let sending_days: BTreeSet<u32> = sending_days.into_iter().collect();
        if let Some(day) = sending_days.iter().find(|day| **day > 6) {
            return Err(SettingsError::InvalidWeekday(*day));
        }
        if start_hour >= end_hour || end_hour > 23 {
            return Err(SettingsError::InvalidHourRange {
                start: start_hour,
                end: end_hour,
            });
        }
        if daily_quota == 0 {
            return Err(SettingsError::InvalidDailyQuota);
        }
        Ok(Self {
            sending_days,
            start_hour,
            end_hour,
            timezone: parse_timezone(timezone)?,
            daily_quota,
            ramp_up_enabled,
            from_name: None,
            signature: None,
        })
    }
}

pub fn parse_timezone(name: &str) -> Result<Tz, SettingsError> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| SettingsError::UnknownTimezone(name.to_string()))
}

fn weekday_number(date: NaiveDate) -> u32 {
    date.weekday().num_days_from_sunday()
}

pub fn is_within_window(settings: &SendingSettings, instant: DateTime<Utc>) -> bool {
    let local = instant.with_timezone(&settings.timezone);
    settings
        .sending_days
        .contains(&weekday_number(local.date_naive()))
        && local.hour() >= settings.start_hour
        && local.hour() < settings.end_hour
}

/// First instant at or after `from` inside the window. Returns `from` itself
/// when it is already inside.
pub fn next_window_start(
    settings: &SendingSettings,
    from: DateTime<Utc>,
) -> Result<DateTime<Utc>, SendingWindowError> {
    if settings.sending_days.is_empty() {
        return Err(SendingWindowError::NoSendingDaysConfigured);
    }
    if is_within_window(settings, from) {
        return Ok(from);
    }

    let local = from.with_timezone(&settings.timezone);
    let today = local.date_naive();
    for offset in 0..=MAX_WINDOW_SCAN_DAYS {
        let date = today + Duration::days(offset);
        if !settings.sending_days.contains(&weekday_number(date)) {
            continue;
        }
        if offset == 0 && local.hour() >= settings.start_hour {
            // Window already closed today.
            continue;
        }
        if let Some(start) = window_open_on(settings, date) {
            if start >= from {
                return Ok(start);
            }
        }
    }
    Err(SendingWindowError::NoWindowFound(MAX_WINDOW_SCAN_DAYS))
}

/// Opening instant of the window on a local date. Skips forward over a DST
/// gap; `None` when the whole window falls inside one.
fn window_open_on(settings: &SendingSettings, date: NaiveDate) -> Option<DateTime<Utc>> {
    (settings.start_hour..settings.end_hour).find_map(|hour| {
        let naive = date.and_hms_opt(hour, 0, 0)?;
        match settings.timezone.from_local_datetime(&naive) {
            LocalResult::Single(value) => Some(value.with_timezone(&Utc)),
            LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
            LocalResult::None => None,
        }
    })
}

pub fn format_hour_range(start_hour: u32, end_hour: u32) -> String {
    format!("{}h - {}h", start_hour, end_hour)
}

/// `[start, end)` of the local calendar day containing `instant`, in UTC.
pub fn local_day_bounds(
    timezone: Tz,
    instant: DateTime<Utc>,
) -> Result<(DateTime<Utc>, DateTime<Utc>), SendingWindowError> {
    let date = instant.with_timezone(&timezone).date_naive();
    let next = date
        .succ_opt()
        .ok_or(SendingWindowError::InvalidLocalDate(date))?;
    Ok((
        start_of_local_day(timezone, date)?,
        start_of_local_day(timezone, next)?,
    ))
}

pub(crate) fn start_of_local_day(
    timezone: Tz,
    date: NaiveDate,
) -> Result<DateTime<Utc>, SendingWindowError> {
    // Some zones skip midnight on DST days; the day then starts at the first
    // valid local time.
    (0..3)
        .filter_map(|hour| date.and_hms_opt(hour, 0, 0))
        .find_map(|naive| timezone.from_local_datetime(&naive).earliest())
        .map(|value| value.with_timezone(&Utc))
        .ok_or(SendingWindowError::InvalidLocalDate(date))
}

/// 1-based campaign day of `at`, counted in local calendar days since the
/// campaign started.
pub fn campaign_day_number(timezone: Tz, started_at: DateTime<Utc>, at: DateTime<Utc>) -> u32 {
    let start = started_at.with_timezone(&timezone).date_naive();
    let day = at.with_timezone(&timezone).date_naive();
    let elapsed = (day - start).num_days();
    u32::try_from(elapsed.max(0) + 1).unwrap_or(u32::MAX)
}
