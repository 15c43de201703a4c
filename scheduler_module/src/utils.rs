use chrono::{DateTime, SecondsFormat, Utc};

use crate::types::SchedulerError;

/// Fixed-width UTC form, so stored timestamps compare correctly as text.
pub(crate) fn format_datetime(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn format_optional_datetime(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(format_datetime)
}

pub(crate) fn parse_datetime(value: &str) -> Result<DateTime<Utc>, SchedulerError> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

pub(crate) fn parse_optional_datetime(
    value: Option<&str>,
) -> Result<Option<DateTime<Utc>>, SchedulerError> {
    match value {
        Some(raw) => Ok(Some(parse_datetime(raw)?)),
        None => Ok(None),
    }
}

pub(crate) fn bool_to_int(value: bool) -> i64 {
    if value {
        1
    } else {
        0
    }
}

pub(crate) fn join_weekdays<'a>(days: impl IntoIterator<Item = &'a u32>) -> String {
    days.into_iter()
        .map(|day| day.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

pub(crate) fn split_weekdays(raw: &str) -> Result<Vec<u32>, SchedulerError> {
    raw.split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| {
            value.parse::<u32>().map_err(|_| {
                SchedulerError::Storage(format!("invalid weekday '{}' in sending_days", value))
            })
        })
        .collect()
}
