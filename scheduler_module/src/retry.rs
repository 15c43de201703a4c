//! Retry classification and backoff for failed sends.

use chrono::{DateTime, Duration, Utc};
use regex::RegexSet;
use send_emails_module::GmailSendError;
use std::sync::LazyLock;

pub const MAX_RETRY_ATTEMPTS: u32 = 3;
pub const RETRY_BACKOFF_MINUTES: [i64; 3] = [1, 5, 15];

const NON_RETRYABLE_CODES: &[&str] = &[
    "INVALID_RECIPIENT",
    "AUTH_REVOKED",
    "TOKEN_EXPIRED",
    "MAIL_HARD_BOUNCE",
    "PERMISSION_DENIED",
    "INVALID_EMAIL",
    "RECIPIENT_NOT_FOUND",
];

const GMAIL_NON_RETRYABLE_REASONS: &[&str] = &[
    "invalidGrant",
    "authError",
    "invalid",
    "notFound",
    "failedPrecondition",
    "invalidArgument",
];

const RETRYABLE_CODES: &[&str] = &[
    "ECONNRESET",
    "ETIMEDOUT",
    "ENOTFOUND",
    "RATE_LIMIT_EXCEEDED",
    "TEMPORARY_FAILURE",
    "SERVICE_UNAVAILABLE",
    "NETWORK_ERROR",
    "CONNECTION_ERROR",
];

const GMAIL_RETRYABLE_REASONS: &[&str] = &[
    "rateLimitExceeded",
    "userRateLimitExceeded",
    "quotaExceeded",
    "backendError",
    "internalError",
];

static TRANSIENT_PATTERNS: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)timeout",
        r"(?i)timed.?out",
        r"(?i)connection",
        r"(?i)network",
        r"(?i)econnreset",
        r"(?i)etimedout",
        r"(?i)rate.?limit",
        r"(?i)too.?many.?requests",
        r"\b5\d{2}\b",
        r"(?i)temporarily",
        r"(?i)unavailable",
    ])
    .expect("transient patterns are valid")
});

const BOUNCE_MARKERS: &[&str] = &[
    "bounce",
    "invalid",
    "not found",
    "rejected",
    "does not exist",
    "unknown user",
];

/// Anything a send can fail with: a typed transport error or a bare message.
pub trait FailureSignal {
    fn message(&self) -> &str;

    fn code(&self) -> Option<&str> {
        None
    }

    fn status_code(&self) -> Option<u16> {
        None
    }
}

impl FailureSignal for str {
    fn message(&self) -> &str {
        self
    }
}

impl FailureSignal for String {
    fn message(&self) -> &str {
        self
    }
}

impl FailureSignal for GmailSendError {
    fn message(&self) -> &str {
        &self.message
    }

    fn code(&self) -> Option<&str> {
        Some(&self.code)
    }

    fn status_code(&self) -> Option<u16> {
        self.status_code
    }
}

fn matches_any(table: &[&str], message: &str, code: Option<&str>) -> bool {
    table
        .iter()
        .any(|entry| message.contains(entry) || code.is_some_and(|code| code.contains(entry)))
}

pub fn is_retryable<E: FailureSignal + ?Sized>(error: &E) -> bool {
    if let Some(status) = error.status_code() {
        if status == 429 || (500..600).contains(&status) {
            return true;
        }
        if (400..500).contains(&status) {
            return false;
        }
    }

    let message = error.message();
    let code = error.code();
    if matches_any(NON_RETRYABLE_CODES, message, code)
        || matches_any(GMAIL_NON_RETRYABLE_REASONS, message, code)
    {
        return false;
    }
    if matches_any(RETRYABLE_CODES, message, code)
        || matches_any(GMAIL_RETRYABLE_REASONS, message, code)
    {
        return true;
    }
    TRANSIENT_PATTERNS.is_match(message)
}

/// Minutes to wait after `attempt`, clamped to the backoff table.
pub fn backoff_minutes(attempt: i64) -> i64 {
    let last = RETRY_BACKOFF_MINUTES.len() - 1;
    let index = usize::try_from(attempt.max(0)).unwrap_or(last).min(last);
    RETRY_BACKOFF_MINUTES[index]
}

pub fn next_retry_at(attempt: i64, now: DateTime<Utc>) -> DateTime<Utc> {
    now + Duration::minutes(backoff_minutes(attempt))
}

/// Mailbox-side rejection that should feed the bounce rate.
pub fn is_bounce_error(message: &str) -> bool {
    let lowered = message.to_lowercase();
    BOUNCE_MARKERS.iter().any(|marker| lowered.contains(marker))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDecision {
    Retry {
        attempt_count: u32,
        next_retry_at: DateTime<Utc>,
        last_error: String,
    },
    GiveUp {
        attempt_count: u32,
        last_error: String,
    },
}

/// What to do with a row whose send just failed after `attempt_count`
/// earlier attempts.
pub fn decide_failure<E: FailureSignal + ?Sized>(
    error: &E,
    attempt_count: u32,
    now: DateTime<Utc>,
) -> FailureDecision {
    let message = error.message().to_string();
    let attempts = attempt_count + 1;
    let retryable = is_retryable(error);
    if retryable && attempts < MAX_RETRY_ATTEMPTS {
        return FailureDecision::Retry {
            attempt_count: attempts,
            next_retry_at: next_retry_at(i64::from(attempt_count), now),
            last_error: message,
        };
    }
    let last_error = if retryable {
        format!(
            "Max retries exceeded ({}/{}): {}",
            attempts, MAX_RETRY_ATTEMPTS, message
        )
    } else {
        format!("Non-retryable error: {}", message)
    };
    FailureDecision::GiveUp {
        attempt_count: attempts,
        last_error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gmail_error(status: Option<u16>, code: &str, message: &str) -> GmailSendError {
        GmailSendError {
            message: message.to_string(),
            code: code.to_string(),
            status_code: status,
            is_retryable: false,
        }
    }

    #[test]
    fn classifies_known_codes() {
        assert!(is_retryable("ECONNRESET"));
        assert!(is_retryable("RATE_LIMIT_EXCEEDED"));
        assert!(!is_retryable("INVALID_RECIPIENT"));
        assert!(!is_retryable("AUTH_REVOKED"));
    }

    #[test]
    fn falls_back_to_transient_patterns() {
        assert!(is_retryable("request timed out after 30s"));
        assert!(is_retryable("Too Many Requests"));
        assert!(is_retryable("upstream returned 503"));
        assert!(is_retryable("Service temporarily unavailable"));
        assert!(!is_retryable("mailbox full"));
        assert!(!is_retryable("order 15031 rejected"));
    }

    #[test]
    fn structured_status_decides_first() {
        let throttled = gmail_error(Some(429), "userRateLimitExceeded", "slow down");
        assert!(is_retryable(&throttled));

        let server = gmail_error(Some(502), "HTTP_502", "bad gateway");
        assert!(is_retryable(&server));

        let client = gmail_error(Some(403), "forbidden", "connection refused by policy");
        assert!(!is_retryable(&client));
    }

    #[test]
    fn network_error_without_status_is_retryable() {
        let error = gmail_error(None, "NETWORK_ERROR", "error sending request");
        assert!(is_retryable(&error));
    }

    #[test]
    fn non_retryable_table_wins_over_transient_wording() {
        assert!(!is_retryable("INVALID_RECIPIENT: connection closed"));
    }

    #[test]
    fn backoff_increases_and_clamps() {
        assert!(backoff_minutes(0) < backoff_minutes(1));
        assert!(backoff_minutes(1) < backoff_minutes(2));
        assert_eq!(backoff_minutes(-1), backoff_minutes(0));
        assert_eq!(backoff_minutes(100), backoff_minutes(2));
        assert_eq!(backoff_minutes(i64::MAX), 15);
    }

    #[test]
    fn next_retry_at_adds_backoff() {
        let now = Utc::now();
        assert_eq!(next_retry_at(1, now), now + Duration::minutes(5));
    }

    #[test]
    fn retryable_failure_schedules_retry_until_exhausted() {
        let now = Utc::now();
        match decide_failure("ETIMEDOUT", 0, now) {
            FailureDecision::Retry {
                attempt_count,
                next_retry_at,
                last_error,
            } => {
                assert_eq!(attempt_count, 1);
                assert_eq!(next_retry_at, now + Duration::minutes(1));
                assert_eq!(last_error, "ETIMEDOUT");
            }
            other => panic!("expected retry, got {:?}", other),
        }

        match decide_failure("ETIMEDOUT", 1, now) {
            FailureDecision::Retry { next_retry_at, .. } => {
                assert_eq!(next_retry_at, now + Duration::minutes(5));
            }
            other => panic!("expected retry, got {:?}", other),
        }

        assert_eq!(
            decide_failure("ETIMEDOUT", 2, now),
            FailureDecision::GiveUp {
                attempt_count: 3,
                last_error: "Max retries exceeded (3/3): ETIMEDOUT".to_string(),
            }
        );
    }

    #[test]
    fn non_retryable_failure_gives_up_immediately() {
        let error = gmail_error(Some(400), "invalidArgument", "Invalid To header");
        assert_eq!(
            decide_failure(&error, 0, Utc::now()),
            FailureDecision::GiveUp {
                attempt_count: 1,
                last_error: "Non-retryable error: Invalid To header".to_string(),
            }
        );
    }

    #[test]
    fn detects_bounce_markers_case_insensitively() {
        assert!(is_bounce_error("Non-retryable error: Recipient address REJECTED"));
        assert!(is_bounce_error("550 5.1.1 Unknown User"));
        assert!(is_bounce_error("Mail bounced"));
        assert!(!is_bounce_error("Max retries exceeded (3/3): ETIMEDOUT"));
    }
}
