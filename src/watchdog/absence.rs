// Absence check
// One-shot comparison of the last-visit marker against a fixed threshold

use chrono::{DateTime, Duration, Utc};

/// Absence threshold applied at Reconciler start
pub const DEFAULT_ABSENCE_THRESHOLD_HOURS: i64 = 48;

pub fn default_threshold() -> Duration {
    Duration::hours(DEFAULT_ABSENCE_THRESHOLD_HOURS)
}

/// True when the visitor has been away longer than `threshold`
///
/// A missing marker never forces a logout, and neither does a marker in the
/// future (clock skew).
pub fn absence_exceeded(
    last_visit: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    threshold: Duration,
) -> bool {
    match last_visit {
        Some(last) => now.signed_duration_since(last) > threshold,
        None => false,
    }
}
