//! Small shared helpers.

use chrono::Utc;

/// Current instant as an RFC 3339 timestamp with millisecond precision.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
