//! Human-friendly duration strings ("500ms", "30s", "5m", "2h").

use std::time::Duration;

use tracing::warn;

/// Parse a duration string like "5s", "500ms", "1m", "2h".
///
/// A bare number is read as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim().parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        hours
            .trim()
            .parse::<u64>()
            .ok()
            .map(|h| Duration::from_secs(h * 3600))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

/// Parse `s`, logging and falling back to `default` when it is malformed.
pub fn duration_or(field: &str, s: &str, default: Duration) -> Duration {
    match parse_duration(s) {
        Some(d) => d,
        None => {
            warn!(field, value = s, ?default, "unparsable duration, using default");
            default
        }
    }
}
