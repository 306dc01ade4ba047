use chrono::{TimeZone, Utc};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Unix timestamp as "YYYY-MM-DD HH:MM:SS" (UTC).
pub fn format_datetime(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Unix timestamp as "YYYY-MM-DD" (UTC).
pub fn format_date(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Human-readable traffic amount, two decimals with trailing zeros trimmed.
pub fn traffic_convert(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;

    let bytes = bytes as f64;
    if bytes > GB {
        format!("{}GB", round2(bytes / GB))
    } else if bytes > MB {
        format!("{}MB", round2(bytes / MB))
    } else if bytes > KB {
        format!("{}KB", round2(bytes / KB))
    } else {
        format!("{}B", round2(bytes))
    }
}

fn round2(value: f64) -> String {
    let formatted = format!("{:.2}", value);
    formatted
        .trim_end_matches('0')
        .trim_end_matches('.')
        .to_string()
}
