//! Time helpers

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current Unix timestamp in milliseconds (0 on a clock set before 1970)
pub fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Time elapsed since a millisecond timestamp, zero when it lies in the future
pub fn elapsed_since(since_millis: u64) -> Duration {
    Duration::from_millis(current_time_millis().saturating_sub(since_millis))
}

/// Compact human readable duration (`42s`, `3m 12s`, `2h 05m`, `1d 4h`)
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    match secs {
        0..=59 => format!("{}s", secs),
        60..=3599 => format!("{}m {:02}s", secs / 60, secs % 60),
        3600..=86_399 => format!("{}h {:02}m", secs / 3600, (secs % 3600) / 60),
        _ => format!("{}d {}h", secs / 86_400, (secs % 86_400) / 3600),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elapsed_since_future_is_zero() {
        let future = current_time_millis() + 60_000;
        assert_eq!(elapsed_since(future), Duration::ZERO);
    }

    #[test]
    fn test_elapsed_since_past() {
        let past = current_time_millis().saturating_sub(5_000);
        assert!(elapsed_since(past) >= Duration::from_secs(5));
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_secs(42)), "42s");
        assert_eq!(format_elapsed(Duration::from_secs(192)), "3m 12s");
        assert_eq!(format_elapsed(Duration::from_secs(7500)), "2h 05m");
        assert_eq!(format_elapsed(Duration::from_secs(100_800)), "1d 4h");
    }
}
