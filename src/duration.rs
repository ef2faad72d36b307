//! Human-readable durations for command-line flags.

use std::time::Duration;

/// Parse a duration from a human-readable string.
///
/// Supports the following suffixes:
/// - `s` or no suffix: seconds
/// - `m`: minutes
/// - `h`: hours
/// - `ms`: milliseconds
/// - `us`: microseconds
///
/// # Examples
/// ```
/// use rssi_logger::duration::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("55s").unwrap(), Duration::from_secs(55));
/// assert_eq!(parse_duration("5000ms").unwrap(), Duration::from_millis(5000));
/// assert_eq!(parse_duration("10000us").unwrap(), Duration::from_micros(10_000));
/// ```
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();

    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    // Longer suffixes first so "ms" is not read as "m"
    const UNITS: [(&str, &str, fn(u64) -> Option<Duration>); 5] = [
        ("us", "microseconds", |n| Some(Duration::from_micros(n))),
        ("ms", "milliseconds", |n| Some(Duration::from_millis(n))),
        ("h", "hours", |n| n.checked_mul(3600).map(Duration::from_secs)),
        ("m", "minutes", |n| n.checked_mul(60).map(Duration::from_secs)),
        ("s", "seconds", |n| Some(Duration::from_secs(n))),
    ];

    for (suffix, unit, make) in UNITS {
        if let Some(num) = src.strip_suffix(suffix) {
            let value: u64 = num
                .trim()
                .parse()
                .map_err(|_| format!("invalid {}: {}", unit, num))?;
            return make(value).ok_or_else(|| format!("{} out of range: {}", unit, num));
        }
    }

    // No suffix, treat as seconds
    let secs: u64 = src
        .parse()
        .map_err(|_| format!("invalid duration: {}", src))?;
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_seconds() {
        assert_eq!(parse_duration("3s").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_duration("0s").unwrap(), Duration::from_secs(0));
    }

    #[test]
    fn test_parse_duration_minutes_and_hours() {
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
    }

    #[test]
    fn test_parse_duration_sub_second() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("625us").unwrap(), Duration::from_micros(625));
    }

    #[test]
    fn test_parse_duration_no_suffix() {
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));
    }

    #[test]
    fn test_parse_duration_with_whitespace() {
        assert_eq!(parse_duration(" 3s ").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_duration("3 s").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("-1s").is_err());
        assert!(parse_duration("1.5s").is_err());
    }

    #[test]
    fn test_parse_duration_overflow() {
        let max = u64::MAX.to_string();
        assert!(parse_duration(&format!("{max}h")).is_err());
        assert!(parse_duration(&format!("{max}m")).is_err());
        assert!(parse_duration(&format!("{}h", u64::MAX / 3600)).is_ok());
    }
}
