use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::{GpxError, Result};

/// A point in time on the UTC timeline. Subtracting two yields a signed
/// [`chrono::TimeDelta`].
pub type Instant = DateTime<Utc>;

/// Parse an ISO-8601 date-time such as `2006-01-08T06:45:07Z`.
///
/// A trailing `Z` or `±hh:mm` offset is honored. Without one the time is
/// taken as UTC. Fractional seconds are accepted.
pub fn parse_timestamp(s: &str) -> Result<Instant> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|_| GpxError::MalformedTimestamp(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, Timelike};

    #[test]
    fn test_zulu_timestamp() {
        let t = parse_timestamp("2006-01-08T06:45:07Z").unwrap();
        assert_eq!(t.to_rfc3339(), "2006-01-08T06:45:07+00:00");
    }

    #[test]
    fn test_no_zone_is_utc() {
        let zoned = parse_timestamp("2012-06-30T21:17:00Z").unwrap();
        let naive = parse_timestamp("2012-06-30T21:17:00").unwrap();
        assert_eq!(zoned, naive);
    }

    #[test]
    fn test_offset_normalized() {
        let t = parse_timestamp("2012-06-30T23:17:00+02:00").unwrap();
        assert_eq!(t, parse_timestamp("2012-06-30T21:17:00Z").unwrap());
    }

    #[test]
    fn test_fractional_seconds() {
        let t = parse_timestamp("2025-01-01T00:00:00.250Z").unwrap();
        assert_eq!(t.nanosecond(), 250_000_000);
        let naive = parse_timestamp("2025-01-01T00:00:00.5").unwrap();
        assert_eq!(naive.nanosecond(), 500_000_000);
    }

    #[test]
    fn test_subtraction_is_signed() {
        let a = parse_timestamp("2025-01-01T00:00:00Z").unwrap();
        let b = parse_timestamp("2025-01-01T00:01:30Z").unwrap();
        assert_eq!(b - a, TimeDelta::seconds(90));
        assert_eq!(a - b, TimeDelta::seconds(-90));
    }

    #[test]
    fn test_malformed() {
        for bad in ["", "yesterday", "2025-01-01", "2025-13-01T00:00:00Z", "2025-01-01 00:00"] {
            assert!(
                matches!(parse_timestamp(bad), Err(GpxError::MalformedTimestamp(_))),
                "accepted {bad:?}"
            );
        }
    }
}
