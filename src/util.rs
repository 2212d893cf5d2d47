//! Time and number helpers shared by venue parsers, sinks and workers.
//!
//! No venue-specific logic lives here. Everything is deterministic and
//! side-effect free so the normalization rules stay testable.

use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, NaiveTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;

/// Format of every persisted `date_time` column, always UTC.
pub const DATE_TIME_FORMAT: &str = "%Y%m%d %H:%M:%S%.6f";

/// Current UTC time in the persisted column format.
pub fn now_string() -> String {
    format_date_time(Utc::now())
}

pub fn format_date_time(date_time: DateTime<Utc>) -> String {
    date_time.format(DATE_TIME_FORMAT).to_string()
}

/// Normalize a numeric epoch into the persisted column format.
///
/// Venues report either seconds or milliseconds; anything at or above
/// 1e12 is taken as milliseconds. Fractional parts are kept to
/// microsecond precision.
pub fn epoch_to_date_time(epoch: f64) -> String {
    let seconds = if epoch >= 1_000_000_000_000.0 {
        epoch / 1000.0
    } else {
        epoch
    };

    let mut secs = seconds.trunc() as i64;
    let mut micros = ((seconds - seconds.trunc()) * 1_000_000.0).round() as i64;
    if micros >= 1_000_000 {
        secs += 1;
        micros -= 1_000_000;
    }

    let date_time = Utc
        .timestamp_opt(secs, (micros as u32) * 1000)
        .single()
        .unwrap_or(DateTime::UNIX_EPOCH);
    format_date_time(date_time)
}

/// Epoch second of a persisted `date_time` string.
pub fn date_time_to_epoch(date_time: &str) -> Option<i64> {
    NaiveDateTime::parse_from_str(date_time, DATE_TIME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc().timestamp())
}

/// Epoch microseconds of a persisted `date_time` string.
pub fn date_time_to_epoch_micros(date_time: &str) -> Option<i64> {
    NaiveDateTime::parse_from_str(date_time, DATE_TIME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc().timestamp_micros())
}

/// Anchor a venue-local `HH:MM:SS` wall clock to today in the venue's
/// fixed offset and convert to the persisted UTC format.
///
/// A result after `now` means the message was sent just before a midnight
/// rollover the local clock has already crossed, so one day is subtracted.
pub fn wall_clock_to_date_time(
    hms: &str,
    offset: FixedOffset,
    now: DateTime<Utc>,
) -> Option<String> {
    let time = NaiveTime::parse_from_str(hms, "%H:%M:%S").ok()?;
    let local_now = now.with_timezone(&offset);
    let mut local = local_now
        .date_naive()
        .and_time(time)
        .and_local_timezone(offset)
        .single()?;
    if local > local_now {
        local -= Duration::days(1);
    }
    Some(format_date_time(local.with_timezone(&Utc)))
}

/// Decimal of a JSON number or numeric string; zero for anything else.
///
/// JSON numbers go through their literal text so the venue's own
/// representation survives (no float round-trip).
pub fn decimal_of(value: &Value) -> Decimal {
    match value {
        Value::String(s) => parse_decimal(s),
        Value::Number(n) => parse_decimal(&n.to_string()),
        _ => Decimal::ZERO,
    }
}

pub fn parse_decimal(text: &str) -> Decimal {
    let trimmed = text.trim();
    Decimal::from_str(trimmed)
        .or_else(|_| Decimal::from_scientific(trimmed))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn epoch_milliseconds_normalize() {
        assert_eq!(
            epoch_to_date_time(1_700_000_000_000.0),
            "20231114 22:13:20.000000"
        );
    }

    #[test]
    fn epoch_seconds_normalize() {
        assert_eq!(epoch_to_date_time(1_700_000_000.5), "20231114 22:13:20.500000");
    }

    #[test]
    fn epoch_round_trip_within_a_microsecond() {
        let epoch_ms = 1_700_000_000_123.0;
        let formatted = epoch_to_date_time(epoch_ms);
        let micros = date_time_to_epoch_micros(&formatted).unwrap();
        assert!((micros - 1_700_000_000_123_000).abs() <= 1);
    }

    #[test]
    fn date_time_epoch_second_truncates() {
        assert_eq!(
            date_time_to_epoch("20231114 22:13:20.500000"),
            Some(1_700_000_000)
        );
    }

    #[test]
    fn wall_clock_anchors_to_today() {
        let offset = FixedOffset::east_opt(8 * 3600).unwrap();
        // 2023-11-14 22:13:20 UTC is 2023-11-15 06:13:20 in UTC+8.
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let formatted = wall_clock_to_date_time("06:13:20", offset, now).unwrap();
        assert_eq!(formatted, "20231114 22:13:20.000000");
    }

    #[test]
    fn wall_clock_in_the_future_rolls_back_a_day() {
        let offset = FixedOffset::east_opt(8 * 3600).unwrap();
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        // 07:00:00 local is ahead of the local 06:13:20, so it must be read
        // as yesterday 07:00:00 local.
        let formatted = wall_clock_to_date_time("07:00:00", offset, now).unwrap();
        assert_eq!(formatted, "20231113 23:00:00.000000");
    }

    #[test]
    fn decimal_of_keeps_the_literal_text() {
        assert_eq!(decimal_of(&serde_json::json!("100.10")), dec!(100.10));
        assert_eq!(decimal_of(&serde_json::json!(0.25)), dec!(0.25));
        assert_eq!(decimal_of(&serde_json::json!(null)), Decimal::ZERO);
    }
}
