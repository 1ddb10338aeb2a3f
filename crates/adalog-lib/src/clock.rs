use chrono::{DateTime, Duration, NaiveDateTime, SecondsFormat, TimeZone, Utc};

/// ISO-8601 UTC timestamp used in every CSV row.
pub fn iso_now() -> String {
    iso(Utc::now())
}

pub fn iso(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Filesystem-safe variant of [`iso`]: `:` and `.` become `-`.
pub fn file_stamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H-%M-%S-%6f").to_string()
}

/// Inverse of [`file_stamp`]; `None` for names that are not session stamps.
pub fn parse_file_stamp(name: &str) -> Option<DateTime<Utc>> {
    if name.len() != 26 || !name.is_char_boundary(19) || !name[19..].starts_with('-') {
        return None;
    }
    let micros = &name[20..];
    if !micros.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let seconds = NaiveDateTime::parse_from_str(&name[..19], "%Y-%m-%dT%H-%M-%S").ok()?;
    let micros: i64 = micros.parse().ok()?;
    Some(Utc.from_utc_datetime(&seconds) + Duration::microseconds(micros))
}

/// `MM:SS` display of an elapsed duration; minutes keep growing past 59.
pub fn elapsed_label(elapsed: std::time::Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

/// Hands out strictly increasing UTC instants at microsecond resolution, so
/// names derived from [`file_stamp`] never repeat, even across rapid
/// start/stop cycles.
#[derive(Debug, Default)]
pub struct MonotonicStamper {
    last: Option<DateTime<Utc>>,
}

impl MonotonicStamper {
    pub fn next(&mut self) -> DateTime<Utc> {
        self.next_after(Utc::now())
    }

    fn next_after(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        // truncate to what a file stamp can represent
        let now = now - Duration::nanoseconds(i64::from(now.timestamp_subsec_nanos() % 1000));
        let stamp = match self.last {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last = Some(stamp);
        stamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[test]
    fn file_stamp_has_no_separators_that_break_paths() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 13, 4, 5).unwrap()
            + chrono::Duration::microseconds(12);
        assert_eq!(file_stamp(at), "2024-05-01T13-04-05-000012");
        assert!(!file_stamp(at).contains(':'));
    }

    #[test]
    fn file_stamps_parse_back() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 13, 4, 5).unwrap()
            + chrono::Duration::microseconds(250_001);
        assert_eq!(parse_file_stamp(&file_stamp(at)), Some(at));
        assert_eq!(parse_file_stamp("Text"), None);
        assert_eq!(parse_file_stamp("2024-05-01T13-04-05-00001x"), None);
    }

    #[test]
    fn elapsed_label_formats_minutes_and_seconds() {
        assert_eq!(elapsed_label(StdDuration::from_secs(0)), "00:00");
        assert_eq!(elapsed_label(StdDuration::from_secs(75)), "01:15");
        assert_eq!(elapsed_label(StdDuration::from_secs(3600)), "60:00");
    }

    #[test]
    fn stamps_increase_even_when_clock_stalls() {
        let mut stamper = MonotonicStamper::default();
        let frozen = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let a = stamper.next_after(frozen);
        let b = stamper.next_after(frozen);
        let c = stamper.next_after(frozen - Duration::seconds(5));
        assert!(a < b && b < c);
        assert_ne!(file_stamp(a), file_stamp(b));
    }
}
