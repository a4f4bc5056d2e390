//! Half-open UTC time windows and the FDSN datetime formats.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};

/// A half-open UTC interval `[start, end)`.
///
/// Either bound may be absent: an absent start means "since forever", an
/// absent end means "until further notice". Instants are stored with
/// microsecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeWindow {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

impl TimeWindow {
    pub fn new(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        Self { start, end }
    }

    /// The unbounded window.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn start(&self) -> Option<DateTime<Utc>> {
        self.start
    }

    pub fn end(&self) -> Option<DateTime<Utc>> {
        self.end
    }

    /// True when both bounds are present and `start >= end`.
    pub fn is_empty(&self) -> bool {
        match (self.start, self.end) {
            (Some(s), Some(e)) => s >= e,
            _ => false,
        }
    }

    /// True if `instant` falls inside the window.
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| s <= instant) && self.end.map_or(true, |e| instant < e)
    }

    /// True if this window fully contains `other`.
    pub fn covers(&self, other: &Self) -> bool {
        let start_ok = match (self.start, other.start) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(a), Some(b)) => a <= b,
        };
        let end_ok = match (self.end, other.end) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(a), Some(b)) => b <= a,
        };
        start_ok && end_ok
    }

    /// Intersect two windows; `None` when the intersection is empty.
    pub fn intersect(&self, other: &Self) -> Option<Self> {
        let start = match (self.start, other.start) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        let end = match (self.end, other.end) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let clipped = Self::new(start, end);
        if clipped.is_empty() {
            None
        } else {
            Some(clipped)
        }
    }
}

/// Error parsing an FDSN datetime.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimeParseError {
    #[error("invalid datetime: {0}")]
    Invalid(String),

    #[error("non-UTC timezone rejected: {0}")]
    NonUtcTimezone(String),
}

/// Parse an FDSN request datetime.
///
/// Accepted shapes: `YYYY-MM-DD`, `YYYY-MM-DDTHH:MM:SS` and
/// `YYYY-MM-DDTHH:MM:SS.ffffff`, each with an optional trailing `Z`. Any
/// other timezone designator is rejected.
pub fn parse_fdsn(input: &str) -> Result<DateTime<Utc>, TimeParseError> {
    let trimmed = input.trim();
    let naive = trimmed.strip_suffix('Z').unwrap_or(trimmed);

    if naive.ends_with(|c: char| c.is_ascii_alphabetic())
        || naive.rfind(['+']).is_some()
        // a '-' past the date part designates an offset, e.g. ...T00:00:00-05:00
        || naive.len() > 10 && naive[10..].contains('-')
    {
        return Err(TimeParseError::NonUtcTimezone(input.to_string()));
    }

    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(naive, format) {
            return Ok(parsed.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(naive, "%Y-%m-%d") {
        let midnight = date
            .and_hms_opt(0, 0, 0)
            .expect("midnight is always representable");
        return Ok(midnight.and_utc());
    }

    Err(TimeParseError::Invalid(input.to_string()))
}

/// The sentinel instant standing in for an open epoch end on surfaces
/// that require a concrete value.
pub fn far_future() -> DateTime<Utc> {
    NaiveDateTime::parse_from_str("2500-12-31T23:59:59", "%Y-%m-%dT%H:%M:%S")
        .expect("sentinel literal is valid")
        .and_utc()
}

/// Format an instant the way FDSN services carry it on the wire:
/// ISO-8601 without a timezone designator, fractional seconds only when
/// non-zero.
pub fn format_fdsn(instant: &DateTime<Utc>) -> String {
    let formatted = instant.to_rfc3339_opts(SecondsFormat::AutoSi, true);
    formatted.trim_end_matches('Z').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn ts(s: &str) -> DateTime<Utc> {
        parse_fdsn(s).unwrap()
    }

    #[test]
    fn parse_accepted_shapes() {
        assert_eq!(ts("2020-01-01"), ts("2020-01-01T00:00:00"));
        assert_eq!(ts("2020-01-01T12:30:00Z"), ts("2020-01-01T12:30:00"));
        assert_eq!(
            ts("2020-01-01T12:30:00.250000"),
            ts("2020-01-01T12:30:00.25")
        );
    }

    #[test]
    fn parse_rejects_non_utc() {
        assert_matches!(
            parse_fdsn("2020-01-01T00:00:00+02:00"),
            Err(TimeParseError::NonUtcTimezone(_))
        );
        assert_matches!(
            parse_fdsn("2020-01-01T00:00:00-05:00"),
            Err(TimeParseError::NonUtcTimezone(_))
        );
        assert_matches!(parse_fdsn("not-a-time"), Err(TimeParseError::Invalid(_)));
    }

    #[test]
    fn format_round_trips() {
        for input in ["2020-01-01T00:00:00", "2020-06-15T12:30:45.125"] {
            assert_eq!(parse_fdsn(&format_fdsn(&ts(input))).unwrap(), ts(input));
        }
    }

    #[test]
    fn window_contains_half_open() {
        let w = TimeWindow::new(Some(ts("2020-01-01")), Some(ts("2020-01-02")));
        assert!(w.contains(ts("2020-01-01")));
        assert!(w.contains(ts("2020-01-01T23:59:59")));
        assert!(!w.contains(ts("2020-01-02")));
    }

    #[test]
    fn window_intersection() {
        let a = TimeWindow::new(Some(ts("2020-01-01")), Some(ts("2020-02-01")));
        let b = TimeWindow::new(Some(ts("2020-01-15")), None);
        let i = a.intersect(&b).unwrap();
        assert_eq!(i.start(), Some(ts("2020-01-15")));
        assert_eq!(i.end(), Some(ts("2020-02-01")));

        let disjoint = TimeWindow::new(Some(ts("2020-03-01")), Some(ts("2020-04-01")));
        assert!(a.intersect(&disjoint).is_none());
    }

    #[test]
    fn unbounded_window_intersects_everything() {
        let all = TimeWindow::all();
        let w = TimeWindow::new(Some(ts("2020-01-01")), Some(ts("2020-01-02")));
        assert_eq!(all.intersect(&w), Some(w));
        assert!(all.covers(&w));
        assert!(!w.covers(&all));
    }
}
