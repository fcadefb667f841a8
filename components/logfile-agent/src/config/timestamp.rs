// External crates
use anyhow::{Context, Result, bail};
use chrono::format::{Parsed, StrftimeItems};
use chrono::{DateTime, Datelike, Duration, Local, TimeZone, Utc};
use regex::Regex;
use std::sync::Arc;

/// Canonical name that selects UTC interpretation; anything else means
/// the host's local zone.
pub const UTC_ZONE_NAME: &str = "UTC";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventTimezone {
    #[default]
    Local,
    Utc,
}

pub fn resolve_timezone(name: Option<&str>) -> EventTimezone {
    match name {
        Some(UTC_ZONE_NAME) => EventTimezone::Utc,
        _ => EventTimezone::Local,
    }
}

/// Pulls a timestamp out of an event's full text.
///
/// The regex locates the timestamp (capture group 1 when present, whole
/// match otherwise); the layouts are tried in order until one parses.
#[derive(Debug, Clone)]
pub struct TimestampExtractor {
    regex: Arc<Regex>,
    layouts: Vec<String>,
    tz: EventTimezone,
}

impl TimestampExtractor {
    pub fn new(pattern: &str, layouts: Vec<String>, tz: EventTimezone) -> Result<Self> {
        if layouts.is_empty() {
            bail!("timestamp_layout requires at least one layout string");
        }
        let regex = Regex::new(pattern)
            .with_context(|| format!("Invalid timestamp regex {:?}", pattern))?;
        Ok(Self {
            regex: Arc::new(regex),
            layouts,
            tz,
        })
    }

    /// Shared handle to the compiled regex, for the multi-line start
    /// sentinel that aliases it.
    pub fn regex(&self) -> Arc<Regex> {
        Arc::clone(&self.regex)
    }

    /// Returns `None` when the regex does not match or no layout parses.
    pub fn extract(&self, message: &str) -> Option<DateTime<Utc>> {
        let caps = self.regex.captures(message)?;
        let text = caps.get(1).or_else(|| caps.get(0))?.as_str();

        self.layouts
            .iter()
            .find_map(|layout| self.parse_layout(text, layout))
    }

    fn parse_layout(&self, text: &str, layout: &str) -> Option<DateTime<Utc>> {
        let mut parsed = Parsed::new();
        chrono::format::parse(&mut parsed, text, StrftimeItems::new(layout)).ok()?;

        // Layouts like "%b %d %H:%M:%S" carry no year; fill in the
        // current one before resolving.
        if parsed.year.is_none() {
            parsed.set_year(i64::from(Utc::now().year())).ok()?;
        }

        let date = parsed.to_naive_date().ok()?;
        let time = parsed.to_naive_time().ok()?;
        let naive = date.and_time(time);

        let mut resolved = match self.tz {
            EventTimezone::Utc => Utc.from_utc_datetime(&naive),
            EventTimezone::Local => Local
                .from_local_datetime(&naive)
                .earliest()?
                .with_timezone(&Utc),
        };

        // A year-less timestamp read shortly after New Year can resolve
        // almost a year ahead of the clock; pull it back.
        if resolved > Utc::now() + Duration::days(30) {
            resolved = resolved.with_year(resolved.year() - 1)?;
        }

        Some(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor(pattern: &str, layout: &str) -> TimestampExtractor {
        TimestampExtractor::new(pattern, vec![layout.to_string()], EventTimezone::Utc).unwrap()
    }

    #[test]
    fn parses_full_timestamp() {
        let e = extractor(
            r"\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}",
            "%Y-%m-%d %H:%M:%S",
        );
        let ts = e.extract("2024-03-05 10:20:30 something happened").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 3, 5, 10, 20, 30).unwrap());
    }

    #[test]
    fn fills_current_year_when_layout_has_none() {
        let e = extractor(r"[A-Z][a-z]{2} +\d+ \d{2}:\d{2}:\d{2}", "%b %d %H:%M:%S");
        let ts = e.extract("Jan 02 15:04:05 kernel: boot").unwrap();
        assert!(ts.year() == Utc::now().year() || ts.year() == Utc::now().year() - 1);
    }

    #[test]
    fn never_resolves_more_than_thirty_days_ahead() {
        let e = extractor(r"[A-Z][a-z]{2} +\d+ \d{2}:\d{2}:\d{2}", "%b %d %H:%M:%S");
        let future = Utc::now() + Duration::days(40);
        let line = format!("{} some event", future.format("%b %d %H:%M:%S"));
        let ts = e.extract(&line).unwrap();
        assert!(ts <= Utc::now() + Duration::days(30));
    }

    #[test]
    fn unparseable_text_yields_none() {
        let e = extractor(r"\d{4}-\d{2}-\d{2}", "%Y-%m-%d %H:%M:%S");
        assert!(e.extract("no timestamp here").is_none());
        // Regex matches but the layout wants more than the match holds.
        assert!(e.extract("2024-03-05 trailing").is_none());
    }

    #[test]
    fn capture_group_narrows_the_match() {
        let e = extractor(r"ts=(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2})", "%Y-%m-%d %H:%M:%S");
        let ts = e.extract("ts=2024-06-01 01:02:03 msg=ok").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 6, 1, 1, 2, 3).unwrap());
    }

    #[test]
    fn timezone_resolution_is_exact_match_only() {
        assert_eq!(resolve_timezone(Some("UTC")), EventTimezone::Utc);
        assert_eq!(resolve_timezone(Some("utc")), EventTimezone::Local);
        assert_eq!(resolve_timezone(Some("Europe/Berlin")), EventTimezone::Local);
        assert_eq!(resolve_timezone(None), EventTimezone::Local);
    }
}
