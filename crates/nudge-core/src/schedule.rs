// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Calendar patterns for recurring timers.
//!
//! Three textual forms are accepted, each evaluated in an IANA timezone:
//!
//! | Form | Example | Meaning |
//! |------|---------|---------|
//! | `HH:MM` | `09:30` | every day at that local time |
//! | `HH:MM-HH:MM` | `08:00-10:00` | every day at a random minute inside the window |
//! | `m h dom mon dow` | `0 9 * * 1` | calendar fields, each `*` or a single value |
//!
//! Calendar fields are combined with AND: every bound field must match.
//! Weekdays count from Sunday = 0 (7 is also Sunday). Local times that do not
//! exist because of a DST gap are skipped.

use std::fmt;

use chrono::{DateTime, Datelike, Days, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use rand::Rng;
use rand::seq::SliceRandom;

use crate::error::{EngineError, Result};

/// How far ahead `next_after` searches before giving up. Covers the
/// 28-year cycle needed for a Feb 29 that must also fall on a given weekday.
const MAX_SEARCH_DAYS: u64 = 366 * 28;

/// A single calendar field: `None` is the wildcard.
type Field = Option<u32>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternKind {
    FixedTime {
        minute_of_day: u32,
    },
    RandomWindow {
        start: u32,
        end: u32,
    },
    Calendar {
        minute: Field,
        hour: Field,
        day: Field,
        month: Field,
        weekday: Field,
    },
}

/// A parsed recurring schedule bound to a timezone.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulePattern {
    kind: PatternKind,
    timezone: Tz,
    source: String,
}

impl SchedulePattern {
    /// Parse a pattern string in the given timezone.
    pub fn parse(source: &str, timezone: Tz) -> Result<Self> {
        let trimmed = source.trim();
        let fields: Vec<&str> = trimmed.split_whitespace().collect();

        let kind = if fields.len() == 5 {
            PatternKind::Calendar {
                minute: parse_field(fields[0], "minute", 0, 59)?,
                hour: parse_field(fields[1], "hour", 0, 23)?,
                day: parse_field(fields[2], "day", 1, 31)?,
                month: parse_field(fields[3], "month", 1, 12)?,
                weekday: parse_field(fields[4], "weekday", 0, 7)?.map(|d| d % 7),
            }
        } else if fields.len() != 1 {
            return Err(EngineError::validation(
                "pattern",
                format!("expected HH:MM, HH:MM-HH:MM or five calendar fields, got '{trimmed}'"),
            ));
        } else if let Some((start, end)) = trimmed.split_once('-') {
            let start = parse_time_of_day(start)?;
            let end = parse_time_of_day(end)?;
            if start >= end {
                return Err(EngineError::validation(
                    "pattern",
                    format!("window start must be before its end in '{trimmed}'"),
                ));
            }
            PatternKind::RandomWindow { start, end }
        } else {
            PatternKind::FixedTime {
                minute_of_day: parse_time_of_day(trimmed)?,
            }
        };

        Ok(Self {
            kind,
            timezone,
            source: trimmed.to_string(),
        })
    }

    /// The pattern text as given.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Timezone the pattern is evaluated in.
    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Whether occurrences are drawn at random inside a window.
    pub fn is_random(&self) -> bool {
        matches!(self.kind, PatternKind::RandomWindow { .. })
    }

    /// Human-readable description for timer listings.
    pub fn describe(&self) -> String {
        match self.kind {
            PatternKind::FixedTime { minute_of_day } => {
                format!("daily at {} ({})", format_minute(minute_of_day), self.timezone)
            }
            PatternKind::RandomWindow { start, end } => format!(
                "daily between {} and {} ({})",
                format_minute(start),
                format_minute(end),
                self.timezone
            ),
            PatternKind::Calendar { .. } => {
                format!("calendar '{}' ({})", self.source, self.timezone)
            }
        }
    }

    /// First occurrence strictly after `after`, or `None` if the pattern can
    /// never match.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.next_after_with(after, &mut rand::thread_rng())
    }

    /// Like [`next_after`](Self::next_after) with an explicit random source.
    pub fn next_after_with<R: Rng + ?Sized>(
        &self,
        after: DateTime<Utc>,
        rng: &mut R,
    ) -> Option<DateTime<Utc>> {
        let start_date = after.with_timezone(&self.timezone).date_naive();
        self.search(start_date, after, rng)
    }

    /// Occurrence following one that fired at `fired`, and after `now`.
    ///
    /// A random window yields one occurrence per local day, so the search
    /// resumes on the day after `fired`.
    pub fn next_after_fired(&self, fired: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.next_after_fired_with(fired, now, &mut rand::thread_rng())
    }

    /// Like [`next_after_fired`](Self::next_after_fired) with an explicit
    /// random source.
    pub fn next_after_fired_with<R: Rng + ?Sized>(
        &self,
        fired: DateTime<Utc>,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> Option<DateTime<Utc>> {
        let after = fired.max(now);
        if !self.is_random() {
            return self.next_after_with(after, rng);
        }
        let next_day = fired
            .with_timezone(&self.timezone)
            .date_naive()
            .checked_add_days(Days::new(1))?;
        self.search(next_day, after, rng)
    }

    fn search<R: Rng + ?Sized>(
        &self,
        start_date: NaiveDate,
        after: DateTime<Utc>,
        rng: &mut R,
    ) -> Option<DateTime<Utc>> {
        for offset in 0..MAX_SEARCH_DAYS {
            let date = start_date.checked_add_days(Days::new(offset))?;
            if !self.matches_date(date) {
                continue;
            }

            let candidates: Vec<DateTime<Utc>> = self
                .minutes_of_day()
                .filter_map(|minute| self.resolve(date, minute))
                .filter(|instant| *instant > after)
                .collect();

            let chosen = if self.is_random() {
                candidates.choose(rng).copied()
            } else {
                candidates.first().copied()
            };
            if chosen.is_some() {
                return chosen;
            }
        }

        None
    }

    fn matches_date(&self, date: NaiveDate) -> bool {
        match self.kind {
            PatternKind::Calendar {
                day,
                month,
                weekday,
                ..
            } => {
                day.is_none_or(|d| date.day() == d)
                    && month.is_none_or(|m| date.month() == m)
                    && weekday.is_none_or(|w| date.weekday().num_days_from_sunday() == w)
            }
            _ => true,
        }
    }

    /// Candidate minutes of the day, ascending.
    fn minutes_of_day(&self) -> Box<dyn Iterator<Item = u32> + '_> {
        match self.kind {
            PatternKind::FixedTime { minute_of_day } => Box::new(std::iter::once(minute_of_day)),
            PatternKind::RandomWindow { start, end } => Box::new(start..=end),
            PatternKind::Calendar { minute, hour, .. } => {
                let hours: Vec<u32> = hour.map_or_else(|| (0..24).collect(), |h| vec![h]);
                Box::new(hours.into_iter().flat_map(move |h| {
                    let minutes: Vec<u32> = minute.map_or_else(|| (0..60).collect(), |m| vec![m]);
                    minutes.into_iter().map(move |m| h * 60 + m)
                }))
            }
        }
    }

    fn resolve(&self, date: NaiveDate, minute_of_day: u32) -> Option<DateTime<Utc>> {
        let local = date.and_hms_opt(minute_of_day / 60, minute_of_day % 60, 0)?;
        self.timezone
            .from_local_datetime(&local)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

impl fmt::Display for SchedulePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn parse_time_of_day(text: &str) -> Result<u32> {
    let invalid = || EngineError::validation("pattern", format!("invalid time of day '{text}'"));

    let (hour, minute) = text.trim().split_once(':').ok_or_else(invalid)?;
    let hour: u32 = parse_digits(hour).ok_or_else(invalid)?;
    let minute: u32 = parse_digits(minute).ok_or_else(invalid)?;
    if hour > 23 || minute > 59 {
        return Err(invalid());
    }
    Ok(hour * 60 + minute)
}

fn parse_field(text: &str, name: &str, min: u32, max: u32) -> Result<Field> {
    if text == "*" {
        return Ok(None);
    }
    match parse_digits(text) {
        Some(value) if (min..=max).contains(&value) => Ok(Some(value)),
        _ => Err(EngineError::validation(
            "pattern",
            format!("{name} field must be '*' or {min}-{max}, got '{text}'"),
        )),
    }
}

fn parse_digits(text: &str) -> Option<u32> {
    if text.is_empty() || text.len() > 2 || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

fn format_minute(minute_of_day: u32) -> String {
    format!("{:02}:{:02}", minute_of_day / 60, minute_of_day % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_fixed_time_same_day_and_next_day() {
        let pattern = SchedulePattern::parse("09:30", chrono_tz::UTC).unwrap();

        assert_eq!(
            pattern.next_after(utc("2025-01-06T08:00:00Z")),
            Some(utc("2025-01-06T09:30:00Z"))
        );
        assert_eq!(
            pattern.next_after(utc("2025-01-06T09:30:00Z")),
            Some(utc("2025-01-07T09:30:00Z"))
        );
    }

    #[test]
    fn test_fixed_time_respects_timezone() {
        let pattern = SchedulePattern::parse("09:30", chrono_tz::Europe::Berlin).unwrap();

        // Berlin is UTC+1 in January
        assert_eq!(
            pattern.next_after(utc("2025-01-06T00:00:00Z")),
            Some(utc("2025-01-06T08:30:00Z"))
        );
    }

    #[test]
    fn test_random_window_stays_inside_window() {
        let pattern = SchedulePattern::parse("08:00-10:00", chrono_tz::UTC).unwrap();
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..50 {
            let next = pattern
                .next_after_with(utc("2025-01-06T00:00:00Z"), &mut rng)
                .unwrap();
            assert!(next >= utc("2025-01-06T08:00:00Z"));
            assert!(next <= utc("2025-01-06T10:00:00Z"));
        }
    }

    #[test]
    fn test_random_window_first_draw_uses_rest_of_open_window() {
        let pattern = SchedulePattern::parse("08:00-10:00", chrono_tz::UTC).unwrap();
        let mut rng = StdRng::seed_from_u64(42);

        // a participant enrolled mid-window still gets today's prompt
        let after = utc("2025-01-06T09:58:00Z");
        let next = pattern.next_after_with(after, &mut rng).unwrap();
        assert!(next > after);
        assert!(next <= utc("2025-01-06T10:00:00Z"));
    }

    #[test]
    fn test_random_window_fires_once_per_day() {
        let pattern = SchedulePattern::parse("08:00-10:00", chrono_tz::UTC).unwrap();
        let fired = utc("2025-01-06T08:30:00Z");

        for seed in 0..100 {
            let mut rng = StdRng::seed_from_u64(seed);
            let next = pattern
                .next_after_fired_with(fired, fired, &mut rng)
                .unwrap();
            assert!(next >= utc("2025-01-07T08:00:00Z"), "seed {seed}: {next}");
            assert!(next <= utc("2025-01-07T10:00:00Z"), "seed {seed}: {next}");
        }
    }

    #[test]
    fn test_random_window_follows_local_day() {
        // 23:00 UTC on Jan 6 is already Jan 7 in Warsaw
        let pattern = SchedulePattern::parse("08:00-10:00", chrono_tz::Europe::Warsaw).unwrap();
        let mut rng = StdRng::seed_from_u64(3);

        let next = pattern
            .next_after_fired_with(utc("2025-01-06T07:30:00Z"), utc("2025-01-06T23:00:00Z"), &mut rng)
            .unwrap();
        assert!(next >= utc("2025-01-07T07:00:00Z"));
        assert!(next <= utc("2025-01-07T09:00:00Z"));
    }

    #[test]
    fn test_fixed_time_after_late_fire() {
        let pattern = SchedulePattern::parse("09:30", chrono_tz::UTC).unwrap();

        // fired on time, callback finished late
        assert_eq!(
            pattern.next_after_fired(utc("2025-01-06T09:30:00Z"), utc("2025-01-06T09:31:10Z")),
            Some(utc("2025-01-07T09:30:00Z"))
        );
        // overdue by more than a day
        assert_eq!(
            pattern.next_after_fired(utc("2025-01-06T09:30:00Z"), utc("2025-01-08T10:00:00Z")),
            Some(utc("2025-01-09T09:30:00Z"))
        );
    }

    #[test]
    fn test_calendar_weekday() {
        // 2025-01-06 is a Monday
        let pattern = SchedulePattern::parse("0 9 * * 1", chrono_tz::UTC).unwrap();

        assert_eq!(
            pattern.next_after(utc("2025-01-06T08:00:00Z")),
            Some(utc("2025-01-06T09:00:00Z"))
        );
        assert_eq!(
            pattern.next_after(utc("2025-01-06T10:00:00Z")),
            Some(utc("2025-01-13T09:00:00Z"))
        );
    }

    #[test]
    fn test_calendar_wildcards_pick_next_minute() {
        let pattern = SchedulePattern::parse("* * * * *", chrono_tz::UTC).unwrap();

        assert_eq!(
            pattern.next_after(utc("2025-01-06T08:00:30Z")),
            Some(utc("2025-01-06T08:01:00Z"))
        );
    }

    #[test]
    fn test_calendar_sunday_as_seven() {
        let pattern = SchedulePattern::parse("0 12 * * 7", chrono_tz::UTC).unwrap();

        // 2025-01-12 is a Sunday
        assert_eq!(
            pattern.next_after(utc("2025-01-06T00:00:00Z")),
            Some(utc("2025-01-12T12:00:00Z"))
        );
    }

    #[test]
    fn test_impossible_date_never_matches() {
        let pattern = SchedulePattern::parse("0 9 30 2 *", chrono_tz::UTC).unwrap();
        assert_eq!(pattern.next_after(utc("2025-01-06T00:00:00Z")), None);
    }

    #[test]
    fn test_dst_gap_is_skipped() {
        // 02:30 does not exist in New York on 2025-03-09
        let pattern = SchedulePattern::parse("02:30", chrono_tz::America::New_York).unwrap();

        assert_eq!(
            pattern.next_after(utc("2025-03-09T06:00:00Z")),
            Some(utc("2025-03-10T06:30:00Z"))
        );
    }

    #[test]
    fn test_invalid_patterns() {
        for bad in [
            "", "25:00", "10:60", "9", "10:00-09:00", "x y z", "60 * * * *", "* * 0 * *",
            "* * * 13 *", "1:2:3",
        ] {
            assert!(
                SchedulePattern::parse(bad, chrono_tz::UTC).is_err(),
                "pattern '{bad}' should be rejected"
            );
        }
    }

    #[test]
    fn test_describe() {
        let tz = chrono_tz::UTC;
        assert_eq!(
            SchedulePattern::parse("9:05", tz).unwrap().describe(),
            "daily at 09:05 (UTC)"
        );
        assert_eq!(
            SchedulePattern::parse("08:00-10:00", tz).unwrap().describe(),
            "daily between 08:00 and 10:00 (UTC)"
        );
        assert_eq!(
            SchedulePattern::parse("0 9 * * 1", tz).unwrap().describe(),
            "calendar '0 9 * * 1' (UTC)"
        );
    }
}
