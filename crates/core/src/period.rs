use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// A calendar year, used as the unit of year-aligned views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CalendarYear(pub i32);

impl fmt::Display for CalendarYear {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl CalendarYear {
    pub fn new(year: i32) -> Self {
        CalendarYear(year)
    }

    pub fn of(at: DateTime<Utc>) -> Self {
        CalendarYear(at.year())
    }

    pub fn year(self) -> i32 {
        self.0
    }

    /// Midnight UTC on January 1. Years outside chrono's range clamp to the
    /// representable extremes.
    pub fn start(self) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(self.0, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or(if self.0 > 0 {
                DateTime::<Utc>::MAX_UTC
            } else {
                DateTime::<Utc>::MIN_UTC
            })
    }

    /// Start of the following year; the year window is `[start, end_exclusive)`.
    pub fn end_exclusive(self) -> DateTime<Utc> {
        match self.0.checked_add(1) {
            Some(next) => CalendarYear(next).start(),
            None => DateTime::<Utc>::MAX_UTC,
        }
    }

    pub fn contains(self, at: DateTime<Utc>) -> bool {
        at >= self.start() && at < self.end_exclusive()
    }
}

/// Replaces the year component of `at`, keeping month, day and time of day.
/// February 29 lands on February 28 in non-leap years.
pub fn with_calendar_year(at: DateTime<Utc>, year: i32) -> DateTime<Utc> {
    at.with_year(year).unwrap_or_else(|| {
        NaiveDate::from_ymd_opt(year, at.month(), 28)
            .map(|date| date.and_time(at.time()).and_utc())
            .unwrap_or(at)
    })
}

/// How often a benefit's credit resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResetCadence {
    Annual,
    #[serde(alias = "twice-yearly", alias = "semi-annual")]
    Semiannual,
    Quarterly,
    Monthly,
}

impl fmt::Display for ResetCadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResetCadence::Annual => write!(f, "annual"),
            ResetCadence::Semiannual => write!(f, "semiannual"),
            ResetCadence::Quarterly => write!(f, "quarterly"),
            ResetCadence::Monthly => write!(f, "monthly"),
        }
    }
}

impl ResetCadence {
    pub fn periods_per_year(self) -> u32 {
        match self {
            ResetCadence::Annual => 1,
            ResetCadence::Semiannual => 2,
            ResetCadence::Quarterly => 4,
            ResetCadence::Monthly => 12,
        }
    }

    /// Splits a calendar year into this cadence's sub-periods, returned as
    /// `(id, range)` pairs in chronological order. Annual benefits have no
    /// sub-periods.
    pub fn sub_periods(self, year: CalendarYear) -> Vec<(String, DateRange)> {
        let count = self.periods_per_year();
        if count <= 1 {
            return Vec::new();
        }
        let months = 12 / count;
        (0..count)
            .filter_map(|index| {
                let first_month = index * months + 1;
                let start = Utc
                    .with_ymd_and_hms(year.0, first_month, 1, 0, 0, 0)
                    .single()?;
                let next = if first_month + months > 12 {
                    year.end_exclusive()
                } else {
                    Utc.with_ymd_and_hms(year.0, first_month + months, 1, 0, 0, 0)
                        .single()?
                };
                let end = next - Duration::milliseconds(1);
                let id = match self {
                    ResetCadence::Semiannual => format!("h{}", index + 1),
                    ResetCadence::Quarterly => format!("q{}", index + 1),
                    _ => format!("m{:02}", first_month),
                };
                Some((id, DateRange::new(start, end)))
            })
            .collect()
    }
}

/// An inclusive instant range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to {}",
            self.start.date_naive(),
            self.end.date_naive()
        )
    }
}

impl DateRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        DateRange { start, end }
    }

    pub fn contains(self, at: DateTime<Utc>) -> bool {
        at >= self.start && at <= self.end
    }

    pub fn has_started(self, at: DateTime<Utc>) -> bool {
        at >= self.start
    }

    pub fn has_ended(self, at: DateTime<Utc>) -> bool {
        at > self.end
    }

    /// Moves both ends by `years` calendar years, keeping month, day and
    /// time of day. A range spanning a year boundary keeps its span.
    pub fn shift_years(self, years: i32) -> Self {
        if years == 0 {
            return self;
        }
        DateRange {
            start: with_calendar_year(self.start, self.start.year().saturating_add(years)),
            end: with_calendar_year(self.end, self.end.year().saturating_add(years)),
        }
    }

    /// Percentage of the range elapsed at `at`, clamped to `0..=100`.
    pub fn time_progress(self, at: DateTime<Utc>) -> f64 {
        if at <= self.start {
            return 0.0;
        }
        if at >= self.end {
            return 100.0;
        }
        let total = (self.end - self.start).num_milliseconds() as f64;
        let elapsed = (at - self.start).num_milliseconds() as f64;
        elapsed / total * 100.0
    }

    /// Whole days until the end of the range, rounded up; negative once past.
    pub fn days_remaining(self, at: DateTime<Utc>) -> i64 {
        let millis = (self.end - at).num_milliseconds() as f64;
        (millis / MILLIS_PER_DAY).ceil() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    // ── CalendarYear ──────────────────────────────────────────────────────────

    #[test]
    fn calendar_year_window_is_half_open() {
        let y = CalendarYear::new(2025);
        assert_eq!(y.start(), at(2025, 1, 1));
        assert_eq!(y.end_exclusive(), at(2026, 1, 1));
        assert!(y.contains(at(2025, 12, 31)));
        assert!(!y.contains(at(2026, 1, 1)));
        assert!(!y.contains(at(2024, 12, 31)));
    }

    #[test]
    fn calendar_year_display() {
        assert_eq!(CalendarYear::new(2024).to_string(), "2024");
    }

    // ── year replacement ──────────────────────────────────────────────────────

    #[test]
    fn with_calendar_year_keeps_month_day_and_time() {
        let original = Utc.with_ymd_and_hms(2025, 3, 31, 23, 59, 59).unwrap();
        let moved = with_calendar_year(original, 2022);
        assert_eq!(moved.year(), 2022);
        assert_eq!(moved.month(), 3);
        assert_eq!(moved.day(), 31);
        assert_eq!(moved.time(), original.time());
    }

    #[test]
    fn leap_day_falls_back_to_feb_28() {
        let leap = Utc.with_ymd_and_hms(2024, 2, 29, 12, 0, 0).unwrap();
        let moved = with_calendar_year(leap, 2025);
        assert_eq!(moved, Utc.with_ymd_and_hms(2025, 2, 28, 12, 0, 0).unwrap());
    }

    #[test]
    fn shift_years_round_trip_preserves_month_day() {
        let range = DateRange::new(at(2025, 7, 1), Utc.with_ymd_and_hms(2025, 12, 31, 23, 59, 59).unwrap());
        let shifted = range.shift_years(-2);
        assert_eq!(shifted.start.year(), 2023);
        assert_eq!((shifted.start.month(), shifted.start.day()), (7, 1));
        assert_eq!((shifted.end.month(), shifted.end.day()), (12, 31));
        assert_eq!(shifted.shift_years(2), range);
    }

    #[test]
    fn shift_years_keeps_cross_year_span() {
        let anniversary = DateRange::new(at(2025, 6, 1), at(2026, 5, 31));
        let shifted = anniversary.shift_years(1);
        assert_eq!(shifted.start, at(2026, 6, 1));
        assert_eq!(shifted.end, at(2027, 5, 31));
    }

    // ── cadence ───────────────────────────────────────────────────────────────

    #[test]
    fn quarterly_sub_periods_cover_full_year() {
        let year = CalendarYear::new(2025);
        let quarters = ResetCadence::Quarterly.sub_periods(year);
        assert_eq!(quarters.len(), 4);
        assert_eq!(quarters[0].0, "q1");
        assert_eq!(quarters[0].1.start, year.start());
        assert_eq!(quarters[1].1.start, at(2025, 4, 1));
        assert_eq!(quarters[3].1.end, year.end_exclusive() - Duration::milliseconds(1));
    }

    #[test]
    fn monthly_and_semiannual_ids() {
        let year = CalendarYear::new(2025);
        let months = ResetCadence::Monthly.sub_periods(year);
        assert_eq!(months.len(), 12);
        assert_eq!(months[0].0, "m01");
        assert_eq!(months[11].0, "m12");
        let halves = ResetCadence::Semiannual.sub_periods(year);
        assert_eq!(halves.iter().map(|(id, _)| id.as_str()).collect::<Vec<_>>(), ["h1", "h2"]);
        assert_eq!(halves[1].1.start, at(2025, 7, 1));
    }

    #[test]
    fn annual_has_no_sub_periods() {
        assert!(ResetCadence::Annual.sub_periods(CalendarYear::new(2025)).is_empty());
    }

    #[test]
    fn cadence_accepts_legacy_name() {
        let cadence: ResetCadence = serde_json::from_str("\"twice-yearly\"").unwrap();
        assert_eq!(cadence, ResetCadence::Semiannual);
    }

    // ── DateRange ─────────────────────────────────────────────────────────────

    #[test]
    fn date_range_contains_is_inclusive() {
        let range = DateRange::new(at(2025, 1, 1), at(2025, 3, 31));
        assert!(range.contains(at(2025, 1, 1)));
        assert!(range.contains(at(2025, 3, 31)));
        assert!(!range.contains(at(2025, 4, 1)));
        assert!(range.has_ended(at(2025, 4, 1)));
        assert!(!range.has_started(at(2024, 12, 31)));
    }

    #[test]
    fn time_progress_and_days_remaining() {
        let range = DateRange::new(at(2025, 1, 1), at(2025, 1, 11));
        assert_eq!(range.time_progress(at(2024, 12, 1)), 0.0);
        assert_eq!(range.time_progress(at(2025, 1, 6)), 50.0);
        assert_eq!(range.time_progress(at(2025, 2, 1)), 100.0);
        assert_eq!(range.days_remaining(at(2025, 1, 6)), 5);
        let noon = Utc.with_ymd_and_hms(2025, 1, 6, 12, 0, 0).unwrap();
        assert_eq!(range.days_remaining(noon), 5);
    }

    #[test]
    fn date_range_display() {
        let range = DateRange::new(at(2025, 1, 1), at(2025, 12, 31));
        assert_eq!(range.to_string(), "2025-01-01 to 2025-12-31");
    }
}
