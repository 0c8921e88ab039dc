use crate::error::Error;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Utc};
use chrono_tz::Tz;
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_TIME_ZONE: &str = "America/Los_Angeles";

/// Date-only layouts tried, in order, for pre-rendered calendar dates.
const CIVIL_DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d", "%Y%m%d", "%Y/%m/%d", "%m/%d/%Y", "%d %b %Y", "%b %d, %Y",
];

/// Length of a `YYYY-MM-DD` prefix on date-time strings.
const ISO_DATE_LEN: usize = 10;

/// A single date/time value as read from a source record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DateTimeSample {
    Instant(DateTime<FixedOffset>),
    Text(String),
}

impl From<&str> for DateTimeSample {
    fn from(value: &str) -> Self {
        DateTimeSample::Text(value.to_string())
    }
}

impl From<DateTime<FixedOffset>> for DateTimeSample {
    fn from(value: DateTime<FixedOffset>) -> Self {
        DateTimeSample::Instant(value)
    }
}

impl From<DateTime<Utc>> for DateTimeSample {
    fn from(value: DateTime<Utc>) -> Self {
        DateTimeSample::Instant(value.fixed_offset())
    }
}

/// How a source encodes its dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SourceConvention {
    /// The value is an absolute instant; its day is taken in the target zone.
    AbsoluteInstant,
    /// The value already names the business day; no zone shift is applied.
    CivilDate,
}

/// The business day a sample belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CanonicalDayKey(NaiveDate);

impl CanonicalDayKey {
    pub fn date(&self) -> NaiveDate {
        self.0
    }

    /// Milliseconds between the Unix epoch and midnight of this day.
    pub fn unix_millis(&self) -> i64 {
        (self.0 - NaiveDateTime::UNIX_EPOCH.date()).num_milliseconds()
    }
}

impl fmt::Display for CanonicalDayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

/// Normalizes samples against a single, fixed target zone.
#[derive(Debug, Clone, Copy)]
pub struct DayKeyNormalizer {
    target: Tz,
}

impl DayKeyNormalizer {
    pub fn new(target: Tz) -> Self {
        DayKeyNormalizer { target }
    }

    pub fn from_zone_name(name: &str) -> Result<Self, Error> {
        let target = Tz::from_str(name).map_err(|_| Error::UnknownTimeZone {
            name: name.to_string(),
        })?;
        Ok(Self::new(target))
    }

    pub fn normalize(
        &self,
        sample: &DateTimeSample,
        convention: SourceConvention,
    ) -> Result<CanonicalDayKey, Error> {
        normalize_day_key(sample, convention, self.target)
    }

    /// The business day that is current right now in the target zone.
    pub fn today(&self) -> CanonicalDayKey {
        CanonicalDayKey(Utc::now().with_timezone(&self.target).date_naive())
    }
}

impl Default for DayKeyNormalizer {
    fn default() -> Self {
        DayKeyNormalizer::new(chrono_tz::America::Los_Angeles)
    }
}

/// Maps a sample to exactly one business day.
///
/// Instants are shifted into `target` using the zone's own offset rules.
/// Civil dates are parsed as-is and never shifted. Anything that does not
/// resolve to a valid calendar date is a [`Error::ParseError`].
pub fn normalize_day_key(
    sample: &DateTimeSample,
    convention: SourceConvention,
    target: Tz,
) -> Result<CanonicalDayKey, Error> {
    let date = match (sample, convention) {
        (DateTimeSample::Instant(instant), SourceConvention::AbsoluteInstant) => {
            instant.with_timezone(&target).date_naive()
        }
        (DateTimeSample::Text(text), SourceConvention::AbsoluteInstant) => {
            parse_instant(text)?.with_timezone(&target).date_naive()
        }
        (DateTimeSample::Instant(instant), SourceConvention::CivilDate) => instant.date_naive(),
        (DateTimeSample::Text(text), SourceConvention::CivilDate) => parse_civil_date(text)?,
    };

    Ok(CanonicalDayKey(date))
}

fn parse_instant(text: &str) -> Result<DateTime<Utc>, Error> {
    let value = text.trim();

    if let Ok(instant) = DateTime::parse_from_rfc3339(value) {
        return Ok(instant.with_timezone(&Utc));
    }
    if let Ok(instant) = DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%z") {
        return Ok(instant.with_timezone(&Utc));
    }
    // Offset-less timestamps are UTC.
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S"))
        .map(|naive| naive.and_utc())
        .map_err(|_| Error::ParseError {
            value: text.to_string(),
        })
}

fn parse_civil_date(text: &str) -> Result<NaiveDate, Error> {
    let value = text.trim();
    let parse_error = || Error::ParseError {
        value: text.to_string(),
    };

    if value.is_empty() {
        return Err(parse_error());
    }

    if let Some(date) = CIVIL_DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(value, format).ok())
    {
        return Ok(date);
    }

    // "2025-10-07T12:00:00" or "2025-10-07 00:00:00": keep the date part only
    match (value.get(..ISO_DATE_LEN), value.get(ISO_DATE_LEN..)) {
        (Some(prefix), Some(rest)) if rest.starts_with(['T', ' ']) => {
            NaiveDate::parse_from_str(prefix, "%Y-%m-%d").map_err(|_| parse_error())
        }
        _ => Err(parse_error()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTimeSample {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap().into()
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_midnight_utc_falls_on_previous_pacific_day() {
        let normalizer = DayKeyNormalizer::default();
        let key = normalizer
            .normalize(&utc(2025, 10, 7, 0, 0), SourceConvention::AbsoluteInstant)
            .unwrap();
        assert_eq!(key.date(), day(2025, 10, 6));
    }

    #[test]
    fn test_morning_utc_stays_on_same_pacific_day() {
        let normalizer = DayKeyNormalizer::default();
        let key = normalizer
            .normalize(&utc(2025, 10, 7, 8, 0), SourceConvention::AbsoluteInstant)
            .unwrap();
        assert_eq!(key.date(), day(2025, 10, 7));
    }

    #[test]
    fn test_fixed_utc_minus_seven_zone() {
        // POSIX sign convention: Etc/GMT+7 is UTC-7
        let normalizer = DayKeyNormalizer::from_zone_name("Etc/GMT+7").unwrap();
        let previous = normalizer
            .normalize(&utc(2025, 10, 7, 0, 0), SourceConvention::AbsoluteInstant)
            .unwrap();
        let same = normalizer
            .normalize(&utc(2025, 10, 7, 8, 0), SourceConvention::AbsoluteInstant)
            .unwrap();
        assert_eq!(previous.date(), day(2025, 10, 6));
        assert_eq!(same.date(), day(2025, 10, 7));
    }

    #[test]
    fn test_normalize_is_deterministic() {
        let normalizer = DayKeyNormalizer::default();
        let samples = [
            utc(2025, 10, 7, 0, 0),
            utc(2025, 3, 9, 10, 30),
            utc(2024, 12, 31, 23, 59),
            DateTimeSample::from("2025-10-07"),
        ];
        for sample in &samples {
            for convention in [SourceConvention::AbsoluteInstant, SourceConvention::CivilDate] {
                let first = normalizer.normalize(sample, convention);
                let second = normalizer.normalize(sample, convention);
                match (first, second) {
                    (Ok(a), Ok(b)) => assert_eq!(a, b),
                    (Err(_), Err(_)) => {}
                    _ => panic!("normalizing {sample:?} twice disagreed"),
                }
            }
        }
    }

    #[test]
    fn test_dst_end_uses_standard_offset() {
        // 2025-11-03 07:30 UTC is 23:30 PST on Nov 2; a fixed -7 shift would say Nov 3
        let normalizer = DayKeyNormalizer::default();
        let key = normalizer
            .normalize(&utc(2025, 11, 3, 7, 30), SourceConvention::AbsoluteInstant)
            .unwrap();
        assert_eq!(key.date(), day(2025, 11, 2));
    }

    #[test]
    fn test_dst_start_boundary() {
        let normalizer = DayKeyNormalizer::default();
        // 2025-03-09 02:00 PST jumps to 03:00 PDT at 10:00 UTC
        let before = normalizer
            .normalize(&utc(2025, 3, 9, 9, 59), SourceConvention::AbsoluteInstant)
            .unwrap();
        let after = normalizer
            .normalize(&utc(2025, 3, 9, 10, 0), SourceConvention::AbsoluteInstant)
            .unwrap();
        assert_eq!(before.date(), day(2025, 3, 9));
        assert_eq!(after.date(), day(2025, 3, 9));

        // 07:59 UTC is still 23:59 PST of the previous day
        let late = normalizer
            .normalize(&utc(2025, 3, 9, 7, 59), SourceConvention::AbsoluteInstant)
            .unwrap();
        assert_eq!(late.date(), day(2025, 3, 8));
    }

    #[test]
    fn test_civil_date_is_not_shifted() {
        let normalizer = DayKeyNormalizer::from_zone_name("Pacific/Kiritimati").unwrap();
        let key = normalizer
            .normalize(&"2025-10-07".into(), SourceConvention::CivilDate)
            .unwrap();
        assert_eq!(key.date(), day(2025, 10, 7));
        assert_eq!(key.to_string(), "2025-10-07");
    }

    #[test]
    fn test_civil_date_flexible_forms() {
        let normalizer = DayKeyNormalizer::default();
        for text in [
            "2025-10-07",
            "20251007",
            "2025/10/07",
            "10/07/2025",
            "07 Oct 2025",
            "Oct 07, 2025",
            " 2025-10-07 ",
            "2025-10-07T23:30:00",
            "2025-10-07 00:00:00",
        ] {
            let key = normalizer
                .normalize(&text.into(), SourceConvention::CivilDate)
                .unwrap_or_else(|err| panic!("{text}: {err}"));
            assert_eq!(key.date(), day(2025, 10, 7), "{text}");
        }
    }

    #[test]
    fn test_instant_under_civil_convention_keeps_local_date() {
        let instant = DateTime::parse_from_rfc3339("2025-10-07T23:00:00-07:00").unwrap();
        let key = DayKeyNormalizer::default()
            .normalize(&instant.into(), SourceConvention::CivilDate)
            .unwrap();
        assert_eq!(key.date(), day(2025, 10, 7));
    }

    #[test]
    fn test_instant_text_is_shifted() {
        let normalizer = DayKeyNormalizer::default();
        for text in [
            "2025-10-07T00:00:00Z",
            "2025-10-07T00:00:00+0000",
            "2025-10-07 00:00:00",
        ] {
            let key = normalizer
                .normalize(&text.into(), SourceConvention::AbsoluteInstant)
                .unwrap();
            assert_eq!(key.date(), day(2025, 10, 6), "{text}");
        }
    }

    #[test]
    fn test_unparseable_dates_fail_closed() {
        let normalizer = DayKeyNormalizer::default();
        for text in ["not-a-date", "", "   ", "2025-02-30", "2025-13-01", "2025-10-07Xjunk"] {
            let result = normalizer.normalize(&text.into(), SourceConvention::CivilDate);
            assert!(
                matches!(result, Err(Error::ParseError { ref value }) if value == text),
                "{text} should not parse"
            );
        }

        let result = normalizer.normalize(&"not-a-date".into(), SourceConvention::AbsoluteInstant);
        assert!(matches!(result, Err(Error::ParseError { .. })));
    }

    #[test]
    fn test_unknown_zone() {
        let result = DayKeyNormalizer::from_zone_name("Mars/Olympus_Mons");
        assert!(matches!(
            result,
            Err(Error::UnknownTimeZone { name }) if name == "Mars/Olympus_Mons"
        ));
    }

    #[test]
    fn test_unix_millis() {
        let key = DayKeyNormalizer::default()
            .normalize(&"2023-10-01".into(), SourceConvention::CivilDate)
            .unwrap();
        assert_eq!(key.unix_millis(), 1696118400000);
    }
}
