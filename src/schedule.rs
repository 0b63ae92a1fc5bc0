/// Schedule specifications: `interval:<secs>`, `cron:<5 fields>`,
/// `once:<delay secs>` or `disabled`.
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleSpec {
    Interval(u64),
    Cron(CronExpr),
    Once(u64),
    Disabled,
}

/// A validated five-field cron expression evaluated in UTC.
#[derive(Clone)]
pub struct CronExpr {
    source: String,
    schedule: cron::Schedule,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self, ConfigError> {
        let source = expr.split_whitespace().collect::<Vec<&str>>().join(" ");
        let fields = source.split(' ').collect::<Vec<&str>>();
        if fields.len() != 5 {
            return Err(ConfigError::Schedule {
                spec: format!("cron:{expr}"),
                reason: format!("expected 5 fields, found {}", fields.len()),
            });
        }
        let dow = map_day_of_week(fields[4]).map_err(|reason| ConfigError::Schedule {
            spec: format!("cron:{expr}"),
            reason,
        })?;
        // the cron crate wants a leading seconds field
        let expanded = format!(
            "0 {} {} {} {} {dow}",
            fields[0], fields[1], fields[2], fields[3]
        );
        let schedule =
            cron::Schedule::from_str(&expanded).map_err(|err| ConfigError::Schedule {
                spec: format!("cron:{expr}"),
                reason: err.to_string(),
            })?;
        Ok(Self { source, schedule })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

impl PartialEq for CronExpr {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for CronExpr {}

impl fmt::Debug for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronExpr").field(&self.source).finish()
    }
}

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

fn day_number(token: &str) -> Result<usize, String> {
    let day = token
        .parse::<usize>()
        .map_err(|err| format!("invalid day of week '{token}': {err}"))?;
    if day > 7 {
        return Err(format!("day of week {day} is out of range 0-7"));
    }
    Ok(day)
}

/// Rewrites numeric day-of-week tokens (0 or 7 = Sunday) into explicit day
/// name lists, since the cron crate numbers days from 1. Named tokens pass
/// through untouched.
fn map_day_of_week(field: &str) -> Result<String, String> {
    let mut named = Vec::new();
    let mut days = [false; 7];
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step = step
                    .parse::<usize>()
                    .ok()
                    .filter(|step| *step > 0)
                    .ok_or_else(|| format!("invalid day of week step '{step}'"))?;
                (range, Some(step))
            }
            None => (part, None),
        };
        if range == "*" && step.is_none() {
            return Ok("*".to_string());
        }
        if range != "*" && !range.chars().all(|c| c.is_ascii_digit() || c == '-') {
            named.push(part.to_string());
            continue;
        }
        let (start, end) = match (range, range.split_once('-')) {
            ("*", _) => (0, 6),
            (_, Some((start, end))) => (day_number(start)?, day_number(end)?),
            // `5/2` means every other day from Friday on
            (single, None) if step.is_some() => (day_number(single)?, 7),
            (single, None) => {
                let day = day_number(single)?;
                (day, day)
            }
        };
        if start > end {
            return Err(format!("day of week range '{range}' is reversed"));
        }
        for day in (start..=end).step_by(step.unwrap_or(1)) {
            days[day % 7] = true;
        }
    }
    let mut parts = DAY_NAMES
        .iter()
        .zip(days)
        .filter(|(_, set)| *set)
        .map(|(name, _)| name.to_string())
        .collect::<Vec<String>>();
    parts.extend(named);
    Ok(parts.join(","))
}

impl ScheduleSpec {
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let trimmed = spec.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("disabled") {
            return Ok(ScheduleSpec::Disabled);
        }
        let invalid = |reason: &str| ConfigError::Schedule {
            spec: spec.to_string(),
            reason: reason.to_string(),
        };
        let (kind, value) = trimmed
            .split_once(':')
            .ok_or_else(|| invalid("expected interval:<secs>, cron:<expr>, once:<secs> or disabled"))?;
        let value = value.trim();
        match kind.trim().to_ascii_lowercase().as_str() {
            "interval" => {
                let secs = value
                    .parse::<u64>()
                    .map_err(|_| invalid("interval must be a positive integer"))?;
                if secs == 0 {
                    return Err(invalid("interval must be a positive integer"));
                }
                if secs > MAX_DELAY_SECS {
                    return Err(invalid(&format!("interval exceeds {MAX_DELAY_SECS} seconds")));
                }
                Ok(ScheduleSpec::Interval(secs))
            }
            "once" => {
                let delay = value
                    .parse::<u64>()
                    .map_err(|_| invalid("once delay must be a non-negative integer"))?;
                if delay > MAX_DELAY_SECS {
                    return Err(invalid(&format!("once delay exceeds {MAX_DELAY_SECS} seconds")));
                }
                Ok(ScheduleSpec::Once(delay))
            }
            "cron" => Ok(ScheduleSpec::Cron(CronExpr::parse(value)?)),
            other => Err(invalid(&format!("unknown schedule type '{other}'"))),
        }
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, ScheduleSpec::Disabled)
    }

    /// Next time the flow becomes due.
    ///
    /// `last_fired` is the start time of the previous cycle, if any. `None`
    /// means the flow never fires again.
    pub fn next_due(
        &self,
        registered_at: DateTime<Utc>,
        last_fired: Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        match self {
            ScheduleSpec::Interval(secs) => match last_fired {
                Some(last) => add_seconds(last, *secs),
                None => Some(registered_at),
            },
            ScheduleSpec::Cron(expr) => {
                let anchor = last_fired.map_or(registered_at, |last| last.max(registered_at));
                expr.next_after(anchor)
            }
            ScheduleSpec::Once(delay) => match last_fired {
                Some(_) => None,
                None => add_seconds(registered_at, *delay),
            },
            ScheduleSpec::Disabled => None,
        }
    }

    pub fn is_due(
        &self,
        now: DateTime<Utc>,
        registered_at: DateTime<Utc>,
        last_fired: Option<DateTime<Utc>>,
    ) -> bool {
        self.next_due(registered_at, last_fired)
            .is_some_and(|due| due <= now)
    }
}

/// Longest accepted interval or once delay (100 years).
pub const MAX_DELAY_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// `None` when the result is not representable.
fn add_seconds(at: DateTime<Utc>, secs: u64) -> Option<DateTime<Utc>> {
    let delta = TimeDelta::try_seconds(i64::try_from(secs).ok()?)?;
    at.checked_add_signed(delta)
}

impl FromStr for ScheduleSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ScheduleSpec::parse(s)
    }
}

impl fmt::Display for ScheduleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleSpec::Interval(secs) => write!(f, "interval:{secs}"),
            ScheduleSpec::Cron(expr) => write!(f, "cron:{}", expr.as_str()),
            ScheduleSpec::Once(delay) => write!(f, "once:{delay}"),
            ScheduleSpec::Disabled => write!(f, "disabled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike};

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, h, m, s).unwrap()
    }

    #[test]
    fn parses_every_form() {
        assert_eq!(ScheduleSpec::parse("interval:3600").unwrap(), ScheduleSpec::Interval(3600));
        assert_eq!(ScheduleSpec::parse(" once:0 ").unwrap(), ScheduleSpec::Once(0));
        assert_eq!(ScheduleSpec::parse("disabled").unwrap(), ScheduleSpec::Disabled);
        assert_eq!(ScheduleSpec::parse("").unwrap(), ScheduleSpec::Disabled);
        let cron = ScheduleSpec::parse("cron:0  * * * *").unwrap();
        assert_eq!(cron.to_string(), "cron:0 * * * *");
    }

    #[test]
    fn rejects_invalid_forms() {
        for spec in [
            "interval:0",
            "interval:-5",
            "interval:abc",
            "once:-1",
            "cron:* * *",
            "cron:61 * * * *",
            "every:5",
            "hourly",
        ] {
            assert!(
                matches!(ScheduleSpec::parse(spec), Err(ConfigError::Schedule { .. })),
                "{spec} should be rejected"
            );
        }
    }

    #[test]
    fn day_of_week_numbers_follow_unix_cron() {
        assert_eq!(map_day_of_week("1-5").unwrap(), "MON,TUE,WED,THU,FRI");
        assert_eq!(map_day_of_week("0,6").unwrap(), "SUN,SAT");
        assert_eq!(map_day_of_week("7").unwrap(), "SUN");
        assert_eq!(map_day_of_week("*").unwrap(), "*");
        assert_eq!(map_day_of_week("5-7").unwrap(), "SUN,FRI,SAT");
        assert_eq!(map_day_of_week("MON-FRI").unwrap(), "MON-FRI");
        assert!(map_day_of_week("9").is_err());
        assert!(map_day_of_week("5-2").is_err());

        // 2025-06-02 is a Monday
        let weekdays = CronExpr::parse("30 9 * * 1-5").unwrap();
        let next = weekdays.next_after(at(10, 0, 0)).unwrap();
        assert_eq!(next.weekday(), chrono::Weekday::Tue);
        assert_eq!((next.hour(), next.minute()), (9, 30));
    }

    #[test]
    fn sunday_as_seven_ranges_cover_the_whole_span() {
        assert_eq!(
            map_day_of_week("0-7").unwrap(),
            "SUN,MON,TUE,WED,THU,FRI,SAT"
        );
        assert_eq!(map_day_of_week("5-7/2").unwrap(), "SUN,FRI");
        assert_eq!(map_day_of_week("5/2").unwrap(), "SUN,FRI");
        assert_eq!(map_day_of_week("*/2").unwrap(), "SUN,TUE,THU,SAT");

        // 2025-06-07 is a Saturday; "5-7/2" skips it and fires on Sunday
        let expr = CronExpr::parse("0 12 * * 5-7/2").unwrap();
        let saturday = Utc.with_ymd_and_hms(2025, 6, 7, 0, 0, 0).unwrap();
        let next = expr.next_after(saturday).unwrap();
        assert_eq!(next.weekday(), chrono::Weekday::Sun);
        let every_day = CronExpr::parse("0 12 * * 0-7").unwrap();
        let next = every_day.next_after(saturday).unwrap();
        assert_eq!(next.weekday(), chrono::Weekday::Sat);
    }

    #[test]
    fn oversized_delays_are_rejected_at_parse_time() {
        for spec in ["interval:9000000000000", "once:9000000000000"] {
            assert!(
                matches!(ScheduleSpec::parse(spec), Err(ConfigError::Schedule { .. })),
                "{spec} should be rejected"
            );
        }
        assert!(ScheduleSpec::parse("interval:31536000").is_ok());
    }

    #[test]
    fn unrepresentable_next_fire_means_never() {
        let spec = ScheduleSpec::Interval(u64::MAX);
        let t0 = at(0, 0, 0);
        assert_eq!(spec.next_due(t0, Some(t0)), None);
        assert!(!spec.is_due(t0, t0, Some(t0)));
        assert_eq!(ScheduleSpec::Once(u64::MAX).next_due(t0, None), None);
    }

    #[test]
    fn interval_fires_at_registration_then_every_period() {
        let spec = ScheduleSpec::Interval(3600);
        let t0 = at(0, 0, 0);
        assert!(spec.is_due(t0, t0, None));
        assert!(!spec.is_due(at(0, 59, 59), t0, Some(t0)));
        assert!(spec.is_due(at(1, 0, 0), t0, Some(t0)));
        assert_eq!(spec.next_due(t0, Some(t0)), Some(at(1, 0, 0)));
    }

    #[test]
    fn cron_fires_once_per_matching_minute() {
        let spec = ScheduleSpec::parse("cron:0 * * * *").unwrap();
        let registered = at(0, 10, 0);
        assert_eq!(spec.next_due(registered, None), Some(at(1, 0, 0)));
        assert!(!spec.is_due(at(0, 59, 59), registered, None));
        assert!(spec.is_due(at(1, 0, 20), registered, None));
        // fired at 01:00:20; later ticks in the same minute are not due
        let fired = at(1, 0, 20);
        assert!(!spec.is_due(at(1, 0, 50), registered, Some(fired)));
        assert_eq!(spec.next_due(registered, Some(fired)), Some(at(2, 0, 0)));
    }

    #[test]
    fn cron_ignores_matches_before_registration() {
        let spec = ScheduleSpec::parse("cron:0 * * * *").unwrap();
        let registered = at(5, 30, 0);
        assert_eq!(spec.next_due(registered, Some(at(1, 0, 0))), Some(at(6, 0, 0)));
    }

    #[test]
    fn once_fires_after_delay_then_never() {
        let spec = ScheduleSpec::Once(60);
        let t0 = at(0, 0, 0);
        assert!(!spec.is_due(at(0, 0, 59), t0, None));
        assert!(spec.is_due(at(0, 1, 0), t0, None));
        assert_eq!(spec.next_due(t0, Some(at(0, 1, 0))), None);
    }

    #[test]
    fn disabled_never_fires() {
        assert_eq!(ScheduleSpec::Disabled.next_due(at(0, 0, 0), None), None);
    }
}
