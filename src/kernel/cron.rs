//! A 5-field cron expression parser (`minute hour day-of-month month
//! day-of-week`). Supports `*`, a literal number, `a-b` ranges, `a-b/s` /
//! `*/s` steps, and comma-separated lists of any of the above. Day-of-month
//! and day-of-week are ANDed together when both are restricted, matching
//! traditional cron semantics rather than the more permissive "OR when both
//! are restricted" variant some schedulers use — chosen because it is the
//! behavior users transplanting existing crontabs will expect.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};

#[derive(Debug, thiserror::Error)]
pub enum CronError {
    #[error("expected 5 fields, got {0}")]
    WrongFieldCount(usize),
    #[error("invalid field '{0}': {1}")]
    InvalidField(String, String),
}

#[derive(Debug, Clone)]
struct FieldSpec {
    allowed: Vec<u32>,
}

impl FieldSpec {
    fn parse(field: &str, min: u32, max: u32) -> Result<Self, CronError> {
        let mut allowed = std::collections::BTreeSet::new();
        for part in field.split(',') {
            Self::parse_part(part, min, max, &mut allowed)
                .map_err(|e| CronError::InvalidField(field.to_string(), e))?;
        }
        Ok(Self { allowed: allowed.into_iter().collect() })
    }

    fn parse_part(
        part: &str,
        min: u32,
        max: u32,
        out: &mut std::collections::BTreeSet<u32>,
    ) -> Result<(), String> {
        let (range_part, step) = match part.split_once('/') {
            Some((r, s)) => (r, Some(s.parse::<u32>().map_err(|_| "bad step".to_string())?)),
            None => (part, None),
        };

        let (lo, hi) = if range_part == "*" {
            (min, max)
        } else if let Some((a, b)) = range_part.split_once('-') {
            let lo = a.parse::<u32>().map_err(|_| "bad range start".to_string())?;
            let hi = b.parse::<u32>().map_err(|_| "bad range end".to_string())?;
            (lo, hi)
        } else {
            let v = range_part.parse::<u32>().map_err(|_| "bad value".to_string())?;
            (v, v)
        };

        if lo < min || hi > max || lo > hi {
            return Err(format!("{lo}-{hi} outside {min}-{max}"));
        }

        let step = step.unwrap_or(1).max(1);
        let mut v = lo;
        while v <= hi {
            out.insert(v);
            v += step;
        }
        Ok(())
    }

    fn matches(&self, value: u32) -> bool {
        self.allowed.contains(&value)
    }

    fn is_restricted(&self, min: u32, max: u32) -> bool {
        self.allowed.len() as u32 != (max - min + 1)
    }
}

#[derive(Debug, Clone)]
pub struct CronSchedule {
    minute: FieldSpec,
    hour: FieldSpec,
    day_of_month: FieldSpec,
    month: FieldSpec,
    day_of_week: FieldSpec,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::WrongFieldCount(fields.len()));
        }
        Ok(Self {
            minute: FieldSpec::parse(fields[0], 0, 59)?,
            hour: FieldSpec::parse(fields[1], 0, 23)?,
            day_of_month: FieldSpec::parse(fields[2], 1, 31)?,
            month: FieldSpec::parse(fields[3], 1, 12)?,
            day_of_week: FieldSpec::parse(fields[4], 0, 6)?,
        })
    }

    fn matches(&self, ts: &DateTime<Utc>) -> bool {
        let dom_restricted = self.day_of_month.is_restricted(1, 31);
        let dow_restricted = self.day_of_week.is_restricted(0, 6);
        let day_ok = match (dom_restricted, dow_restricted) {
            (true, true) => {
                self.day_of_month.matches(ts.day())
                    && self.day_of_week.matches(ts.weekday().num_days_from_sunday())
            }
            (true, false) => self.day_of_month.matches(ts.day()),
            (false, true) => self.day_of_week.matches(ts.weekday().num_days_from_sunday()),
            (false, false) => true,
        };
        day_ok
            && self.minute.matches(ts.minute())
            && self.hour.matches(ts.hour())
            && self.month.matches(ts.month())
    }

    /// Linear search forward minute-by-minute, capped at two years out —
    /// cron expressions are sparse enough that this always terminates
    /// quickly in practice, and a closed-form "next fire time" solver buys
    /// little for a scheduler that ticks every few seconds anyway.
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut candidate = (from + Duration::minutes(1))
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))?;
        let limit = from + Duration::days(366 * 2);
        while candidate < limit {
            if self.matches(&candidate) {
                return Some(candidate);
            }
            candidate += Duration::minutes(1);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn rejects_wrong_field_count() {
        assert!(CronSchedule::parse("* * *").is_err());
    }

    #[test]
    fn every_minute_matches_anything() {
        let schedule = CronSchedule::parse("* * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2026, 7, 27, 10, 15, 0).unwrap();
        assert!(schedule.matches(&now));
    }

    #[test]
    fn exact_time_matches_only_that_minute() {
        let schedule = CronSchedule::parse("30 9 * * *").unwrap();
        let hit = Utc.with_ymd_and_hms(2026, 7, 27, 9, 30, 0).unwrap();
        let miss = Utc.with_ymd_and_hms(2026, 7, 27, 9, 31, 0).unwrap();
        assert!(schedule.matches(&hit));
        assert!(!schedule.matches(&miss));
    }

    #[test]
    fn step_syntax_fires_every_n_minutes() {
        let schedule = CronSchedule::parse("*/15 * * * *").unwrap();
        assert!(schedule.matches(&Utc.with_ymd_and_hms(2026, 7, 27, 9, 0, 0).unwrap()));
        assert!(schedule.matches(&Utc.with_ymd_and_hms(2026, 7, 27, 9, 15, 0).unwrap()));
        assert!(!schedule.matches(&Utc.with_ymd_and_hms(2026, 7, 27, 9, 20, 0).unwrap()));
    }

    #[test]
    fn dom_and_dow_are_conjoined_when_both_restricted() {
        // 13th of the month AND a Friday.
        let schedule = CronSchedule::parse("0 0 13 * 5").unwrap();
        // 2026-02-13 is a Friday.
        let friday_13th = Utc.with_ymd_and_hms(2026, 2, 13, 0, 0, 0).unwrap();
        assert!(schedule.matches(&friday_13th));
        let friday_not_13th = Utc.with_ymd_and_hms(2026, 2, 20, 0, 0, 0).unwrap();
        assert!(!schedule.matches(&friday_not_13th));
    }

    #[test]
    fn next_after_finds_the_following_occurrence() {
        let schedule = CronSchedule::parse("0 * * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2026, 7, 27, 10, 15, 0).unwrap();
        let next = schedule.next_after(from).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 7, 27, 11, 0, 0).unwrap());
    }

    #[test]
    fn invalid_range_is_rejected() {
        assert!(CronSchedule::parse("80 * * * *").is_err());
    }
}
