use chrono::{Duration, NaiveDateTime, NaiveTime};
use tracing::warn;

use super::{DayOfMonth, DayOfWeek, Dialect, Month, RecurrenceError};
use crate::limits::MAX_CRON_SEARCH_DAYS;
use crate::model::{Ms, to_datetime, to_ms};

/// Finds the next instant a cron text fires.
pub trait CronEvaluator {
    /// First valid time strictly after `after`, or `None` when the text is
    /// unusable or nothing fires within the search horizon.
    fn next_valid_time(&self, expression: &str, after: Ms) -> Option<Ms>;
}

/// The bundled evaluator over standard 5-field text.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardCron;

impl CronEvaluator for StandardCron {
    fn next_valid_time(&self, expression: &str, after: Ms) -> Option<Ms> {
        match CronSchedule::parse(expression) {
            Ok(schedule) => schedule.next_after(to_datetime(after)).map(to_ms),
            Err(e) => {
                warn!(expression, error = %e, "unusable cron text, treating recurrence as exhausted");
                None
            }
        }
    }
}

/// Minute or hour field as a bitmask of permitted values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TimeField(u64);

impl TimeField {
    fn parse(text: &str, max: u32, err: impl Fn() -> RecurrenceError) -> Result<Self, RecurrenceError> {
        let mut mask = 0u64;
        for part in text.split(',') {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => {
                    let step: u32 = step.parse().map_err(|_| err())?;
                    if step == 0 {
                        return Err(err());
                    }
                    (range, step)
                }
                None => (part, 1),
            };
            let (lo, hi) = if range == "*" {
                (0, max)
            } else if let Some((lo, hi)) = range.split_once('-') {
                (lo.parse().map_err(|_| err())?, hi.parse().map_err(|_| err())?)
            } else {
                let v: u32 = range.parse().map_err(|_| err())?;
                // `5/15` runs from 5 to the end of the field
                (v, if step > 1 { max } else { v })
            };
            if lo > hi || hi > max {
                return Err(err());
            }
            for v in (lo..=hi).step_by(step as usize) {
                mask |= 1 << v;
            }
        }
        Ok(Self(mask))
    }

    fn values(&self, max: u32) -> impl Iterator<Item = u32> + '_ {
        (0..=max).filter(|v| self.0 & (1 << v) != 0)
    }
}

/// A parsed 5-field cron text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minutes: TimeField,
    hours: TimeField,
    day_of_month: DayOfMonth,
    month: Month,
    day_of_week: DayOfWeek,
}

impl CronSchedule {
    pub fn parse(text: &str) -> Result<Self, RecurrenceError> {
        let fields: Vec<&str> = text.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(RecurrenceError::FieldCount(fields.len()));
        }
        Ok(Self {
            minutes: TimeField::parse(fields[0], 59, || {
                RecurrenceError::InvalidMinute(fields[0].to_string())
            })?,
            hours: TimeField::parse(fields[1], 23, || {
                RecurrenceError::InvalidHour(fields[1].to_string())
            })?,
            day_of_month: DayOfMonth::parse(fields[2])?,
            month: Month::parse(fields[3])?,
            day_of_week: DayOfWeek::parse(fields[4], Dialect::Standard)?,
        })
    }

    fn matches_date(&self, date: chrono::NaiveDate) -> bool {
        if !self.month.matches(date) {
            return false;
        }
        let dom_any = self.day_of_month == DayOfMonth::Any;
        let dow_any = self.day_of_week == DayOfWeek::Any;
        match (dom_any, dow_any) {
            (true, true) => true,
            (false, true) => self.day_of_month.matches(date),
            (true, false) => self.day_of_week.matches(date),
            // Both restricted: either may fire.
            (false, false) => self.day_of_month.matches(date) || self.day_of_week.matches(date),
        }
    }

    /// First firing strictly after `after`.
    pub fn next_after(&self, after: NaiveDateTime) -> Option<NaiveDateTime> {
        let first = after.date();
        for offset in 0..MAX_CRON_SEARCH_DAYS {
            let date = first.checked_add_signed(Duration::days(offset))?;
            if !self.matches_date(date) {
                continue;
            }
            for hour in self.hours.values(23) {
                for minute in self.minutes.values(59) {
                    let Some(time) = NaiveTime::from_hms_opt(hour, minute, 0) else {
                        continue;
                    };
                    let candidate = date.and_time(time);
                    if candidate > after {
                        return Some(candidate);
                    }
                }
            }
        }
        None
    }
}
