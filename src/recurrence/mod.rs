//! Simplified cron rules for repeating appointments and calendar events.
//!
//! A [`RecurrenceExpression`] pins the minute and hour and restricts the
//! calendar with day-of-month, month and day-of-week fields. Its
//! [`RecurrenceType`] is derived purely from the shape of those three fields.

mod cron;

pub use cron::{CronEvaluator, CronSchedule, StandardCron};

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate, Timelike, Weekday};
use thiserror::Error;

use crate::model::{Ms, to_datetime};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecurrenceError {
    #[error("expected 5 fields, or 6-7 with a leading seconds field; got {0}")]
    FieldCount(usize),
    #[error("invalid seconds: {0} (only 0 is supported)")]
    InvalidSeconds(String),
    #[error("invalid minute: {0}")]
    InvalidMinute(String),
    #[error("invalid hour: {0}")]
    InvalidHour(String),
    #[error("invalid day of month: {0}")]
    InvalidDayOfMonth(String),
    #[error("invalid month: {0}")]
    InvalidMonth(String),
    #[error("invalid day of week: {0}")]
    InvalidDayOfWeek(String),
    #[error("unsupported year: {0}")]
    UnsupportedYear(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecurrenceType {
    Daily,
    Weekdays,
    Weekly,
    Monthly,
    Yearly,
    Custom,
}

/// How numeric day-of-week values are read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dialect {
    /// `0-7`, with both 0 and 7 meaning Sunday.
    Standard,
    /// `1-7`, with 1 meaning Sunday (the seconds-prefixed form).
    Legacy,
}

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];
const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];

// ── Field sets ───────────────────────────────────────────────────

/// Days of the week, bit `n` = `n` days from Sunday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct WeekdaySet(u8);

impl WeekdaySet {
    pub const WEEKDAYS: WeekdaySet = WeekdaySet(0b0011_1110);
    const ALL: u8 = 0b0111_1111;

    pub fn single(day: Weekday) -> Self {
        let mut set = Self::default();
        set.insert(day);
        set
    }

    pub fn insert(&mut self, day: Weekday) {
        self.0 |= 1 << day.num_days_from_sunday();
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_sunday()) != 0
    }

    pub fn len(&self) -> u32 {
        self.0.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    fn indices(&self) -> impl Iterator<Item = u32> + '_ {
        (0..7).filter(|i| self.0 & (1 << i) != 0)
    }
}

impl FromIterator<Weekday> for WeekdaySet {
    fn from_iter<I: IntoIterator<Item = Weekday>>(iter: I) -> Self {
        let mut set = Self::default();
        for day in iter {
            set.insert(day);
        }
        set
    }
}

/// Bitset over small calendar numbers (days 1-31, months 1-12).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NumberSet(u32);

impl NumberSet {
    pub fn single(n: u32) -> Self {
        Self(1 << n)
    }

    pub fn insert(&mut self, n: u32) {
        self.0 |= 1 << n;
    }

    pub fn contains(&self, n: u32) -> bool {
        n < 32 && self.0 & (1 << n) != 0
    }

    pub fn len(&self) -> u32 {
        self.0.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// The lowest member, if any.
    pub fn first(&self) -> Option<u32> {
        (!self.is_empty()).then(|| self.0.trailing_zeros())
    }

    fn range(lo: u32, hi: u32) -> Self {
        let mut set = Self::default();
        for n in lo..=hi {
            set.insert(n);
        }
        set
    }

    fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        (0..32).filter(|n| self.contains(*n))
    }
}

// ── Fields ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DayOfMonth {
    Any,
    /// Listed days, plus the last day of the month when `last` is set.
    Days { days: NumberSet, last: bool },
}

impl DayOfMonth {
    pub fn day(day: u32) -> Self {
        DayOfMonth::Days {
            days: NumberSet::single(day),
            last: false,
        }
    }

    /// Exactly one numeric day.
    pub fn single_day(&self) -> Option<u32> {
        match self {
            DayOfMonth::Days { days, last: false } if days.len() == 1 => days.first(),
            _ => None,
        }
    }

    pub(crate) fn matches(&self, date: NaiveDate) -> bool {
        match self {
            DayOfMonth::Any => true,
            DayOfMonth::Days { days, last } => {
                days.contains(date.day()) || (*last && is_last_day_of_month(date))
            }
        }
    }

    pub(crate) fn parse(text: &str) -> Result<Self, RecurrenceError> {
        let err = || RecurrenceError::InvalidDayOfMonth(text.to_string());
        if is_wildcard(text) {
            return Ok(DayOfMonth::Any);
        }
        let mut days = NumberSet::default();
        let mut last = false;
        for part in text.split(',') {
            if part.eq_ignore_ascii_case("L") {
                last = true;
            } else if let Some((lo, hi)) = part.split_once('-') {
                let lo = parse_number(lo, 1, 31).ok_or_else(err)?;
                let hi = parse_number(hi, 1, 31).ok_or_else(err)?;
                if lo > hi {
                    return Err(err());
                }
                days.0 |= NumberSet::range(lo, hi).0;
            } else {
                days.insert(parse_number(part, 1, 31).ok_or_else(err)?);
            }
        }
        if days.len() == 31 {
            return Ok(DayOfMonth::Any);
        }
        Ok(DayOfMonth::Days { days, last })
    }
}

impl fmt::Display for DayOfMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DayOfMonth::Any => f.write_str("*"),
            DayOfMonth::Days { days, last } => {
                let mut parts = render_runs(days.iter(), |n| n.to_string());
                if *last {
                    parts.push("L".to_string());
                }
                f.write_str(&parts.join(","))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Month {
    Any,
    Months(NumberSet),
    /// Every `interval` months starting at `start`, within one year.
    Every { start: u32, interval: u32 },
}

impl Month {
    pub fn month(month: u32) -> Self {
        Month::Months(NumberSet::single(month))
    }

    /// Exactly one numeric month.
    pub fn single_month(&self) -> Option<u32> {
        match self {
            Month::Months(set) if set.len() == 1 => set.first(),
            _ => None,
        }
    }

    pub(crate) fn matches(&self, date: NaiveDate) -> bool {
        let m = date.month();
        match self {
            Month::Any => true,
            Month::Months(set) => set.contains(m),
            Month::Every { start, interval } => m >= *start && (m - start) % interval == 0,
        }
    }

    pub(crate) fn parse(text: &str) -> Result<Self, RecurrenceError> {
        let err = || RecurrenceError::InvalidMonth(text.to_string());
        if is_wildcard(text) {
            return Ok(Month::Any);
        }
        if let Some((start, interval)) = text.split_once('/') {
            let start = parse_month_token(start).ok_or_else(err)?;
            let interval = parse_number(interval, 1, 12).ok_or_else(err)?;
            return Ok(Month::Every { start, interval });
        }
        let mut set = NumberSet::default();
        for part in text.split(',') {
            if let Some((lo, hi)) = part.split_once('-') {
                let lo = parse_month_token(lo).ok_or_else(err)?;
                let hi = parse_month_token(hi).ok_or_else(err)?;
                if lo > hi {
                    return Err(err());
                }
                set.0 |= NumberSet::range(lo, hi).0;
            } else {
                set.insert(parse_month_token(part).ok_or_else(err)?);
            }
        }
        if set.len() == 12 {
            return Ok(Month::Any);
        }
        Ok(Month::Months(set))
    }
}

impl fmt::Display for Month {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Month::Any => f.write_str("*"),
            Month::Months(set) => f.write_str(&render_runs(set.iter(), |n| n.to_string()).join(",")),
            Month::Every { start, interval } => write!(f, "{start}/{interval}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DayOfWeek {
    Any,
    Days(WeekdaySet),
    /// The `ordinal`-th (1-5) occurrence of `day` in the month.
    Nth { day: Weekday, ordinal: u32 },
    /// The last occurrence of `day` in the month.
    Last(Weekday),
}

impl DayOfWeek {
    pub fn day(day: Weekday) -> Self {
        DayOfWeek::Days(WeekdaySet::single(day))
    }

    /// Monday to Friday and nothing else.
    pub fn is_weekdays(&self) -> bool {
        matches!(self, DayOfWeek::Days(set) if *set == WeekdaySet::WEEKDAYS)
    }

    /// Exactly one plain day (ordinal forms excluded).
    pub fn single_day(&self) -> Option<Weekday> {
        match self {
            DayOfWeek::Days(set) if set.len() == 1 => set.indices().next().map(weekday_from_sunday),
            _ => None,
        }
    }

    pub(crate) fn matches(&self, date: NaiveDate) -> bool {
        let weekday = date.weekday();
        match self {
            DayOfWeek::Any => true,
            DayOfWeek::Days(set) => set.contains(weekday),
            DayOfWeek::Nth { day, ordinal } => {
                weekday == *day && (date.day() - 1) / 7 + 1 == *ordinal
            }
            DayOfWeek::Last(day) => {
                weekday == *day && date.day() + 7 > days_in_month(date)
            }
        }
    }

    pub(crate) fn parse(text: &str, dialect: Dialect) -> Result<Self, RecurrenceError> {
        let err = || RecurrenceError::InvalidDayOfWeek(text.to_string());
        if is_wildcard(text) {
            return Ok(DayOfWeek::Any);
        }
        if let Some((day, ordinal)) = text.split_once('#') {
            let day = parse_day_token(day, dialect).ok_or_else(err)?;
            let ordinal = parse_number(ordinal, 1, 5).ok_or_else(err)?;
            return Ok(DayOfWeek::Nth { day, ordinal });
        }
        if text.len() > 1 && (text.ends_with('L') || text.ends_with('l')) {
            let day = parse_day_token(&text[..text.len() - 1], dialect).ok_or_else(err)?;
            return Ok(DayOfWeek::Last(day));
        }
        let mut set = WeekdaySet::default();
        for part in text.split(',') {
            if let Some((lo, hi)) = part.split_once('-') {
                let lo = parse_day_token(lo, dialect).ok_or_else(err)?.num_days_from_sunday();
                let hi = parse_day_token(hi, dialect).ok_or_else(err)?.num_days_from_sunday();
                // SUN written as 7 closes a range: MON-7
                let hi = if hi == 0 && lo > 0 { 7 } else { hi };
                if lo > hi {
                    return Err(err());
                }
                for i in lo..=hi {
                    set.insert(weekday_from_sunday(i % 7));
                }
            } else {
                set.insert(parse_day_token(part, dialect).ok_or_else(err)?);
            }
        }
        if set.0 == WeekdaySet::ALL {
            return Ok(DayOfWeek::Any);
        }
        Ok(DayOfWeek::Days(set))
    }
}

impl fmt::Display for DayOfWeek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DayOfWeek::Any => f.write_str("*"),
            DayOfWeek::Days(set) => {
                f.write_str(&render_runs(set.indices(), |i| DAY_NAMES[i as usize].to_string()).join(","))
            }
            DayOfWeek::Nth { day, ordinal } => {
                write!(f, "{}#{ordinal}", DAY_NAMES[day.num_days_from_sunday() as usize])
            }
            DayOfWeek::Last(day) => write!(f, "{}L", DAY_NAMES[day.num_days_from_sunday() as usize]),
        }
    }
}

// ── Expression ───────────────────────────────────────────────────

/// Equality and hashing are structural over the five fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecurrenceExpression {
    minute: u32,
    hour: u32,
    day_of_month: DayOfMonth,
    month: Month,
    day_of_week: DayOfWeek,
}

impl RecurrenceExpression {
    pub fn new(
        minute: u32,
        hour: u32,
        day_of_month: DayOfMonth,
        month: Month,
        day_of_week: DayOfWeek,
    ) -> Result<Self, RecurrenceError> {
        if minute > 59 {
            return Err(RecurrenceError::InvalidMinute(minute.to_string()));
        }
        if hour > 23 {
            return Err(RecurrenceError::InvalidHour(hour.to_string()));
        }
        Ok(Self {
            minute,
            hour,
            day_of_month,
            month,
            day_of_week,
        })
    }

    fn at(start: Ms, day_of_month: DayOfMonth, month: Month, day_of_week: DayOfWeek) -> Self {
        let dt = to_datetime(start);
        Self {
            minute: dt.minute(),
            hour: dt.hour(),
            day_of_month,
            month,
            day_of_week,
        }
    }

    /// Every day at the time of `start`.
    pub fn daily(start: Ms) -> Self {
        Self::at(start, DayOfMonth::Any, Month::Any, DayOfWeek::Any)
    }

    /// Monday to Friday at the time of `start`.
    pub fn weekdays(start: Ms) -> Self {
        Self::at(start, DayOfMonth::Any, Month::Any, DayOfWeek::Days(WeekdaySet::WEEKDAYS))
    }

    /// Every week on the weekday of `start`.
    pub fn weekly(start: Ms) -> Self {
        let day = to_datetime(start).weekday();
        Self::at(start, DayOfMonth::Any, Month::Any, DayOfWeek::day(day))
    }

    /// Every month on the day-of-month of `start`.
    pub fn monthly(start: Ms) -> Self {
        let day = to_datetime(start).day();
        Self::at(start, DayOfMonth::day(day), Month::Any, DayOfWeek::Any)
    }

    /// Every year on the date of `start`.
    pub fn yearly(start: Ms) -> Self {
        let dt = to_datetime(start);
        Self::at(start, DayOfMonth::day(dt.day()), Month::month(dt.month()), DayOfWeek::Any)
    }

    /// Parse either `min hour dom month dow` or the seconds-prefixed
    /// `0 min hour dom month dow [year]` form.
    pub fn parse(text: &str) -> Result<Self, RecurrenceError> {
        let parts: Vec<&str> = text.split_whitespace().collect();
        let (fields, dialect) = match parts.len() {
            5 => (&parts[..], Dialect::Standard),
            6 | 7 => {
                if parts[0] != "0" {
                    return Err(RecurrenceError::InvalidSeconds(parts[0].to_string()));
                }
                if let Some(year) = parts.get(6)
                    && !is_wildcard(year)
                {
                    return Err(RecurrenceError::UnsupportedYear(year.to_string()));
                }
                (&parts[1..6], Dialect::Legacy)
            }
            n => return Err(RecurrenceError::FieldCount(n)),
        };
        let minute = parse_number(fields[0], 0, 59)
            .ok_or_else(|| RecurrenceError::InvalidMinute(fields[0].to_string()))?;
        let hour = parse_number(fields[1], 0, 23)
            .ok_or_else(|| RecurrenceError::InvalidHour(fields[1].to_string()))?;
        Ok(Self {
            minute,
            hour,
            day_of_month: DayOfMonth::parse(fields[2])?,
            month: Month::parse(fields[3])?,
            day_of_week: DayOfWeek::parse(fields[4], dialect)?,
        })
    }

    pub fn minute(&self) -> u32 {
        self.minute
    }

    pub fn hour(&self) -> u32 {
        self.hour
    }

    pub fn day_of_month(&self) -> DayOfMonth {
        self.day_of_month
    }

    pub fn month(&self) -> Month {
        self.month
    }

    pub fn day_of_week(&self) -> DayOfWeek {
        self.day_of_week
    }

    /// Classification, first match wins.
    pub fn classify(&self) -> RecurrenceType {
        let any_dom = self.day_of_month == DayOfMonth::Any;
        let any_month = self.month == Month::Any;
        let any_dow = self.day_of_week == DayOfWeek::Any;

        if any_dom && any_month && any_dow {
            RecurrenceType::Daily
        } else if any_dom && any_month && self.day_of_week.is_weekdays() {
            RecurrenceType::Weekdays
        } else if any_dom && any_month && self.day_of_week.single_day().is_some() {
            RecurrenceType::Weekly
        } else if self.day_of_month.single_day().is_some() && any_month && any_dow {
            RecurrenceType::Monthly
        } else if self.day_of_month.single_day().is_some()
            && self.month.single_month().is_some()
            && any_dow
        {
            RecurrenceType::Yearly
        } else {
            RecurrenceType::Custom
        }
    }

    /// Canonical 5-field text for a cron evaluator. Seconds are implicitly 0.
    pub fn to_cron_text(&self) -> String {
        format!(
            "{} {} {} {} {}",
            self.minute, self.hour, self.day_of_month, self.month, self.day_of_week
        )
    }
}

impl fmt::Display for RecurrenceExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_cron_text())
    }
}

impl FromStr for RecurrenceExpression {
    type Err = RecurrenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ── Token helpers ────────────────────────────────────────────────

fn is_wildcard(text: &str) -> bool {
    text == "*" || text == "?"
}

fn parse_number(text: &str, min: u32, max: u32) -> Option<u32> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok().filter(|n| (min..=max).contains(n))
}

fn parse_month_token(text: &str) -> Option<u32> {
    parse_number(text, 1, 12).or_else(|| {
        MONTH_NAMES
            .iter()
            .position(|name| name.eq_ignore_ascii_case(text))
            .map(|i| i as u32 + 1)
    })
}

fn parse_day_token(text: &str, dialect: Dialect) -> Option<Weekday> {
    if let Some(i) = DAY_NAMES.iter().position(|name| name.eq_ignore_ascii_case(text)) {
        return Some(weekday_from_sunday(i as u32));
    }
    match dialect {
        Dialect::Standard => parse_number(text, 0, 7).map(|n| weekday_from_sunday(n % 7)),
        Dialect::Legacy => parse_number(text, 1, 7).map(|n| weekday_from_sunday(n - 1)),
    }
}

pub(crate) fn weekday_from_sunday(i: u32) -> Weekday {
    match i {
        0 => Weekday::Sun,
        1 => Weekday::Mon,
        2 => Weekday::Tue,
        3 => Weekday::Wed,
        4 => Weekday::Thu,
        5 => Weekday::Fri,
        _ => Weekday::Sat,
    }
}

fn days_in_month(date: NaiveDate) -> u32 {
    let (y, m) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(y, m, 1)
        .and_then(|first| first.pred_opt())
        .map_or(31, |last| last.day())
}

fn is_last_day_of_month(date: NaiveDate) -> bool {
    date.day() == days_in_month(date)
}

/// Render sorted values, collapsing runs of three or more into `a-b`.
fn render_runs(values: impl Iterator<Item = u32>, name: impl Fn(u32) -> String) -> Vec<String> {
    let values: Vec<u32> = values.collect();
    let mut parts = Vec::new();
    let mut i = 0;
    while i < values.len() {
        let mut j = i;
        while j + 1 < values.len() && values[j + 1] == values[j] + 1 {
            j += 1;
        }
        if j - i >= 2 {
            parts.push(format!("{}-{}", name(values[i]), name(values[j])));
        } else {
            for v in &values[i..=j] {
                parts.push(name(*v));
            }
        }
        i = j + 1;
    }
    parts
}
