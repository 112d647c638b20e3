//! ISO-8601 week identifiers (`2025-W03`), the usual partition key for
//! weekly jobs.

use core::str::FromStr;

use chrono::{DateTime, Datelike, Days, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};

/// An ISO week: weeks start on Monday and week 1 contains the year's first
/// Thursday, so early-January dates may belong to the previous year's week 52/53.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IsoWeek {
    year: i32,
    week: u32,
}

impl IsoWeek {
    pub fn new(year: i32, week: u32) -> CoreResult<Self> {
        NaiveDate::from_isoywd_opt(year, week, Weekday::Mon)
            .ok_or_else(|| CoreError::validation(format!("{year} has no ISO week {week}")))?;
        Ok(Self { year, week })
    }

    pub fn of_date(date: NaiveDate) -> Self {
        let iso = date.iso_week();
        Self {
            year: iso.year(),
            week: iso.week(),
        }
    }

    /// Week containing `at` (evaluated in UTC).
    pub fn of(at: DateTime<Utc>) -> Self {
        Self::of_date(at.date_naive())
    }

    pub fn current(clock: &impl Clock) -> Self {
        Self::of(clock.now())
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn week(&self) -> u32 {
        self.week
    }

    /// Monday of this week.
    pub fn start_date(&self) -> NaiveDate {
        // Validated on construction.
        NaiveDate::from_isoywd_opt(self.year, self.week, Weekday::Mon).unwrap_or(NaiveDate::MIN)
    }

    /// Sunday of this week.
    pub fn end_date(&self) -> NaiveDate {
        self.start_date()
            .checked_add_days(Days::new(6))
            .unwrap_or(NaiveDate::MAX)
    }

    /// The week before this one; crosses year boundaries (2025-W01 -> 2024-W52).
    pub fn previous(&self) -> Self {
        let prior = self
            .start_date()
            .checked_sub_days(Days::new(7))
            .unwrap_or(NaiveDate::MIN);
        Self::of_date(prior)
    }

    /// This week followed by the `count - 1` weeks before it, newest first.
    pub fn trailing(&self, count: usize) -> Vec<Self> {
        let mut weeks = Vec::with_capacity(count);
        let mut current = *self;
        for _ in 0..count {
            weeks.push(current);
            current = current.previous();
        }
        weeks
    }
}

impl core::fmt::Display for IsoWeek {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:04}-W{:02}", self.year, self.week)
    }
}

impl FromStr for IsoWeek {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CoreError::invalid_id(format!("IsoWeek: expected YYYY-Www, got {s:?}"));

        let (year, week) = s.split_once("-W").ok_or_else(invalid)?;
        if year.len() != 4 || week.len() != 2 {
            return Err(invalid());
        }
        if !year.bytes().chain(week.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }

        let year: i32 = year.parse().map_err(|_| invalid())?;
        let week: u32 = week.parse().map_err(|_| invalid())?;
        Self::new(year, week)
    }
}

impl TryFrom<String> for IsoWeek {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<IsoWeek> for String {
    fn from(value: IsoWeek) -> Self {
        value.to_string()
    }
}
