//! Month-granular reporting periods
//!
//! A [`DateRange`] covers whole calendar months, inclusive on both ends. The
//! comparison period is the run of months of equal length that ends the day
//! before the range starts.

use std::fmt;

use chrono::{Datelike, Months, NaiveDate};
use serde::{Deserialize, Serialize};

const MONTH_NAMES: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// A calendar month. Only built through [`YearMonth::new`] or
/// [`YearMonth::of`], so `month` is always in 1..=12.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct YearMonth {
    year: i32,
    /// 1-based month
    month: u32,
}

impl YearMonth {
    /// Returns `None` when `month` is outside 1..=12.
    pub fn new(year: i32, month: u32) -> Option<Self> {
        (1..=12).contains(&month).then_some(Self { year, month })
    }

    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    fn index(&self) -> i64 {
        self.year as i64 * 12 + (self.month as i64 - 1)
    }

    fn from_index(index: i64) -> Self {
        Self {
            year: index.div_euclid(12) as i32,
            month: index.rem_euclid(12) as u32 + 1,
        }
    }

    /// Shift by a signed number of months.
    pub fn add_months(&self, months: i64) -> Self {
        Self::from_index(self.index() + months)
    }

    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
    }

    /// Last day of the month, leap years included.
    pub fn last_day(&self) -> NaiveDate {
        self.first_day()
            .checked_add_months(Months::new(1))
            .and_then(|next| next.pred_opt())
            .unwrap_or(NaiveDate::MAX)
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// Which end of a range a user edited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Boundary {
    Start,
    End,
}

/// Inclusive month range with `start <= end`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateRange {
    start: YearMonth,
    end: YearMonth,
}

impl DateRange {
    /// Returns `None` when `start > end`.
    pub fn new(start: YearMonth, end: YearMonth) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    /// The `months`-long range ending with the month of `today`.
    pub fn ending_at(today: NaiveDate, months: u32) -> Self {
        let end = YearMonth::of(today);
        let start = end.add_months(-(months.max(1) as i64 - 1));
        Self { start, end }
    }

    #[cfg(test)]
    pub fn start(&self) -> YearMonth {
        self.start
    }

    #[cfg(test)]
    pub fn end(&self) -> YearMonth {
        self.end
    }

    /// Apply a user edit to one boundary. If the edit would invert the range,
    /// the other boundary snaps to the edited value.
    pub fn edit(&self, boundary: Boundary, value: YearMonth) -> Self {
        match boundary {
            Boundary::Start => Self {
                start: value,
                end: self.end.max(value),
            },
            Boundary::End => Self {
                start: self.start.min(value),
                end: value,
            },
        }
    }

    /// Build a range from two raw boundaries, resolving an inversion in
    /// favour of the edited one.
    pub fn resolve(start: YearMonth, end: YearMonth, edited: Boundary) -> Self {
        match edited {
            Boundary::Start => Self { start, end }.edit(Boundary::Start, start),
            Boundary::End => Self { start, end }.edit(Boundary::End, end),
        }
    }

    /// Number of calendar months covered, inclusive.
    pub fn month_span(&self) -> u32 {
        (self.end.index() - self.start.index() + 1) as u32
    }

    /// Inclusive date interval: first day of start month to last day of end
    /// month.
    pub fn interval(&self) -> (NaiveDate, NaiveDate) {
        (self.start.first_day(), self.end.last_day())
    }

    /// Equal-length range ending the day before this one starts.
    pub fn previous(&self) -> Self {
        let end = self.start.add_months(-1);
        let start = end.add_months(-(self.month_span() as i64 - 1));
        Self { start, end }
    }

    /// Human label, e.g. `Jan 2024 to Mar 2024`.
    pub fn describe(&self) -> String {
        format!(
            "{} {} to {} {}",
            MONTH_NAMES[self.start.month as usize - 1],
            self.start.year,
            MONTH_NAMES[self.end.month as usize - 1],
            self.end.year
        )
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}
