//! Month partitions and date-range planning.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::constants::naming::{MONTH_SEGMENT_PREFIX, YEAR_SEGMENT_PREFIX};
use crate::errors::MaterializeError;

/// One calendar month of a dataset: the unit of concurrency and failure isolation.
///
/// Ordering is chronological (year first, then month).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionKey {
    year: u16,
    month: u8,
}

impl PartitionKey {
    /// Build a key, rejecting years outside `1..=9999` and months outside `1..=12`.
    pub fn new(year: u32, month: u32) -> Result<Self, MaterializeError> {
        if !(1..=9999).contains(&year) {
            return Err(MaterializeError::InvalidRange(format!(
                "year {year} is outside 1..=9999"
            )));
        }
        if !(1..=12).contains(&month) {
            return Err(MaterializeError::InvalidRange(format!(
                "month {month} is outside 1..=12"
            )));
        }
        Ok(Self {
            year: year as u16,
            month: month as u8,
        })
    }

    /// Month containing `date`.
    pub fn from_date(date: NaiveDate) -> Result<Self, MaterializeError> {
        let year = u32::try_from(date.year()).map_err(|_| {
            MaterializeError::InvalidRange(format!("year {} is not positive", date.year()))
        })?;
        Self::new(year, date.month())
    }

    /// Four-digit year.
    pub fn year(&self) -> u32 {
        u32::from(self.year)
    }

    /// Month number, `1..=12`.
    pub fn month(&self) -> u32 {
        u32::from(self.month)
    }

    /// The following calendar month.
    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// `year=YYYY` path segment.
    pub fn year_segment(&self) -> String {
        format!("{YEAR_SEGMENT_PREFIX}{:04}", self.year)
    }

    /// `month=MM` path segment.
    pub fn month_segment(&self) -> String {
        format!("{MONTH_SEGMENT_PREFIX}{:02}", self.month)
    }

    /// `YYYYMM` stamp used inside batch file names.
    pub fn compact(&self) -> String {
        format!("{:04}{:02}", self.year, self.month)
    }

    /// Parse a `YYYYMM` stamp.
    pub fn parse_compact(value: &str) -> Option<Self> {
        if value.len() != 6 || !value.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let year = value[..4].parse::<u32>().ok()?;
        let month = value[4..].parse::<u32>().ok()?;
        Self::new(year, month).ok()
    }

    fn ordinal(&self) -> u32 {
        self.year() * 12 + self.month() - 1
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for PartitionKey {
    type Err = MaterializeError;

    /// Parse `YYYY-MM`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            MaterializeError::InvalidRange(format!("'{value}' is not a YYYY-MM month"))
        };
        let (year, month) = value.trim().split_once('-').ok_or_else(invalid)?;
        let year = year.parse::<u32>().map_err(|_| invalid())?;
        let month = month.parse::<u32>().map_err(|_| invalid())?;
        Self::new(year, month)
    }
}

/// Inclusive month range `[start, end]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DateRange {
    start: PartitionKey,
    end: PartitionKey,
}

impl DateRange {
    /// Build a range from raw fields; both bounds are inclusive.
    pub fn new(
        start_year: u32,
        start_month: u32,
        end_year: u32,
        end_month: u32,
    ) -> Result<Self, MaterializeError> {
        let start = PartitionKey::new(start_year, start_month)?;
        let end = PartitionKey::new(end_year, end_month)?;
        Self::from_keys(start, end)
    }

    /// Build a range from an upstream descriptor whose fields may be missing.
    pub fn from_optional(
        start_year: Option<u32>,
        start_month: Option<u32>,
        end_year: Option<u32>,
        end_month: Option<u32>,
    ) -> Result<Self, MaterializeError> {
        let missing = [
            ("start_year", start_year),
            ("start_month", start_month),
            ("end_year", end_year),
            ("end_month", end_month),
        ]
        .iter()
        .filter(|(_, value)| value.is_none())
        .map(|(name, _)| *name)
        .collect::<Vec<_>>();
        match (start_year, start_month, end_year, end_month) {
            (Some(sy), Some(sm), Some(ey), Some(em)) => Self::new(sy, sm, ey, em),
            _ => Err(MaterializeError::InvalidRange(format!(
                "missing fields: {}",
                missing.join(", ")
            ))),
        }
    }

    /// Build a range from two keys; fails when `start` is after `end`.
    pub fn from_keys(start: PartitionKey, end: PartitionKey) -> Result<Self, MaterializeError> {
        if start > end {
            return Err(MaterializeError::InvalidRange(format!(
                "start {start} is after end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// First month of the range.
    pub fn start(&self) -> PartitionKey {
        self.start
    }

    /// Last month of the range.
    pub fn end(&self) -> PartitionKey {
        self.end
    }

    /// Number of calendar months covered, both ends included.
    pub fn months(&self) -> usize {
        (self.end.ordinal() - self.start.ordinal() + 1) as usize
    }
}

/// Expand a range into one ascending key per calendar month.
pub fn plan_partitions(range: &DateRange) -> Vec<PartitionKey> {
    let mut partitions = Vec::with_capacity(range.months());
    let mut current = range.start();
    while current <= range.end() {
        partitions.push(current);
        current = current.next();
    }
    partitions
}
