//! Calendar month periods (`YYYY-MM`) and their comparison counterparts.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeriodError {
    #[error("invalid format: '{0}'. Expected 'YYYY-MM'")]
    Format(String),
    #[error("invalid month: {0}. Must be between 1 and 12")]
    Month(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct YearMonth {
    year: i32,
    month: u32,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Result<Self, PeriodError> {
        if !(1..=12).contains(&month) {
            return Err(PeriodError::Month(month));
        }
        Ok(Self { year, month })
    }

    /// Strict `YYYY-MM` parse: four digit year, dash, two digit month.
    pub fn parse(input: &str) -> Result<Self, PeriodError> {
        let bytes = input.as_bytes();
        let well_formed = bytes.len() == 7
            && bytes[4] == b'-'
            && bytes[..4].iter().all(u8::is_ascii_digit)
            && bytes[5..].iter().all(u8::is_ascii_digit);
        if !well_formed {
            return Err(PeriodError::Format(input.to_string()));
        }
        let year = input[..4]
            .parse::<i32>()
            .map_err(|_| PeriodError::Format(input.to_string()))?;
        let month = input[5..]
            .parse::<u32>()
            .map_err(|_| PeriodError::Format(input.to_string()))?;
        Self::new(year, month)
    }

    /// Month bucket of a stored text timestamp: text starting with `YYYY-MM`
    /// is truncated, anything else is rejected. Epoch seconds arrive as
    /// integers and go through [`YearMonth::from_epoch_seconds`].
    pub fn from_stored(value: &str) -> Option<Self> {
        let value = value.trim();
        if let (Some(head), Some(rest)) = (value.get(..7), value.get(7..)) {
            if let Ok(period) = Self::parse(head) {
                if rest.is_empty() || rest.starts_with('-') {
                    return Some(period);
                }
            }
        }
        None
    }

    pub fn from_epoch_seconds(seconds: i64) -> Option<Self> {
        DateTime::from_timestamp(seconds, 0).and_then(|at| Self::new(at.year(), at.month()).ok())
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn year_str(&self) -> String {
        format!("{:04}", self.year)
    }

    pub fn month_str(&self) -> String {
        format!("{:02}", self.month)
    }

    pub fn previous_month(&self) -> Self {
        if self.month == 1 {
            Self {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Self {
                year: self.year,
                month: self.month - 1,
            }
        }
    }

    pub fn same_month_last_year(&self) -> Self {
        Self {
            year: self.year - 1,
            month: self.month,
        }
    }

    pub fn comparison_periods(&self) -> ComparisonPeriods {
        ComparisonPeriods {
            mom: self.previous_month(),
            yoy: self.same_month_last_year(),
        }
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for YearMonth {
    type Err = PeriodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for YearMonth {
    type Error = PeriodError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<YearMonth> for String {
    fn from(value: YearMonth) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComparisonPeriods {
    pub mom: YearMonth,
    pub yoy: YearMonth,
}

pub fn comparison_periods(year_month: &str) -> Result<ComparisonPeriods, PeriodError> {
    Ok(YearMonth::parse(year_month)?.comparison_periods())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comparison_periods_within_year() {
        let periods = comparison_periods("2026-06").unwrap();
        assert_eq!(periods.mom.to_string(), "2026-05");
        assert_eq!(periods.yoy.to_string(), "2025-06");
    }

    #[test]
    fn comparison_periods_roll_over_january() {
        let periods = comparison_periods("2026-01").unwrap();
        assert_eq!(periods.mom.to_string(), "2025-12");
        assert_eq!(periods.yoy.to_string(), "2025-01");
    }

    #[test]
    fn malformed_periods_are_rejected() {
        for bad in ["2026-6", "2026/06", "26-06", "2026-06-01", "", "abcd-ef", "2026-0a"] {
            assert!(
                matches!(comparison_periods(bad), Err(PeriodError::Format(_))),
                "{bad} should be a format error"
            );
        }
        assert_eq!(comparison_periods("2026-13"), Err(PeriodError::Month(13)));
        assert_eq!(comparison_periods("2026-00"), Err(PeriodError::Month(0)));
    }

    #[test]
    fn stored_text_buckets_by_prefix() {
        let first = YearMonth::from_stored("2025-03-01T00:00:00").unwrap();
        let last = YearMonth::from_stored("2025-03-31T23:59:59").unwrap();
        let next = YearMonth::from_stored("2025-04-01T00:00:00").unwrap();
        assert_eq!(first, last);
        assert_ne!(last, next);
        assert_eq!(YearMonth::from_stored("2025-03").unwrap(), first);
        assert_eq!(YearMonth::from_stored("2025-03-15").unwrap(), first);
    }

    #[test]
    fn stored_epoch_buckets_in_utc() {
        // 2024-02-29T23:59:59Z and 2024-03-01T00:00:00Z
        assert_eq!(
            YearMonth::from_epoch_seconds(1709251199).unwrap().to_string(),
            "2024-02"
        );
        assert_eq!(
            YearMonth::from_epoch_seconds(1709251200).unwrap().to_string(),
            "2024-03"
        );
    }

    #[test]
    fn garbage_timestamps_have_no_bucket() {
        assert_eq!(YearMonth::from_stored("yesterday"), None);
        assert_eq!(YearMonth::from_stored("2025-13-01"), None);
        assert_eq!(YearMonth::from_stored("2025-0301"), None);
        assert_eq!(YearMonth::from_stored(""), None);
    }

    #[test]
    fn digit_only_text_is_not_an_epoch() {
        assert_eq!(YearMonth::from_stored("2025"), None);
        assert_eq!(YearMonth::from_stored("20250301"), None);
        assert_eq!(YearMonth::from_stored("1709251200"), None);
    }
}
