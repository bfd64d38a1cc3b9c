//! Common types used across Salesync

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CommonError;

/// Upstream marketplace a chunk of data is ingested from.
///
/// The declaration order is the default ingestion priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceId {
    Wildberries,
    Ozon,
}

impl SourceId {
    /// All sources in default priority order
    pub const ALL: [SourceId; 2] = [SourceId::Wildberries, SourceId::Ozon];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceId::Wildberries => "wildberries",
            SourceId::Ozon => "ozon",
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceId {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "wildberries" | "wb" => Ok(SourceId::Wildberries),
            "ozon" => Ok(SourceId::Ozon),
            other => Err(CommonError::UnknownSource(other.to_string())),
        }
    }
}

/// Inclusive calendar-date window `[from, to]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DateWindow {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateWindow {
    /// Build a window without validating order; see [`DateWindow::is_valid`]
    pub fn new(from: NaiveDate, to: NaiveDate) -> Self {
        Self { from, to }
    }

    /// Single-day window
    pub fn day(date: NaiveDate) -> Self {
        Self { from: date, to: date }
    }

    /// Parse `YYYY-MM-DD` bounds
    pub fn parse(from: &str, to: &str) -> crate::Result<Self> {
        Ok(Self {
            from: parse_date(from)?,
            to: parse_date(to)?,
        })
    }

    pub fn is_valid(&self) -> bool {
        self.from <= self.to
    }

    /// Number of days covered, counting both ends
    pub fn days(&self) -> i64 {
        (self.to - self.from).num_days() + 1
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.from <= date && date <= self.to
    }

    /// First day after the window
    pub fn next_day(&self) -> Option<NaiveDate> {
        self.to.checked_add_signed(Duration::days(1))
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.from, self.to)
    }
}

/// Parse an ISO `YYYY-MM-DD` date
pub fn parse_date(value: &str) -> crate::Result<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|e| CommonError::invalid_date(value, e.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_source_id_round_trip_names() {
        for source in SourceId::ALL {
            assert_eq!(source.as_str().parse::<SourceId>().unwrap(), source);
        }
        assert_eq!("WB".parse::<SourceId>().unwrap(), SourceId::Wildberries);
        assert!("amazon".parse::<SourceId>().is_err());
    }

    #[test]
    fn test_source_id_serde_snake_case() {
        let json = serde_json::to_string(&SourceId::Wildberries).unwrap();
        assert_eq!(json, "\"wildberries\"");
    }

    #[test]
    fn test_window_days_inclusive() {
        let window = DateWindow::parse("2024-01-01", "2024-01-31").unwrap();
        assert_eq!(window.days(), 31);
        assert!(window.contains(NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()));
        assert_eq!(window.next_day(), NaiveDate::from_ymd_opt(2024, 2, 1));
        assert_eq!(DateWindow::day(window.from).days(), 1);
    }

    #[test]
    fn test_window_validity() {
        let window = DateWindow::parse("2024-02-01", "2024-01-01").unwrap();
        assert!(!window.is_valid());
        assert!(DateWindow::parse("2024-13-01", "2024-01-01").is_err());
    }
}
