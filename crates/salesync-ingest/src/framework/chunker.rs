//! Splits a requested period into source-specific windows
//!
//! Windows are ordered, contiguous and never overlap; together they tile the
//! requested range exactly. Each window ends at the earliest of the policy
//! boundary (N days or month end), the source's maximum span, and the end of
//! the range.

use chrono::{Datelike, Days, NaiveDate};
use std::collections::BTreeMap;

use salesync_common::{DateWindow, SourceId};

use crate::config::{WindowPolicy, WindowSize};
use crate::error::{IngestError, Result};

/// Last calendar day of the month containing `date`
fn end_of_month(date: NaiveDate) -> NaiveDate {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|first| first.pred_opt())
        .unwrap_or(NaiveDate::MAX)
}

/// `date + days`, saturating at the calendar's end
fn add_days(date: NaiveDate, days: u32) -> NaiveDate {
    date.checked_add_days(Days::new(u64::from(days)))
        .unwrap_or(NaiveDate::MAX)
}

/// Split `period` according to `policy`
pub fn split_period(policy: &WindowPolicy, period: DateWindow) -> Result<Vec<DateWindow>> {
    if !period.is_valid() {
        return Err(IngestError::InvalidRange {
            from: period.from,
            to: period.to,
        });
    }

    let max_span = policy.max_span_days.max(1);
    let mut windows = Vec::new();
    let mut cursor = period.from;

    loop {
        let policy_end = match policy.size {
            WindowSize::FixedDays { days } => add_days(cursor, days.max(1) - 1),
            WindowSize::CalendarMonth => end_of_month(cursor),
        };
        let span_end = add_days(cursor, max_span - 1);
        let end = policy_end.min(span_end).min(period.to);

        windows.push(DateWindow::new(cursor, end));

        match end.succ_opt() {
            Some(next) if end < period.to => cursor = next,
            _ => break,
        }
    }

    Ok(windows)
}

/// Holds the window policy of every source
#[derive(Debug, Clone)]
pub struct Chunker {
    policies: BTreeMap<SourceId, WindowPolicy>,
}

impl Chunker {
    pub fn new(policies: BTreeMap<SourceId, WindowPolicy>) -> Self {
        Self { policies }
    }

    pub fn policy(&self, source: SourceId) -> WindowPolicy {
        self.policies
            .get(&source)
            .copied()
            .unwrap_or_else(|| WindowPolicy::default_for(source))
    }

    /// Windows for one source; fails with `InvalidRange` when `from > to`
    pub fn split(&self, source: SourceId, from: NaiveDate, to: NaiveDate) -> Result<Vec<DateWindow>> {
        split_period(&self.policy(source), DateWindow::new(from, to))
    }

    /// Windows for every source, keyed by source
    pub fn plan(
        &self,
        sources: &[SourceId],
        period: DateWindow,
    ) -> Result<BTreeMap<SourceId, Vec<DateWindow>>> {
        sources
            .iter()
            .map(|source| Ok((*source, self.split(*source, period.from, period.to)?)))
            .collect()
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(
            SourceId::ALL
                .iter()
                .map(|source| (*source, WindowPolicy::default_for(*source)))
                .collect(),
        )
    }
}
