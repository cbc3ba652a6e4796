use chrono::{DateTime, Datelike, Days, Months, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::BillingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} to {}", self.start, self.end)
    }
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        DateRange { start, end }
    }

    /// Both ends inclusive.
    pub fn contains(self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }

    pub fn overlaps(self, other: DateRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Human-readable label, e.g. `02-01-2025 to 02-14-2025`.
    pub fn label(self) -> String {
        format!(
            "{} to {}",
            self.start.format("%m-%d-%Y"),
            self.end.format("%m-%d-%Y")
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleLength {
    Days(u32),
    CalendarMonth,
}

pub const BIWEEKLY: CycleLength = CycleLength::Days(14);

/// Billing cycle rules: periods of a fixed length counted from `anchor`, or
/// calendar months.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleConfig {
    pub start_day: Weekday,
    pub length: CycleLength,
    pub anchor: NaiveDate,
}

impl CycleConfig {
    pub fn new(anchor: NaiveDate, length: CycleLength, start_day: Weekday) -> Result<Self, BillingError> {
        if let CycleLength::Days(0) = length {
            return Err(BillingError::InvalidCycle("cycle length must be at least one day".into()));
        }
        Ok(CycleConfig { start_day, length, anchor })
    }

    pub fn fixed(anchor: NaiveDate, days: u32) -> Result<Self, BillingError> {
        Self::new(anchor, CycleLength::Days(days), anchor.weekday())
    }

    pub fn monthly(anchor: NaiveDate) -> Self {
        CycleConfig {
            start_day: anchor.weekday(),
            length: CycleLength::CalendarMonth,
            anchor,
        }
    }

    /// The period containing `date`. Dates before the anchor resolve to
    /// earlier cycles.
    pub fn period_for(&self, date: NaiveDate) -> DateRange {
        match self.length {
            CycleLength::Days(days) => {
                let len = i64::from(days.max(1));
                let elapsed = (date - self.anchor).num_days();
                let index = elapsed.div_euclid(len);
                let start = shift_days(self.anchor, index * len);
                DateRange::new(start, shift_days(start, len - 1))
            }
            CycleLength::CalendarMonth => month_containing(date),
        }
    }

    pub fn next_after(&self, period: DateRange) -> DateRange {
        self.period_for(shift_days(period.end, 1))
    }

    /// Every period that overlaps `range`, oldest first.
    pub fn periods_between(&self, range: DateRange) -> Vec<DateRange> {
        let mut periods = Vec::new();
        if range.end < range.start {
            return periods;
        }
        let mut current = self.period_for(range.start);
        while current.start <= range.end {
            periods.push(current);
            current = self.next_after(current);
        }
        periods
    }
}

fn shift_days(date: NaiveDate, days: i64) -> NaiveDate {
    let magnitude = Days::new(days.unsigned_abs());
    let shifted = if days >= 0 {
        date.checked_add_days(magnitude)
    } else {
        date.checked_sub_days(magnitude)
    };
    shifted.unwrap_or(date)
}

fn month_containing(date: NaiveDate) -> DateRange {
    let first = date.with_day(1).unwrap_or(date);
    let last = first
        .checked_add_months(Months::new(1))
        .and_then(|next| next.pred_opt())
        .unwrap_or(date);
    DateRange::new(first, last)
}

/// Most recent `start_day` on or before `today`.
pub fn most_recent_weekday(today: NaiveDate, start_day: Weekday) -> NaiveDate {
    let back = (7 + today.weekday().num_days_from_monday() - start_day.num_days_from_monday()) % 7;
    shift_days(today, -i64::from(back))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeriodId(pub i64);

impl fmt::Display for PeriodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodStatus {
    Open,
    Closed,
    Invoiced,
}

impl fmt::Display for PeriodStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeriodStatus::Open => write!(f, "open"),
            PeriodStatus::Closed => write!(f, "closed"),
            PeriodStatus::Invoiced => write!(f, "invoiced"),
        }
    }
}

impl std::str::FromStr for PeriodStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(PeriodStatus::Open),
            "closed" => Ok(PeriodStatus::Closed),
            "invoiced" => Ok(PeriodStatus::Invoiced),
            other => Err(format!("Unknown period status: '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub id: PeriodId,
    pub range: DateRange,
    pub label: String,
    pub status: PeriodStatus,
    pub invoices_generated: bool,
    pub closed_at: Option<DateTime<Utc>>,
}

impl BillingPeriod {
    /// New timesheets may only be attached while the period is open.
    pub fn accepts_timesheets(&self) -> bool {
        self.status == PeriodStatus::Open
    }

    /// Whether the period has ended as of `today` (end date is inclusive).
    pub fn has_ended(&self, today: NaiveDate) -> bool {
        self.range.end < today
    }

    pub fn close(&mut self, at: DateTime<Utc>) -> Result<(), BillingError> {
        match self.status {
            PeriodStatus::Open => {
                self.status = PeriodStatus::Closed;
                self.closed_at = Some(at);
                Ok(())
            }
            other => Err(BillingError::InvalidTransition {
                entity: "billing period",
                from: other.to_string(),
                to: PeriodStatus::Closed.to_string(),
            }),
        }
    }

    pub fn mark_invoiced(&mut self, at: DateTime<Utc>) -> Result<(), BillingError> {
        match self.status {
            PeriodStatus::Open | PeriodStatus::Closed => {
                self.status = PeriodStatus::Invoiced;
                self.invoices_generated = true;
                self.closed_at.get_or_insert(at);
                Ok(())
            }
            PeriodStatus::Invoiced => Err(BillingError::InvalidTransition {
                entity: "billing period",
                from: PeriodStatus::Invoiced.to_string(),
                to: PeriodStatus::Invoiced.to_string(),
            }),
        }
    }
}
