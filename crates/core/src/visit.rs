use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::entity::{AgencyId, ClinicianId, PatientId};
use super::invoice::InvoiceId;
use super::period::PeriodId;

/// One clinical visit as extracted from a timesheet. Never mutated by billing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitRecord {
    pub date: NaiveDate,
    pub time_in: Option<String>,
    pub time_out: Option<String>,
    /// Explicit duration, when the sheet states one.
    pub duration_minutes: Option<u32>,
    pub visit_code: Option<String>,
    pub patient_name: String,
    pub clinician_name: String,
    pub clinician_title: Option<String>,
}

const TIME_FORMATS: &[&str] = &["%H:%M", "%I:%M %p", "%I:%M%p", "%H%M"];

fn parse_clock(raw: &str) -> Option<NaiveTime> {
    let cleaned = raw.trim().to_uppercase();
    TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(&cleaned, fmt).ok())
}

impl VisitRecord {
    /// Explicit duration if present, else derived from time-in/time-out.
    /// Visits crossing midnight wrap to the next day; unparseable times count as zero.
    pub fn minutes(&self) -> u32 {
        if let Some(minutes) = self.duration_minutes {
            return minutes;
        }
        let (Some(time_in), Some(time_out)) = (
            self.time_in.as_deref().and_then(parse_clock),
            self.time_out.as_deref().and_then(parse_clock),
        ) else {
            return 0;
        };
        let mut minutes = (time_out - time_in).num_minutes();
        if minutes < 0 {
            minutes += 24 * 60;
        }
        u32::try_from(minutes).unwrap_or(0)
    }

    /// The stored visit code, trimmed; `None` when blank.
    pub fn code(&self) -> Option<&str> {
        self.visit_code
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimesheetId(pub i64);

impl fmt::Display for TimesheetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimesheetStatus {
    Pending,
    Processing,
    Processed,
    Flagged,
    Reviewed,
    Invoiced,
    Error,
}

impl TimesheetStatus {
    /// Eligible for a new invoice (subject to not already being claimed).
    pub fn is_billable(self) -> bool {
        matches!(self, TimesheetStatus::Processed | TimesheetStatus::Reviewed)
    }

    /// Counted towards payroll, which also covers invoiced work.
    pub fn counts_for_payroll(self) -> bool {
        matches!(
            self,
            TimesheetStatus::Processed | TimesheetStatus::Reviewed | TimesheetStatus::Invoiced
        )
    }
}

impl fmt::Display for TimesheetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimesheetStatus::Pending => "pending",
            TimesheetStatus::Processing => "processing",
            TimesheetStatus::Processed => "processed",
            TimesheetStatus::Flagged => "flagged",
            TimesheetStatus::Reviewed => "reviewed",
            TimesheetStatus::Invoiced => "invoiced",
            TimesheetStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TimesheetStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TimesheetStatus::Pending),
            "processing" => Ok(TimesheetStatus::Processing),
            "processed" => Ok(TimesheetStatus::Processed),
            "flagged" => Ok(TimesheetStatus::Flagged),
            "reviewed" => Ok(TimesheetStatus::Reviewed),
            "invoiced" => Ok(TimesheetStatus::Invoiced),
            "error" => Ok(TimesheetStatus::Error),
            other => Err(format!("Unknown timesheet status: '{other}'")),
        }
    }
}

/// A processed timesheet: its visits plus whatever entity references have
/// been resolved so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timesheet {
    pub id: TimesheetId,
    pub period_id: Option<PeriodId>,
    pub status: TimesheetStatus,
    pub company_name: Option<String>,
    pub agency_id: Option<AgencyId>,
    pub clinician_id: Option<ClinicianId>,
    pub patient_id: Option<PatientId>,
    pub invoice_id: Option<InvoiceId>,
    pub visits: Vec<VisitRecord>,
}

impl Timesheet {
    pub fn is_claimed(&self) -> bool {
        self.invoice_id.is_some()
    }

    pub fn total_minutes(&self) -> u32 {
        self.visits.iter().map(VisitRecord::minutes).sum()
    }
}
