use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::entity::AgencyId;
use super::error::BillingError;
use super::money::Money;
use super::period::PeriodId;
use super::visit::TimesheetId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InvoiceId(pub i64);

impl fmt::Display for InvoiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `INV-<year>-<4-digit sequence>`; the sequence is global, never reset.
pub fn format_invoice_number(year: i32, sequence: u64) -> String {
    format!("INV-{year}-{sequence:04}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Sent,
    Paid,
    Overdue,
    Void,
}

impl InvoiceStatus {
    /// Legal moves: draft→sent, draft→void, sent→paid, sent→overdue, overdue→paid.
    pub fn can_transition_to(self, next: InvoiceStatus) -> bool {
        use InvoiceStatus::*;
        matches!(
            (self, next),
            (Draft, Sent) | (Draft, Void) | (Sent, Paid) | (Sent, Overdue) | (Overdue, Paid)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, InvoiceStatus::Paid | InvoiceStatus::Void)
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvoiceStatus::Draft => write!(f, "draft"),
            InvoiceStatus::Sent => write!(f, "sent"),
            InvoiceStatus::Paid => write!(f, "paid"),
            InvoiceStatus::Overdue => write!(f, "overdue"),
            InvoiceStatus::Void => write!(f, "void"),
        }
    }
}

impl std::str::FromStr for InvoiceStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(InvoiceStatus::Draft),
            "sent" => Ok(InvoiceStatus::Sent),
            "paid" => Ok(InvoiceStatus::Paid),
            "overdue" => Ok(InvoiceStatus::Overdue),
            "void" => Ok(InvoiceStatus::Void),
            other => Err(format!("Unknown invoice status: '{other}'")),
        }
    }
}

/// One billed visit. Billing is flat per visit: `amount == rate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub timesheet_id: Option<TimesheetId>,
    pub patient_name: String,
    pub clinician_name: String,
    pub clinician_title: Option<String>,
    pub date: NaiveDate,
    pub time_in: Option<String>,
    pub time_out: Option<String>,
    pub duration_minutes: u32,
    pub visit_code: Option<String>,
    /// Display care type: the visit code, else the clinician title, else "Visit".
    pub care_type: String,
    pub rate: Money,
    pub amount: Money,
}

/// Presentation order: patient name (case-insensitive) ascending, then visit date.
pub fn sort_line_items(items: &mut [LineItem]) {
    items.sort_by(|a, b| {
        a.patient_name
            .to_lowercase()
            .cmp(&b.patient_name.to_lowercase())
            .then(a.date.cmp(&b.date))
    });
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: InvoiceId,
    pub number: String,
    pub agency_id: AgencyId,
    pub period_id: PeriodId,
    pub timesheet_ids: Vec<TimesheetId>,
    line_items: Vec<LineItem>,
    subtotal: Money,
    adjustments: Money,
    total: Money,
    pub status: InvoiceStatus,
    pub due_date: NaiveDate,
    pub sent_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub paid_amount: Option<Money>,
    pub payment_notes: Option<String>,
    pub notes: Option<String>,
    pub pdf_path: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Invoice {
    /// A fresh draft. Line items are fixed from here on; totals follow them.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: InvoiceId,
        number: String,
        agency_id: AgencyId,
        period_id: PeriodId,
        timesheet_ids: Vec<TimesheetId>,
        line_items: Vec<LineItem>,
        due_date: NaiveDate,
        created_at: DateTime<Utc>,
    ) -> Self {
        let subtotal: Money = line_items.iter().map(|li| li.amount).sum();
        Invoice {
            id,
            number,
            agency_id,
            period_id,
            timesheet_ids,
            line_items,
            subtotal,
            adjustments: Money::zero(),
            total: subtotal,
            status: InvoiceStatus::Draft,
            due_date,
            sent_at: None,
            paid_at: None,
            paid_amount: None,
            payment_notes: None,
            notes: None,
            pdf_path: None,
            created_at,
        }
    }

    /// Restores a persisted adjustment total without a state check.
    pub fn with_adjustments(mut self, adjustments: Money) -> Self {
        self.adjustments = adjustments;
        self.recompute();
        self
    }

    pub fn line_items(&self) -> &[LineItem] {
        &self.line_items
    }

    pub fn subtotal(&self) -> Money {
        self.subtotal
    }

    pub fn adjustments(&self) -> Money {
        self.adjustments
    }

    pub fn total(&self) -> Money {
        self.total
    }

    fn recompute(&mut self) {
        self.subtotal = self.line_items.iter().map(|li| li.amount).sum();
        self.total = self.subtotal + self.adjustments;
    }

    fn transition(&mut self, next: InvoiceStatus) -> Result<(), BillingError> {
        if !self.status.can_transition_to(next) {
            return Err(BillingError::InvalidTransition {
                entity: "invoice",
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn send(&mut self, now: DateTime<Utc>) -> Result<(), BillingError> {
        self.transition(InvoiceStatus::Sent)?;
        self.sent_at = Some(now);
        Ok(())
    }

    /// `amount` defaults to the invoice total.
    pub fn mark_paid(
        &mut self,
        at: DateTime<Utc>,
        amount: Option<Money>,
        notes: Option<String>,
    ) -> Result<(), BillingError> {
        self.transition(InvoiceStatus::Paid)?;
        self.paid_at = Some(at);
        self.paid_amount = Some(amount.unwrap_or(self.total));
        if notes.is_some() {
            self.payment_notes = notes;
        }
        Ok(())
    }

    pub fn void(&mut self) -> Result<(), BillingError> {
        self.transition(InvoiceStatus::Void)
    }

    /// Eligibility for the time-based sent→overdue move.
    pub fn is_overdue(&self, today: NaiveDate) -> bool {
        self.status == InvoiceStatus::Sent && self.due_date < today
    }

    pub fn mark_overdue(&mut self, today: NaiveDate) -> Result<(), BillingError> {
        if !self.is_overdue(today) {
            return Err(BillingError::InvalidTransition {
                entity: "invoice",
                from: self.status.to_string(),
                to: InvoiceStatus::Overdue.to_string(),
            });
        }
        self.transition(InvoiceStatus::Overdue)
    }

    /// Adds a signed adjustment; only while the invoice is still collectable.
    pub fn adjust(&mut self, delta: Money) -> Result<(), BillingError> {
        if self.status.is_terminal() {
            return Err(BillingError::InvalidTransition {
                entity: "invoice",
                from: self.status.to_string(),
                to: "adjusted".to_string(),
            });
        }
        self.adjustments = Money::from_decimal((self.adjustments + delta).as_decimal());
        self.recompute();
        Ok(())
    }

    /// Drafts delete freely; anything else needs `force`.
    pub fn check_delete(&self, force: bool) -> Result<(), BillingError> {
        if self.status == InvoiceStatus::Draft || force {
            Ok(())
        } else {
            Err(BillingError::DeleteRequiresForce {
                status: self.status.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn item(patient: &str, day: u32, dollars: i64) -> LineItem {
        LineItem {
            timesheet_id: Some(TimesheetId(1)),
            patient_name: patient.to_string(),
            clinician_name: "Jane Doe".to_string(),
            clinician_title: Some("PTA".to_string()),
            date: date(2025, 2, day),
            time_in: None,
            time_out: None,
            duration_minutes: 60,
            visit_code: Some("P".to_string()),
            care_type: "P".to_string(),
            rate: Money::from_dollars(dollars),
            amount: Money::from_dollars(dollars),
        }
    }

    fn invoice() -> Invoice {
        let now = Utc.with_ymd_and_hms(2025, 2, 15, 9, 0, 0).unwrap();
        Invoice::new(
            InvoiceId(1),
            format_invoice_number(2025, 1),
            AgencyId(1),
            PeriodId(1),
            vec![TimesheetId(1)],
            vec![item("A", 3, 85), item("A", 10, 110)],
            date(2025, 3, 17),
            now,
        )
    }

    #[test]
    fn number_format() {
        assert_eq!(format_invoice_number(2025, 1), "INV-2025-0001");
        assert_eq!(format_invoice_number(2025, 42), "INV-2025-0042");
        assert_eq!(format_invoice_number(2026, 12_345), "INV-2026-12345");
    }

    #[test]
    fn new_invoice_totals() {
        let inv = invoice();
        assert_eq!(inv.subtotal(), Money::from_dollars(195));
        assert_eq!(inv.total(), Money::from_dollars(195));
        assert_eq!(inv.status, InvoiceStatus::Draft);
    }

    #[test]
    fn adjustments_recompute_total() {
        let mut inv = invoice();
        inv.adjust(Money::from_cents(-1_550)).unwrap();
        inv.adjust(Money::from_dollars(5)).unwrap();
        assert_eq!(inv.adjustments(), Money::from_cents(-1_050));
        assert_eq!(inv.total(), inv.subtotal() + inv.adjustments());
    }

    #[test]
    fn sort_by_patient_then_date() {
        let mut items = vec![item("bob", 10, 1), item("Alice", 12, 1), item("alice", 3, 1), item("Bob", 1, 1)];
        sort_line_items(&mut items);
        let order: Vec<(String, u32)> = items
            .iter()
            .map(|li| (li.patient_name.clone(), chrono::Datelike::day(&li.date)))
            .collect();
        assert_eq!(
            order,
            vec![
                ("alice".to_string(), 3),
                ("Alice".to_string(), 12),
                ("Bob".to_string(), 1),
                ("bob".to_string(), 10)
            ]
        );
    }

    #[test]
    fn send_then_pay() {
        let mut inv = invoice();
        let now = Utc::now();
        inv.send(now).unwrap();
        assert_eq!(inv.sent_at, Some(now));
        inv.mark_paid(now, None, Some("check 1042".into())).unwrap();
        assert_eq!(inv.status, InvoiceStatus::Paid);
        assert_eq!(inv.paid_amount, Some(Money::from_dollars(195)));
    }

    #[test]
    fn cannot_send_twice() {
        let mut inv = invoice();
        inv.send(Utc::now()).unwrap();
        let err = inv.send(Utc::now()).unwrap_err();
        assert_eq!(
            err,
            BillingError::InvalidTransition {
                entity: "invoice",
                from: "sent".into(),
                to: "sent".into()
            }
        );
        assert_eq!(inv.status, InvoiceStatus::Sent);
    }

    #[test]
    fn draft_cannot_be_paid_directly() {
        let mut inv = invoice();
        assert!(inv.mark_paid(Utc::now(), None, None).is_err());
        assert_eq!(inv.status, InvoiceStatus::Draft);
        assert_eq!(inv.paid_at, None);
    }

    #[test]
    fn no_exit_from_terminal_states() {
        let mut inv = invoice();
        inv.void().unwrap();
        assert!(inv.send(Utc::now()).is_err());
        assert!(inv.adjust(Money::from_dollars(1)).is_err());
        for next in [InvoiceStatus::Draft, InvoiceStatus::Sent, InvoiceStatus::Overdue, InvoiceStatus::Paid] {
            assert!(!InvoiceStatus::Paid.can_transition_to(next));
            assert!(!InvoiceStatus::Void.can_transition_to(next));
        }
    }

    #[test]
    fn overdue_only_after_due_date() {
        let mut inv = invoice();
        assert!(!inv.is_overdue(date(2025, 4, 1)));
        inv.send(Utc::now()).unwrap();
        assert!(!inv.is_overdue(date(2025, 3, 17)));
        assert!(inv.mark_overdue(date(2025, 3, 17)).is_err());
        assert!(inv.is_overdue(date(2025, 3, 18)));
        inv.mark_overdue(date(2025, 3, 18)).unwrap();
        inv.mark_paid(Utc::now(), Some(Money::from_dollars(100)), None).unwrap();
        assert_eq!(inv.paid_amount, Some(Money::from_dollars(100)));
    }

    #[test]
    fn delete_guard() {
        let mut inv = invoice();
        assert!(inv.check_delete(false).is_ok());
        inv.send(Utc::now()).unwrap();
        assert_eq!(
            inv.check_delete(false),
            Err(BillingError::DeleteRequiresForce { status: "sent".into() })
        );
        assert!(inv.check_delete(true).is_ok());
    }

    #[test]
    fn status_roundtrip() {
        use std::str::FromStr;
        for s in ["draft", "sent", "paid", "overdue", "void"] {
            assert_eq!(InvoiceStatus::from_str(s).unwrap().to_string(), s);
        }
    }
}
