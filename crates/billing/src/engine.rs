//! Pure billing computation over already-loaded records.
//!
//! Invoices bill a flat amount per visit (`amount == rate`) while payroll pays
//! by the hour. The asymmetry is a business rule, not an inconsistency.

use std::collections::BTreeMap;

use carebill_core::invoice::sort_line_items;
use carebill_core::money::round2;
use carebill_core::{
    name_key, resolve_rate, Agency, AgencyId, Clinician, ClinicianId, DateRange, LineItem, Money, PaymentId,
    PaymentStatus, PayrollPayment, Timesheet, TimesheetId,
};
use chrono::{Days, NaiveDate};
use rust_decimal::Decimal;
use serde::Serialize;

/// Whether a timesheet may go on a new invoice.
pub fn is_invoiceable(timesheet: &Timesheet) -> bool {
    timesheet.status.is_billable() && !timesheet.is_claimed()
}

/// Display care type: the visit code, else the clinician title, else "Visit".
pub fn care_type(visit_code: Option<&str>, clinician_title: Option<&str>) -> String {
    visit_code
        .or(clinician_title.map(str::trim).filter(|t| !t.is_empty()))
        .unwrap_or("Visit")
        .to_string()
}

/// One agency's invoice before it is numbered and stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvoiceDraft {
    pub agency_id: AgencyId,
    pub agency_name: String,
    pub timesheet_ids: Vec<TimesheetId>,
    pub line_items: Vec<LineItem>,
    pub subtotal: Money,
    /// Adjustments are zero at creation, so this equals the subtotal.
    pub total: Money,
    pub due_date: NaiveDate,
}

/// Groups the visits of `timesheets` by agency and prices each visit.
///
/// Timesheets without a resolved agency are skipped, as are agencies that end
/// up with no line items. Drafts come out in agency id order; line items are
/// sorted by patient then date.
pub fn build_invoice_drafts<'a>(
    timesheets: impl IntoIterator<Item = &'a Timesheet>,
    agencies: &BTreeMap<AgencyId, Agency>,
    system_default: Money,
    today: NaiveDate,
) -> Vec<InvoiceDraft> {
    let mut by_agency: BTreeMap<AgencyId, Vec<&Timesheet>> = BTreeMap::new();
    for timesheet in timesheets {
        match timesheet.agency_id {
            Some(agency) => by_agency.entry(agency).or_default().push(timesheet),
            None => tracing::debug!(timesheet = timesheet.id.0, "No agency resolved, not invoiced"),
        }
    }

    let mut drafts = Vec::new();
    for (agency_id, group) in by_agency {
        let Some(agency) = agencies.get(&agency_id) else {
            tracing::warn!(agency = agency_id.0, "Agency missing from registry, not invoiced");
            continue;
        };

        let mut line_items = Vec::new();
        for timesheet in &group {
            for visit in &timesheet.visits {
                let code = visit.code();
                let rate = resolve_rate(Some(agency), code, system_default);
                let patient_name = match visit.patient_name.trim() {
                    "" => "Unknown".to_string(),
                    name => name.to_string(),
                };
                line_items.push(LineItem {
                    timesheet_id: Some(timesheet.id),
                    patient_name,
                    clinician_name: visit.clinician_name.trim().to_string(),
                    clinician_title: visit.clinician_title.clone(),
                    date: visit.date,
                    time_in: visit.time_in.clone(),
                    time_out: visit.time_out.clone(),
                    duration_minutes: visit.minutes(),
                    visit_code: code.map(str::to_string),
                    care_type: care_type(code, visit.clinician_title.as_deref()),
                    rate,
                    amount: rate,
                });
            }
        }
        if line_items.is_empty() {
            continue;
        }
        sort_line_items(&mut line_items);

        let subtotal: Money = line_items.iter().map(|li| li.amount).sum();
        let due_date = today
            .checked_add_days(Days::new(u64::from(agency.payment_terms_days)))
            .unwrap_or(today);
        drafts.push(InvoiceDraft {
            agency_id,
            agency_name: agency.name.clone(),
            timesheet_ids: group.iter().map(|t| t.id).collect(),
            line_items,
            subtotal,
            total: subtotal,
            due_date,
        });
    }
    drafts
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Payee {
    Clinician(ClinicianId),
    /// Unresolved clinician, keyed by normalized extracted name.
    Name(String),
}

/// One clinician's pay for the filtered work.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PayrollRow {
    pub clinician_id: Option<ClinicianId>,
    pub clinician_name: String,
    pub clinician_title: Option<String>,
    pub pay_rate: Money,
    pub total_minutes: u32,
    pub visits: u32,
    /// `total_minutes / 60`, unrounded.
    pub hours: Decimal,
    pub earnings: Money,
    /// Existing payment total (base + adjustments) if one was recorded, else earnings.
    pub final_amount: Money,
    pub payment_id: Option<PaymentId>,
    pub payment_status: Option<PaymentStatus>,
}

impl PayrollRow {
    pub fn rounded_hours(&self) -> Decimal {
        round2(self.hours)
    }
}

#[derive(Debug, Default)]
struct Accumulator {
    name: String,
    title: Option<String>,
    minutes: u32,
    visits: u32,
}

/// Hourly payroll per clinician.
///
/// Visits outside `range` (when given) are ignored. A clinician with no pay
/// rate still gets a row, with zero earnings. Rows are ordered by name.
pub fn compute_payroll<'a>(
    timesheets: impl IntoIterator<Item = &'a Timesheet>,
    clinicians: &BTreeMap<ClinicianId, Clinician>,
    existing: &[PayrollPayment],
    range: Option<DateRange>,
) -> Vec<PayrollRow> {
    let mut grouped: BTreeMap<Payee, Accumulator> = BTreeMap::new();
    for timesheet in timesheets {
        if !timesheet.status.counts_for_payroll() {
            continue;
        }
        for visit in &timesheet.visits {
            if range.is_some_and(|r| !r.contains(visit.date)) {
                continue;
            }
            let payee = match timesheet.clinician_id {
                Some(id) => Payee::Clinician(id),
                None => Payee::Name(name_key(&visit.clinician_name)),
            };
            let acc = grouped.entry(payee).or_default();
            if acc.name.is_empty() {
                acc.name = visit.clinician_name.trim().to_string();
            }
            if acc.title.is_none() {
                acc.title = visit.clinician_title.clone();
            }
            acc.minutes += visit.minutes();
            acc.visits += 1;
        }
    }

    let mut rows: Vec<PayrollRow> = grouped
        .into_iter()
        .map(|(payee, acc)| {
            let (clinician_id, registered) = match &payee {
                Payee::Clinician(id) => (Some(*id), clinicians.get(id)),
                Payee::Name(_) => (None, None),
            };
            let clinician_name = registered.map(|c| c.name.clone()).unwrap_or(acc.name);
            let clinician_title = registered.and_then(|c| c.title.clone()).or(acc.title);
            let pay_rate = registered.map(|c| c.pay_rate).unwrap_or_default();

            let hours = Decimal::from(acc.minutes) / Decimal::from(60);
            let earnings = pay_rate * hours;

            let payment = existing.iter().find(|p| match &payee {
                Payee::Clinician(id) => p.base.clinician_id == Some(*id),
                Payee::Name(key) => p.base.clinician_id.is_none() && name_key(&p.base.clinician_name) == *key,
            });

            PayrollRow {
                clinician_id,
                clinician_name,
                clinician_title,
                pay_rate,
                total_minutes: acc.minutes,
                visits: acc.visits,
                hours,
                earnings,
                final_amount: payment.map(PayrollPayment::total_amount).unwrap_or(earnings),
                payment_id: payment.map(|p| p.id),
                payment_status: payment.map(|p| p.status),
            }
        })
        .collect();

    rows.sort_by(|a, b| {
        a.clinician_name
            .to_lowercase()
            .cmp(&b.clinician_name.to_lowercase())
            .then(a.clinician_id.cmp(&b.clinician_id))
    });
    rows
}

/// Roll-up across payroll rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PayrollTotals {
    pub total: Money,
    pub hours: Decimal,
    pub visits: u32,
    pub clinicians: usize,
}

pub fn payroll_totals(rows: &[PayrollRow]) -> PayrollTotals {
    PayrollTotals {
        total: rows.iter().map(|r| r.final_amount).sum(),
        hours: round2(rows.iter().map(|r| r.hours).sum()),
        visits: rows.iter().map(|r| r.visits).sum(),
        clinicians: rows.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carebill_core::{
        Adjustment, AdjustmentKind, AdjustmentPolicy, PaymentBase, PeriodId, RateCard, TimesheetStatus, VisitRecord,
    };
    use proptest::prelude::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn acme() -> Agency {
        Agency {
            id: AgencyId(1),
            name: "Acme Home Health".into(),
            address: None,
            contact_name: None,
            contact_email: None,
            contact_phone: None,
            default_rate: None,
            rates: [("P", Money::from_dollars(85)), ("WC", Money::from_dollars(110))]
                .into_iter()
                .collect(),
            payment_terms_days: 30,
            active: true,
            notes: None,
        }
    }

    fn jane() -> Clinician {
        Clinician {
            id: ClinicianId(7),
            name: "Jane Doe".into(),
            title: Some("PTA".into()),
            email: None,
            phone: None,
            pay_rate: Money::from_dollars(40),
            agencies: vec![AgencyId(1)],
            active: true,
            notes: None,
        }
    }

    fn visit(day: NaiveDate, code: Option<&str>, minutes: u32, patient: &str) -> VisitRecord {
        VisitRecord {
            date: day,
            time_in: None,
            time_out: None,
            duration_minutes: Some(minutes),
            visit_code: code.map(str::to_string),
            patient_name: patient.into(),
            clinician_name: "Jane Doe".into(),
            clinician_title: Some("PTA".into()),
        }
    }

    fn timesheet(id: i64, status: TimesheetStatus, visits: Vec<VisitRecord>) -> Timesheet {
        Timesheet {
            id: TimesheetId(id),
            period_id: Some(PeriodId(1)),
            status,
            company_name: Some("Acme Home Health".into()),
            agency_id: Some(AgencyId(1)),
            clinician_id: Some(ClinicianId(7)),
            patient_id: None,
            invoice_id: None,
            visits,
        }
    }

    fn registries() -> (BTreeMap<AgencyId, Agency>, BTreeMap<ClinicianId, Clinician>) {
        (
            BTreeMap::from([(AgencyId(1), acme())]),
            BTreeMap::from([(ClinicianId(7), jane())]),
        )
    }

    #[test]
    fn acme_invoice_and_jane_payroll() {
        let (agencies, clinicians) = registries();
        let sheets = vec![
            timesheet(1, TimesheetStatus::Processed, vec![visit(date(2025, 2, 3), Some("P"), 60, "John Smith")]),
            timesheet(2, TimesheetStatus::Reviewed, vec![visit(date(2025, 2, 10), Some("WC"), 45, "John Smith")]),
        ];
        let today = date(2025, 2, 15);

        let drafts = build_invoice_drafts(sheets.iter().filter(|t| is_invoiceable(t)), &agencies, Money::from_dollars(75), today);
        assert_eq!(drafts.len(), 1);
        let draft = &drafts[0];
        assert_eq!(draft.line_items.len(), 2);
        assert_eq!(draft.subtotal, Money::from_dollars(195));
        assert_eq!(draft.total, Money::from_dollars(195));
        assert_eq!(draft.due_date, date(2025, 3, 17));
        assert!(draft.line_items.iter().all(|li| li.amount == li.rate));

        let rows = compute_payroll(&sheets, &clinicians, &[], None);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].hours, Decimal::new(175, 2));
        assert_eq!(rows[0].earnings, Money::from_cents(7_000));
        assert_eq!(rows[0].final_amount, Money::from_cents(7_000));
        assert_eq!(rows[0].visits, 2);
    }

    #[test]
    fn claimed_and_unbillable_sheets_are_not_invoiced() {
        let (agencies, _) = registries();
        let mut claimed = timesheet(1, TimesheetStatus::Invoiced, vec![visit(date(2025, 2, 3), Some("P"), 60, "A")]);
        claimed.invoice_id = Some(carebill_core::InvoiceId(9));
        let flagged = timesheet(2, TimesheetStatus::Flagged, vec![visit(date(2025, 2, 3), Some("P"), 60, "A")]);
        let sheets = [claimed, flagged];
        let drafts = build_invoice_drafts(
            sheets.iter().filter(|t| is_invoiceable(t)),
            &agencies,
            Money::from_dollars(75),
            date(2025, 2, 15),
        );
        assert!(drafts.is_empty());
    }

    #[test]
    fn line_items_sorted_by_patient_then_date() {
        let (agencies, _) = registries();
        let sheets = vec![timesheet(
            1,
            TimesheetStatus::Processed,
            vec![
                visit(date(2025, 2, 9), Some("P"), 60, "zoe adams"),
                visit(date(2025, 2, 5), Some("P"), 60, "Bob Brown"),
                visit(date(2025, 2, 4), Some("P"), 60, "Zoe Adams"),
                visit(date(2025, 2, 2), Some("P"), 60, "bob brown"),
            ],
        )];
        let drafts = build_invoice_drafts(&sheets, &agencies, Money::from_dollars(75), date(2025, 2, 15));
        let order: Vec<NaiveDate> = drafts[0].line_items.iter().map(|li| li.date).collect();
        assert_eq!(order, vec![date(2025, 2, 2), date(2025, 2, 5), date(2025, 2, 4), date(2025, 2, 9)]);
    }

    #[test]
    fn blank_code_prices_as_p_and_shows_title() {
        let (agencies, _) = registries();
        let sheets = vec![timesheet(1, TimesheetStatus::Processed, vec![visit(date(2025, 2, 3), Some("  "), 30, "A")])];
        let drafts = build_invoice_drafts(&sheets, &agencies, Money::from_dollars(75), date(2025, 2, 15));
        let item = &drafts[0].line_items[0];
        assert_eq!(item.rate, Money::from_dollars(85));
        assert_eq!(item.visit_code, None);
        assert_eq!(item.care_type, "PTA");
        assert_eq!(care_type(None, None), "Visit");
    }

    #[test]
    fn unknown_code_falls_back_to_system_default_and_terms_zero_is_due_today() {
        let mut agency = acme();
        agency.rates = RateCard::new();
        agency.payment_terms_days = 0;
        let agencies = BTreeMap::from([(AgencyId(1), agency)]);
        let sheets = vec![timesheet(1, TimesheetStatus::Processed, vec![visit(date(2025, 2, 3), Some("ZZZ"), 30, "A")])];
        let today = date(2025, 2, 15);
        let drafts = build_invoice_drafts(&sheets, &agencies, Money::from_dollars(75), today);
        assert_eq!(drafts[0].total, Money::from_dollars(75));
        assert_eq!(drafts[0].due_date, today);
    }

    #[test]
    fn sheets_without_agency_or_visits_produce_nothing() {
        let (agencies, _) = registries();
        let mut orphan = timesheet(1, TimesheetStatus::Processed, vec![visit(date(2025, 2, 3), Some("P"), 30, "A")]);
        orphan.agency_id = None;
        let empty = timesheet(2, TimesheetStatus::Processed, Vec::new());
        let drafts = build_invoice_drafts(&[orphan, empty], &agencies, Money::from_dollars(75), date(2025, 2, 15));
        assert!(drafts.is_empty());
    }

    #[test]
    fn zero_rate_and_unresolved_clinicians_still_listed() {
        let mut unpaid = jane();
        unpaid.pay_rate = Money::zero();
        let clinicians = BTreeMap::from([(ClinicianId(7), unpaid)]);
        let mut unresolved = timesheet(2, TimesheetStatus::Processed, vec![visit(date(2025, 2, 3), None, 90, "A")]);
        unresolved.clinician_id = None;
        unresolved.visits[0].clinician_name = "  Sam Lee ".into();
        let sheets = vec![
            timesheet(1, TimesheetStatus::Invoiced, vec![visit(date(2025, 2, 3), None, 60, "A")]),
            unresolved,
        ];
        let rows = compute_payroll(&sheets, &clinicians, &[], None);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].clinician_name, "Jane Doe");
        assert_eq!(rows[0].earnings, Money::zero());
        assert_eq!(rows[1].clinician_name, "Sam Lee");
        assert_eq!(rows[1].clinician_id, None);
        assert_eq!(rows[1].rounded_hours(), Decimal::new(15, 1));
    }

    #[test]
    fn existing_payment_supplies_final_amount() {
        let (_, clinicians) = registries();
        let sheets = vec![timesheet(1, TimesheetStatus::Processed, vec![visit(date(2025, 2, 3), None, 60, "A")])];
        let mut payment = PayrollPayment::new(
            PaymentId(3),
            PaymentBase {
                clinician_id: Some(ClinicianId(7)),
                clinician_name: "Jane Doe".into(),
                clinician_title: None,
                period_id: Some(PeriodId(1)),
                period_label: String::new(),
                amount: Money::from_dollars(40),
                hours: Decimal::ONE,
                visits: 1,
                pay_rate: Money::from_dollars(40),
            },
        );
        payment
            .add_adjustment(
                Adjustment::new(AdjustmentKind::Bonus, Money::from_dollars(10), "mileage"),
                AdjustmentPolicy::default(),
            )
            .unwrap();
        let rows = compute_payroll(&sheets, &clinicians, &[payment], None);
        assert_eq!(rows[0].earnings, Money::from_dollars(40));
        assert_eq!(rows[0].final_amount, Money::from_dollars(50));
        assert_eq!(rows[0].payment_id, Some(PaymentId(3)));
    }

    #[test]
    fn range_filter_limits_visits() {
        let (_, clinicians) = registries();
        let sheets = vec![timesheet(
            1,
            TimesheetStatus::Processed,
            vec![visit(date(2025, 2, 3), None, 60, "A"), visit(date(2025, 2, 20), None, 60, "A")],
        )];
        let range = DateRange::new(date(2025, 2, 1), date(2025, 2, 14));
        let rows = compute_payroll(&sheets, &clinicians, &[], Some(range));
        assert_eq!(rows[0].visits, 1);
        assert_eq!(rows[0].earnings, Money::from_dollars(40));
    }

    #[test]
    fn totals_sum_final_amounts() {
        let (_, clinicians) = registries();
        let sheets = vec![timesheet(1, TimesheetStatus::Processed, vec![visit(date(2025, 2, 3), None, 100, "A")])];
        let rows = compute_payroll(&sheets, &clinicians, &[], None);
        // 100 minutes at $40/h = 66.666.. → 66.67
        assert_eq!(rows[0].earnings, Money::from_cents(6_667));
        let totals = payroll_totals(&rows);
        assert_eq!(totals.total, Money::from_cents(6_667));
        assert_eq!(totals.hours, Decimal::new(167, 2));
        assert_eq!(totals.clinicians, 1);
    }

    proptest! {
        #[test]
        fn invoice_total_is_sum_of_rates(codes in proptest::collection::vec(prop_oneof![Just("P"), Just("WC"), Just("X"), Just("")], 1..20)) {
            let (agencies, _) = registries();
            let visits = codes
                .iter()
                .map(|c| visit(date(2025, 2, 3), Some(*c), 30, "A"))
                .collect();
            let sheets = vec![timesheet(1, TimesheetStatus::Processed, visits)];
            let drafts = build_invoice_drafts(&sheets, &agencies, Money::from_dollars(75), date(2025, 2, 15));
            let expected: i64 = codes
                .iter()
                .map(|c| match *c { "WC" => 11_000, "X" => 7_500, _ => 8_500 })
                .sum();
            prop_assert_eq!(drafts[0].total.to_cents(), expected);
        }
    }
}
