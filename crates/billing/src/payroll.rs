use std::collections::BTreeMap;

use carebill_core::money::round2;
use carebill_core::{
    Adjustment, BillingPeriod, ClinicianId, Clinician, DateRange, PaymentBase, PaymentId, PaymentMethod,
    PayrollPayment, PeriodId, Timesheet, TimesheetStatus,
};
use carebill_storage as storage;
use carebill_storage::{PaymentFilter, StorageError};
use chrono::NaiveDate;
use serde::Serialize;

use crate::engine::{compute_payroll, payroll_totals, PayrollRow, PayrollTotals};
use crate::error::Result;
use crate::service::Billing;

const PAYABLE: [TimesheetStatus; 3] = [TimesheetStatus::Processed, TimesheetStatus::Reviewed, TimesheetStatus::Invoiced];

#[derive(Debug, Clone, Serialize)]
pub struct PayrollSummary {
    pub range: DateRange,
    pub label: String,
    pub rows: Vec<PayrollRow>,
    pub totals: PayrollTotals,
}

/// A clinician whose payment could not be recorded. The rest of the run goes on.
#[derive(Debug, Clone, Serialize)]
pub struct ClinicianFailure {
    pub clinician_id: Option<ClinicianId>,
    pub clinician_name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PaymentReport {
    pub created: Vec<PayrollPayment>,
    /// Names of clinicians that already had a payment for the period.
    pub existing: Vec<String>,
    pub failures: Vec<ClinicianFailure>,
}

impl Billing {
    async fn clinicians_by_id(&self) -> Result<BTreeMap<ClinicianId, Clinician>> {
        Ok(storage::list_clinicians(&self.pool, true)
            .await?
            .into_iter()
            .map(|c| (c.id, c))
            .collect())
    }

    async fn payroll_period(&self, id: PeriodId) -> Result<BillingPeriod> {
        Ok(storage::get_period(&self.pool, id)
            .await?
            .ok_or(StorageError::NotFound { entity: "billing period", id: id.0 })?)
    }

    /// Hourly pay per clinician for one period, merged with any payments
    /// already recorded for it.
    pub async fn payroll_summary(&self, period_id: PeriodId) -> Result<PayrollSummary> {
        let period = self.payroll_period(period_id).await?;
        let timesheets = storage::list_timesheets(&self.pool, period_id, &PAYABLE).await?;
        let existing = storage::list_payments(
            &self.pool,
            PaymentFilter { period_id: Some(period_id), ..Default::default() },
        )
        .await?;
        let rows = compute_payroll(&timesheets, &self.clinicians_by_id().await?, &existing, None);
        Ok(PayrollSummary {
            range: period.range,
            label: period.label,
            totals: payroll_totals(&rows),
            rows,
        })
    }

    /// Hourly pay for every visit dated within `range`, across whichever
    /// periods hold them. Recorded payments are not merged.
    pub async fn payroll_between(&self, range: DateRange) -> Result<PayrollSummary> {
        let mut timesheets: Vec<Timesheet> = Vec::new();
        for period in storage::periods_overlapping(&self.pool, range).await? {
            timesheets.extend(storage::list_timesheets(&self.pool, period.id, &PAYABLE).await?);
        }
        let rows = compute_payroll(&timesheets, &self.clinicians_by_id().await?, &[], Some(range));
        Ok(PayrollSummary {
            range,
            label: range.label(),
            totals: payroll_totals(&rows),
            rows,
        })
    }

    /// Records a pending payment for every clinician in the period's payroll
    /// that does not have one yet.
    pub async fn generate_payroll_payments(&self, period_id: PeriodId) -> Result<PaymentReport> {
        let summary = self.payroll_summary(period_id).await?;
        let mut report = PaymentReport::default();
        for row in summary.rows {
            if row.payment_id.is_some() {
                report.existing.push(row.clinician_name);
                continue;
            }
            let base = PaymentBase {
                clinician_id: row.clinician_id,
                clinician_name: row.clinician_name,
                clinician_title: row.clinician_title,
                period_id: Some(period_id),
                period_label: summary.label.clone(),
                amount: row.earnings,
                hours: round2(row.hours),
                visits: row.visits,
                pay_rate: row.pay_rate,
            };
            let payment = match storage::insert_payment(&self.pool, &base, "").await {
                Ok(payment) => payment,
                Err(e) => {
                    tracing::warn!(clinician = %base.clinician_name, error = %e, "Payroll payment not recorded");
                    report.failures.push(ClinicianFailure {
                        clinician_id: base.clinician_id,
                        clinician_name: base.clinician_name,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            tracing::info!(
                clinician = %payment.base.clinician_name,
                amount = %payment.base.amount,
                "Recorded payroll payment"
            );
            report.created.push(payment);
        }
        Ok(report)
    }

    /// Records a single payment, with or without a period. A clinician gets
    /// at most one payment per period.
    pub async fn record_payment(&self, base: PaymentBase, notes: &str) -> Result<PayrollPayment> {
        if let Some(period) = base.period_id {
            if storage::find_payment_for(&self.pool, period, base.clinician_id, &base.clinician_name)
                .await?
                .is_some()
            {
                return Err(StorageError::DuplicatePayment {
                    clinician: base.clinician_name,
                    period: period.0,
                }
                .into());
            }
        }
        let payment = storage::insert_payment(&self.pool, &base, notes).await?;
        tracing::info!(
            clinician = %payment.base.clinician_name,
            amount = %payment.base.amount,
            period = ?payment.base.period_id.map(|p| p.0),
            "Recorded payroll payment"
        );
        Ok(payment)
    }

    pub async fn adjust_payment(&self, id: PaymentId, adjustment: Adjustment) -> Result<PayrollPayment> {
        let settings = storage::load_settings(&self.pool).await?;
        Ok(storage::add_payment_adjustment(&self.pool, id, adjustment, settings.adjustment_policy()).await?)
    }

    pub async fn pay(&self, id: PaymentId, date: NaiveDate, method: PaymentMethod) -> Result<PayrollPayment> {
        Ok(storage::mark_payment_paid(&self.pool, id, date, method).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::test_support::*;
    use crate::ServiceError;
    use carebill_core::settings::KEY_ALLOW_ADJUSTMENT_AFTER_PAID;
    use carebill_core::{AdjustmentKind, BillingError, BillingSettings, Money, PaymentStatus};
    use rust_decimal::Decimal;

    async fn seeded(billing: &Billing) -> PeriodId {
        let agency = acme(billing).await;
        let clinician = jane(billing, agency.id).await;
        let period = storage::current_open_period(&billing.pool, &BillingSettings::default(), date(2025, 2, 5))
            .await
            .unwrap();
        processed_sheet(
            billing,
            period.id,
            Some(agency.id),
            Some(clinician.id),
            vec![visit(date(2025, 2, 3), Some("P"), 60), visit(date(2025, 2, 10), Some("WC"), 45)],
        )
        .await;
        period.id
    }

    #[tokio::test]
    async fn summary_pays_hourly() {
        let (_dir, billing) = fresh_billing().await;
        let period = seeded(&billing).await;
        let summary = billing.payroll_summary(period).await.unwrap();
        assert_eq!(summary.rows.len(), 1);
        assert_eq!(summary.rows[0].earnings, Money::from_dollars(70));
        assert_eq!(summary.totals.total, Money::from_dollars(70));
        assert_eq!(summary.totals.hours, Decimal::new(175, 2));
    }

    #[tokio::test]
    async fn invoiced_work_still_counts() {
        let (_dir, billing) = fresh_billing().await;
        let period = seeded(&billing).await;
        billing
            .generate_invoices(period, chrono::Utc::now())
            .await
            .unwrap();
        let summary = billing.payroll_summary(period).await.unwrap();
        assert_eq!(summary.totals.total, Money::from_dollars(70));
    }

    #[tokio::test]
    async fn payments_generated_once_and_merge_adjustments() {
        let (_dir, billing) = fresh_billing().await;
        let period = seeded(&billing).await;

        let first = billing.generate_payroll_payments(period).await.unwrap();
        assert_eq!(first.created.len(), 1);
        let payment = &first.created[0];
        assert_eq!(payment.base.hours, Decimal::new(175, 2));
        assert_eq!(payment.status, PaymentStatus::Pending);

        let second = billing.generate_payroll_payments(period).await.unwrap();
        assert!(second.created.is_empty());
        assert_eq!(second.existing, vec!["Jane Doe".to_string()]);

        billing
            .adjust_payment(payment.id, Adjustment::new(AdjustmentKind::Bonus, Money::from_dollars(15), "mileage"))
            .await
            .unwrap();
        let summary = billing.payroll_summary(period).await.unwrap();
        assert_eq!(summary.rows[0].final_amount, Money::from_dollars(85));
        assert_eq!(summary.rows[0].earnings, Money::from_dollars(70));
    }

    #[tokio::test]
    async fn paid_adjustment_follows_setting() {
        let (_dir, billing) = fresh_billing().await;
        let period = seeded(&billing).await;
        let id = billing.generate_payroll_payments(period).await.unwrap().created[0].id;
        billing.pay(id, date(2025, 2, 20), PaymentMethod::DirectDeposit).await.unwrap();

        storage::set_setting(&billing.pool, KEY_ALLOW_ADJUSTMENT_AFTER_PAID, &serde_json::json!(false))
            .await
            .unwrap();
        let refused = billing
            .adjust_payment(id, Adjustment::new(AdjustmentKind::Deduction, Money::from_dollars(-5), "advance"))
            .await;
        assert!(matches!(
            refused,
            Err(ServiceError::Storage(StorageError::Billing(BillingError::AdjustmentAfterPaid)))
        ));
    }

    #[tokio::test]
    async fn range_summary_filters_by_visit_date() {
        let (_dir, billing) = fresh_billing().await;
        seeded(&billing).await;
        let range = DateRange::new(date(2025, 2, 1), date(2025, 2, 5));
        let summary = billing.payroll_between(range).await.unwrap();
        assert_eq!(summary.rows[0].visits, 1);
        assert_eq!(summary.totals.total, Money::from_dollars(40));
    }

    #[tokio::test]
    async fn one_failing_clinician_does_not_stop_the_others() {
        let (_dir, billing) = fresh_billing().await;
        let period = seeded(&billing).await;
        let jane = storage::list_clinicians(&billing.pool, false).await.unwrap().remove(0);
        let mut maria = carebill_core::NewClinician::named("Maria Lopez");
        maria.pay_rate = Money::from_dollars(50);
        let maria = storage::insert_clinician(&billing.pool, &maria).await.unwrap();
        processed_sheet(&billing, period, None, Some(maria.id), vec![visit(date(2025, 2, 4), Some("P"), 30)]).await;

        sqlx::query(&format!(
            "CREATE TRIGGER jane_on_hold BEFORE INSERT ON payroll_payments WHEN NEW.clinician_id = {} \
             BEGIN SELECT RAISE(ABORT, 'bank details missing'); END",
            jane.id.0
        ))
        .execute(&billing.pool)
        .await
        .unwrap();

        let report = billing.generate_payroll_payments(period).await.unwrap();
        assert_eq!(report.created.len(), 1);
        assert_eq!(report.created[0].base.clinician_id, Some(maria.id));
        assert_eq!(report.created[0].base.amount, Money::from_dollars(25));
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].clinician_id, Some(jane.id));
        assert!(report.failures[0].reason.contains("bank details"));
    }

    #[tokio::test]
    async fn ad_hoc_payments_need_no_period() {
        let (_dir, billing) = fresh_billing().await;
        let period = seeded(&billing).await;
        let jane = storage::list_clinicians(&billing.pool, false).await.unwrap().remove(0);
        let bonus = PaymentBase {
            clinician_id: Some(jane.id),
            clinician_name: jane.name.clone(),
            clinician_title: jane.title.clone(),
            period_id: None,
            period_label: String::new(),
            amount: Money::from_dollars(120),
            hours: Decimal::ZERO,
            visits: 0,
            pay_rate: jane.pay_rate,
        };
        let recorded = billing.record_payment(bonus.clone(), "training day").await.unwrap();
        assert_eq!(recorded.base.period_id, None);
        assert_eq!(recorded.notes, "training day");
        assert_eq!(recorded.status, PaymentStatus::Pending);
        billing.record_payment(bonus.clone(), "second session").await.unwrap();

        billing.generate_payroll_payments(period).await.unwrap();
        let duplicate = billing.record_payment(PaymentBase { period_id: Some(period), ..bonus }, "").await;
        assert!(matches!(
            duplicate,
            Err(ServiceError::Storage(StorageError::DuplicatePayment { .. }))
        ));
        let all = storage::list_payments(&billing.pool, PaymentFilter::default()).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn unknown_period_is_not_found() {
        let (_dir, billing) = fresh_billing().await;
        let err = billing.payroll_summary(PeriodId(42)).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
