use carebill_core::{BillingPeriod, BillingSettings, PeriodId};
use carebill_storage as storage;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::invoices::GenerationReport;
use crate::service::Billing;

#[derive(Debug, Clone, Serialize)]
pub struct RolledPeriod {
    pub closed: String,
    pub opened: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeriodFailure {
    pub period_id: PeriodId,
    pub label: String,
    pub reason: String,
}

/// Outcome of one scheduled pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub rolled: Vec<RolledPeriod>,
    pub generated: Vec<GenerationReport>,
    pub failures: Vec<PeriodFailure>,
    pub overdue_marked: u64,
}

impl Billing {
    /// One scheduled pass over the billing calendar.
    ///
    /// With automatic invoicing on, every open period that has ended is
    /// rolled over (when automatic periods are on) and invoiced. The overdue
    /// sweep always runs. A failing period is reported and the pass goes on.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<CycleReport> {
        let today = now.date_naive();
        let settings = storage::load_settings(&self.pool).await?;
        let mut report = CycleReport::default();

        if settings.auto_generate_invoices {
            for period in storage::ended_open_periods(&self.pool, today).await? {
                if let Err(e) = self.close_and_invoice(&period, &settings, now, &mut report).await {
                    tracing::warn!(period = %period.label, error = %e, "Billing cycle step failed");
                    report.failures.push(PeriodFailure {
                        period_id: period.id,
                        label: period.label.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        } else {
            tracing::debug!("Automatic invoicing disabled");
        }

        if settings.auto_generate_periods {
            storage::current_open_period(&self.pool, &settings, today).await?;
        }

        report.overdue_marked = self.sweep_overdue(today).await?;
        tracing::info!(
            rolled = report.rolled.len(),
            invoiced = report.generated.iter().map(|g| g.created.len()).sum::<usize>(),
            overdue = report.overdue_marked,
            "Billing cycle complete"
        );
        Ok(report)
    }

    async fn close_and_invoice(
        &self,
        period: &BillingPeriod,
        settings: &BillingSettings,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Result<()> {
        if settings.auto_generate_periods {
            let (closed, opened) = storage::roll_period(&self.pool, period.id, settings, now).await?;
            report.rolled.push(RolledPeriod { closed: closed.label, opened: opened.label });
        }
        let generated = self.generate_invoices(period.id, now).await?;
        report.generated.push(generated);
        Ok(())
    }
}
