use std::collections::BTreeMap;

use carebill_core::{
    Agency, AgencyId, BillingPeriod, Invoice, InvoiceId, InvoiceStatus, Money, PeriodId, PeriodStatus,
    TimesheetStatus,
};
use carebill_storage as storage;
use carebill_storage::{DeletedInvoice, NewInvoice, StorageError};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::engine::{build_invoice_drafts, is_invoiceable, InvoiceDraft};
use crate::error::Result;
use crate::render::InvoiceDocument;
use crate::service::Billing;

/// Why a generation run created nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    PeriodNotFound,
    AlreadyInvoiced,
    NoBillableTimesheets,
}

/// One agency whose invoice could not be stored. The rest of the run goes on.
#[derive(Debug, Clone, Serialize)]
pub struct AgencyFailure {
    pub agency_id: AgencyId,
    pub agency_name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationReport {
    pub period_id: PeriodId,
    pub created: Vec<Invoice>,
    pub skipped: Option<SkipReason>,
    pub failures: Vec<AgencyFailure>,
}

impl GenerationReport {
    fn skipped(period_id: PeriodId, reason: SkipReason) -> Self {
        Self { period_id, created: Vec::new(), skipped: Some(reason), failures: Vec::new() }
    }

    pub fn total_billed(&self) -> Money {
        self.created.iter().map(Invoice::total).sum()
    }
}

const BILLABLE: [TimesheetStatus; 2] = [TimesheetStatus::Processed, TimesheetStatus::Reviewed];

impl Billing {
    async fn agencies_by_id(&self) -> Result<BTreeMap<AgencyId, Agency>> {
        Ok(storage::list_agencies(&self.pool, true)
            .await?
            .into_iter()
            .map(|a| (a.id, a))
            .collect())
    }

    async fn require_period(&self, id: PeriodId) -> Result<BillingPeriod> {
        Ok(storage::get_period(&self.pool, id)
            .await?
            .ok_or(StorageError::NotFound { entity: "billing period", id: id.0 })?)
    }

    /// Creates one draft invoice per agency for the period's unclaimed
    /// billable timesheets, then marks the period invoiced.
    ///
    /// Runs for the same period are serialized; a repeat run creates nothing.
    pub async fn generate_invoices(&self, period_id: PeriodId, now: DateTime<Utc>) -> Result<GenerationReport> {
        let _guard = self.lock_period(period_id).await;

        let Some(period) = storage::get_period(&self.pool, period_id).await? else {
            return Ok(GenerationReport::skipped(period_id, SkipReason::PeriodNotFound));
        };
        if period.status == PeriodStatus::Invoiced {
            tracing::info!(period = %period.label, "Invoices already generated");
            return Ok(GenerationReport::skipped(period_id, SkipReason::AlreadyInvoiced));
        }

        let settings = storage::load_settings(&self.pool).await?;
        let timesheets = storage::list_timesheets(&self.pool, period_id, &BILLABLE).await?;
        let agencies = self.agencies_by_id().await?;
        let drafts = build_invoice_drafts(
            timesheets.iter().filter(|t| is_invoiceable(t)),
            &agencies,
            settings.default_billing_rate,
            now.date_naive(),
        );
        if drafts.is_empty() {
            tracing::info!(period = %period.label, "No billable timesheets");
            return Ok(GenerationReport::skipped(period_id, SkipReason::NoBillableTimesheets));
        }

        let mut report = GenerationReport { period_id, created: Vec::new(), skipped: None, failures: Vec::new() };
        for draft in drafts {
            let new = NewInvoice {
                agency_id: draft.agency_id,
                period_id,
                timesheet_ids: draft.timesheet_ids,
                line_items: draft.line_items,
                due_date: draft.due_date,
                created_at: now,
            };
            let mut invoice = match storage::insert_invoice_claiming(&self.pool, &new).await {
                Ok(invoice) => invoice,
                Err(e) => {
                    tracing::warn!(agency = %draft.agency_name, error = %e, "Invoice not created");
                    report.failures.push(AgencyFailure {
                        agency_id: draft.agency_id,
                        agency_name: draft.agency_name,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let artifact = match agencies.get(&invoice.agency_id) {
                Some(agency) => {
                    let document = InvoiceDocument {
                        invoice: &invoice,
                        agency,
                        period: &period,
                        biller_name: &settings.biller_name,
                    };
                    self.renderer.render(document).unwrap_or_else(|e| {
                        tracing::warn!(invoice = %invoice.number, error = %e, "Invoice document not produced");
                        None
                    })
                }
                None => None,
            };
            if let Some(artifact) = artifact {
                self.attach_artifact(&mut invoice, artifact).await;
            }

            tracing::info!(
                invoice = %invoice.number,
                agency = %draft.agency_name,
                total = %invoice.total(),
                "Created invoice"
            );
            report.created.push(invoice);
        }

        if !report.created.is_empty() {
            storage::mark_period_invoiced(&self.pool, period_id, now).await?;
        }
        Ok(report)
    }

    /// Records the artifact on a stored invoice. If that fails the invoice
    /// stays without one and the artifact is removed.
    async fn attach_artifact(&self, invoice: &mut Invoice, artifact: String) {
        invoice.pdf_path = Some(artifact);
        if let Err(e) = storage::save_invoice(&self.pool, invoice).await {
            tracing::warn!(invoice = %invoice.number, error = %e, "Artifact not recorded");
            if let Some(orphan) = invoice.pdf_path.take() {
                if let Err(e) = self.renderer.discard(&orphan) {
                    tracing::warn!(invoice = %invoice.number, artifact = %orphan, error = %e, "Artifact not removed");
                }
            }
        }
    }

    /// What generation would bill for the period, without writing anything.
    /// Timesheets already on an invoice are included.
    pub async fn preview_invoices(&self, period_id: PeriodId, today: NaiveDate) -> Result<Vec<InvoiceDraft>> {
        self.require_period(period_id).await?;
        let settings = storage::load_settings(&self.pool).await?;
        let timesheets = storage::list_timesheets(
            &self.pool,
            period_id,
            &[TimesheetStatus::Processed, TimesheetStatus::Reviewed, TimesheetStatus::Invoiced],
        )
        .await?;
        let agencies = self.agencies_by_id().await?;
        Ok(build_invoice_drafts(&timesheets, &agencies, settings.default_billing_rate, today))
    }

    /// draft → sent, delivering through the configured mailer.
    ///
    /// Without a mailer the invoice is only marked sent. A failed delivery
    /// leaves the invoice as it was.
    pub async fn send_invoice(&self, id: InvoiceId, now: DateTime<Utc>) -> Result<Invoice> {
        let invoice = storage::require_invoice(&self.pool, id).await?;
        let mut sent = invoice.clone();
        sent.send(now)?;

        match &self.mailer {
            Some(mailer) => {
                let agency = storage::require_agency(&self.pool, invoice.agency_id).await?;
                let period = self.require_period(invoice.period_id).await?;
                let settings = storage::load_settings(&self.pool).await?;
                let document = InvoiceDocument {
                    invoice: &invoice,
                    agency: &agency,
                    period: &period,
                    biller_name: &settings.biller_name,
                };
                mailer.deliver(document, invoice.pdf_path.as_deref())?;
                tracing::info!(invoice = %invoice.number, agency = %agency.name, "Invoice delivered");
            }
            None => tracing::info!(invoice = %invoice.number, "No mailer configured, marking sent only"),
        }

        storage::save_invoice(&self.pool, &sent).await?;
        Ok(sent)
    }

    /// draft → sent without delivering anything.
    pub async fn mark_invoice_sent(&self, id: InvoiceId, now: DateTime<Utc>) -> Result<Invoice> {
        let mut invoice = storage::require_invoice(&self.pool, id).await?;
        invoice.send(now)?;
        storage::save_invoice(&self.pool, &invoice).await?;
        Ok(invoice)
    }

    pub async fn mark_invoice_paid(
        &self,
        id: InvoiceId,
        at: DateTime<Utc>,
        amount: Option<Money>,
        notes: Option<String>,
    ) -> Result<Invoice> {
        let mut invoice = storage::require_invoice(&self.pool, id).await?;
        invoice.mark_paid(at, amount, notes)?;
        storage::save_invoice(&self.pool, &invoice).await?;
        tracing::info!(invoice = %invoice.number, "Invoice paid");
        Ok(invoice)
    }

    pub async fn void_invoice(&self, id: InvoiceId) -> Result<Invoice> {
        let mut invoice = storage::require_invoice(&self.pool, id).await?;
        invoice.void()?;
        storage::save_invoice(&self.pool, &invoice).await?;
        tracing::info!(invoice = %invoice.number, "Invoice voided");
        Ok(invoice)
    }

    /// Adds a signed adjustment; the total follows.
    pub async fn adjust_invoice(&self, id: InvoiceId, delta: Money, note: Option<String>) -> Result<Invoice> {
        let mut invoice = storage::require_invoice(&self.pool, id).await?;
        invoice.adjust(delta)?;
        if let Some(note) = note {
            invoice.notes = Some(match invoice.notes.take() {
                Some(existing) => format!("{existing}\n{note}"),
                None => note,
            });
        }
        storage::save_invoice(&self.pool, &invoice).await?;
        Ok(invoice)
    }

    /// Deletes an invoice and returns its timesheets to `processed`.
    /// Anything past draft needs `force`.
    pub async fn delete_invoice(&self, id: InvoiceId, force: bool) -> Result<DeletedInvoice> {
        let invoice = storage::require_invoice(&self.pool, id).await?;
        invoice.check_delete(force)?;
        let deleted = storage::delete_invoice(&self.pool, id).await?;
        if let Some(artifact) = &deleted.pdf_path {
            if let Err(e) = self.renderer.discard(artifact) {
                tracing::warn!(invoice = %invoice.number, artifact = %artifact, error = %e, "Artifact not removed");
            }
        }
        Ok(deleted)
    }

    /// sent → overdue for every invoice past its due date.
    pub async fn sweep_overdue(&self, today: NaiveDate) -> Result<u64> {
        let marked = storage::mark_overdue_invoices(&self.pool, today).await?;
        if marked > 0 {
            tracing::info!(marked, "Marked invoices overdue");
        }
        Ok(marked)
    }

    pub async fn invoices_for_status(&self, status: InvoiceStatus) -> Result<Vec<Invoice>> {
        Ok(storage::list_invoices(
            &self.pool,
            storage::InvoiceFilter { status: Some(status), ..Default::default() },
        )
        .await?)
    }
}
