use std::collections::BTreeMap;

use carebill_core::invoice::format_invoice_number;
use carebill_core::{AgencyId, Invoice, InvoiceId, InvoiceStatus, LineItem, Money, PeriodId, TimesheetId};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::Serialize;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use crate::db::{parse_status, to_u32, DbPool};
use crate::error::{Result, StorageError};
use crate::timesheets::{claim_timesheets, claimed_by, release_timesheets};

/// Everything needed to persist a new draft invoice.
#[derive(Debug, Clone, PartialEq)]
pub struct NewInvoice {
    pub agency_id: AgencyId,
    pub period_id: PeriodId,
    pub timesheet_ids: Vec<TimesheetId>,
    pub line_items: Vec<LineItem>,
    pub due_date: NaiveDate,
    pub created_at: DateTime<Utc>,
}

type InvoiceRow = (
    i64,
    String,
    i64,
    i64,
    String,
    i64,
    NaiveDate,
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
    Option<i64>,
    Option<String>,
    Option<String>,
    Option<String>,
    DateTime<Utc>,
);

const INVOICE_COLUMNS: &str = "id, invoice_number, agency_id, period_id, status, adjustments_cents, due_date, \
     sent_at, paid_at, paid_amount_cents, payment_notes, notes, pdf_path, created_at";

type LineItemRow = (
    Option<i64>,
    String,
    String,
    Option<String>,
    NaiveDate,
    Option<String>,
    Option<String>,
    i64,
    Option<String>,
    String,
    i64,
    i64,
);

async fn load_line_items(conn: &mut SqliteConnection, invoice: i64) -> Result<Vec<LineItem>> {
    let rows = sqlx::query_as::<_, LineItemRow>(
        "SELECT timesheet_id, patient_name, clinician_name, clinician_title, date, time_in, time_out, \
         duration_minutes, visit_code, care_type, rate_cents, amount_cents \
         FROM invoice_line_items WHERE invoice_id = ? ORDER BY position",
    )
    .bind(invoice)
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter()
        .map(|r| {
            Ok(LineItem {
                timesheet_id: r.0.map(TimesheetId),
                patient_name: r.1,
                clinician_name: r.2,
                clinician_title: r.3,
                date: r.4,
                time_in: r.5,
                time_out: r.6,
                duration_minutes: to_u32(r.7, "duration_minutes")?,
                visit_code: r.8,
                care_type: r.9,
                rate: Money::from_cents(r.10),
                amount: Money::from_cents(r.11),
            })
        })
        .collect()
}

async fn invoice_from_row(conn: &mut SqliteConnection, r: InvoiceRow) -> Result<Invoice> {
    let line_items = load_line_items(conn, r.0).await?;
    let timesheet_ids = claimed_by(conn, InvoiceId(r.0)).await?;
    let mut invoice = Invoice::new(
        InvoiceId(r.0),
        r.1,
        AgencyId(r.2),
        PeriodId(r.3),
        timesheet_ids,
        line_items,
        r.6,
        r.13,
    )
    .with_adjustments(Money::from_cents(r.5));
    invoice.status = parse_status(&r.4)?;
    invoice.sent_at = r.7;
    invoice.paid_at = r.8;
    invoice.paid_amount = r.9.map(Money::from_cents);
    invoice.payment_notes = r.10;
    invoice.notes = r.11;
    invoice.pdf_path = r.12;
    Ok(invoice)
}

async fn find_in(conn: &mut SqliteConnection, id: InvoiceId) -> Result<Option<Invoice>> {
    let row = sqlx::query_as::<_, InvoiceRow>(&format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE id = ?"))
        .bind(id.0)
        .fetch_optional(&mut *conn)
        .await?;
    match row {
        Some(r) => Ok(Some(invoice_from_row(conn, r).await?)),
        None => Ok(None),
    }
}

/// Allocates the next invoice number, stores the draft with its line items and
/// claims every listed timesheet, all in one transaction.
///
/// If any timesheet is already held by another invoice nothing is written and
/// [`StorageError::ClaimConflict`] is returned.
pub async fn insert_invoice_claiming(pool: &DbPool, new: &NewInvoice) -> Result<Invoice> {
    let mut tx = pool.begin().await?;

    let sequence = sqlx::query_scalar::<_, i64>(
        "UPDATE invoice_sequence SET last_value = last_value + 1 WHERE id = 1 RETURNING last_value",
    )
    .fetch_one(&mut *tx)
    .await?;
    let number = format_invoice_number(new.created_at.year(), sequence.unsigned_abs());

    // Build the draft first so totals come from the domain type.
    let draft = Invoice::new(
        InvoiceId(0),
        number,
        new.agency_id,
        new.period_id,
        new.timesheet_ids.clone(),
        new.line_items.clone(),
        new.due_date,
        new.created_at,
    );

    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO invoices (invoice_number, agency_id, period_id, status, adjustments_cents, subtotal_cents, \
         total_cents, due_date, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(&draft.number)
    .bind(draft.agency_id.0)
    .bind(draft.period_id.0)
    .bind(draft.status.to_string())
    .bind(draft.adjustments().to_cents())
    .bind(draft.subtotal().to_cents())
    .bind(draft.total().to_cents())
    .bind(draft.due_date)
    .bind(draft.created_at)
    .fetch_one(&mut *tx)
    .await?;

    for (position, item) in draft.line_items().iter().enumerate() {
        sqlx::query(
            "INSERT INTO invoice_line_items (invoice_id, position, timesheet_id, patient_name, clinician_name, \
             clinician_title, date, time_in, time_out, duration_minutes, visit_code, care_type, rate_cents, \
             amount_cents) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(position as i64)
        .bind(item.timesheet_id.map(|t| t.0))
        .bind(&item.patient_name)
        .bind(&item.clinician_name)
        .bind(&item.clinician_title)
        .bind(item.date)
        .bind(&item.time_in)
        .bind(&item.time_out)
        .bind(i64::from(item.duration_minutes))
        .bind(&item.visit_code)
        .bind(&item.care_type)
        .bind(item.rate.to_cents())
        .bind(item.amount.to_cents())
        .execute(&mut *tx)
        .await?;
    }

    let wanted = new.timesheet_ids.len();
    let claimed = claim_timesheets(&mut tx, InvoiceId(id), &new.timesheet_ids).await?;
    if claimed != wanted as u64 {
        // Dropping the transaction rolls back the number, the invoice and any partial claim.
        return Err(StorageError::ClaimConflict { wanted, claimed });
    }

    let invoice = find_in(&mut tx, InvoiceId(id))
        .await?
        .ok_or(StorageError::NotFound { entity: "invoice", id })?;
    tx.commit().await?;
    Ok(invoice)
}

pub async fn get_invoice(pool: &DbPool, id: InvoiceId) -> Result<Option<Invoice>> {
    let mut conn = pool.acquire().await?;
    find_in(&mut conn, id).await
}

pub async fn require_invoice(pool: &DbPool, id: InvoiceId) -> Result<Invoice> {
    get_invoice(pool, id)
        .await?
        .ok_or(StorageError::NotFound { entity: "invoice", id: id.0 })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvoiceFilter {
    pub period_id: Option<PeriodId>,
    pub agency_id: Option<AgencyId>,
    pub status: Option<InvoiceStatus>,
}

/// Newest first.
pub async fn list_invoices(pool: &DbPool, filter: InvoiceFilter) -> Result<Vec<Invoice>> {
    let mut conn = pool.acquire().await?;
    let mut query: QueryBuilder<'_, Sqlite> = QueryBuilder::new("SELECT ");
    query.push(INVOICE_COLUMNS).push(" FROM invoices WHERE 1 = 1");
    if let Some(period) = filter.period_id {
        query.push(" AND period_id = ").push_bind(period.0);
    }
    if let Some(agency) = filter.agency_id {
        query.push(" AND agency_id = ").push_bind(agency.0);
    }
    if let Some(status) = filter.status {
        query.push(" AND status = ").push_bind(status.to_string());
    }
    query.push(" ORDER BY created_at DESC, id DESC");

    let rows = query.build_query_as::<InvoiceRow>().fetch_all(&mut *conn).await?;
    let mut invoices = Vec::with_capacity(rows.len());
    for r in rows {
        invoices.push(invoice_from_row(&mut conn, r).await?);
    }
    Ok(invoices)
}

/// Persists status, payment, adjustment and artifact fields. Line items are
/// immutable once stored and are not rewritten.
pub async fn save_invoice(pool: &DbPool, invoice: &Invoice) -> Result<()> {
    let done = sqlx::query(
        "UPDATE invoices SET status = ?, adjustments_cents = ?, subtotal_cents = ?, total_cents = ?, \
         sent_at = ?, paid_at = ?, paid_amount_cents = ?, payment_notes = ?, notes = ?, pdf_path = ? \
         WHERE id = ?",
    )
    .bind(invoice.status.to_string())
    .bind(invoice.adjustments().to_cents())
    .bind(invoice.subtotal().to_cents())
    .bind(invoice.total().to_cents())
    .bind(invoice.sent_at)
    .bind(invoice.paid_at)
    .bind(invoice.paid_amount.map(Money::to_cents))
    .bind(&invoice.payment_notes)
    .bind(&invoice.notes)
    .bind(&invoice.pdf_path)
    .bind(invoice.id.0)
    .execute(pool)
    .await?;
    if done.rows_affected() == 0 {
        return Err(StorageError::NotFound {
            entity: "invoice",
            id: invoice.id.0,
        });
    }
    Ok(())
}

/// What a deletion left behind for the caller to clean up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeletedInvoice {
    pub released: Vec<TimesheetId>,
    pub pdf_path: Option<String>,
}

/// Removes the invoice and its line items and releases its timesheets back to
/// `processed`. Callers decide whether deletion is allowed.
pub async fn delete_invoice(pool: &DbPool, id: InvoiceId) -> Result<DeletedInvoice> {
    let mut tx = pool.begin().await?;
    let pdf_path = sqlx::query_scalar::<_, Option<String>>("SELECT pdf_path FROM invoices WHERE id = ?")
        .bind(id.0)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StorageError::NotFound { entity: "invoice", id: id.0 })?;

    let released = release_timesheets(&mut tx, id).await?;
    sqlx::query("DELETE FROM invoices WHERE id = ?")
        .bind(id.0)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    tracing::info!(invoice = id.0, released = released.len(), "Deleted invoice");
    Ok(DeletedInvoice { released, pdf_path })
}

/// sent → overdue for every invoice whose due date is before `today`.
pub async fn mark_overdue_invoices(pool: &DbPool, today: NaiveDate) -> Result<u64> {
    let done = sqlx::query("UPDATE invoices SET status = 'overdue' WHERE status = 'sent' AND due_date < ?")
        .bind(today)
        .execute(pool)
        .await?;
    Ok(done.rows_affected())
}

pub async fn count_invoices_for_period(pool: &DbPool, period: PeriodId) -> Result<i64> {
    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM invoices WHERE period_id = ?")
        .bind(period.0)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusTotals {
    pub count: u32,
    pub total: Money,
}

/// Dashboard roll-up of invoices by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InvoiceSummary {
    pub by_status: BTreeMap<String, StatusTotals>,
    /// Sent plus overdue.
    pub outstanding: Money,
    pub collected: Money,
}

pub async fn invoice_summary(pool: &DbPool) -> Result<InvoiceSummary> {
    let rows = sqlx::query_as::<_, (String, i64, i64, i64)>(
        "SELECT status, COUNT(*), COALESCE(SUM(total_cents), 0), \
         COALESCE(SUM(COALESCE(paid_amount_cents, total_cents)), 0) FROM invoices GROUP BY status",
    )
    .fetch_all(pool)
    .await?;

    let mut summary = InvoiceSummary::default();
    for (status, count, total_cents, paid_cents) in rows {
        let parsed: InvoiceStatus = parse_status(&status)?;
        let total = Money::from_cents(total_cents);
        match parsed {
            InvoiceStatus::Sent | InvoiceStatus::Overdue => summary.outstanding += total,
            InvoiceStatus::Paid => summary.collected += Money::from_cents(paid_cents),
            InvoiceStatus::Draft | InvoiceStatus::Void => {}
        }
        summary.by_status.insert(
            status,
            StatusTotals {
                count: to_u32(count, "count")?,
                total,
            },
        );
    }
    Ok(summary)
}
