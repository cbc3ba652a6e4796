use carebill_core::period::{CycleConfig, PeriodStatus};
use carebill_core::{BillingPeriod, BillingSettings, DateRange, PeriodId};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::SqliteConnection;

use crate::db::{parse_status, DbPool};
use crate::error::{is_unique_violation, Result, StorageError};

type PeriodRow = (i64, NaiveDate, NaiveDate, String, String, bool, Option<DateTime<Utc>>);

const PERIOD_COLUMNS: &str = "id, start_date, end_date, label, status, invoices_generated, closed_at";

fn period_from_row(r: PeriodRow) -> Result<BillingPeriod> {
    Ok(BillingPeriod {
        id: PeriodId(r.0),
        range: DateRange::new(r.1, r.2),
        label: r.3,
        status: parse_status(&r.4)?,
        invoices_generated: r.5,
        closed_at: r.6,
    })
}

pub async fn get_period(pool: &DbPool, id: PeriodId) -> Result<Option<BillingPeriod>> {
    let row = sqlx::query_as::<_, PeriodRow>(&format!(
        "SELECT {PERIOD_COLUMNS} FROM billing_periods WHERE id = ?"
    ))
    .bind(id.0)
    .fetch_optional(pool)
    .await?;
    row.map(period_from_row).transpose()
}

/// Newest first.
pub async fn list_periods(pool: &DbPool) -> Result<Vec<BillingPeriod>> {
    let rows = sqlx::query_as::<_, PeriodRow>(&format!(
        "SELECT {PERIOD_COLUMNS} FROM billing_periods ORDER BY start_date DESC"
    ))
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(period_from_row).collect()
}

/// Stored periods that share at least one day with `range`, oldest first.
pub async fn periods_overlapping(pool: &DbPool, range: DateRange) -> Result<Vec<BillingPeriod>> {
    let rows = sqlx::query_as::<_, PeriodRow>(&format!(
        "SELECT {PERIOD_COLUMNS} FROM billing_periods WHERE start_date <= ? AND end_date >= ? ORDER BY start_date"
    ))
    .bind(range.end)
    .bind(range.start)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(period_from_row).collect()
}

pub async fn open_period(pool: &DbPool) -> Result<Option<BillingPeriod>> {
    let row = sqlx::query_as::<_, PeriodRow>(&format!(
        "SELECT {PERIOD_COLUMNS} FROM billing_periods WHERE status = 'open'"
    ))
    .fetch_optional(pool)
    .await?;
    row.map(period_from_row).transpose()
}

/// Periods still open after their last day.
pub async fn ended_open_periods(pool: &DbPool, today: NaiveDate) -> Result<Vec<BillingPeriod>> {
    let rows = sqlx::query_as::<_, PeriodRow>(&format!(
        "SELECT {PERIOD_COLUMNS} FROM billing_periods \
         WHERE status = 'open' AND end_date < ? AND invoices_generated = 0 ORDER BY start_date"
    ))
    .bind(today)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(period_from_row).collect()
}

async fn find_by_range(conn: &mut SqliteConnection, range: DateRange) -> Result<Option<BillingPeriod>> {
    let row = sqlx::query_as::<_, PeriodRow>(&format!(
        "SELECT {PERIOD_COLUMNS} FROM billing_periods WHERE start_date = ? AND end_date = ?"
    ))
    .bind(range.start)
    .bind(range.end)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(period_from_row).transpose()
}

async fn insert_open(conn: &mut SqliteConnection, range: DateRange) -> std::result::Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        "INSERT INTO billing_periods (start_date, end_date, label, status) VALUES (?, ?, ?, 'open') RETURNING id",
    )
    .bind(range.start)
    .bind(range.end)
    .bind(range.label())
    .fetch_one(&mut *conn)
    .await
}

/// The open period, creating it from the cycle rules when none exists.
///
/// If the period containing `today` was already closed early, the next
/// unused period becomes the open one.
pub async fn current_open_period(
    pool: &DbPool,
    settings: &BillingSettings,
    today: NaiveDate,
) -> Result<BillingPeriod> {
    if let Some(period) = open_period(pool).await? {
        return Ok(period);
    }

    let cycle = settings.cycle_config(today)?;
    let mut conn = pool.acquire().await?;
    let mut range = cycle.period_for(today);
    while let Some(existing) = find_by_range(&mut conn, range).await? {
        if existing.status == PeriodStatus::Open {
            return Ok(existing);
        }
        range = cycle.next_after(range);
    }

    match insert_open(&mut conn, range).await {
        Ok(id) => {
            tracing::info!(period = %range.label(), "Opened billing period");
            drop(conn);
            get_period(pool, PeriodId(id))
                .await?
                .ok_or(StorageError::NotFound { entity: "billing period", id })
        }
        // Another caller opened one first.
        Err(e) if is_unique_violation(&e) => {
            drop(conn);
            open_period(pool)
                .await?
                .ok_or_else(|| StorageError::Corrupt("open period vanished after conflict".into()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Closes period `id` and opens the one after it in a single transaction, so
/// there is never more than one open period and never a gap.
pub async fn roll_period(
    pool: &DbPool,
    id: PeriodId,
    settings: &BillingSettings,
    at: DateTime<Utc>,
) -> Result<(BillingPeriod, BillingPeriod)> {
    let mut tx = pool.begin().await?;
    let mut period = find_in(&mut tx, id)
        .await?
        .ok_or(StorageError::NotFound { entity: "billing period", id: id.0 })?;
    period.close(at)?;
    sqlx::query("UPDATE billing_periods SET status = 'closed', closed_at = ? WHERE id = ?")
        .bind(at)
        .bind(id.0)
        .execute(&mut *tx)
        .await?;

    let first_day = period.range.end.succ_opt().unwrap_or(period.range.end);
    let anchor = settings.billing_cycle_start.unwrap_or(first_day);
    let cycle = CycleConfig::new(anchor, settings.cycle_length, settings.cycle_start_day)?;
    let next_range = cycle.period_for(first_day);

    let next = match find_by_range(&mut tx, next_range).await? {
        Some(existing) if existing.status == PeriodStatus::Open => existing,
        Some(existing) => {
            sqlx::query("UPDATE billing_periods SET status = 'open', closed_at = NULL WHERE id = ?")
                .bind(existing.id.0)
                .execute(&mut *tx)
                .await?;
            BillingPeriod {
                status: PeriodStatus::Open,
                closed_at: None,
                ..existing
            }
        }
        None => {
            let next_id = insert_open(&mut tx, next_range).await?;
            find_in(&mut tx, PeriodId(next_id))
                .await?
                .ok_or(StorageError::NotFound { entity: "billing period", id: next_id })?
        }
    };
    tx.commit().await?;

    tracing::info!(closed = %period.label, opened = %next.label, "Rolled billing period");
    Ok((period, next))
}

async fn find_in(conn: &mut SqliteConnection, id: PeriodId) -> Result<Option<BillingPeriod>> {
    let row = sqlx::query_as::<_, PeriodRow>(&format!(
        "SELECT {PERIOD_COLUMNS} FROM billing_periods WHERE id = ?"
    ))
    .bind(id.0)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(period_from_row).transpose()
}

/// open/closed → invoiced. Fails if the period is already invoiced.
pub async fn mark_period_invoiced(pool: &DbPool, id: PeriodId, at: DateTime<Utc>) -> Result<BillingPeriod> {
    let mut period = get_period(pool, id)
        .await?
        .ok_or(StorageError::NotFound { entity: "billing period", id: id.0 })?;
    period.mark_invoiced(at)?;
    sqlx::query(
        "UPDATE billing_periods SET status = 'invoiced', invoices_generated = 1, \
         closed_at = COALESCE(closed_at, ?) WHERE id = ?",
    )
    .bind(at)
    .bind(id.0)
    .execute(pool)
    .await?;
    Ok(period)
}
