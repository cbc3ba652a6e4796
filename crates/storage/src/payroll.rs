use carebill_core::entity::name_key;
use carebill_core::payroll::{Adjustment, AdjustmentPolicy, PaymentMethod, PaymentStatus};
use carebill_core::{ClinicianId, Money, PaymentBase, PaymentId, PayrollPayment, PeriodId};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use crate::db::{parse_status, to_u32, DbPool};
use crate::error::{Result, StorageError};

type PaymentRow = (
    i64,
    Option<i64>,
    String,
    Option<String>,
    Option<i64>,
    String,
    i64,
    String,
    i64,
    i64,
    String,
    Option<NaiveDate>,
    String,
    String,
);

const PAYMENT_COLUMNS: &str = "id, clinician_id, clinician_name, clinician_title, period_id, period_label, \
     amount_cents, hours, visits, pay_rate_cents, status, paid_date, payment_method, notes";

async fn load_adjustments(conn: &mut SqliteConnection, payment: i64) -> Result<Vec<Adjustment>> {
    let rows = sqlx::query_as::<_, (String, i64, String)>(
        "SELECT kind, amount_cents, reason FROM payroll_adjustments WHERE payment_id = ? ORDER BY position",
    )
    .bind(payment)
    .fetch_all(&mut *conn)
    .await?;
    rows.into_iter()
        .map(|(kind, cents, reason)| Ok(Adjustment::new(parse_status(&kind)?, Money::from_cents(cents), reason)))
        .collect()
}

async fn payment_from_row(conn: &mut SqliteConnection, r: PaymentRow) -> Result<PayrollPayment> {
    let hours: Decimal = r
        .7
        .parse()
        .map_err(|_| StorageError::Corrupt(format!("payroll hours '{}'", r.7)))?;
    let base = PaymentBase {
        clinician_id: r.1.map(ClinicianId),
        clinician_name: r.2,
        clinician_title: r.3,
        period_id: r.4.map(PeriodId),
        period_label: r.5,
        amount: Money::from_cents(r.6),
        hours,
        visits: to_u32(r.8, "visits")?,
        pay_rate: Money::from_cents(r.9),
    };
    let adjustments = load_adjustments(conn, r.0).await?;
    let mut payment = PayrollPayment::new(PaymentId(r.0), base).with_adjustments(adjustments);
    payment.status = parse_status::<PaymentStatus>(&r.10)?;
    payment.paid_date = r.11;
    payment.payment_method = parse_status::<PaymentMethod>(&r.12)?;
    payment.notes = r.13;
    Ok(payment)
}

async fn find_in(conn: &mut SqliteConnection, id: PaymentId) -> Result<Option<PayrollPayment>> {
    let row = sqlx::query_as::<_, PaymentRow>(&format!(
        "SELECT {PAYMENT_COLUMNS} FROM payroll_payments WHERE id = ?"
    ))
    .bind(id.0)
    .fetch_optional(&mut *conn)
    .await?;
    match row {
        Some(r) => Ok(Some(payment_from_row(conn, r).await?)),
        None => Ok(None),
    }
}

pub async fn insert_payment(pool: &DbPool, base: &PaymentBase, notes: &str) -> Result<PayrollPayment> {
    let mut conn = pool.acquire().await?;
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO payroll_payments (clinician_id, clinician_name, clinician_key, clinician_title, period_id, \
         period_label, amount_cents, hours, visits, pay_rate_cents, total_amount_cents, notes) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(base.clinician_id.map(|c| c.0))
    .bind(base.clinician_name.trim())
    .bind(name_key(&base.clinician_name))
    .bind(&base.clinician_title)
    .bind(base.period_id.map(|p| p.0))
    .bind(&base.period_label)
    .bind(base.amount.to_cents())
    .bind(base.hours.to_string())
    .bind(i64::from(base.visits))
    .bind(base.pay_rate.to_cents())
    .bind(base.amount.to_cents())
    .bind(notes)
    .fetch_one(&mut *conn)
    .await?;
    find_in(&mut conn, PaymentId(id))
        .await?
        .ok_or(StorageError::NotFound { entity: "payroll payment", id })
}

pub async fn get_payment(pool: &DbPool, id: PaymentId) -> Result<Option<PayrollPayment>> {
    let mut conn = pool.acquire().await?;
    find_in(&mut conn, id).await
}

pub async fn require_payment(pool: &DbPool, id: PaymentId) -> Result<PayrollPayment> {
    get_payment(pool, id).await?.ok_or(StorageError::NotFound {
        entity: "payroll payment",
        id: id.0,
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PaymentFilter {
    pub period_id: Option<PeriodId>,
    pub clinician_id: Option<ClinicianId>,
    pub status: Option<PaymentStatus>,
}

/// Ordered by clinician name.
pub async fn list_payments(pool: &DbPool, filter: PaymentFilter) -> Result<Vec<PayrollPayment>> {
    let mut conn = pool.acquire().await?;
    let mut query: QueryBuilder<'_, Sqlite> = QueryBuilder::new("SELECT ");
    query.push(PAYMENT_COLUMNS).push(" FROM payroll_payments WHERE 1 = 1");
    if let Some(period) = filter.period_id {
        query.push(" AND period_id = ").push_bind(period.0);
    }
    if let Some(clinician) = filter.clinician_id {
        query.push(" AND clinician_id = ").push_bind(clinician.0);
    }
    if let Some(status) = filter.status {
        query.push(" AND status = ").push_bind(status.to_string());
    }
    query.push(" ORDER BY clinician_name, id");

    let rows = query.build_query_as::<PaymentRow>().fetch_all(&mut *conn).await?;
    let mut payments = Vec::with_capacity(rows.len());
    for r in rows {
        payments.push(payment_from_row(&mut conn, r).await?);
    }
    Ok(payments)
}

/// The payment already recorded for this clinician in `period`, matched by id
/// when known and otherwise by name.
pub async fn find_payment_for(
    pool: &DbPool,
    period: PeriodId,
    clinician_id: Option<ClinicianId>,
    clinician_name: &str,
) -> Result<Option<PayrollPayment>> {
    let mut conn = pool.acquire().await?;
    let row = match clinician_id {
        Some(id) => {
            sqlx::query_as::<_, PaymentRow>(&format!(
                "SELECT {PAYMENT_COLUMNS} FROM payroll_payments WHERE period_id = ? AND clinician_id = ? \
                 ORDER BY id LIMIT 1"
            ))
            .bind(period.0)
            .bind(id.0)
            .fetch_optional(&mut *conn)
            .await?
        }
        None => {
            sqlx::query_as::<_, PaymentRow>(&format!(
                "SELECT {PAYMENT_COLUMNS} FROM payroll_payments WHERE period_id = ? AND clinician_id IS NULL \
                 AND clinician_key = ? ORDER BY id LIMIT 1"
            ))
            .bind(period.0)
            .bind(name_key(clinician_name))
            .fetch_optional(&mut *conn)
            .await?
        }
    };
    match row {
        Some(r) => Ok(Some(payment_from_row(&mut conn, r).await?)),
        None => Ok(None),
    }
}

/// Appends an adjustment and stores the recomputed total.
pub async fn add_payment_adjustment(
    pool: &DbPool,
    id: PaymentId,
    adjustment: Adjustment,
    policy: AdjustmentPolicy,
) -> Result<PayrollPayment> {
    let mut tx = pool.begin().await?;
    let mut payment = find_in(&mut tx, id).await?.ok_or(StorageError::NotFound {
        entity: "payroll payment",
        id: id.0,
    })?;
    payment.add_adjustment(adjustment.clone(), policy)?;

    sqlx::query(
        "INSERT INTO payroll_adjustments (payment_id, position, kind, amount_cents, reason) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(id.0)
    .bind(payment.adjustments().len() as i64 - 1)
    .bind(adjustment.kind.to_string())
    .bind(adjustment.amount.to_cents())
    .bind(&adjustment.reason)
    .execute(&mut *tx)
    .await?;
    sqlx::query("UPDATE payroll_payments SET total_amount_cents = ? WHERE id = ?")
        .bind(payment.total_amount().to_cents())
        .bind(id.0)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(payment)
}

pub async fn mark_payment_paid(
    pool: &DbPool,
    id: PaymentId,
    date: NaiveDate,
    method: PaymentMethod,
) -> Result<PayrollPayment> {
    let mut payment = require_payment(pool, id).await?;
    payment.mark_paid(date, method)?;
    sqlx::query("UPDATE payroll_payments SET status = 'paid', paid_date = ?, payment_method = ? WHERE id = ?")
        .bind(date)
        .bind(method.to_string())
        .bind(id.0)
        .execute(pool)
        .await?;
    Ok(payment)
}

/// Only pending payments may be deleted.
pub async fn delete_payment(pool: &DbPool, id: PaymentId) -> Result<()> {
    let payment = require_payment(pool, id).await?;
    payment.check_delete()?;
    sqlx::query("DELETE FROM payroll_payments WHERE id = ? AND status = 'pending'")
        .bind(id.0)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::fresh_db;
    use carebill_core::payroll::AdjustmentKind;
    use carebill_core::BillingError;

    fn base(name: &str, cents: i64) -> PaymentBase {
        PaymentBase {
            clinician_id: None,
            clinician_name: name.to_string(),
            clinician_title: Some("PTA".into()),
            period_id: None,
            period_label: String::new(),
            amount: Money::from_cents(cents),
            hours: Decimal::new(175, 2),
            visits: 2,
            pay_rate: Money::from_dollars(40),
        }
    }

    #[tokio::test]
    async fn adjustments_persist_in_order() {
        let (_dir, pool) = fresh_db().await;
        let payment = insert_payment(&pool, &base("Jane Doe", 20_000), "").await.unwrap();
        let policy = AdjustmentPolicy::default();
        add_payment_adjustment(
            &pool,
            payment.id,
            Adjustment::new(AdjustmentKind::Bonus, Money::from_dollars(50), "holiday"),
            policy,
        )
        .await
        .unwrap();
        add_payment_adjustment(
            &pool,
            payment.id,
            Adjustment::new(AdjustmentKind::Deduction, Money::from_dollars(-20), "advance"),
            policy,
        )
        .await
        .unwrap();

        let reloaded = require_payment(&pool, payment.id).await.unwrap();
        assert_eq!(reloaded.total_amount(), Money::from_dollars(230));
        assert_eq!(reloaded.adjustments()[1].kind, AdjustmentKind::Deduction);
        assert_eq!(reloaded.base.hours, Decimal::new(175, 2));
    }

    #[tokio::test]
    async fn paid_payments_cannot_be_deleted() {
        let (_dir, pool) = fresh_db().await;
        let payment = insert_payment(&pool, &base("Jane Doe", 10_000), "").await.unwrap();
        let day = NaiveDate::from_ymd_opt(2025, 2, 20).unwrap();
        mark_payment_paid(&pool, payment.id, day, PaymentMethod::DirectDeposit)
            .await
            .unwrap();

        let err = delete_payment(&pool, payment.id).await.unwrap_err();
        assert!(matches!(err, StorageError::Billing(BillingError::PaymentNotDeletable { .. })));

        let again = mark_payment_paid(&pool, payment.id, day, PaymentMethod::Cash).await;
        assert!(again.is_err());
        let reloaded = require_payment(&pool, payment.id).await.unwrap();
        assert_eq!(reloaded.payment_method, PaymentMethod::DirectDeposit);
        assert_eq!(reloaded.paid_date, Some(day));
    }

    #[tokio::test]
    async fn strict_policy_blocks_late_adjustment() {
        let (_dir, pool) = fresh_db().await;
        let payment = insert_payment(&pool, &base("Jane Doe", 10_000), "").await.unwrap();
        mark_payment_paid(&pool, payment.id, NaiveDate::from_ymd_opt(2025, 2, 20).unwrap(), PaymentMethod::Check)
            .await
            .unwrap();
        let strict = AdjustmentPolicy {
            allow_adjustment_after_paid: false,
        };
        let err = add_payment_adjustment(
            &pool,
            payment.id,
            Adjustment::new(AdjustmentKind::Bonus, Money::from_dollars(5), ""),
            strict,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StorageError::Billing(BillingError::AdjustmentAfterPaid)));
        assert!(require_payment(&pool, payment.id).await.unwrap().adjustments().is_empty());
    }

    #[tokio::test]
    async fn unresolved_clinicians_match_by_folded_name() {
        let (_dir, pool) = fresh_db().await;
        let period = crate::periods::current_open_period(
            &pool,
            &carebill_core::BillingSettings::default(),
            NaiveDate::from_ymd_opt(2025, 2, 5).unwrap(),
        )
        .await
        .unwrap();
        let mut jose = base(" José Núñez", 12_000);
        jose.period_id = Some(period.id);
        let stored = insert_payment(&pool, &jose, "").await.unwrap();
        assert_eq!(stored.base.clinician_name, "José Núñez");

        let found = find_payment_for(&pool, period.id, None, "JOSÉ NÚÑEZ").await.unwrap();
        assert_eq!(found.map(|p| p.id), Some(stored.id));
        assert!(find_payment_for(&pool, period.id, None, "Jose Nunez").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pending_payment_deletes() {
        let (_dir, pool) = fresh_db().await;
        let payment = insert_payment(&pool, &base("Jane Doe", 10_000), "").await.unwrap();
        delete_payment(&pool, payment.id).await.unwrap();
        assert!(get_payment(&pool, payment.id).await.unwrap().is_none());
        assert!(list_payments(&pool, PaymentFilter::default()).await.unwrap().is_empty());
    }
}
