use carebill_core::rate::STANDARD_CODES;
use carebill_core::{BillingCode, Money};

use crate::db::DbPool;
use crate::error::{Result, StorageError};

type CodeRow = (String, String, i64, bool);

fn code_from_row(r: CodeRow) -> BillingCode {
    BillingCode {
        code: r.0,
        description: r.1,
        default_rate: Money::from_cents(r.2),
        active: r.3,
    }
}

/// Adds the standard codes once, when the catalog has never held any.
/// Codes are only ever deactivated, so a used catalog is never reseeded.
pub(crate) async fn seed_standard_codes(pool: &DbPool) -> std::result::Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM billing_codes")
        .fetch_one(&mut *tx)
        .await?;
    if count == 0 {
        for (code, description, dollars) in STANDARD_CODES {
            sqlx::query("INSERT INTO billing_codes (code, description, default_rate_cents) VALUES (?, ?, ?)")
                .bind(code)
                .bind(description)
                .bind(Money::from_dollars(dollars).to_cents())
                .execute(&mut *tx)
                .await?;
        }
        tracing::debug!(codes = STANDARD_CODES.len(), "Seeded billing codes");
    }
    tx.commit().await
}

/// The visit-code catalog ordered by code.
pub async fn list_billing_codes(pool: &DbPool, include_inactive: bool) -> Result<Vec<BillingCode>> {
    let rows = sqlx::query_as::<_, CodeRow>(
        "SELECT code, description, default_rate_cents, active FROM billing_codes \
         WHERE active = 1 OR ? ORDER BY code",
    )
    .bind(include_inactive)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(code_from_row).collect())
}

/// Creates or replaces a code; case-insensitive on the code. Reactivates a
/// deactivated one.
pub async fn set_billing_code(
    pool: &DbPool,
    code: &str,
    description: &str,
    default_rate: Money,
) -> Result<BillingCode> {
    let row = sqlx::query_as::<_, CodeRow>(
        "INSERT INTO billing_codes (code, description, default_rate_cents) VALUES (?, ?, ?) \
         ON CONFLICT(code) DO UPDATE SET description = excluded.description, \
         default_rate_cents = excluded.default_rate_cents, active = 1 \
         RETURNING code, description, default_rate_cents, active",
    )
    .bind(code.trim())
    .bind(description.trim())
    .bind(default_rate.to_cents())
    .fetch_one(pool)
    .await?;
    Ok(code_from_row(row))
}

pub async fn deactivate_billing_code(pool: &DbPool, code: &str) -> Result<()> {
    let done = sqlx::query("UPDATE billing_codes SET active = 0 WHERE code = ?")
        .bind(code.trim())
        .execute(pool)
        .await?;
    if done.rows_affected() == 0 {
        return Err(StorageError::UnknownCode(code.trim().to_string()));
    }
    Ok(())
}
