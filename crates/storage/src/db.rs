use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::StorageError;

pub type DbPool = Pool<Sqlite>;

/// Opens (creating if needed) the database at `path` and brings the schema up
/// to date. Safe to call on every start.
pub async fn create_db(path: &Path) -> Result<DbPool, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5))
        .pragma("cache_size", "-32000");

    // One writer connection keeps claim transactions strictly serialized.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;

    tracing::debug!(path = %path.display(), "Database ready");
    Ok(pool)
}

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS agencies (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        name_key TEXT NOT NULL UNIQUE,
        address TEXT,
        contact_name TEXT,
        contact_email TEXT,
        contact_phone TEXT,
        default_rate_cents INTEGER,
        rates TEXT NOT NULL DEFAULT '{}',
        payment_terms_days INTEGER NOT NULL DEFAULT 30,
        active INTEGER NOT NULL DEFAULT 1,
        notes TEXT,
        created_at TEXT NOT NULL DEFAULT (datetime('now'))
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS clinicians (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        name_key TEXT NOT NULL UNIQUE,
        title TEXT,
        email TEXT,
        phone TEXT,
        pay_rate_cents INTEGER NOT NULL DEFAULT 0,
        active INTEGER NOT NULL DEFAULT 1,
        notes TEXT,
        created_at TEXT NOT NULL DEFAULT (datetime('now'))
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS clinician_agencies (
        clinician_id INTEGER NOT NULL,
        agency_id INTEGER NOT NULL,
        PRIMARY KEY (clinician_id, agency_id),
        FOREIGN KEY (clinician_id) REFERENCES clinicians(id) ON DELETE CASCADE,
        FOREIGN KEY (agency_id) REFERENCES agencies(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS patients (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        name_key TEXT NOT NULL,
        agency_id INTEGER,
        clinical_record_number TEXT UNIQUE,
        address TEXT,
        active INTEGER NOT NULL DEFAULT 1,
        notes TEXT,
        created_at TEXT NOT NULL DEFAULT (datetime('now')),
        FOREIGN KEY (agency_id) REFERENCES agencies(id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_patients_name_key ON patients(name_key)",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_patients_unnumbered_name ON patients(name_key) \
     WHERE clinical_record_number IS NULL",
    r#"
    CREATE TABLE IF NOT EXISTS billing_periods (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        start_date TEXT NOT NULL,
        end_date TEXT NOT NULL,
        label TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'open',
        invoices_generated INTEGER NOT NULL DEFAULT 0,
        closed_at TEXT,
        created_at TEXT NOT NULL DEFAULT (datetime('now')),
        UNIQUE (start_date, end_date)
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_billing_periods_one_open ON billing_periods(status) WHERE status = 'open'",
    r#"
    CREATE TABLE IF NOT EXISTS invoice_sequence (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        last_value INTEGER NOT NULL
    )
    "#,
    "INSERT OR IGNORE INTO invoice_sequence (id, last_value) VALUES (1, 0)",
    r#"
    CREATE TABLE IF NOT EXISTS invoices (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        invoice_number TEXT NOT NULL UNIQUE,
        agency_id INTEGER NOT NULL,
        period_id INTEGER NOT NULL,
        status TEXT NOT NULL DEFAULT 'draft',
        adjustments_cents INTEGER NOT NULL DEFAULT 0,
        subtotal_cents INTEGER NOT NULL,
        total_cents INTEGER NOT NULL,
        due_date TEXT NOT NULL,
        sent_at TEXT,
        paid_at TEXT,
        paid_amount_cents INTEGER,
        payment_notes TEXT,
        notes TEXT,
        pdf_path TEXT,
        created_at TEXT NOT NULL,
        FOREIGN KEY (agency_id) REFERENCES agencies(id),
        FOREIGN KEY (period_id) REFERENCES billing_periods(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS invoice_line_items (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        invoice_id INTEGER NOT NULL,
        position INTEGER NOT NULL,
        timesheet_id INTEGER,
        patient_name TEXT NOT NULL,
        clinician_name TEXT NOT NULL,
        clinician_title TEXT,
        date TEXT NOT NULL,
        time_in TEXT,
        time_out TEXT,
        duration_minutes INTEGER NOT NULL DEFAULT 0,
        visit_code TEXT,
        care_type TEXT NOT NULL,
        rate_cents INTEGER NOT NULL,
        amount_cents INTEGER NOT NULL,
        FOREIGN KEY (invoice_id) REFERENCES invoices(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS timesheets (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        period_id INTEGER,
        status TEXT NOT NULL DEFAULT 'pending',
        company_name TEXT,
        employee_name TEXT,
        employee_title TEXT,
        patient_name TEXT,
        clinical_record_number TEXT,
        agency_id INTEGER,
        clinician_id INTEGER,
        patient_id INTEGER,
        invoice_id INTEGER,
        image_hash TEXT UNIQUE,
        ocr_confidence REAL,
        flag_reason TEXT,
        created_at TEXT NOT NULL DEFAULT (datetime('now')),
        FOREIGN KEY (period_id) REFERENCES billing_periods(id),
        FOREIGN KEY (agency_id) REFERENCES agencies(id),
        FOREIGN KEY (clinician_id) REFERENCES clinicians(id),
        FOREIGN KEY (patient_id) REFERENCES patients(id),
        FOREIGN KEY (invoice_id) REFERENCES invoices(id) ON DELETE SET NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_timesheets_period ON timesheets(period_id, status)",
    r#"
    CREATE TABLE IF NOT EXISTS visits (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timesheet_id INTEGER NOT NULL,
        position INTEGER NOT NULL,
        date TEXT NOT NULL,
        time_in TEXT,
        time_out TEXT,
        duration_minutes INTEGER,
        visit_code TEXT,
        patient_name TEXT NOT NULL DEFAULT '',
        clinician_name TEXT NOT NULL DEFAULT '',
        clinician_title TEXT,
        FOREIGN KEY (timesheet_id) REFERENCES timesheets(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS payroll_payments (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        clinician_id INTEGER,
        clinician_name TEXT NOT NULL,
        clinician_key TEXT NOT NULL DEFAULT '',
        clinician_title TEXT,
        period_id INTEGER,
        period_label TEXT NOT NULL DEFAULT '',
        amount_cents INTEGER NOT NULL,
        hours TEXT NOT NULL DEFAULT '0',
        visits INTEGER NOT NULL DEFAULT 0,
        pay_rate_cents INTEGER NOT NULL DEFAULT 0,
        total_amount_cents INTEGER NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        paid_date TEXT,
        payment_method TEXT NOT NULL DEFAULT 'check',
        notes TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL DEFAULT (datetime('now')),
        FOREIGN KEY (clinician_id) REFERENCES clinicians(id),
        FOREIGN KEY (period_id) REFERENCES billing_periods(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS payroll_adjustments (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        payment_id INTEGER NOT NULL,
        position INTEGER NOT NULL,
        kind TEXT NOT NULL,
        amount_cents INTEGER NOT NULL,
        reason TEXT NOT NULL DEFAULT '',
        FOREIGN KEY (payment_id) REFERENCES payroll_payments(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS billing_codes (
        code TEXT PRIMARY KEY COLLATE NOCASE,
        description TEXT NOT NULL DEFAULT '',
        default_rate_cents INTEGER NOT NULL DEFAULT 0,
        active INTEGER NOT NULL DEFAULT 1
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
    "#,
];

async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::Error> {
    for statement in MIGRATIONS {
        sqlx::query(statement).execute(pool).await?;
    }
    crate::codes::seed_standard_codes(pool).await
}

pub(crate) fn parse_status<T: FromStr<Err = String>>(raw: &str) -> Result<T, StorageError> {
    raw.parse().map_err(StorageError::Corrupt)
}

pub(crate) fn to_u32(value: i64, column: &str) -> Result<u32, StorageError> {
    u32::try_from(value).map_err(|_| StorageError::Corrupt(format!("{column} out of range: {value}")))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    /// A fresh database in its own temp dir; keep the dir alive for the test.
    pub async fn fresh_db() -> (TempDir, DbPool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_db(&dir.path().join("carebill.db")).await.unwrap();
        (dir, pool)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::fresh_db;
    use super::*;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let (dir, pool) = fresh_db().await;
        pool.close().await;
        let pool = create_db(&dir.path().join("carebill.db")).await.unwrap();
        let (count,): (i64,) = sqlx::query_as("SELECT last_value FROM invoice_sequence WHERE id = 1")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn only_one_open_period_allowed() {
        let (_dir, pool) = fresh_db().await;
        let insert = "INSERT INTO billing_periods (start_date, end_date, label, status) VALUES (?, ?, 'p', 'open')";
        sqlx::query(insert)
            .bind("2025-02-01")
            .bind("2025-02-14")
            .execute(&pool)
            .await
            .unwrap();
        let err = sqlx::query(insert)
            .bind("2025-02-15")
            .bind("2025-02-28")
            .execute(&pool)
            .await
            .unwrap_err();
        assert!(crate::error::is_unique_violation(&err));
    }
}
